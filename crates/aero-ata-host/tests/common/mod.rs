#![allow(dead_code)]

use aero_ata_host::testing::{run_until_idle, CompletionLog, SimChannel, SimDevice};
use aero_ata_host::MemoryDescriptor as _;
use aero_ata_host::{
    AtaBus, BusConfig, Command, ExtendedTaskFile, FakeHostClock, Opcode, Packet, Protocol,
    TaskFile, Transfer, Unit, ATA_CMD_FLUSH_CACHE, ATA_CMD_PACKET, ATA_CMD_READ_SECTORS,
    ATA_CMD_READ_SECTORS_EXT, ATA_CMD_WRITE_SECTORS,
};

pub type SimBus = AtaBus<SimChannel, FakeHostClock>;

pub const SETTLE_STEPS: usize = 100_000;

pub struct Rig {
    pub bus: SimBus,
    pub sim: SimChannel,
    pub clock: FakeHostClock,
    pub found: usize,
}

impl Rig {
    pub fn new(devices: Vec<(Unit, SimDevice)>) -> Self {
        Self::with_config(devices, BusConfig::default())
    }

    pub fn with_config(devices: Vec<(Unit, SimDevice)>, config: BusConfig) -> Self {
        init_tracing();
        let clock = FakeHostClock::new();
        let sim = SimChannel::new(clock.clone());
        for (unit, device) in devices {
            sim.attach(unit, device);
        }
        let mut bus = AtaBus::new(sim.clone(), clock.clone(), config).unwrap();
        let found = bus.start();
        Self {
            bus,
            sim,
            clock,
            found,
        }
    }

    pub fn submit(&mut self, command: Command) {
        self.bus.execute_command(command).unwrap();
    }

    pub fn settle(&mut self) {
        assert!(
            run_until_idle(&mut self.bus, SETTLE_STEPS),
            "bus did not go idle"
        );
    }
}

/// Routes bus tracing into the test harness; `RUST_LOG=aero_ata_host=trace` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn disk() -> SimDevice {
    SimDevice::ata_disk(64)
}

pub fn cdrom() -> SimDevice {
    SimDevice::atapi_cdrom(16)
}

/// FLUSH CACHE, tagged through the (ignored) features register.
pub fn flush(unit: Unit, tag: u8, log: &CompletionLog) -> Command {
    Command::builder(Opcode::ExecIo, unit)
        .task_file(TaskFile {
            features: tag,
            command: ATA_CMD_FLUSH_CACHE,
            ..TaskFile::default()
        })
        .on_complete(log.recorder())
        .build()
        .unwrap()
}

pub fn read_sectors(unit: Unit, lba: u32, count: u8, log: &CompletionLog) -> Command {
    let len = usize::from(count) * 512;
    Command::builder(Opcode::ExecIo, unit)
        .task_file(TaskFile::lba28(lba, unit, count, ATA_CMD_READ_SECTORS).unwrap())
        .data(Transfer::PioIn, Box::new(vec![0u8; len]), 0, len)
        .on_complete(log.recorder())
        .build()
        .unwrap()
}

pub fn read_sectors_ext(unit: Unit, lba: u64, count: u16, log: &CompletionLog) -> Command {
    let len = usize::from(count) * 512;
    Command::builder(Opcode::ExecIo, unit)
        .extended(ExtendedTaskFile::new(lba, unit, count, ATA_CMD_READ_SECTORS_EXT).unwrap())
        .data(Transfer::PioIn, Box::new(vec![0u8; len]), 0, len)
        .on_complete(log.recorder())
        .build()
        .unwrap()
}

pub fn write_sectors(unit: Unit, lba: u32, data: Vec<u8>, log: &CompletionLog) -> Command {
    let len = data.len();
    let count = u8::try_from(len / 512).unwrap();
    Command::builder(Opcode::ExecIo, unit)
        .task_file(TaskFile::lba28(lba, unit, count, ATA_CMD_WRITE_SECTORS).unwrap())
        .data(Transfer::PioOut, Box::new(data), 0, len)
        .on_complete(log.recorder())
        .build()
        .unwrap()
}

/// A PACKET command reading `len` bytes in response to `cdb`.
pub fn packet_in(unit: Unit, cdb: &[u8], len: usize, log: &CompletionLog) -> Command {
    let builder = Command::builder(Opcode::ExecIo, unit)
        .protocol(Protocol::Atapi)
        .task_file(TaskFile {
            command: ATA_CMD_PACKET,
            ..TaskFile::default()
        })
        .packet(Packet::new(cdb).unwrap())
        .on_complete(log.recorder());
    let builder = if len > 0 {
        builder.data(Transfer::PioIn, Box::new(vec![0u8; len]), 0, len)
    } else {
        builder
    };
    builder.build().unwrap()
}

pub fn read10(lba: u32, blocks: u16) -> [u8; 12] {
    let mut cdb = [0u8; 12];
    cdb[0] = 0x28;
    cdb[2..6].copy_from_slice(&lba.to_be_bytes());
    cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
    cdb
}

pub fn inquiry(alloc_len: u8) -> [u8; 12] {
    let mut cdb = [0u8; 12];
    cdb[0] = 0x12;
    cdb[4] = alloc_len;
    cdb
}

/// Copies the first `len` bytes out of a finished command's buffer.
pub fn buffer_bytes(command: &mut Command, len: usize) -> Vec<u8> {
    let buffer = command.take_buffer().expect("command has no buffer");
    let mut out = vec![0u8; len];
    buffer.read_bytes(0, &mut out).unwrap();
    out
}
