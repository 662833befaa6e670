mod common;

use aero_ata_host::testing::{CompletionLog, SimCdrom, SimDevice, CD_SECTOR_SIZE};
use aero_ata_host::{
    AtaError, AtaRegister, BusState, Command, CommandState, ExtendedTaskFile, Opcode,
    PacketDelivery, Protocol, Status, TaskFile, TaskFileCapture, Transfer, Unit, ATA_CMD_PACKET,
    ATA_CMD_READ_SECTORS, ATA_CMD_READ_SECTORS_EXT,
};
use common::{
    buffer_bytes, cdrom, disk, inquiry, packet_in, read10, read_sectors, read_sectors_ext,
    write_sectors, Rig,
};

#[test]
fn ata_read_spans_several_drq_blocks() {
    let mut rig = Rig::new(vec![(Unit::Device0, disk())]);
    let log = CompletionLog::new();

    rig.submit(read_sectors(Unit::Device0, 3, 4, &log));
    assert_eq!(
        rig.bus.current_command().map(Command::state),
        Some(CommandState::DataTransfer)
    );
    rig.settle();

    let mut done = log.take().pop().unwrap();
    assert_eq!(done.result(), Some(&Ok(())));
    assert_eq!(done.actual_transfer(), 4 * 512);
    assert_eq!(
        buffer_bytes(&mut done, 4 * 512),
        rig.sim.medium(Unit::Device0, 3 * 512, 4 * 512)
    );
}

#[test]
fn ata_write_lands_on_the_medium() {
    let mut rig = Rig::new(vec![(Unit::Device0, disk())]);
    let log = CompletionLog::new();
    let data: Vec<u8> = (0..3 * 512).map(|i| (i as u8) ^ 0xA5).collect();

    rig.submit(write_sectors(Unit::Device0, 10, data.clone(), &log));
    rig.settle();

    let done = log.take().pop().unwrap();
    assert_eq!(done.result(), Some(&Ok(())));
    assert_eq!(done.actual_transfer(), data.len());
    assert_eq!(rig.sim.medium(Unit::Device0, 10 * 512, data.len()), data);
    assert!(!rig.sim.interrupt_pending());
}

#[test]
fn single_sector_write_finishes_on_the_status_interrupt() {
    let mut rig = Rig::new(vec![(Unit::Device0, disk())]);
    let log = CompletionLog::new();

    rig.submit(write_sectors(Unit::Device0, 0, vec![0x5A; 512], &log));
    // The only block went out with the command; completion waits for the
    // device interrupt.
    assert_eq!(
        rig.bus.current_command().map(Command::state),
        Some(CommandState::Status)
    );
    assert!(rig.sim.interrupt_pending());
    rig.settle();

    assert_eq!(log.take()[0].result(), Some(&Ok(())));
    assert_eq!(rig.sim.medium(Unit::Device0, 0, 512), vec![0x5A; 512]);
}

#[test]
fn lba48_read_writes_previous_content_bytes_first() {
    let mut rig = Rig::new(vec![(Unit::Device0, disk())]);
    let log = CompletionLog::new();
    rig.sim.clear_stats();

    rig.submit(read_sectors_ext(Unit::Device0, 7, 2, &log));
    rig.settle();

    let mut done = log.take().pop().unwrap();
    assert_eq!(done.result(), Some(&Ok(())));
    assert_eq!(
        buffer_bytes(&mut done, 1024),
        rig.sim.medium(Unit::Device0, 7 * 512, 1024)
    );

    let stats = rig.sim.stats();
    let lba_low: Vec<u8> = stats
        .register_writes
        .iter()
        .filter(|(reg, _)| *reg == AtaRegister::SectorNumber)
        .map(|(_, value)| *value)
        .collect();
    assert_eq!(lba_low, vec![0x00, 0x07]);
    assert_eq!(stats.commands, vec![ATA_CMD_READ_SECTORS_EXT]);
}

#[test]
fn lba48_capture_reads_back_both_register_halves() {
    let mut rig = Rig::new(vec![(Unit::Device0, disk())]);
    let log = CompletionLog::new();

    rig.submit(
        Command::builder(Opcode::ExecIo, Unit::Device0)
            .extended(
                ExtendedTaskFile::new(0x0102, Unit::Device0, 2, ATA_CMD_READ_SECTORS_EXT).unwrap(),
            )
            .data(Transfer::PioIn, Box::new(vec![0u8; 1024]), 0, 1024)
            .capture(TaskFileCapture::Always)
            .on_complete(log.recorder())
            .build()
            .unwrap(),
    );
    rig.settle();

    let done = log.take().pop().unwrap();
    assert_eq!(done.result(), Some(&Ok(())));
    let ext = done.extended().unwrap();
    assert_eq!(ext.lba(), 0x0102);
    assert_eq!(ext.sector_count, 2);
    assert!(Status::from_bits_retain(done.task_file().control).contains(Status::DRDY));
}

#[test]
fn polled_read_completes_inside_submission() {
    let mut rig = Rig::new(vec![(Unit::Device0, disk())]);
    let log = CompletionLog::new();

    rig.submit(
        Command::builder(Opcode::ExecIo, Unit::Device0)
            .task_file(TaskFile::lba28(5, Unit::Device0, 2, ATA_CMD_READ_SECTORS).unwrap())
            .data(Transfer::PioIn, Box::new(vec![0u8; 1024]), 0, 1024)
            .irq_suppressed(true)
            .on_complete(log.recorder())
            .build()
            .unwrap(),
    );

    assert_eq!(rig.bus.bus_state(), BusState::Free);
    assert!(!rig.sim.interrupt_pending());
    let mut done = log.take().pop().unwrap();
    assert_eq!(done.result(), Some(&Ok(())));
    assert_eq!(
        buffer_bytes(&mut done, 1024),
        rig.sim.medium(Unit::Device0, 5 * 512, 1024)
    );
}

#[test]
fn device_error_captures_error_register() {
    let mut rig = Rig::new(vec![(Unit::Device0, disk())]);
    let log = CompletionLog::new();

    rig.submit(
        Command::builder(Opcode::ExecIo, Unit::Device0)
            .task_file(TaskFile::lba28(1000, Unit::Device0, 1, ATA_CMD_READ_SECTORS).unwrap())
            .data(Transfer::PioIn, Box::new(vec![0u8; 512]), 0, 512)
            .capture(TaskFileCapture::OnError)
            .on_complete(log.recorder())
            .build()
            .unwrap(),
    );
    rig.settle();

    let done = log.take().pop().unwrap();
    assert_eq!(done.result(), Some(&Err(AtaError::DeviceError)));
    assert!(done.end_status().contains(Status::ERR));
    assert_eq!(done.end_error(), 0x04);
    assert_eq!(done.task_file().features, 0x04);
    assert_eq!(done.actual_transfer(), 0);
}

#[test]
fn atapi_read_moves_the_reported_byte_count() {
    let mut rig = Rig::new(vec![(Unit::Device0, cdrom())]);
    let log = CompletionLog::new();

    rig.submit(packet_in(Unit::Device0, &read10(2, 2), 2 * CD_SECTOR_SIZE, &log));
    rig.settle();

    let mut done = log.take().pop().unwrap();
    assert_eq!(done.result(), Some(&Ok(())));
    assert_eq!(done.actual_transfer(), 2 * CD_SECTOR_SIZE);
    assert_eq!(
        buffer_bytes(&mut done, 2 * CD_SECTOR_SIZE),
        rig.sim
            .medium(Unit::Device0, 2 * CD_SECTOR_SIZE, 2 * CD_SECTOR_SIZE)
    );
    assert_eq!(rig.sim.stats().packets, vec![read10(2, 2).to_vec()]);
}

#[test]
fn atapi_overrun_is_drained() {
    let mut rig = Rig::new(vec![(
        Unit::Device0,
        SimDevice::Atapi(SimCdrom::new(4).extra_bytes(16)),
    )]);
    let log = CompletionLog::new();

    rig.submit(packet_in(Unit::Device0, &read10(1, 1), CD_SECTOR_SIZE, &log));
    rig.settle();

    let mut done = log.take().pop().unwrap();
    assert_eq!(done.result(), Some(&Ok(())));
    assert_eq!(done.actual_transfer(), CD_SECTOR_SIZE);
    assert_eq!(
        buffer_bytes(&mut done, CD_SECTOR_SIZE),
        rig.sim.medium(Unit::Device0, CD_SECTOR_SIZE, CD_SECTOR_SIZE)
    );
    assert!(!rig.sim.interrupt_pending());
}

#[test]
fn atapi_short_response_ends_at_status_phase() {
    let mut rig = Rig::new(vec![(Unit::Device0, cdrom())]);
    let log = CompletionLog::new();

    rig.submit(packet_in(Unit::Device0, &inquiry(36), 96, &log));
    rig.settle();

    let mut done = log.take().pop().unwrap();
    assert_eq!(done.result(), Some(&Ok(())));
    assert_eq!(done.actual_transfer(), 36);
    let bytes = buffer_bytes(&mut done, 96);
    assert_eq!(bytes[0], 0x05);
    assert_eq!(&bytes[8..16], b"AERO    ");
    assert!(bytes[36..].iter().all(|&b| b == 0));
}

#[test]
fn atapi_packet_sent_after_interrupt_when_device_asks() {
    let mut rig = Rig::new(vec![(
        Unit::Device0,
        SimDevice::Atapi(SimCdrom::new(4).interrupt_for_packet(true)),
    )]);
    rig.bus.set_packet_delivery(Unit::Device0, PacketDelivery::Irq);
    let log = CompletionLog::new();

    rig.submit(packet_in(Unit::Device0, &[0u8; 12], 0, &log));
    assert_eq!(
        rig.bus.current_command().map(Command::state),
        Some(CommandState::PacketIssue)
    );
    assert!(rig.sim.stats().packets.is_empty());
    rig.settle();

    assert_eq!(log.take()[0].result(), Some(&Ok(())));
    assert_eq!(rig.sim.stats().packets, vec![vec![0u8; 12]]);
}

#[test]
fn atapi_rejected_packet_reports_sense_in_error_register() {
    let mut rig = Rig::new(vec![(Unit::Device0, cdrom())]);
    let log = CompletionLog::new();

    let mut cdb = [0u8; 12];
    cdb[0] = 0xFF;
    rig.submit(packet_in(Unit::Device0, &cdb, 0, &log));
    rig.settle();

    let done = log.take().pop().unwrap();
    assert_eq!(done.result(), Some(&Err(AtaError::DeviceError)));
    assert_eq!(done.end_error() >> 4, 0x05);
}

#[test]
fn polled_atapi_read_runs_every_phase() {
    let mut rig = Rig::new(vec![(Unit::Device0, cdrom())]);
    let log = CompletionLog::new();

    rig.submit(
        Command::builder(Opcode::ExecIo, Unit::Device0)
            .protocol(Protocol::Atapi)
            .task_file(TaskFile {
                command: ATA_CMD_PACKET,
                ..TaskFile::default()
            })
            .packet(aero_ata_host::Packet::new(&read10(0, 1)).unwrap())
            .data(Transfer::PioIn, Box::new(vec![0u8; CD_SECTOR_SIZE]), 0, CD_SECTOR_SIZE)
            .irq_suppressed(true)
            .on_complete(log.recorder())
            .build()
            .unwrap(),
    );

    let mut done = log.take().pop().unwrap();
    assert_eq!(done.result(), Some(&Ok(())));
    assert_eq!(
        buffer_bytes(&mut done, CD_SECTOR_SIZE),
        rig.sim.medium(Unit::Device0, 0, CD_SECTOR_SIZE)
    );
    assert_eq!(rig.bus.bus_state(), BusState::Free);
    assert!(!rig.sim.interrupt_pending());
}

#[test]
fn transfer_honours_buffer_position() {
    let mut rig = Rig::new(vec![(Unit::Device0, disk())]);
    let log = CompletionLog::new();

    rig.submit(
        Command::builder(Opcode::ExecIo, Unit::Device0)
            .task_file(TaskFile::lba28(0, Unit::Device0, 1, ATA_CMD_READ_SECTORS).unwrap())
            .data(Transfer::PioIn, Box::new(vec![0xEEu8; 600]), 64, 512)
            .on_complete(log.recorder())
            .build()
            .unwrap(),
    );
    rig.settle();

    let mut done = log.take().pop().unwrap();
    let bytes = buffer_bytes(&mut done, 600);
    assert!(bytes[..64].iter().all(|&b| b == 0xEE));
    assert_eq!(&bytes[64..576], &rig.sim.medium(Unit::Device0, 0, 512)[..]);
    assert!(bytes[576..].iter().all(|&b| b == 0xEE));
}
