//! Simulated PATA channel for exercising the engine without hardware.
//!
//! [`SimChannel`] models the device side of one channel: per-device
//! taskfiles with HOB shadow bytes, SRST and DEVICE RESET, PIO data phases
//! in 512-byte DRQ blocks, the ATAPI packet protocol with interrupt reason
//! and byte count, and a handful of faults (stuck BSY, missing DRQ, a
//! master that shadows an absent slave). Time comes from a shared
//! [`FakeHostClock`], so reset busy periods elapse as the engine sleeps.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::buffer::SECTOR_SIZE;
use crate::bus::AtaBus;
use crate::clock::{FakeHostClock, HostClock};
use crate::command::{Command, Unit};
use crate::device::CommandSink;
use crate::error::{AtaError, Result};
use crate::hardware::{AtaHardware, BusInfo, SocketType};
use crate::regs::{AtaRegister, DeviceControl, RegisterPort, Status, ATAPI_SIGNATURE};

pub const CD_SECTOR_SIZE: usize = 2048;

const ERR_ABRT: u8 = 0x04;
/// ILLEGAL REQUEST sense key in the upper nibble, ABRT below.
const ERR_ATAPI_ILLEGAL_REQUEST: u8 = 0x54;

/// Byte stored at `offset` of a freshly created simulated medium.
pub fn pattern_byte(offset: usize) -> u8 {
    (offset % 251) as u8
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(pattern_byte).collect()
}

/// A device plugged into the simulated channel.
#[derive(Debug, Clone)]
pub enum SimDevice {
    Ata(SimDisk),
    Atapi(SimCdrom),
}

impl SimDevice {
    pub fn ata_disk(sectors: usize) -> Self {
        SimDevice::Ata(SimDisk {
            image: pattern(sectors * SECTOR_SIZE),
        })
    }

    pub fn atapi_cdrom(sectors: usize) -> Self {
        SimDevice::Atapi(SimCdrom::new(sectors))
    }

    fn is_atapi(&self) -> bool {
        matches!(self, SimDevice::Atapi(_))
    }
}

#[derive(Debug, Clone)]
pub struct SimDisk {
    image: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SimCdrom {
    image: Vec<u8>,
    interrupt_for_packet: bool,
    extra_bytes: usize,
}

impl SimCdrom {
    pub fn new(sectors: usize) -> Self {
        Self {
            image: pattern(sectors * CD_SECTOR_SIZE),
            interrupt_for_packet: false,
            extra_bytes: 0,
        }
    }

    /// Raise an interrupt when ready for the packet instead of asserting
    /// DRQ straight away.
    pub fn interrupt_for_packet(mut self, irq: bool) -> Self {
        self.interrupt_for_packet = irq;
        self
    }

    /// Append `extra` bytes to every data response, overrunning the host.
    pub fn extra_bytes(mut self, extra: usize) -> Self {
        self.extra_bytes = extra;
        self
    }
}

/// Counters and logs of what the engine did to the channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    pub device_select_writes: usize,
    pub commands: Vec<u8>,
    pub packets: Vec<Vec<u8>>,
    pub register_writes: Vec<(AtaRegister, u8)>,
    pub srst_pulses: usize,
    pub start_dma_calls: usize,
    pub stop_dma_calls: usize,
    pub timing_selects: usize,
    pub barriers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataMode {
    None,
    PioIn,
    PioOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferKind {
    AtaPioRead,
    AtaPioWrite,
    Identify,
    AtapiPacket,
    AtapiPioIn,
}

#[derive(Debug, Clone, Default)]
struct ShadowTaskFile {
    features: u8,
    sector_count: u8,
    lba0: u8,
    lba1: u8,
    lba2: u8,
    device: u8,

    hob_features: u8,
    hob_sector_count: u8,
    hob_lba0: u8,
    hob_lba1: u8,
    hob_lba2: u8,

    // First write of a pair lands in the HOB byte; the second in the low byte.
    pending_high: [bool; 5],
}

impl ShadowTaskFile {
    fn index(reg: AtaRegister) -> Option<usize> {
        match reg {
            AtaRegister::ErrorFeatures => Some(0),
            AtaRegister::SectorCount => Some(1),
            AtaRegister::SectorNumber => Some(2),
            AtaRegister::CylinderLow => Some(3),
            AtaRegister::CylinderHigh => Some(4),
            _ => None,
        }
    }

    fn slots(&mut self, idx: usize) -> (&mut u8, &mut u8) {
        match idx {
            0 => (&mut self.features, &mut self.hob_features),
            1 => (&mut self.sector_count, &mut self.hob_sector_count),
            2 => (&mut self.lba0, &mut self.hob_lba0),
            3 => (&mut self.lba1, &mut self.hob_lba1),
            _ => (&mut self.lba2, &mut self.hob_lba2),
        }
    }

    fn read_reg(&self, reg: AtaRegister, hob: bool) -> u8 {
        match (reg, hob) {
            (AtaRegister::SectorCount, false) => self.sector_count,
            (AtaRegister::SectorCount, true) => self.hob_sector_count,
            (AtaRegister::SectorNumber, false) => self.lba0,
            (AtaRegister::SectorNumber, true) => self.hob_lba0,
            (AtaRegister::CylinderLow, false) => self.lba1,
            (AtaRegister::CylinderLow, true) => self.hob_lba1,
            (AtaRegister::CylinderHigh, false) => self.lba2,
            (AtaRegister::CylinderHigh, true) => self.hob_lba2,
            (AtaRegister::DeviceHead, _) => self.device,
            _ => 0,
        }
    }

    fn write_reg(&mut self, reg: AtaRegister, value: u8) {
        if reg == AtaRegister::DeviceHead {
            self.device = value;
            return;
        }
        let Some(idx) = Self::index(reg) else {
            return;
        };
        let pending = self.pending_high[idx];
        let (low, high) = self.slots(idx);
        if pending {
            *low = value;
        } else {
            *high = value;
        }
        self.pending_high[idx] = !pending;
    }

    /// Commits single writes of a 28-bit command into the low bytes.
    fn normalize_for_command(&mut self, lba48: bool) {
        for idx in 0..5 {
            let pending = self.pending_high[idx];
            let (low, high) = self.slots(idx);
            if pending {
                *low = *high;
            }
            if !lba48 {
                *high = 0;
            }
            self.pending_high[idx] = false;
        }
    }

    fn set_signature(&mut self, atapi: bool) {
        *self = ShadowTaskFile::default();
        self.sector_count = 0x01;
        self.lba0 = 0x01;
        if atapi {
            (self.lba1, self.lba2) = ATAPI_SIGNATURE;
        }
    }

    fn lba28(&self) -> u64 {
        u64::from(self.device & 0x0F) << 24
            | u64::from(self.lba2) << 16
            | u64::from(self.lba1) << 8
            | u64::from(self.lba0)
    }

    fn lba48(&self) -> u64 {
        u64::from(self.hob_lba2) << 40
            | u64::from(self.hob_lba1) << 32
            | u64::from(self.hob_lba0) << 24
            | u64::from(self.lba2) << 16
            | u64::from(self.lba1) << 8
            | u64::from(self.lba0)
    }

    fn sector_count28(&self) -> u64 {
        match self.sector_count {
            0 => 256,
            c => u64::from(c),
        }
    }

    fn sector_count48(&self) -> u64 {
        match u64::from(self.hob_sector_count) << 8 | u64::from(self.sector_count) {
            0 => 65536,
            c => c,
        }
    }

    fn atapi_byte_limit(&self) -> usize {
        match usize::from(u16::from_le_bytes([self.lba1, self.lba2])) {
            0 => 0xFFFE,
            limit => limit & !1,
        }
    }
}

struct Slot {
    device: Option<SimDevice>,
    tf: ShadowTaskFile,
    status: u8,
    error: u8,
    busy_until_ns: u64,
    mode: DataMode,
    kind: Option<TransferKind>,
    data: Vec<u8>,
    index: usize,
    block_end: usize,
    block_limit: usize,
    pio_write: Option<(u64, u64)>,
}

impl Slot {
    fn empty() -> Self {
        Self {
            device: None,
            tf: ShadowTaskFile::default(),
            status: 0,
            error: 0,
            busy_until_ns: 0,
            mode: DataMode::None,
            kind: None,
            data: Vec::new(),
            index: 0,
            block_end: 0,
            block_limit: SECTOR_SIZE,
            pio_write: None,
        }
    }

    fn is_atapi(&self) -> bool {
        self.device.as_ref().is_some_and(SimDevice::is_atapi)
    }

    fn reset(&mut self, now_ns: u64, busy: Duration) {
        let atapi = self.is_atapi();
        self.tf.set_signature(atapi);
        self.status = if atapi { 0 } else { Status::DRDY.bits() };
        self.error = 0x01;
        self.clear_data();
        self.busy_until_ns = now_ns + u64::try_from(busy.as_nanos()).unwrap_or(u64::MAX);
    }

    fn clear_data(&mut self) {
        self.mode = DataMode::None;
        self.kind = None;
        self.data.clear();
        self.index = 0;
        self.block_end = 0;
        self.pio_write = None;
    }
}

struct SimState {
    clock: FakeHostClock,
    slots: [Slot; 2],
    selected: usize,
    control: u8,
    irq: bool,
    stuck_busy: bool,
    hang_on_command: bool,
    no_drq: bool,
    shadow_absent_slave: bool,
    dma_capable: bool,
    dma_armed: bool,
    dma_stall: bool,
    reset_busy: Duration,
    stats: SimStats,
}

impl SimState {
    fn now(&self) -> u64 {
        self.clock.now_ns()
    }

    fn sel(&mut self) -> &mut Slot {
        &mut self.slots[self.selected]
    }

    fn present(&self, idx: usize) -> bool {
        self.slots[idx].device.is_some()
    }

    fn status_of(&self, idx: usize) -> u8 {
        let slot = &self.slots[idx];
        if slot.device.is_none() {
            return 0x00;
        }
        if self.stuck_busy || self.now() < slot.busy_until_ns {
            return Status::BSY.bits();
        }
        slot.status
    }

    fn raise_irq(&mut self) {
        self.irq = true;
    }

    fn hob(&self) -> bool {
        self.control & DeviceControl::HOB.bits() != 0
    }

    fn read(&mut self, reg: AtaRegister) -> u8 {
        let idx = self.selected;
        if !self.present(idx) {
            return match reg {
                AtaRegister::SectorCount
                | AtaRegister::SectorNumber
                | AtaRegister::CylinderLow
                | AtaRegister::CylinderHigh
                    if self.shadow_absent_slave && self.present(0) =>
                {
                    self.slots[0].tf.read_reg(reg, false)
                }
                AtaRegister::DeviceHead => self.slots[idx].tf.device,
                _ => 0x00,
            };
        }
        match reg {
            AtaRegister::Data => self.data_in_u8(),
            AtaRegister::ErrorFeatures => self.slots[idx].error,
            AtaRegister::StatusCommand => {
                self.irq = false;
                self.status_of(idx)
            }
            AtaRegister::AltStatusDeviceControl => self.status_of(idx),
            _ => {
                let hob = self.hob();
                self.slots[idx].tf.read_reg(reg, hob)
            }
        }
    }

    fn write(&mut self, reg: AtaRegister, value: u8) {
        self.stats.register_writes.push((reg, value));
        match reg {
            AtaRegister::AltStatusDeviceControl => self.write_control(value),
            AtaRegister::DeviceHead => {
                self.stats.device_select_writes += 1;
                for slot in &mut self.slots {
                    slot.tf.write_reg(reg, value);
                }
                self.selected = usize::from(value & 0x10 != 0);
            }
            AtaRegister::StatusCommand => {
                self.stats.commands.push(value);
                if self.present(self.selected) {
                    self.exec_command(value);
                }
            }
            AtaRegister::Data => {
                if self.present(self.selected) {
                    self.data_out_u8(value);
                }
            }
            _ => {
                // Both devices latch command block writes.
                for slot in &mut self.slots {
                    slot.tf.write_reg(reg, value);
                }
                self.control &= !DeviceControl::HOB.bits();
            }
        }
    }

    fn write_control(&mut self, value: u8) {
        let prev = self.control;
        self.control = value;
        let srst = DeviceControl::SRST.bits();
        if prev & srst == 0 && value & srst != 0 {
            self.stats.srst_pulses += 1;
            let now = self.now();
            let busy = self.reset_busy;
            for slot in &mut self.slots {
                if slot.device.is_some() {
                    slot.reset(now, busy);
                }
            }
            self.selected = 0;
            self.irq = false;
        }
    }

    fn abort_command(&mut self, err: u8) {
        let slot = self.sel();
        slot.clear_data();
        slot.error = err;
        slot.status = (Status::DRDY | Status::ERR).bits();
        self.raise_irq();
    }

    fn complete_non_data(&mut self, irq: bool) {
        let slot = self.sel();
        slot.clear_data();
        slot.error = 0;
        slot.status = Status::DRDY.bits();
        if irq {
            self.raise_irq();
        }
    }

    fn begin_pio_in(&mut self, kind: TransferKind, data: Vec<u8>, block_limit: usize) {
        let slot = self.sel();
        slot.data = data;
        slot.index = 0;
        slot.block_limit = block_limit;
        slot.block_end = block_limit.min(slot.data.len());
        slot.mode = DataMode::PioIn;
        slot.kind = Some(kind);
        slot.error = 0;
        slot.status = (Status::DRDY | Status::DRQ).bits();
        if kind == TransferKind::AtapiPioIn {
            let block = slot.block_end;
            slot.tf.sector_count = 0x02;
            slot.tf.lba1 = block as u8;
            slot.tf.lba2 = (block >> 8) as u8;
        }
        self.raise_irq();
    }

    fn begin_pio_out(&mut self, kind: TransferKind, len: usize, irq: bool) {
        let slot = self.sel();
        slot.data = vec![0u8; len];
        slot.index = 0;
        slot.block_limit = SECTOR_SIZE;
        slot.block_end = SECTOR_SIZE.min(len);
        slot.mode = DataMode::PioOut;
        slot.kind = Some(kind);
        slot.error = 0;
        slot.status = (Status::DRDY | Status::DRQ).bits();
        if irq {
            self.raise_irq();
        }
    }

    fn data_in_u8(&mut self) -> u8 {
        let slot = self.sel();
        if slot.mode != DataMode::PioIn || slot.index >= slot.data.len() {
            return 0;
        }
        let b = slot.data[slot.index];
        slot.index += 1;
        self.after_data_access();
        b
    }

    fn data_in_u16(&mut self) -> u16 {
        let slot = self.sel();
        if slot.mode != DataMode::PioIn || slot.index >= slot.data.len() {
            return 0;
        }
        let lo = slot.data[slot.index];
        let hi = slot.data.get(slot.index + 1).copied().unwrap_or(0);
        slot.index = (slot.index + 2).min(slot.data.len());
        self.after_data_access();
        u16::from_le_bytes([lo, hi])
    }

    fn data_out_u8(&mut self, value: u8) {
        let slot = self.sel();
        if slot.mode != DataMode::PioOut || slot.index >= slot.data.len() {
            return;
        }
        slot.data[slot.index] = value;
        slot.index += 1;
        self.after_data_access();
    }

    fn data_out_u16(&mut self, value: u16) {
        let slot = self.sel();
        if slot.mode != DataMode::PioOut || slot.index >= slot.data.len() {
            return;
        }
        let [lo, hi] = value.to_le_bytes();
        slot.data[slot.index] = lo;
        if let Some(b) = slot.data.get_mut(slot.index + 1) {
            *b = hi;
        }
        slot.index = (slot.index + 2).min(slot.data.len());
        self.after_data_access();
    }

    fn after_data_access(&mut self) {
        let slot = self.sel();
        if slot.index >= slot.data.len() {
            self.finish_data_phase();
        } else if slot.index >= slot.block_end {
            slot.block_end = (slot.block_end + slot.block_limit).min(slot.data.len());
            if slot.kind == Some(TransferKind::AtapiPioIn) {
                let block = slot.block_end - slot.index;
                slot.tf.lba1 = block as u8;
                slot.tf.lba2 = (block >> 8) as u8;
            }
            self.raise_irq();
        }
    }

    fn finish_data_phase(&mut self) {
        let kind = self.sel().kind;
        match kind {
            Some(TransferKind::AtaPioWrite) => {
                let slot = self.sel();
                let data = std::mem::take(&mut slot.data);
                let written = match (slot.pio_write.take(), slot.device.as_mut()) {
                    (Some((lba, _)), Some(SimDevice::Ata(disk))) => {
                        let start = lba as usize * SECTOR_SIZE;
                        match disk.image.get_mut(start..start + data.len()) {
                            Some(dst) => {
                                dst.copy_from_slice(&data);
                                true
                            }
                            None => false,
                        }
                    }
                    _ => false,
                };
                if written {
                    self.complete_non_data(true);
                } else {
                    self.abort_command(ERR_ABRT);
                }
            }
            Some(TransferKind::AtapiPacket) => {
                let slot = self.sel();
                let mut cdb = [0u8; 12];
                cdb.copy_from_slice(&slot.data[..12]);
                self.stats.packets.push(cdb.to_vec());
                self.exec_packet(&cdb);
            }
            Some(TransferKind::AtapiPioIn) => {
                self.sel().tf.sector_count = 0x03;
                self.complete_non_data(true);
            }
            Some(TransferKind::AtaPioRead) | Some(TransferKind::Identify) | None => {
                self.complete_non_data(false);
            }
        }
    }

    fn exec_command(&mut self, cmd: u8) {
        let lba48 = matches!(cmd, 0x24 | 0x34 | 0x25 | 0x35 | 0xEA);
        self.irq = false;
        self.sel().tf.normalize_for_command(lba48);

        if self.hang_on_command {
            let slot = self.sel();
            slot.clear_data();
            slot.status = Status::BSY.bits();
            return;
        }

        let data_command = matches!(cmd, 0x20 | 0x24 | 0x30 | 0x34 | 0xEC | 0xA0 | 0xA1);
        if self.no_drq && data_command {
            let slot = self.sel();
            slot.clear_data();
            slot.status = Status::DRDY.bits();
            return;
        }

        let atapi = self.sel().is_atapi();
        match cmd {
            0xEC if !atapi => {
                let data = identify_data(false);
                self.begin_pio_in(TransferKind::Identify, data, SECTOR_SIZE);
            }
            0xEC => {
                self.sel().tf.set_signature(true);
                self.abort_command(ERR_ABRT);
            }
            0xA1 if atapi => {
                let data = identify_data(true);
                self.begin_pio_in(TransferKind::Identify, data, SECTOR_SIZE);
            }
            0x20 | 0x24 if !atapi => {
                let tf = &self.sel().tf;
                let (lba, count) = if cmd == 0x24 {
                    (tf.lba48(), tf.sector_count48())
                } else {
                    (tf.lba28(), tf.sector_count28())
                };
                let start = lba as usize * SECTOR_SIZE;
                let len = count as usize * SECTOR_SIZE;
                let data = match self.sel().device.as_ref() {
                    Some(SimDevice::Ata(disk)) => disk.image.get(start..start + len).map(<[u8]>::to_vec),
                    _ => None,
                };
                match data {
                    Some(data) => self.begin_pio_in(TransferKind::AtaPioRead, data, SECTOR_SIZE),
                    None => self.abort_command(ERR_ABRT),
                }
            }
            0x30 | 0x34 if !atapi => {
                let tf = &self.sel().tf;
                let (lba, count) = if cmd == 0x34 {
                    (tf.lba48(), tf.sector_count48())
                } else {
                    (tf.lba28(), tf.sector_count28())
                };
                self.begin_pio_out(TransferKind::AtaPioWrite, count as usize * SECTOR_SIZE, false);
                self.sel().pio_write = Some((lba, count));
            }
            0xC8 | 0xCA | 0x25 | 0x35 if !atapi => {
                if self.dma_armed && !self.dma_stall {
                    self.complete_non_data(true);
                } else {
                    self.sel().status = Status::BSY.bits();
                }
            }
            0xE7 | 0xEA | 0xEF | 0x90 | 0x91 if !atapi => self.complete_non_data(true),
            0x08 if atapi => {
                let now = self.now();
                let busy = self.reset_busy;
                self.sel().reset(now, busy);
            }
            0xA0 if atapi => {
                let irq = matches!(
                    self.sel().device,
                    Some(SimDevice::Atapi(SimCdrom {
                        interrupt_for_packet: true,
                        ..
                    }))
                );
                let limit = self.sel().tf.atapi_byte_limit();
                self.sel().tf.sector_count = 0x01;
                self.begin_pio_out(TransferKind::AtapiPacket, 12, irq);
                self.sel().block_limit = limit;
            }
            _ => self.abort_command(ERR_ABRT),
        }
    }

    fn exec_packet(&mut self, cdb: &[u8; 12]) {
        let limit = self.sel().block_limit;
        let Some(SimDevice::Atapi(cdrom)) = self.sel().device.as_ref() else {
            self.abort_command(ERR_ABRT);
            return;
        };
        let extra = cdrom.extra_bytes;

        let response = match cdb[0] {
            0x00 => Some(Vec::new()),
            0x03 => {
                let mut sense = vec![0u8; 18];
                sense[0] = 0x70;
                sense[7] = 10;
                sense.truncate(usize::from(cdb[4]));
                Some(sense)
            }
            0x12 => {
                let mut inquiry = vec![0u8; 36];
                inquiry[0] = 0x05;
                inquiry[1] = 0x80;
                inquiry[4] = 31;
                inquiry[8..16].copy_from_slice(b"AERO    ");
                inquiry[16..32].copy_from_slice(b"SIM CD-ROM      ");
                inquiry.truncate(usize::from(cdb[4]));
                Some(inquiry)
            }
            0x28 => {
                let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as usize;
                let blocks = usize::from(u16::from_be_bytes([cdb[7], cdb[8]]));
                let start = lba * CD_SECTOR_SIZE;
                cdrom
                    .image
                    .get(start..start + blocks * CD_SECTOR_SIZE)
                    .map(<[u8]>::to_vec)
            }
            _ => None,
        };

        match response {
            Some(data) if data.is_empty() => {
                self.sel().tf.sector_count = 0x03;
                self.complete_non_data(true);
            }
            Some(mut data) => {
                data.resize(data.len() + extra, 0);
                self.begin_pio_in(TransferKind::AtapiPioIn, data, limit);
            }
            None => {
                self.sel().tf.sector_count = 0x03;
                self.abort_command(ERR_ATAPI_ILLEGAL_REQUEST);
            }
        }
    }
}

fn identify_data(atapi: bool) -> Vec<u8> {
    let mut words = [0u16; 256];
    // General configuration: packet device, CD-ROM, 12-byte packets, DRQ within 50us.
    words[0] = if atapi { 0x85C0 } else { 0x0040 };
    words[49] = 0x0200;
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// Handle to a simulated channel. Clones share the same devices.
#[derive(Clone)]
pub struct SimChannel {
    state: Arc<Mutex<SimState>>,
}

impl SimChannel {
    pub fn new(clock: FakeHostClock) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                clock,
                slots: [Slot::empty(), Slot::empty()],
                selected: 0,
                control: 0,
                irq: false,
                stuck_busy: false,
                hang_on_command: false,
                no_drq: false,
                shadow_absent_slave: false,
                dma_capable: false,
                dma_armed: false,
                dma_stall: false,
                reset_busy: Duration::from_millis(2),
                stats: SimStats::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Plugs `device` into `unit`, in its post-reset state.
    pub fn attach(&self, unit: Unit, device: SimDevice) {
        let mut state = self.lock();
        let slot = &mut state.slots[unit.index()];
        slot.device = Some(device);
        slot.reset(0, Duration::ZERO);
    }

    pub fn set_stuck_busy(&self, stuck: bool) {
        self.lock().stuck_busy = stuck;
    }

    /// Devices accept selection normally but hold BSY after any command
    /// byte until the next reset.
    pub fn set_hang_on_command(&self, hang: bool) {
        self.lock().hang_on_command = hang;
    }

    pub fn set_no_drq(&self, no_drq: bool) {
        self.lock().no_drq = no_drq;
    }

    pub fn set_shadow_absent_slave(&self, shadow: bool) {
        self.lock().shadow_absent_slave = shadow;
    }

    pub fn set_dma_capable(&self, capable: bool) {
        self.lock().dma_capable = capable;
    }

    /// DMA commands hold BSY forever even with the engine armed.
    pub fn set_dma_stall(&self, stall: bool) {
        self.lock().dma_stall = stall;
    }

    pub fn set_reset_busy(&self, busy: Duration) {
        self.lock().reset_busy = busy;
    }

    /// Interrupt line as seen by the host: pending and not masked by nIEN.
    pub fn interrupt_pending(&self) -> bool {
        let state = self.lock();
        state.irq && state.control & DeviceControl::NIEN.bits() == 0
    }

    pub fn stats(&self) -> SimStats {
        self.lock().stats.clone()
    }

    pub fn clear_stats(&self) {
        self.lock().stats = SimStats::default();
    }

    /// Bytes of the medium in `unit`.
    pub fn medium(&self, unit: Unit, offset: usize, len: usize) -> Vec<u8> {
        let state = self.lock();
        let image = match state.slots[unit.index()].device.as_ref() {
            Some(SimDevice::Ata(disk)) => &disk.image,
            Some(SimDevice::Atapi(cdrom)) => &cdrom.image,
            None => return Vec::new(),
        };
        image.get(offset..offset + len).map(<[u8]>::to_vec).unwrap_or_default()
    }
}

impl RegisterPort for SimChannel {
    fn read_u8(&mut self, reg: AtaRegister) -> u8 {
        self.lock().read(reg)
    }

    fn write_u8(&mut self, reg: AtaRegister, value: u8) {
        self.lock().write(reg, value);
    }

    fn read_data(&mut self) -> u16 {
        let mut state = self.lock();
        if !state.present(state.selected) {
            return 0;
        }
        state.data_in_u16()
    }

    fn write_data(&mut self, value: u16) {
        let mut state = self.lock();
        if state.present(state.selected) {
            state.data_out_u16(value);
        }
    }

    fn barrier(&mut self) {
        self.lock().stats.barriers += 1;
    }
}

impl AtaHardware for SimChannel {
    fn start_dma(&mut self, _command: &Command) -> Result<()> {
        let mut state = self.lock();
        state.stats.start_dma_calls += 1;
        if !state.dma_capable {
            return Err(AtaError::Unsupported);
        }
        state.dma_armed = true;
        Ok(())
    }

    fn stop_dma(&mut self) -> Result<()> {
        let mut state = self.lock();
        state.stats.stop_dma_calls += 1;
        state.dma_armed = false;
        Ok(())
    }

    fn select_io_timing(&mut self, _unit: Unit) {
        self.lock().stats.timing_selects += 1;
    }

    fn provide_bus_info(&self) -> Result<BusInfo> {
        let state = self.lock();
        Ok(BusInfo {
            socket: SocketType::Internal,
            pio_modes: 0x1F,
            multiword_dma_modes: if state.dma_capable { 0x07 } else { 0 },
            ultra_dma_modes: 0,
            supports_dma: state.dma_capable,
            supports_lba48: true,
            units: 2,
        })
    }
}

/// Collects completed commands in completion order.
#[derive(Clone, Default)]
pub struct CompletionLog {
    inner: Arc<Mutex<Vec<Command>>>,
}

impl CompletionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A completion callback that appends the finished command to the log.
    pub fn recorder(&self) -> impl FnOnce(Command, &mut dyn CommandSink) + Send + 'static {
        let log = self.clone();
        move |command, _bus| log.push(command)
    }

    pub fn push(&self, command: Command) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take(&self) -> Vec<Command> {
        std::mem::take(&mut *self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Drives interrupts, the command timer and simulated time until the bus
/// has nothing left to do. Returns `false` if it did not settle within
/// `max_steps` one-millisecond steps.
pub fn run_until_idle(bus: &mut AtaBus<SimChannel, FakeHostClock>, max_steps: usize) -> bool {
    for _ in 0..max_steps {
        if bus.current_command().is_none() && bus.queued() == 0 {
            return true;
        }
        if bus.hardware().interrupt_pending() {
            let _ = bus.handle_device_interrupt();
            continue;
        }
        if bus.poll_timer() {
            continue;
        }
        bus.clock().advance(Duration::from_millis(1));
    }
    bus.current_command().is_none() && bus.queued() == 0
}
