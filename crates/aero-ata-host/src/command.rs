//! Command objects submitted to the bus.
//!
//! A [`Command`] is built with [`CommandBuilder`], which rejects flag
//! combinations the protocol engine cannot execute. Once submitted, the
//! engine owns it until completion hands it back through the completion
//! callback.

use std::fmt;

use bitflags::bitflags;

use crate::buffer::{MemoryDescriptor, SECTOR_SIZE};
use crate::device::CommandSink;
use crate::error::{AtaError, Result};
use crate::regs::{DEVICE_HEAD_LBA, Status};

/// Longest command descriptor block an ATAPI device accepts.
pub const MAX_PACKET_LEN: usize = 16;

pub const DEFAULT_TIMEOUT_MS: u32 = 30_000;

/// Device on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Unit {
    Device0 = 0,
    Device1 = 1,
}

impl Unit {
    pub const ALL: [Unit; 2] = [Unit::Device0, Unit::Device1];

    pub fn from_index(index: u8) -> Result<Self> {
        match index {
            0 => Ok(Unit::Device0),
            1 => Ok(Unit::Device1),
            other => Err(AtaError::InvalidUnit(other)),
        }
    }

    pub const fn index(self) -> usize {
        self as usize
    }

    /// DEV bit of the device/head register.
    pub const fn select_bits(self) -> u8 {
        (self as u8) << 4
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDirection {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    ExecIo,
    RegisterAccess(AccessDirection),
    BusReset,
    QueueFlush,
}

impl Opcode {
    /// Decodes the raw opcode numbering used by block drivers.
    pub fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            1 => Ok(Opcode::ExecIo),
            2 => Ok(Opcode::RegisterAccess(AccessDirection::Read)),
            3 => Ok(Opcode::RegisterAccess(AccessDirection::Write)),
            4 => Ok(Opcode::BusReset),
            5 => Ok(Opcode::QueueFlush),
            other => Err(AtaError::UnknownOpcode(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Ata,
    Atapi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Device to memory.
    ToMemory,
    /// Memory to device.
    FromMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    None,
    PioIn,
    PioOut,
    Dma(DmaDirection),
}

impl Transfer {
    pub fn is_read(self) -> bool {
        matches!(self, Transfer::PioIn | Transfer::Dma(DmaDirection::ToMemory))
    }

    pub fn is_write(self) -> bool {
        matches!(self, Transfer::PioOut | Transfer::Dma(DmaDirection::FromMemory))
    }

    pub fn is_dma(self) -> bool {
        matches!(self, Transfer::Dma(_))
    }

    pub fn is_pio(self) -> bool {
        matches!(self, Transfer::PioIn | Transfer::PioOut)
    }
}

/// When to copy the taskfile back into the command after status collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskFileCapture {
    #[default]
    Never,
    OnError,
    Always,
}

/// Command lifecycle, advanced only by the bus engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Initial,
    Started,
    PacketIssue,
    DataTransfer,
    Status,
    Complete,
    Done,
}

/// 28-bit taskfile image. On reads `features` holds the error register and
/// `command` holds status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskFile {
    pub features: u8,
    pub sector_count: u8,
    pub sector_number: u8,
    pub cylinder_low: u8,
    pub cylinder_high: u8,
    pub device_head: u8,
    pub command: u8,
    /// Alternate status on reads, device control on writes.
    pub control: u8,
    pub data: u16,
}

impl TaskFile {
    /// LBA28 addressing for `count` sectors.
    pub fn lba28(lba: u32, unit: Unit, count: u8, command: u8) -> Result<Self> {
        if lba & 0xF000_0000 != 0 {
            return Err(AtaError::InvalidArgument("LBA does not fit in 28 bits"));
        }
        let [b0, b1, b2, b3] = lba.to_le_bytes();
        Ok(Self {
            sector_count: count,
            sector_number: b0,
            cylinder_low: b1,
            cylinder_high: b2,
            device_head: DEVICE_HEAD_LBA | unit.select_bits() | (b3 & 0x0F),
            command,
            ..Self::default()
        })
    }

    pub fn lba(&self) -> u32 {
        u32::from_le_bytes([
            self.sector_number,
            self.cylinder_low,
            self.cylinder_high,
            self.device_head & 0x0F,
        ])
    }
}

/// 48-bit taskfile image: each register carries the previous-content
/// (high) byte in bits 15..8.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtendedTaskFile {
    pub features: u16,
    pub sector_count: u16,
    pub lba_low: u16,
    pub lba_mid: u16,
    pub lba_high: u16,
    pub device: u8,
    pub command: u8,
}

impl ExtendedTaskFile {
    pub fn new(lba: u64, unit: Unit, count: u16, command: u8) -> Result<Self> {
        if lba >> 48 != 0 {
            return Err(AtaError::InvalidArgument("LBA does not fit in 48 bits"));
        }
        let b = lba.to_le_bytes();
        Ok(Self {
            features: 0,
            sector_count: count,
            lba_low: u16::from_le_bytes([b[0], b[3]]),
            lba_mid: u16::from_le_bytes([b[1], b[4]]),
            lba_high: u16::from_le_bytes([b[2], b[5]]),
            device: DEVICE_HEAD_LBA | unit.select_bits(),
            command,
        })
    }

    pub fn lba(&self) -> u64 {
        let [l0, l3] = self.lba_low.to_le_bytes();
        let [m1, m4] = self.lba_mid.to_le_bytes();
        let [h2, h5] = self.lba_high.to_le_bytes();
        u64::from_le_bytes([l0, m1, h2, l3, m4, h5, 0, 0])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    Lba28,
    Lba48(ExtendedTaskFile),
}

/// ATAPI command descriptor block.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    bytes: [u8; MAX_PACKET_LEN],
    len: usize,
}

impl Packet {
    pub fn new(cdb: &[u8]) -> Result<Self> {
        if cdb.is_empty() {
            return Err(AtaError::InvalidArgument("empty ATAPI packet"));
        }
        if cdb.len() > MAX_PACKET_LEN {
            return Err(AtaError::InvalidArgument("ATAPI packet longer than 16 bytes"));
        }
        let mut bytes = [0u8; MAX_PACKET_LEN];
        bytes[..cdb.len()].copy_from_slice(cdb);
        Ok(Self {
            bytes,
            len: cdb.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Words written to the data register: six for a 12-byte packet, eight
    /// for a 16-byte one. Short packets are zero padded.
    pub fn words(&self) -> impl Iterator<Item = u16> + '_ {
        let count = if self.len > 12 { 8 } else { 6 };
        self.bytes
            .chunks_exact(2)
            .take(count)
            .map(|w| u16::from_le_bytes([w[0], w[1]]))
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Packet").field(&self.as_bytes()).finish()
    }
}

bitflags! {
    /// Registers touched by a register-access command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RegisterMask: u16 {
        const ERROR_FEATURES = 1 << 0;
        const SECTOR_COUNT = 1 << 1;
        const SECTOR_NUMBER = 1 << 2;
        const CYLINDER_LOW = 1 << 3;
        const CYLINDER_HIGH = 1 << 4;
        const DEVICE_HEAD = 1 << 5;
        const ALT_STATUS_DEVICE_CONTROL = 1 << 6;
        const DATA = 1 << 7;
        const STATUS_COMMAND = 1 << 8;

        /// Everything but the data and status/command registers.
        const TASK_FILE = Self::ERROR_FEATURES.bits()
            | Self::SECTOR_COUNT.bits()
            | Self::SECTOR_NUMBER.bits()
            | Self::CYLINDER_LOW.bits()
            | Self::CYLINDER_HIGH.bits()
            | Self::DEVICE_HEAD.bits()
            | Self::ALT_STATUS_DEVICE_CONTROL.bits();
    }
}

/// Invoked exactly once when a command finishes. The sink accepts follow-up
/// submissions on the same turn.
pub type Completion = Box<dyn FnOnce(Command, &mut dyn CommandSink) + Send>;

pub struct Command {
    pub(crate) opcode: Opcode,
    pub(crate) unit: Unit,
    pub(crate) protocol: Protocol,
    pub(crate) transfer: Transfer,
    pub(crate) addressing: Addressing,
    pub(crate) immediate: bool,
    pub(crate) irq_suppressed: bool,
    /// Forced polled for this run because it started during a bus event.
    pub(crate) polled_for_callout: bool,
    pub(crate) capture: TaskFileCapture,
    pub(crate) task_file: TaskFile,
    pub(crate) register_mask: RegisterMask,
    pub(crate) packet: Option<Packet>,
    pub(crate) buffer: Option<Box<dyn MemoryDescriptor>>,
    pub(crate) byte_count: usize,
    pub(crate) actual_transfer: usize,
    pub(crate) position: usize,
    pub(crate) chunk_size: usize,
    pub(crate) timeout_ms: u32,
    pub(crate) state: CommandState,
    pub(crate) result: Option<Result<()>>,
    pub(crate) end_status: u8,
    pub(crate) end_error: u8,
    pub(crate) in_use: bool,
    pub(crate) completion: Option<Completion>,
}

impl Command {
    pub fn builder(opcode: Opcode, unit: Unit) -> CommandBuilder {
        CommandBuilder::new(opcode, unit)
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn transfer(&self) -> Transfer {
        self.transfer
    }

    pub fn is_immediate(&self) -> bool {
        self.immediate
    }

    pub fn is_irq_suppressed(&self) -> bool {
        self.irq_suppressed
    }

    /// Whether the last run was polled, either by request or because it
    /// was started from a bus event handler.
    pub fn ran_polled(&self) -> bool {
        self.runs_polled()
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use
    }

    /// `None` until the command has completed.
    pub fn result(&self) -> Option<&Result<()>> {
        self.result.as_ref()
    }

    pub fn end_status(&self) -> Status {
        Status::from_bits_retain(self.end_status)
    }

    pub fn end_error(&self) -> u8 {
        self.end_error
    }

    pub fn actual_transfer(&self) -> usize {
        self.actual_transfer
    }

    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    pub fn task_file(&self) -> &TaskFile {
        &self.task_file
    }

    pub fn extended(&self) -> Option<&ExtendedTaskFile> {
        match &self.addressing {
            Addressing::Lba48(ext) => Some(ext),
            Addressing::Lba28 => None,
        }
    }

    pub fn packet(&self) -> Option<&Packet> {
        self.packet.as_ref()
    }

    pub fn buffer(&self) -> Option<&dyn MemoryDescriptor> {
        self.buffer.as_deref()
    }

    pub fn take_buffer(&mut self) -> Option<Box<dyn MemoryDescriptor>> {
        self.buffer.take()
    }

    /// Command byte that will be written to the command register.
    pub fn command_byte(&self) -> u8 {
        match &self.addressing {
            Addressing::Lba48(ext) => ext.command,
            Addressing::Lba28 => self.task_file.command,
        }
    }

    pub(crate) fn is_packet_command(&self) -> bool {
        self.protocol == Protocol::Atapi && self.packet.is_some()
    }

    pub(crate) fn runs_polled(&self) -> bool {
        self.irq_suppressed || self.polled_for_callout
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("opcode", &self.opcode)
            .field("unit", &self.unit)
            .field("protocol", &self.protocol)
            .field("transfer", &self.transfer)
            .field("immediate", &self.immediate)
            .field("irq_suppressed", &self.irq_suppressed)
            .field("state", &self.state)
            .field("byte_count", &self.byte_count)
            .field("actual_transfer", &self.actual_transfer)
            .field("result", &self.result)
            .finish_non_exhaustive()
    }
}

pub struct CommandBuilder {
    opcode: Opcode,
    unit: Unit,
    protocol: Protocol,
    transfer: Transfer,
    addressing: Addressing,
    immediate: bool,
    irq_suppressed: bool,
    capture: TaskFileCapture,
    task_file: TaskFile,
    register_mask: RegisterMask,
    packet: Option<Packet>,
    buffer: Option<Box<dyn MemoryDescriptor>>,
    byte_count: usize,
    position: usize,
    chunk_size: usize,
    timeout_ms: u32,
    completion: Option<Completion>,
}

impl CommandBuilder {
    pub fn new(opcode: Opcode, unit: Unit) -> Self {
        Self {
            opcode,
            unit,
            protocol: Protocol::Ata,
            transfer: Transfer::None,
            addressing: Addressing::Lba28,
            immediate: false,
            irq_suppressed: false,
            capture: TaskFileCapture::Never,
            task_file: TaskFile::default(),
            register_mask: RegisterMask::empty(),
            packet: None,
            buffer: None,
            byte_count: 0,
            position: 0,
            chunk_size: SECTOR_SIZE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            completion: None,
        }
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn task_file(mut self, task_file: TaskFile) -> Self {
        self.task_file = task_file;
        self
    }

    pub fn extended(mut self, ext: ExtendedTaskFile) -> Self {
        self.addressing = Addressing::Lba48(ext);
        self
    }

    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    /// Run polled with device interrupts disabled.
    pub fn irq_suppressed(mut self, suppressed: bool) -> Self {
        self.irq_suppressed = suppressed;
        self
    }

    pub fn capture(mut self, capture: TaskFileCapture) -> Self {
        self.capture = capture;
        self
    }

    pub fn register_mask(mut self, mask: RegisterMask) -> Self {
        self.register_mask = mask;
        self
    }

    pub fn packet(mut self, packet: Packet) -> Self {
        self.packet = Some(packet);
        self
    }

    /// Attaches the data buffer; `byte_count` bytes starting at `position`
    /// are transferred.
    pub fn data(
        mut self,
        transfer: Transfer,
        buffer: Box<dyn MemoryDescriptor>,
        position: usize,
        byte_count: usize,
    ) -> Self {
        self.transfer = transfer;
        self.buffer = Some(buffer);
        self.position = position;
        self.byte_count = byte_count;
        self
    }

    /// Bytes moved per DRQ block.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn on_complete<F>(mut self, completion: F) -> Self
    where
        F: FnOnce(Command, &mut dyn CommandSink) + Send + 'static,
    {
        self.completion = Some(Box::new(completion));
        self
    }

    pub fn build(self) -> Result<Command> {
        if self.packet.is_some() && self.protocol != Protocol::Atapi {
            return Err(AtaError::InvalidArgument("packet on a non-ATAPI command"));
        }
        if self.transfer.is_dma() && self.irq_suppressed {
            return Err(AtaError::InvalidArgument(
                "DMA transfers cannot run with interrupts suppressed",
            ));
        }
        if self.timeout_ms == 0 {
            return Err(AtaError::InvalidArgument("zero timeout"));
        }
        if self.chunk_size == 0 {
            return Err(AtaError::InvalidArgument("zero transfer chunk size"));
        }
        match self.transfer {
            Transfer::None => {
                if self.byte_count != 0 {
                    return Err(AtaError::InvalidArgument("byte count on a non-data command"));
                }
            }
            _ => {
                let buffer = self
                    .buffer
                    .as_ref()
                    .ok_or(AtaError::InvalidArgument("data transfer without a buffer"))?;
                if self.byte_count == 0 {
                    return Err(AtaError::InvalidArgument("data transfer of zero bytes"));
                }
                let end = self
                    .position
                    .checked_add(self.byte_count)
                    .ok_or(AtaError::InvalidArgument("transfer range overflows"))?;
                if end > buffer.len() {
                    return Err(AtaError::InvalidArgument("buffer shorter than the transfer"));
                }
            }
        }
        if matches!(self.opcode, Opcode::RegisterAccess(_)) && self.register_mask.is_empty() {
            return Err(AtaError::InvalidArgument("register access with an empty mask"));
        }

        Ok(Command {
            opcode: self.opcode,
            unit: self.unit,
            protocol: self.protocol,
            transfer: self.transfer,
            addressing: self.addressing,
            immediate: self.immediate,
            irq_suppressed: self.irq_suppressed,
            polled_for_callout: false,
            capture: self.capture,
            task_file: self.task_file,
            register_mask: self.register_mask,
            packet: self.packet,
            buffer: self.buffer,
            byte_count: self.byte_count,
            actual_transfer: 0,
            position: self.position,
            chunk_size: self.chunk_size,
            timeout_ms: self.timeout_ms,
            state: CommandState::Initial,
            result: None,
            end_status: 0,
            end_error: 0,
            in_use: false,
            completion: self.completion,
        })
    }
}
