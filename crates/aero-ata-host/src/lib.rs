//! Host-side engine for one ATA/ATAPI (PATA) channel.
//!
//! The engine sits between device drivers, which submit [`Command`]s, and a
//! controller-specific backend implementing [`AtaHardware`]. It provides:
//!
//! - [`AtaBus`]: command queue and arbiter, device selection, soft reset and
//!   drive scan, the interrupt-driven and polled phase machines, PIO data
//!   movement through a [`DoubleBuffer`], and timeout supervision
//! - [`CommandGate`]: serializes submissions, interrupts and timer expiries
//!   from several threads
//! - [`CommandBuilder`]: builds commands and rejects combinations the engine
//!   cannot run
//! - [`testing`]: a simulated channel and helpers for driving the engine
//!   deterministically with a [`FakeHostClock`]
//!
//! Controller registers are reached only through [`RegisterPort`]; time comes
//! from a [`HostClock`].

mod buffer;
mod bus;
mod clock;
mod command;
mod config;
mod device;
mod error;
mod gate;
mod hardware;
mod pio;
mod protocol;
mod queue;
mod regs;
mod select;
mod timer;

pub mod testing;

pub use buffer::{DoubleBuffer, MemoryDescriptor, DOUBLE_BUFFER_SIZE, SECTOR_SIZE};
pub use bus::{AtaBus, Dispatch};
pub use clock::{FakeHostClock, HostClock, StdHostClock};
pub use command::{
    AccessDirection, Addressing, Command, CommandBuilder, CommandState, Completion, DmaDirection,
    ExtendedTaskFile, Opcode, Packet, Protocol, RegisterMask, TaskFile, TaskFileCapture,
    Transfer, Unit, DEFAULT_TIMEOUT_MS, MAX_PACKET_LEN,
};
pub use config::BusConfig;
pub use device::{BusEvent, CommandSink, DeviceDriver, DeviceInfo, DeviceType, PacketDelivery};
pub use error::{AtaError, Result, SubmitError};
pub use gate::CommandGate;
pub use hardware::{AtaHardware, BusInfo, DeviceTimingConfig, SocketType};
pub use queue::{ArbiterState, BusState, CommandQueue, ImmediateGate, QueueState};
pub use regs::{
    AtaRegister, DeviceControl, RegisterPort, Status, ATAPI_SIGNATURE, ATA_CMD_DEVICE_RESET,
    ATA_CMD_EXECUTE_DEVICE_DIAGNOSTIC, ATA_CMD_FLUSH_CACHE, ATA_CMD_IDENTIFY_DEVICE,
    ATA_CMD_IDENTIFY_PACKET_DEVICE, ATA_CMD_INITIALIZE_DEVICE_PARAMETERS, ATA_CMD_PACKET,
    ATA_CMD_READ_SECTORS, ATA_CMD_READ_SECTORS_EXT, ATA_CMD_SET_FEATURES, ATA_CMD_WRITE_SECTORS,
    ATA_CMD_WRITE_SECTORS_EXT,
};
pub use timer::CommandTimer;
