use crate::command::{Command, Unit};
use crate::error::SubmitError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceType {
    #[default]
    Unknown,
    Ata,
    Atapi,
}

/// How an ATAPI device asks for its command packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketDelivery {
    #[default]
    Unknown,
    /// Raises an interrupt once it is ready for the packet.
    Irq,
    /// Asserts DRQ within 3ms of the PACKET command.
    DrqSlow,
    /// Asserts DRQ within 50us of the PACKET command.
    DrqFast,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    pub kind: DeviceType,
    pub packet_delivery: PacketDelivery,
}

/// Bus-wide events announced to attached drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    AtaReset,
    AtapiReset,
}

/// Anything commands can be submitted to from inside the bus's gate.
///
/// Completion callbacks and event handlers receive the bus through this
/// trait, so follow-up work is queued on the same turn instead of going back
/// through the gate.
pub trait CommandSink {
    fn execute_command(&mut self, command: Command) -> Result<(), SubmitError>;
    fn device_info(&self, unit: Unit) -> DeviceInfo;
}

/// A driver bound to one unit of the bus.
pub trait DeviceDriver: Send {
    /// Called with the queue locked to immediate commands. Immediate commands
    /// submitted here run to completion before this returns.
    fn notify_event(&mut self, event: BusEvent, bus: &mut dyn CommandSink);
}
