use thiserror::Error;

use crate::command::Command;

pub type Result<T> = std::result::Result<T, AtaError>;

/// Failure taxonomy shared by submission, protocol phases and hardware hooks.
///
/// Everything that happens after a command has been accepted is reported
/// through the command's completion; only [`SubmitError`] is returned
/// synchronously.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AtaError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("invalid device unit {0} (expected 0 or 1)")]
    InvalidUnit(u8),

    #[error("unknown command opcode {0:#04x}")]
    UnknownOpcode(u8),

    #[error("device did not become ready for selection")]
    DeviceBusy,

    #[error("device reported an error")]
    DeviceError,

    #[error("timed out waiting for the device")]
    Timeout,

    #[error("operation not supported by this controller")]
    Unsupported,

    #[error("protocol state machine reached an inconsistent state")]
    ProtocolInconsistent,

    #[error("device is offline")]
    Offline,

    #[error("command cancelled by a queue flush")]
    Cancelled,

    #[error("device interrupt with no command in flight")]
    SpuriousInterrupt,

    #[error("command gate poisoned by a panicking holder")]
    GatePoisoned,
}

/// A command rejected at submission, handed back to the caller.
#[derive(Debug, Error)]
#[error("command rejected: {error}")]
pub struct SubmitError {
    pub error: AtaError,
    pub command: Box<Command>,
}

impl SubmitError {
    pub fn new(error: AtaError, command: Command) -> Self {
        Self {
            error,
            command: Box::new(command),
        }
    }

    pub fn into_command(self) -> Command {
        *self.command
    }
}
