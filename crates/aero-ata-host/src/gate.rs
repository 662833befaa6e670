use std::sync::Mutex;

use crate::bus::AtaBus;
use crate::clock::HostClock;
use crate::command::Command;
use crate::error::{AtaError, Result, SubmitError};
use crate::hardware::AtaHardware;

/// Serializes every action on a bus.
///
/// Threads block in [`CommandGate::run_action`] until the gate admits them;
/// the action then runs to completion before the next one starts.
#[derive(Debug, Default)]
pub struct CommandGate<B> {
    inner: Mutex<B>,
}

impl<B> CommandGate<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub fn run_action<R>(&self, action: impl FnOnce(&mut B) -> R) -> Result<R> {
        let mut guard = self.inner.lock().map_err(|_| AtaError::GatePoisoned)?;
        Ok(action(&mut guard))
    }

    pub fn into_inner(self) -> Result<B> {
        self.inner.into_inner().map_err(|_| AtaError::GatePoisoned)
    }
}

impl<H: AtaHardware, C: HostClock> CommandGate<AtaBus<H, C>> {
    pub fn execute_command(&self, command: Command) -> std::result::Result<(), SubmitError> {
        match self.inner.lock() {
            Ok(mut bus) => bus.execute_command(command),
            Err(_) => Err(SubmitError::new(AtaError::GatePoisoned, command)),
        }
    }

    pub fn handle_interrupt(&self) -> Result<()> {
        self.run_action(|bus| bus.handle_device_interrupt())?
    }

    pub fn poll_timer(&self) -> Result<bool> {
        self.run_action(|bus| bus.poll_timer())
    }
}
