//! The bus engine: command arbitration, completion and timeout supervision.
//!
//! Selection/reset lives in `select.rs`, the phase machine in `protocol.rs`
//! and data movement in `pio.rs`; all of them are `impl` blocks on
//! [`AtaBus`].

use tracing::{debug, trace, warn};

use crate::buffer::DoubleBuffer;
use crate::clock::HostClock;
use crate::command::{AccessDirection, Command, CommandState, Opcode, Protocol, Unit};
use crate::config::BusConfig;
use crate::device::{BusEvent, CommandSink, DeviceDriver, DeviceInfo, DeviceType, PacketDelivery};
use crate::error::{AtaError, Result, SubmitError};
use crate::hardware::{AtaHardware, BusInfo, DeviceTimingConfig};
use crate::queue::{ArbiterState, BusState, CommandQueue, QueueState};
use crate::regs::{AtaRegister, Status, TaskFileIo, ATA_CMD_DEVICE_RESET, DEVICE_HEAD_OBSOLETE};
use crate::timer::CommandTimer;

/// Outcome of one [`AtaBus::dispatch_next`] attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The arbiter does not admit the head of the queue right now.
    Blocked,
    QueueEmpty,
    Dispatched,
    /// A dispatch loop further up the stack picks the queue up once the
    /// running command returns.
    Deferred,
}

/// State put aside while drivers handle a bus event.
struct ArbiterSnapshot {
    current: Option<Command>,
    state: ArbiterState,
    dispatching: bool,
}

/// One ATA channel: up to two devices sharing a taskfile.
///
/// All methods expect to be called from one logical thread at a time; wrap
/// the bus in a [`crate::CommandGate`] to share it.
pub struct AtaBus<H, C> {
    pub(crate) hw: H,
    pub(crate) clock: C,
    pub(crate) config: BusConfig,
    pub(crate) timer: CommandTimer,
    pub(crate) queue: CommandQueue,
    pub(crate) arbiter: ArbiterState,
    pub(crate) current: Option<Command>,
    pub(crate) selected: Option<Unit>,
    pub(crate) devices: [DeviceInfo; 2],
    drivers: [Option<Box<dyn DeviceDriver>>; 2],
    pub(crate) double_buffer: DoubleBuffer,
    /// Set while [`AtaBus::dispatch_next`] is draining the queue.
    dispatching: bool,
}

impl<H: AtaHardware, C: HostClock> AtaBus<H, C> {
    pub fn new(mut hw: H, clock: C, config: BusConfig) -> Result<Self> {
        let double_buffer = hw.allocate_double_buffer()?;
        Ok(Self {
            hw,
            clock,
            config,
            timer: CommandTimer::new(),
            queue: CommandQueue::new(),
            arbiter: ArbiterState::IDLE,
            current: None,
            selected: None,
            devices: [DeviceInfo::default(); 2],
            drivers: [None, None],
            double_buffer,
            dispatching: false,
        })
    }

    /// Discovers attached devices. Returns how many were found.
    pub fn start(&mut self) -> usize {
        let found = self.scan_for_drives();
        debug!(found, devices = ?self.devices, "bus started");
        found
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn hardware(&self) -> &H {
        &self.hw
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn bus_state(&self) -> BusState {
        self.arbiter.bus
    }

    pub fn queue_state(&self) -> QueueState {
        self.arbiter.queue
    }

    pub fn arbiter_state(&self) -> ArbiterState {
        self.arbiter
    }

    pub fn current_command(&self) -> Option<&Command> {
        self.current.as_ref()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn selected_unit(&self) -> Option<Unit> {
        self.selected
    }

    pub fn timer_armed(&self) -> bool {
        self.timer.is_armed()
    }

    pub fn device_info(&self, unit: Unit) -> DeviceInfo {
        self.devices[unit.index()]
    }

    /// Records how the device wants its command packets, normally learned
    /// from IDENTIFY PACKET DEVICE word 0.
    pub fn set_packet_delivery(&mut self, unit: Unit, delivery: PacketDelivery) {
        self.devices[unit.index()].packet_delivery = delivery;
    }

    /// Binds a driver to `unit`, returning the one it replaces.
    pub fn attach_driver(
        &mut self,
        unit: Unit,
        driver: Box<dyn DeviceDriver>,
    ) -> Option<Box<dyn DeviceDriver>> {
        self.drivers[unit.index()].replace(driver)
    }

    pub fn detach_driver(&mut self, unit: Unit) -> Option<Box<dyn DeviceDriver>> {
        self.drivers[unit.index()].take()
    }

    pub fn provide_bus_info(&self) -> Result<BusInfo> {
        self.hw.provide_bus_info()
    }

    pub fn select_config(&mut self, unit: Unit, config: &DeviceTimingConfig) -> Result<()> {
        self.hw.select_config(unit, config)
    }

    pub fn get_config(&self, unit: Unit) -> Result<DeviceTimingConfig> {
        self.hw.get_config(unit)
    }

    /// Accepts a command for execution. Only malformed submissions fail
    /// here; everything else is reported through the command's completion.
    pub fn execute_command(&mut self, mut command: Command) -> std::result::Result<(), SubmitError> {
        command.in_use = true;
        self.handle_command(command);
        Ok(())
    }

    fn handle_command(&mut self, mut command: Command) {
        command.state = CommandState::Initial;
        command.result = None;
        command.polled_for_callout = false;
        command.actual_transfer = 0;
        trace!(opcode = ?command.opcode, unit = ?command.unit, immediate = command.immediate, "command queued");
        self.queue.enqueue(command);
        self.dispatch_next();
    }

    /// Starts queued commands until one is left in flight or the arbiter
    /// stops admitting.
    ///
    /// Commands that finish synchronously (polled I/O, register access,
    /// resets, flushes) call back in here from `complete_io`; those nested
    /// calls return [`Dispatch::Deferred`] and this loop starts the next
    /// command, so stack depth stays flat however long the queue is.
    pub fn dispatch_next(&mut self) -> Dispatch {
        if self.dispatching {
            return Dispatch::Deferred;
        }
        self.dispatching = true;
        let first = self.dispatch_one();
        if first == Dispatch::Dispatched {
            while self.dispatch_one() == Dispatch::Dispatched {}
        }
        self.dispatching = false;
        first
    }

    fn dispatch_one(&mut self) -> Dispatch {
        if !self.arbiter.admits(self.queue.head_is_immediate()) {
            return Dispatch::Blocked;
        }

        self.arbiter.bus = BusState::Busy;
        let Some(mut command) = self.queue.dequeue_first() else {
            self.arbiter.bus = BusState::Free;
            return Dispatch::QueueEmpty;
        };

        if command.opcode == Opcode::ExecIo && command.command_byte() == ATA_CMD_DEVICE_RESET {
            debug!(unit = ?command.unit, "device reset issued as I/O; handling as bus reset");
            command.opcode = Opcode::BusReset;
        }
        command.state = CommandState::Started;

        if self.arbiter.forces_polled(command.immediate) {
            if command.transfer.is_dma() {
                // DMA needs the completion interrupt, which a callout cannot wait for.
                warn!(unit = ?command.unit, "DMA command submitted during a bus event");
                self.current = Some(command);
                self.set_state(CommandState::Complete);
                self.complete_io(Err(AtaError::Unsupported));
                return Dispatch::Dispatched;
            }
            command.polled_for_callout = true;
        }

        let opcode = command.opcode;
        debug!(?opcode, unit = ?command.unit, polled = command.runs_polled(), "dispatching command");
        self.current = Some(command);

        match opcode {
            Opcode::ExecIo => self.handle_exec_io(),
            Opcode::RegisterAccess(direction) => self.handle_register_access(direction),
            Opcode::BusReset => self.handle_bus_reset(),
            Opcode::QueueFlush => self.handle_queue_flush(),
        }
        Dispatch::Dispatched
    }

    fn handle_exec_io(&mut self) {
        let Some(command) = self.current.as_ref() else {
            return;
        };
        let (unit, timeout_ms, polled) = (command.unit, command.timeout_ms, command.runs_polled());

        self.start_timer(timeout_ms);
        if let Err(err) = self.select_device(unit) {
            warn!(?unit, %err, "device is blocking the bus");
            self.set_state(CommandState::Complete);
            if polled {
                self.complete_io(Err(AtaError::Offline));
            } else {
                // Completed as a timeout when the grace timer fires.
                self.start_timer(self.config.stuck_bus_timeout_ms);
            }
            return;
        }

        let result = if polled {
            self.synchronous_io()
        } else {
            self.async_io()
        };
        if let Err(err) = result {
            debug!(?unit, %err, "I/O phase failed");
        }
    }

    fn handle_register_access(&mut self, direction: AccessDirection) {
        let Some(unit) = self.current.as_ref().map(|c| c.unit) else {
            return;
        };
        let result = self
            .select_device(unit)
            .and_then(|()| self.register_access(direction));
        self.set_state(CommandState::Complete);
        self.complete_io(result);
    }

    fn handle_bus_reset(&mut self) {
        let Some(command) = self.current.as_ref() else {
            return;
        };
        let atapi_only = command.protocol == Protocol::Atapi;
        let target = command.unit;
        let mut result = Ok(());

        for unit in Unit::ALL {
            if atapi_only && unit != target {
                continue;
            }
            if self.devices[unit.index()].kind != DeviceType::Atapi {
                continue;
            }
            self.hw
                .write_reg(AtaRegister::DeviceHead, DEVICE_HEAD_OBSOLETE | unit.select_bits());
            self.selected = None;
            let _ = self.hw.alt_status();
            result = self.soft_reset_bus(true);
        }

        if atapi_only {
            self.notify_event(BusEvent::AtapiReset, Some(target));
        } else {
            result = self.soft_reset_bus(false);
            self.notify_event(BusEvent::AtaReset, None);
        }

        self.set_state(CommandState::Complete);
        self.complete_io(result);
    }

    /// Cancels every queued command, then completes the flush itself.
    fn handle_queue_flush(&mut self) {
        let flushed = self.queue.drain();
        debug!(count = flushed.len(), "flushing queue");
        for mut command in flushed {
            command.state = CommandState::Done;
            command.result = Some(Err(AtaError::Cancelled));
            command.in_use = false;
            if let Some(done) = command.completion.take() {
                done(command, self);
            }
        }
        self.set_state(CommandState::Complete);
        self.complete_io(Ok(()));
    }

    /// Tells attached drivers about `event`. Only the driver for `unit` is
    /// told when one is given.
    ///
    /// Drivers may submit immediate commands from the handler; those run
    /// polled, to completion, before the handler returns. The arbiter state
    /// and the current command are restored exactly afterwards.
    pub(crate) fn notify_event(&mut self, event: BusEvent, unit: Option<Unit>) {
        let snapshot = ArbiterSnapshot {
            current: self.current.take(),
            state: self.arbiter,
            dispatching: self.dispatching,
        };
        self.arbiter = ArbiterState::CALLOUT;

        // Immediates submitted by drivers run from a dispatch loop of their own.
        self.dispatching = false;

        let mut drivers = std::mem::take(&mut self.drivers);
        for target in Unit::ALL {
            if unit.is_some_and(|u| u != target) {
                continue;
            }
            if let Some(driver) = drivers[target.index()].as_mut() {
                debug!(?event, unit = ?target, "notifying driver");
                driver.notify_event(event, self);
            }
        }
        for (slot, driver) in self.drivers.iter_mut().zip(drivers) {
            if slot.is_none() {
                *slot = driver;
            }
        }

        self.current = snapshot.current;
        self.arbiter = snapshot.state;
        self.dispatching = snapshot.dispatching;
    }

    /// Finishes the current command and starts the next one.
    pub(crate) fn complete_io(&mut self, result: Result<()>) {
        let Some(mut command) = self.current.take() else {
            return;
        };

        command.state = CommandState::Done;
        self.stop_timer();
        let _ = self.hw.stop_dma();
        self.arbiter.bus = BusState::Free;

        if command.result.is_none() {
            command.result = Some(result);
        }
        command.in_use = false;
        debug!(opcode = ?command.opcode, unit = ?command.unit, result = ?command.result, "command complete");

        if let Some(done) = command.completion.take() {
            done(command, self);
        }

        self.dispatch_next();
    }

    /// Entry point for the channel interrupt.
    pub fn handle_device_interrupt(&mut self) -> Result<()> {
        let status = self.hw.status();
        if self.current.is_none() {
            trace!(?status, "interrupt with no command in flight");
            return Err(AtaError::SpuriousInterrupt);
        }
        trace!(?status, "device interrupt");
        self.async_io()
    }

    /// Runs [`AtaBus::handle_timeout`] if the armed deadline has passed.
    pub fn poll_timer(&mut self) -> bool {
        if !self.timer.has_expired(self.clock.now_ns()) {
            return false;
        }
        self.timer.stop();
        self.handle_timeout();
        true
    }

    pub fn handle_timeout(&mut self) {
        let Some(command) = self.current.as_mut() else {
            self.dispatch_next();
            return;
        };
        warn!(opcode = ?command.opcode, unit = ?command.unit, state = ?command.state, "command timed out");

        command.result = Some(Err(AtaError::Timeout));
        command.state = CommandState::Complete;
        // complete_io tears down DMA.
        let _ = self.async_status();
        self.complete_io(Err(AtaError::Timeout));
    }

    pub(crate) fn start_timer(&mut self, timeout_ms: u32) {
        self.timer.start(self.clock.now_ns(), timeout_ms);
    }

    pub(crate) fn stop_timer(&mut self) {
        self.timer.stop();
    }

    pub(crate) fn check_timeout(&self) -> bool {
        self.timer.has_expired(self.clock.now_ns())
    }

    pub(crate) fn state(&self) -> Option<CommandState> {
        self.current.as_ref().map(|c| c.state)
    }

    pub(crate) fn set_state(&mut self, state: CommandState) {
        if let Some(command) = self.current.as_mut() {
            trace!(from = ?command.state, to = ?state, "command state");
            command.state = state;
        }
    }

    /// Short alternate-status wait (about a millisecond).
    pub(crate) fn wait_for_status(&mut self, mask: Status, value: Status) -> bool {
        self.hw.wait_for_status(
            &self.clock,
            self.config.status_wait_window,
            self.config.status_sample_interval,
            mask,
            value,
        )
    }
}

impl<H: AtaHardware, C: HostClock> CommandSink for AtaBus<H, C> {
    fn execute_command(&mut self, command: Command) -> std::result::Result<(), SubmitError> {
        AtaBus::execute_command(self, command)
    }

    fn device_info(&self, unit: Unit) -> DeviceInfo {
        AtaBus::device_info(self, unit)
    }
}
