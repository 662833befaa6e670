//! Command phases: issue, packet, data, status.
//!
//! Interrupt-driven commands advance through [`AtaBus::async_io`] one
//! interrupt at a time. Polled commands run every phase in
//! [`AtaBus::synchronous_io`] with device interrupts masked.

use tracing::{debug, trace, warn};

use crate::bus::AtaBus;
use crate::clock::HostClock;
use crate::command::{
    AccessDirection, Addressing, CommandState, ExtendedTaskFile, Protocol, RegisterMask,
    TaskFile, TaskFileCapture, Transfer,
};
use crate::device::PacketDelivery;
use crate::error::{AtaError, Result};
use crate::hardware::AtaHardware;
use crate::regs::{AtaRegister, DeviceControl, Status, TaskFileIo};

/// What the phase machine does after running one phase.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Advance {
    /// Wait for the next interrupt (or the timer).
    Await,
    /// Run the next phase now.
    Continue(CommandState),
    /// The command is finished.
    Finish(Result<()>),
}

impl<H: AtaHardware, C: HostClock> AtaBus<H, C> {
    /// Advances the current interrupt-driven command.
    pub(crate) fn async_io(&mut self) -> Result<()> {
        let Some(command) = self.current.as_ref() else {
            return Err(AtaError::ProtocolInconsistent);
        };
        if command.is_packet_command()
            && matches!(
                command.state,
                CommandState::PacketIssue | CommandState::DataTransfer | CommandState::Status
            )
        {
            let next = self.determine_atapi_state();
            self.set_state(next);
        }

        loop {
            let state = self.state().ok_or(AtaError::ProtocolInconsistent)?;
            match self.advance(state) {
                Advance::Await => return Ok(()),
                Advance::Continue(next) => self.set_state(next),
                Advance::Finish(result) => {
                    self.complete_io(result.clone());
                    return result;
                }
            }
        }
    }

    fn advance(&mut self, state: CommandState) -> Advance {
        match state {
            CommandState::Started => {
                if let Err(err) = self.async_command() {
                    return self.fail_phase(err);
                }
                let (state, unit) = match self.current.as_ref() {
                    Some(command) => (command.state, command.unit),
                    None => return Advance::Finish(Err(AtaError::ProtocolInconsistent)),
                };
                if state == CommandState::PacketIssue
                    && self.devices[unit.index()].packet_delivery != PacketDelivery::Irq
                {
                    Advance::Continue(CommandState::PacketIssue)
                } else {
                    Advance::Await
                }
            }
            CommandState::PacketIssue => {
                if let Err(err) = self.write_packet() {
                    return self.fail_phase(err);
                }
                self.set_state(self.after_packet_state());
                Advance::Await
            }
            CommandState::DataTransfer => {
                if let Err(err) = self.async_data() {
                    return self.fail_phase(err);
                }
                let Some(command) = self.current.as_ref() else {
                    return Advance::Finish(Err(AtaError::ProtocolInconsistent));
                };
                let pio_write = command.protocol == Protocol::Ata && command.transfer == Transfer::PioOut;
                if command.state == CommandState::DataTransfer
                    || pio_write
                    || command.is_packet_command()
                {
                    Advance::Await
                } else {
                    Advance::Continue(CommandState::Status)
                }
            }
            CommandState::Status => {
                let result = self.async_status();
                self.set_state(CommandState::Complete);
                Advance::Finish(result)
            }
            CommandState::Complete => {
                // Selection failed; the grace timer finishes this command.
                trace!("interrupt while waiting for the stuck-bus timer");
                Advance::Await
            }
            CommandState::Initial | CommandState::Done => {
                warn!(?state, "command in an impossible state");
                self.set_state(CommandState::Complete);
                Advance::Finish(Err(AtaError::ProtocolInconsistent))
            }
        }
    }

    fn fail_phase(&mut self, err: AtaError) -> Advance {
        debug!(%err, "phase failed");
        self.set_state(CommandState::Complete);
        let _ = self.async_status();
        Advance::Finish(Err(err))
    }

    fn after_packet_state(&self) -> CommandState {
        match self.current.as_ref() {
            Some(command) if command.transfer.is_pio() => CommandState::DataTransfer,
            _ => CommandState::Status,
        }
    }

    /// Runs the current command to completion with interrupts masked.
    pub(crate) fn synchronous_io(&mut self) -> Result<()> {
        self.hw.write_control(DeviceControl::NIEN);

        let mut result = self.async_command();
        if result.is_ok() && !self.poll_not_busy_until_deadline() {
            warn!(status = ?self.hw.alt_status(), "polled command still busy at its deadline");
            result = Err(AtaError::Timeout);
        }
        if result.is_err() {
            self.set_state(CommandState::Complete);
        }

        if self.state() == Some(CommandState::PacketIssue) {
            result = self.write_packet();
            let next = if result.is_err() {
                CommandState::Complete
            } else {
                self.after_packet_state()
            };
            self.set_state(next);
        }

        if self.state() == Some(CommandState::DataTransfer) {
            while self.state() == Some(CommandState::DataTransfer) {
                if let Err(err) = self.async_data() {
                    result = Err(err);
                    self.set_state(CommandState::Complete);
                    break;
                }
            }
            if result.is_ok() && self.current.as_ref().is_some_and(|c| c.is_packet_command()) {
                self.wait_for_status(Status::BSY, Status::empty());
            }
        }

        if self.state() == Some(CommandState::Status) {
            result = self.async_status();
            self.set_state(CommandState::Complete);
        } else if result.is_err() {
            let _ = self.async_status();
        }

        let _ = self.hw.status();
        self.hw.write_control(DeviceControl::empty());

        if self.state() == Some(CommandState::Complete) {
            self.complete_io(result.clone());
        }
        result
    }

    /// Coarse BSY=0 polling for polled commands, bounded by both
    /// `sync_busy_poll_limit` and the command deadline.
    fn poll_not_busy_until_deadline(&mut self) -> bool {
        for _ in 0..self.config.sync_busy_poll_limit {
            if self.wait_for_status(Status::BSY, Status::empty()) {
                return true;
            }
            if self.check_timeout() {
                return false;
            }
            self.clock.sleep(self.config.poll_interval);
        }
        false
    }

    /// Starts DMA if needed, issues the taskfile and picks the first phase.
    fn async_command(&mut self) -> Result<()> {
        let command = self.current.as_ref().ok_or(AtaError::ProtocolInconsistent)?;
        let transfer = command.transfer;
        let protocol = command.protocol;
        let packet = command.is_packet_command();

        if transfer.is_dma() {
            if let Err(err) = self.hw.start_dma(command) {
                let _ = self.hw.stop_dma();
                return Err(err);
            }
        }

        self.issue_command()?;

        let next = if packet {
            CommandState::PacketIssue
        } else if transfer.is_dma() {
            CommandState::Status
        } else if transfer == Transfer::PioOut && protocol == Protocol::Ata {
            self.set_state(CommandState::DataTransfer);
            return self.async_data();
        } else if transfer == Transfer::PioIn {
            CommandState::DataTransfer
        } else {
            CommandState::Status
        };
        self.set_state(next);
        Ok(())
    }

    /// Writes the taskfile and command byte.
    ///
    /// The DEV bit always follows the command's unit so the cached
    /// selection stays truthful.
    fn issue_command(&mut self) -> Result<()> {
        let command = self.current.as_ref().ok_or(AtaError::ProtocolInconsistent)?;
        let unit_bits = command.unit.select_bits();
        let tf = command.task_file;
        let addressing = command.addressing;
        trace!(command = command.command_byte(), unit = ?command.unit, "issuing command");

        match addressing {
            Addressing::Lba48(ext) => {
                self.hw
                    .write_reg(AtaRegister::DeviceHead, (ext.device & !0x10) | unit_bits);
                let pairs = [
                    (AtaRegister::ErrorFeatures, ext.features),
                    (AtaRegister::SectorCount, ext.sector_count),
                    (AtaRegister::SectorNumber, ext.lba_low),
                    (AtaRegister::CylinderLow, ext.lba_mid),
                    (AtaRegister::CylinderHigh, ext.lba_high),
                ];
                for (reg, value) in pairs {
                    self.hw.write_reg(reg, (value >> 8) as u8);
                }
                for (reg, value) in pairs {
                    self.hw.write_reg(reg, value as u8);
                }
                self.hw.write_reg(AtaRegister::StatusCommand, ext.command);
            }
            Addressing::Lba28 => {
                self.hw
                    .write_reg(AtaRegister::DeviceHead, (tf.device_head & !0x10) | unit_bits);
                self.hw.write_reg(AtaRegister::ErrorFeatures, tf.features);
                self.hw.write_reg(AtaRegister::SectorCount, tf.sector_count);
                self.hw.write_reg(AtaRegister::SectorNumber, tf.sector_number);
                self.hw.write_reg(AtaRegister::CylinderLow, tf.cylinder_low);
                self.hw.write_reg(AtaRegister::CylinderHigh, tf.cylinder_high);
                self.hw.write_reg(AtaRegister::StatusCommand, tf.command);
            }
        }
        Ok(())
    }

    /// Waits for the device to request the packet, then writes it.
    fn write_packet(&mut self) -> Result<()> {
        let Some(packet) = self.current.as_ref().and_then(|c| c.packet) else {
            return Ok(());
        };

        let mut retries = self.config.packet_drq_retries;
        while !self.wait_for_status(Status::BSY | Status::DRQ, Status::DRQ) {
            let status = self.hw.alt_status() & (Status::BSY | Status::ERR);
            if status == Status::ERR {
                return Err(AtaError::DeviceError);
            }
            if retries == 0 || self.check_timeout() {
                return Err(AtaError::Timeout);
            }
            retries -= 1;
            self.clock.sleep(self.config.poll_interval);
        }

        trace!(?packet, "writing command packet");
        for word in packet.words() {
            self.hw.write_word(word);
        }
        Ok(())
    }

    /// Next phase of a packet command from the interrupt reason bits.
    pub(crate) fn determine_atapi_state(&mut self) -> CommandState {
        match self.state() {
            Some(CommandState::Started) | None => return CommandState::Started,
            _ => {}
        }
        match self.hw.read_reg(AtaRegister::SectorCount) & 0x03 {
            0x01 => CommandState::PacketIssue,
            0x03 => CommandState::Status,
            _ => CommandState::DataTransfer,
        }
    }

    /// Collects final status and error, copying the taskfile back when the
    /// command asked for it. A device still busy after a short wait has not
    /// finished and never counts as success.
    pub(crate) fn async_status(&mut self) -> Result<()> {
        let Some(capture) = self.current.as_ref().map(|c| c.capture) else {
            return Err(AtaError::ProtocolInconsistent);
        };
        if self.hw.alt_status().contains(Status::BSY) {
            self.wait_for_status(Status::BSY, Status::empty());
        }
        let status = self.hw.alt_status();

        let (result, error) = if status.contains(Status::BSY) {
            (Err(AtaError::DeviceBusy), 0)
        } else if status.contains(Status::ERR) {
            let error = self.hw.read_reg(AtaRegister::ErrorFeatures);
            if capture != TaskFileCapture::Never {
                self.register_access(AccessDirection::Read)?;
            }
            (Err(AtaError::DeviceError), error)
        } else {
            if capture == TaskFileCapture::Always {
                self.register_access(AccessDirection::Read)?;
            }
            (Ok(()), 0)
        };

        if let Some(command) = self.current.as_mut() {
            command.end_status = status.bits();
            command.end_error = error;
        }
        if status.intersects(Status::BSY | Status::ERR) {
            debug!(?status, error, "command did not finish cleanly");
        }
        result
    }

    /// Transfers the registers named by the command's mask, in register
    /// order. An empty mask on a capturing command means the full taskfile.
    pub(crate) fn register_access(&mut self, direction: AccessDirection) -> Result<()> {
        let command = self.current.as_ref().ok_or(AtaError::ProtocolInconsistent)?;
        let mask = if command.register_mask.is_empty() {
            RegisterMask::TASK_FILE
        } else {
            command.register_mask
        };
        let mut tf = command.task_file;
        let mut addressing = command.addressing;

        match direction {
            AccessDirection::Read => self.read_registers(mask, &mut tf, &mut addressing),
            AccessDirection::Write => self.write_registers(mask, &tf, &addressing),
        }

        if let Some(command) = self.current.as_mut() {
            command.task_file = tf;
            command.addressing = addressing;
        }
        Ok(())
    }

    fn read_registers(&mut self, mask: RegisterMask, tf: &mut TaskFile, addressing: &mut Addressing) {
        match addressing {
            Addressing::Lba48(ext) => self.read_extended(mask, ext),
            Addressing::Lba28 => {
                if mask.contains(RegisterMask::ERROR_FEATURES) {
                    tf.features = self.hw.read_reg(AtaRegister::ErrorFeatures);
                }
                if mask.contains(RegisterMask::SECTOR_COUNT) {
                    tf.sector_count = self.hw.read_reg(AtaRegister::SectorCount);
                }
                if mask.contains(RegisterMask::SECTOR_NUMBER) {
                    tf.sector_number = self.hw.read_reg(AtaRegister::SectorNumber);
                }
                if mask.contains(RegisterMask::CYLINDER_LOW) {
                    tf.cylinder_low = self.hw.read_reg(AtaRegister::CylinderLow);
                }
                if mask.contains(RegisterMask::CYLINDER_HIGH) {
                    tf.cylinder_high = self.hw.read_reg(AtaRegister::CylinderHigh);
                }
            }
        }
        if mask.contains(RegisterMask::DEVICE_HEAD) {
            tf.device_head = self.hw.read_reg(AtaRegister::DeviceHead);
        }
        if mask.contains(RegisterMask::ALT_STATUS_DEVICE_CONTROL) {
            tf.control = self.hw.read_reg(AtaRegister::AltStatusDeviceControl);
        }
        if mask.contains(RegisterMask::DATA) {
            tf.data = self.hw.read_word();
        }
        if mask.contains(RegisterMask::STATUS_COMMAND) {
            tf.command = self.hw.read_reg(AtaRegister::StatusCommand);
        }
    }

    fn write_registers(&mut self, mask: RegisterMask, tf: &TaskFile, addressing: &Addressing) {
        match addressing {
            Addressing::Lba48(ext) => self.write_extended(mask, ext),
            Addressing::Lba28 => {
                if mask.contains(RegisterMask::ERROR_FEATURES) {
                    self.hw.write_reg(AtaRegister::ErrorFeatures, tf.features);
                }
                if mask.contains(RegisterMask::SECTOR_COUNT) {
                    self.hw.write_reg(AtaRegister::SectorCount, tf.sector_count);
                }
                if mask.contains(RegisterMask::SECTOR_NUMBER) {
                    self.hw.write_reg(AtaRegister::SectorNumber, tf.sector_number);
                }
                if mask.contains(RegisterMask::CYLINDER_LOW) {
                    self.hw.write_reg(AtaRegister::CylinderLow, tf.cylinder_low);
                }
                if mask.contains(RegisterMask::CYLINDER_HIGH) {
                    self.hw.write_reg(AtaRegister::CylinderHigh, tf.cylinder_high);
                }
            }
        }
        if mask.contains(RegisterMask::DEVICE_HEAD) {
            self.hw.write_reg(AtaRegister::DeviceHead, tf.device_head);
        }
        if mask.contains(RegisterMask::ALT_STATUS_DEVICE_CONTROL) {
            self.hw.write_reg(AtaRegister::AltStatusDeviceControl, tf.control);
        }
        if mask.contains(RegisterMask::DATA) {
            self.hw.write_word(tf.data);
        }
        if mask.contains(RegisterMask::STATUS_COMMAND) {
            self.hw.write_reg(AtaRegister::StatusCommand, tf.command);
        }
    }

    fn read_extended(&mut self, mask: RegisterMask, ext: &mut ExtendedTaskFile) {
        if mask.contains(RegisterMask::ERROR_FEATURES) {
            ext.features = self.read_ext_register(AtaRegister::ErrorFeatures);
        }
        if mask.contains(RegisterMask::SECTOR_COUNT) {
            ext.sector_count = self.read_ext_register(AtaRegister::SectorCount);
        }
        if mask.contains(RegisterMask::SECTOR_NUMBER) {
            ext.lba_low = self.read_ext_register(AtaRegister::SectorNumber);
        }
        if mask.contains(RegisterMask::CYLINDER_LOW) {
            ext.lba_mid = self.read_ext_register(AtaRegister::CylinderLow);
        }
        if mask.contains(RegisterMask::CYLINDER_HIGH) {
            ext.lba_high = self.read_ext_register(AtaRegister::CylinderHigh);
        }
    }

    fn write_extended(&mut self, mask: RegisterMask, ext: &ExtendedTaskFile) {
        if mask.contains(RegisterMask::ERROR_FEATURES) {
            self.write_ext_register(AtaRegister::ErrorFeatures, ext.features);
        }
        if mask.contains(RegisterMask::SECTOR_COUNT) {
            self.write_ext_register(AtaRegister::SectorCount, ext.sector_count);
        }
        if mask.contains(RegisterMask::SECTOR_NUMBER) {
            self.write_ext_register(AtaRegister::SectorNumber, ext.lba_low);
        }
        if mask.contains(RegisterMask::CYLINDER_LOW) {
            self.write_ext_register(AtaRegister::CylinderLow, ext.lba_mid);
        }
        if mask.contains(RegisterMask::CYLINDER_HIGH) {
            self.write_ext_register(AtaRegister::CylinderHigh, ext.lba_high);
        }
    }

    /// Reads the current byte, then the previous-content byte with HOB set.
    /// Polled commands keep nIEN asserted throughout.
    fn read_ext_register(&mut self, reg: AtaRegister) -> u16 {
        let base = if self.current.as_ref().is_some_and(|c| c.runs_polled()) {
            DeviceControl::NIEN
        } else {
            DeviceControl::empty()
        };
        let low = self.hw.read_reg(reg);
        self.hw.write_control(base | DeviceControl::HOB);
        let high = self.hw.read_reg(reg);
        self.hw.write_control(base);
        u16::from_le_bytes([low, high])
    }

    /// High byte first: the device shifts the first write into the
    /// previous-content slot.
    fn write_ext_register(&mut self, reg: AtaRegister, value: u16) {
        let [low, high] = value.to_le_bytes();
        self.hw.write_reg(reg, high);
        self.hw.write_reg(reg, low);
    }
}
