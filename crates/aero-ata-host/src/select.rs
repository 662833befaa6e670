//! Device selection, soft reset and drive discovery.

use tracing::{debug, trace, warn};

use crate::bus::AtaBus;
use crate::clock::HostClock;
use crate::command::{Opcode, Unit};
use crate::device::{DeviceInfo, DeviceType, PacketDelivery};
use crate::error::{AtaError, Result};
use crate::hardware::AtaHardware;
use crate::regs::{
    AtaRegister, DeviceControl, Status, TaskFileIo, ATAPI_SIGNATURE, ATA_CMD_DEVICE_RESET,
    ATA_CMD_EXECUTE_DEVICE_DIAGNOSTIC, ATA_CMD_IDENTIFY_PACKET_DEVICE,
    ATA_CMD_INITIALIZE_DEVICE_PARAMETERS, IDENTIFY_WORDS,
};

impl<H: AtaHardware, C: HostClock> AtaBus<H, C> {
    /// Makes `unit` the selected device and waits for it to accept a command.
    ///
    /// The select bit is only written when `unit` is not already selected.
    /// Polling is bounded by the current command's timeout (or
    /// `idle_select_timeout_ms` with nothing in flight) and by its deadline.
    /// Any failure forgets the cached selection.
    pub fn select_device(&mut self, unit: Unit) -> Result<()> {
        let (timeout_ms, needs_ready) = match self.current.as_ref() {
            Some(command) => (
                command.timeout_ms,
                command.opcode == Opcode::ExecIo
                    && !matches!(
                        command.command_byte(),
                        ATA_CMD_EXECUTE_DEVICE_DIAGNOSTIC | ATA_CMD_INITIALIZE_DEVICE_PARAMETERS
                    ),
            ),
            None => (self.config.idle_select_timeout_ms, false),
        };
        let needs_ready = needs_ready && self.devices[unit.index()].kind == DeviceType::Ata;

        self.hw.select_io_timing(unit);

        if self.selected != Some(unit) {
            let interval_ms = self.config.poll_interval.as_millis().max(1);
            let mut polls = u128::from(timeout_ms) / interval_ms;
            while !self.wait_for_status(Status::BSY | Status::DRQ, Status::empty()) {
                let status = self.hw.status();
                if polls == 0 || status.contains(Status::DRQ) || self.check_timeout() {
                    debug!(?unit, ?status, "bus not idle, cannot select");
                    self.selected = None;
                    return Err(AtaError::DeviceBusy);
                }
                polls -= 1;
                self.clock.sleep(self.config.poll_interval);
            }
            self.selected = None;
            self.hw.write_reg(AtaRegister::DeviceHead, unit.select_bits());
        }

        let (mask, value) = if needs_ready {
            (Status::BSY | Status::DRDY, Status::DRDY)
        } else {
            (Status::BSY, Status::empty())
        };
        let mut polls = self.config.ready_poll_limit;
        while !self.wait_for_status(mask, value) {
            let status = self.hw.status();
            if polls == 0 || status.contains(Status::DRQ) || self.check_timeout() {
                debug!(?unit, ?status, "device not ready after selection");
                self.selected = None;
                return Err(AtaError::DeviceBusy);
            }
            polls -= 1;
            self.clock.sleep(self.config.poll_interval);
        }

        self.hw.write_control(DeviceControl::empty());
        self.selected = Some(unit);
        trace!(?unit, "device selected");
        Ok(())
    }

    /// Resets the bus, or only the selected packet device when `atapi` is set.
    ///
    /// Fails with [`AtaError::Timeout`] if the devices do not come back
    /// within `reset_poll_limit` polls; there is no automatic retry.
    pub fn soft_reset_bus(&mut self, atapi: bool) -> Result<()> {
        if atapi {
            self.hw.write_reg(AtaRegister::StatusCommand, ATA_CMD_DEVICE_RESET);
        } else {
            self.hw.write_control(DeviceControl::SRST);
            self.clock.delay(self.config.reset_hold);
            self.hw.write_control(DeviceControl::empty());
            self.selected = None;
        }

        self.clock.sleep(self.config.reset_settle);

        let (mask, value) = if !atapi && self.devices[0].kind == DeviceType::Ata {
            (Status::BSY | Status::DRDY, Status::DRDY)
        } else {
            (Status::BSY, Status::empty())
        };
        for _ in 0..self.config.reset_poll_limit {
            let status = self.hw.status();
            if status & mask == value {
                debug!(atapi, ?status, "reset complete");
                return Ok(());
            }
            self.clock.sleep(self.config.poll_interval);
        }

        warn!(atapi, "devices did not come back from reset");
        Err(AtaError::Timeout)
    }

    /// Classifies both units from their reset signatures and returns how
    /// many devices answered. Leaves device 0 selected electrically with the
    /// cached selection cleared.
    pub fn scan_for_drives(&mut self) -> usize {
        self.devices = [DeviceInfo::default(); 2];
        let found = self.classify_units();

        self.hw.write_reg(AtaRegister::DeviceHead, 0x00);
        self.hw.write_control(DeviceControl::empty());
        self.selected = None;
        found
    }

    fn classify_units(&mut self) -> usize {
        let mut budget = self.config.scan_poll_limit;
        if !self.poll_not_busy(&mut budget) {
            warn!("bus stuck busy, no devices found");
            return 0;
        }

        let mut found = 0;
        for unit in Unit::ALL {
            self.hw.write_reg(AtaRegister::DeviceHead, unit.select_bits());
            if !self.poll_not_busy(&mut budget) {
                warn!(?unit, "scan budget exhausted");
                break;
            }

            let sector_count = self.hw.read_reg(AtaRegister::SectorCount);
            let sector_number = self.hw.read_reg(AtaRegister::SectorNumber);
            let cylinder_low = self.hw.read_reg(AtaRegister::CylinderLow);
            let cylinder_high = self.hw.read_reg(AtaRegister::CylinderHigh);

            if (cylinder_low, cylinder_high) == ATAPI_SIGNATURE {
                if unit == Unit::Device1
                    && self.devices[0].kind == DeviceType::Atapi
                    && !self.atapi_slave_exists()
                {
                    debug!("device 1 signature is a shadow of device 0");
                    break;
                }
                self.devices[unit.index()] = DeviceInfo {
                    kind: DeviceType::Atapi,
                    packet_delivery: PacketDelivery::DrqFast,
                };
                found += 1;
                debug!(?unit, "found ATAPI device");
                continue;
            }

            let status = self.hw.alt_status();
            if sector_count == 0x01
                && sector_number == 0x01
                && cylinder_low == 0x00
                && cylinder_high == 0x00
                && status & (Status::DRDY | Status::ERR) == Status::DRDY
            {
                self.devices[unit.index()] = DeviceInfo {
                    kind: DeviceType::Ata,
                    packet_delivery: PacketDelivery::Unknown,
                };
                found += 1;
                debug!(?unit, "found ATA device");
            } else {
                trace!(?unit, sector_count, sector_number, cylinder_low, cylinder_high, ?status, "no recognisable signature");
            }
        }
        found
    }

    fn poll_not_busy(&mut self, budget: &mut u32) -> bool {
        loop {
            if !self.hw.alt_status().contains(Status::BSY) {
                return true;
            }
            if *budget == 0 {
                return false;
            }
            *budget -= 1;
            self.clock.sleep(self.config.poll_interval);
        }
    }

    /// Sends IDENTIFY PACKET DEVICE to the selected device 1 and reports
    /// whether a real device returns data.
    ///
    /// A lone packet device may answer register reads for an absent slave;
    /// only the data phase proves a second device is there.
    pub(crate) fn atapi_slave_exists(&mut self) -> bool {
        self.hw.write_control(DeviceControl::NIEN);
        self.hw
            .write_reg(AtaRegister::StatusCommand, ATA_CMD_IDENTIFY_PACKET_DEVICE);
        let _ = self.hw.alt_status();
        let present = if self.hw.alt_status().is_empty() {
            false
        } else {
            self.await_identify_data()
        };
        self.hw.write_control(DeviceControl::empty());
        present
    }

    fn await_identify_data(&mut self) -> bool {
        for _ in 0..self.config.slave_probe_poll_limit {
            let status = self.hw.alt_status();
            if status.contains(Status::ERR) {
                break;
            }
            if status & (Status::BSY | Status::DRQ) == Status::DRQ {
                let _ = self.hw.status();
                for _ in 0..IDENTIFY_WORDS {
                    let _ = self.hw.read_word();
                }
                return true;
            }
            self.clock.sleep(self.config.poll_interval);
        }
        let _ = self.hw.status();
        false
    }
}
