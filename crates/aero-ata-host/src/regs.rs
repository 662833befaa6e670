//! Taskfile register model and the ordered port the engine drives.

use std::time::Duration;

use bitflags::bitflags;

use crate::clock::HostClock;

pub const ATA_CMD_DEVICE_RESET: u8 = 0x08;
pub const ATA_CMD_READ_SECTORS: u8 = 0x20;
pub const ATA_CMD_READ_SECTORS_EXT: u8 = 0x24;
pub const ATA_CMD_WRITE_SECTORS: u8 = 0x30;
pub const ATA_CMD_WRITE_SECTORS_EXT: u8 = 0x34;
pub const ATA_CMD_EXECUTE_DEVICE_DIAGNOSTIC: u8 = 0x90;
pub const ATA_CMD_INITIALIZE_DEVICE_PARAMETERS: u8 = 0x91;
pub const ATA_CMD_PACKET: u8 = 0xA0;
pub const ATA_CMD_IDENTIFY_PACKET_DEVICE: u8 = 0xA1;
pub const ATA_CMD_FLUSH_CACHE: u8 = 0xE7;
pub const ATA_CMD_IDENTIFY_DEVICE: u8 = 0xEC;
pub const ATA_CMD_SET_FEATURES: u8 = 0xEF;

/// Cylinder low/high values left by a packet device after reset.
pub const ATAPI_SIGNATURE: (u8, u8) = (0x14, 0xEB);

/// Device/head bits that must read back as one on legacy devices.
pub const DEVICE_HEAD_OBSOLETE: u8 = 0xA0;
pub const DEVICE_HEAD_LBA: u8 = 0x40;

/// Words in one IDENTIFY data block.
pub const IDENTIFY_WORDS: usize = 256;

/// The nine registers of an ATA channel.
///
/// Registers that share an address keep both names: reads return the first,
/// writes target the second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtaRegister {
    Data,
    ErrorFeatures,
    SectorCount,
    SectorNumber,
    CylinderLow,
    CylinderHigh,
    DeviceHead,
    StatusCommand,
    AltStatusDeviceControl,
}

impl AtaRegister {
    /// Offset within the command block, or within the control block for
    /// [`AtaRegister::AltStatusDeviceControl`].
    pub const fn offset(self) -> u16 {
        match self {
            AtaRegister::Data => 0,
            AtaRegister::ErrorFeatures => 1,
            AtaRegister::SectorCount => 2,
            AtaRegister::SectorNumber => 3,
            AtaRegister::CylinderLow => 4,
            AtaRegister::CylinderHigh => 5,
            AtaRegister::DeviceHead => 6,
            AtaRegister::StatusCommand => 7,
            AtaRegister::AltStatusDeviceControl => 0,
        }
    }

    pub const fn is_control_block(self) -> bool {
        matches!(self, AtaRegister::AltStatusDeviceControl)
    }
}

bitflags! {
    /// Status / alternate status register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Status: u8 {
        const BSY = 0x80;
        const DRDY = 0x40;
        const DF = 0x20;
        const DSC = 0x10;
        const DRQ = 0x08;
        const CORR = 0x04;
        const IDX = 0x02;
        const ERR = 0x01;
    }
}

bitflags! {
    /// Device control register.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceControl: u8 {
        const NIEN = 0x02;
        const SRST = 0x04;
        const HOB = 0x80;
    }
}

/// Raw, ordered access to one channel's registers.
///
/// Implementations perform exactly the access asked for; they never cache,
/// merge or reorder. The engine calls [`RegisterPort::barrier`] after every
/// access so posted writes reach the device before the next one.
pub trait RegisterPort {
    fn read_u8(&mut self, reg: AtaRegister) -> u8;
    fn write_u8(&mut self, reg: AtaRegister, value: u8);
    fn read_data(&mut self) -> u16;
    fn write_data(&mut self, value: u16);
    fn barrier(&mut self) {}
}

/// Barrier-separated register helpers used throughout the engine.
pub(crate) trait TaskFileIo: RegisterPort {
    fn read_reg(&mut self, reg: AtaRegister) -> u8 {
        let value = self.read_u8(reg);
        self.barrier();
        value
    }

    fn write_reg(&mut self, reg: AtaRegister, value: u8) {
        self.write_u8(reg, value);
        self.barrier();
    }

    fn read_word(&mut self) -> u16 {
        let value = self.read_data();
        self.barrier();
        value
    }

    fn write_word(&mut self, value: u16) {
        self.write_data(value);
        self.barrier();
    }

    /// Reads alternate status; does not acknowledge a pending interrupt.
    fn alt_status(&mut self) -> Status {
        Status::from_bits_retain(self.read_reg(AtaRegister::AltStatusDeviceControl))
    }

    /// Reads the status register, which acknowledges the device interrupt.
    fn status(&mut self) -> Status {
        Status::from_bits_retain(self.read_reg(AtaRegister::StatusCommand))
    }

    fn write_control(&mut self, control: DeviceControl) {
        self.write_reg(AtaRegister::AltStatusDeviceControl, control.bits());
    }

    /// Samples alternate status every `interval` until `(status & mask) == value`
    /// or `window` elapses.
    fn wait_for_status<C: HostClock + ?Sized>(
        &mut self,
        clock: &C,
        window: Duration,
        interval: Duration,
        mask: Status,
        value: Status,
    ) -> bool {
        let start = clock.now_ns();
        let window_ns = u64::try_from(window.as_nanos()).unwrap_or(u64::MAX);
        loop {
            if self.alt_status() & mask == value {
                return true;
            }
            if clock.now_ns().saturating_sub(start) >= window_ns {
                return false;
            }
            clock.delay(interval);
        }
    }
}

impl<P: RegisterPort + ?Sized> TaskFileIo for P {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeHostClock;

    struct CountingPort {
        alt_status: Vec<u8>,
        reads: usize,
        barriers: usize,
    }

    impl RegisterPort for CountingPort {
        fn read_u8(&mut self, reg: AtaRegister) -> u8 {
            assert_eq!(reg, AtaRegister::AltStatusDeviceControl);
            let idx = self.reads.min(self.alt_status.len() - 1);
            self.reads += 1;
            self.alt_status[idx]
        }

        fn write_u8(&mut self, _reg: AtaRegister, _value: u8) {}

        fn read_data(&mut self) -> u16 {
            0
        }

        fn write_data(&mut self, _value: u16) {}

        fn barrier(&mut self) {
            self.barriers += 1;
        }
    }

    #[test]
    fn wait_for_status_returns_once_mask_matches() {
        let clock = FakeHostClock::new();
        let mut port = CountingPort {
            alt_status: vec![0x80, 0x80, 0x58],
            reads: 0,
            barriers: 0,
        };
        let ok = port.wait_for_status(
            &clock,
            Duration::from_millis(1),
            Duration::from_micros(5),
            Status::BSY | Status::DRQ,
            Status::DRQ,
        );
        assert!(ok);
        assert_eq!(port.reads, 3);
        assert_eq!(port.barriers, 3);
        assert_eq!(clock.now_ns(), 10_000);
    }

    #[test]
    fn wait_for_status_gives_up_after_window() {
        let clock = FakeHostClock::new();
        let mut port = CountingPort {
            alt_status: vec![0x80],
            reads: 0,
            barriers: 0,
        };
        let ok = port.wait_for_status(
            &clock,
            Duration::from_millis(1),
            Duration::from_micros(5),
            Status::BSY,
            Status::empty(),
        );
        assert!(!ok);
        assert_eq!(clock.now_ns(), 1_000_000);
        assert_eq!(port.reads, 201);
    }

    #[test]
    fn control_block_register_is_distinguished() {
        assert!(AtaRegister::AltStatusDeviceControl.is_control_block());
        assert!(!AtaRegister::StatusCommand.is_control_block());
        assert_eq!(AtaRegister::StatusCommand.offset(), 7);
        assert_eq!(AtaRegister::DeviceHead.offset(), 6);
    }
}
