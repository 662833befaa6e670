//! Programmed I/O data phases, staged through the double buffer.

use tracing::{debug, trace};

use crate::bus::AtaBus;
use crate::clock::HostClock;
use crate::command::{CommandState, Protocol};
use crate::error::{AtaError, Result};
use crate::hardware::AtaHardware;
use crate::regs::{AtaRegister, RegisterPort, Status, TaskFileIo};

impl<H: AtaHardware, C: HostClock> AtaBus<H, C> {
    /// Moves one DRQ block of the current command.
    ///
    /// Leaves the command in `DataTransfer` while bytes remain and in
    /// `Status` once the transfer is exhausted or has failed.
    pub(crate) fn async_data(&mut self) -> Result<()> {
        let command = self.current.as_ref().ok_or(AtaError::ProtocolInconsistent)?;
        let remaining = command.byte_count.saturating_sub(command.actual_transfer);
        let atapi = command.protocol == Protocol::Atapi;
        let packet = command.is_packet_command();
        let reading = command.transfer.is_read();
        let chunk = command.chunk_size;

        if remaining == 0 {
            self.set_state(CommandState::Status);
            return Ok(());
        }

        let mut ready = false;
        while !self.check_timeout() {
            let status = self.hw.alt_status() & (Status::BSY | Status::DRQ | Status::ERR);
            if status.contains(Status::ERR) && !status.contains(Status::BSY) {
                self.set_state(CommandState::Status);
                return Err(AtaError::DeviceError);
            }
            if status == Status::DRQ {
                ready = true;
                break;
            }
            if packet && status.is_empty() && self.atapi_status_phase() {
                debug!(remaining, "device ended the data phase early");
                self.set_state(CommandState::Status);
                return Ok(());
            }
            self.clock.delay(self.config.data_sample_interval);
        }
        if !ready {
            self.set_state(CommandState::Status);
            return Err(AtaError::Timeout);
        }

        let mut this_pass = remaining.min(chunk);
        let mut overrun = 0;
        if atapi {
            let reported = self.atapi_byte_count();
            if reported == 0 {
                self.set_state(CommandState::Status);
                return Err(AtaError::ProtocolInconsistent);
            }
            this_pass = reported.min(remaining);
            overrun = reported - this_pass;
        }

        self.move_block(this_pass, reading)?;
        if overrun > 0 {
            debug!(overrun, reading, "device offered more data than requested");
            self.handle_overrun(overrun, reading);
        }

        let left = remaining - this_pass;
        trace!(this_pass, left, "data block moved");
        self.set_state(if left > 0 {
            CommandState::DataTransfer
        } else {
            CommandState::Status
        });
        Ok(())
    }

    /// Copies `len` bytes between the device and the command buffer in
    /// double-buffer sized slices.
    fn move_block(&mut self, len: usize, reading: bool) -> Result<()> {
        let command = self.current.as_mut().ok_or(AtaError::ProtocolInconsistent)?;
        let buffer = command
            .buffer
            .as_mut()
            .ok_or(AtaError::InvalidArgument("data transfer without a buffer"))?;

        let mut left = len;
        while left > 0 {
            let n = left.min(self.double_buffer.len());
            let offset = command.position + command.actual_transfer;
            let staging = &mut self.double_buffer.as_mut_slice()[..n];
            if reading {
                transfer_in(&mut self.hw, staging);
                buffer.write_bytes(offset, staging)?;
            } else {
                buffer.read_bytes(offset, staging)?;
                transfer_out(&mut self.hw, staging);
            }
            command.actual_transfer += n;
            left -= n;
        }
        Ok(())
    }

    /// Drains or pads bytes the device wants beyond the host's transfer.
    fn handle_overrun(&mut self, len: usize, reading: bool) {
        for _ in 0..len.div_ceil(2) {
            if reading {
                let _ = self.hw.read_word();
            } else {
                self.hw.write_word(0);
            }
        }
    }

    fn atapi_byte_count(&mut self) -> usize {
        let low = self.hw.read_reg(AtaRegister::CylinderLow);
        let high = self.hw.read_reg(AtaRegister::CylinderHigh);
        usize::from(u16::from_le_bytes([low, high]))
    }

    fn atapi_status_phase(&mut self) -> bool {
        self.hw.read_reg(AtaRegister::SectorCount) & 0x03 == 0x03
    }
}

/// Word-wide reads with a trailing byte read for odd lengths.
pub(crate) fn transfer_in<P: RegisterPort + ?Sized>(port: &mut P, dst: &mut [u8]) {
    let mut words = dst.chunks_exact_mut(2);
    for word in &mut words {
        word.copy_from_slice(&port.read_word().to_le_bytes());
    }
    if let [last] = words.into_remainder() {
        *last = port.read_reg(AtaRegister::Data);
    }
}

pub(crate) fn transfer_out<P: RegisterPort + ?Sized>(port: &mut P, src: &[u8]) {
    let mut words = src.chunks_exact(2);
    for word in &mut words {
        port.write_word(u16::from_le_bytes([word[0], word[1]]));
    }
    if let [last] = words.remainder() {
        port.write_reg(AtaRegister::Data, *last);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct DataPort {
        incoming: Vec<u8>,
        read_pos: usize,
        written: Vec<u8>,
        word_accesses: usize,
        byte_accesses: usize,
    }

    impl RegisterPort for DataPort {
        fn read_u8(&mut self, reg: AtaRegister) -> u8 {
            assert_eq!(reg, AtaRegister::Data);
            self.byte_accesses += 1;
            let b = self.incoming[self.read_pos];
            self.read_pos += 1;
            b
        }

        fn write_u8(&mut self, reg: AtaRegister, value: u8) {
            assert_eq!(reg, AtaRegister::Data);
            self.byte_accesses += 1;
            self.written.push(value);
        }

        fn read_data(&mut self) -> u16 {
            self.word_accesses += 1;
            let w = u16::from_le_bytes([self.incoming[self.read_pos], self.incoming[self.read_pos + 1]]);
            self.read_pos += 2;
            w
        }

        fn write_data(&mut self, value: u16) {
            self.word_accesses += 1;
            self.written.extend_from_slice(&value.to_le_bytes());
        }
    }

    #[test]
    fn odd_length_read_ends_with_a_byte_access() {
        let mut port = DataPort {
            incoming: (1..=5).collect(),
            ..DataPort::default()
        };
        let mut dst = [0u8; 5];
        transfer_in(&mut port, &mut dst);
        assert_eq!(dst, [1, 2, 3, 4, 5]);
        assert_eq!(port.word_accesses, 2);
        assert_eq!(port.byte_accesses, 1);
    }

    #[test]
    fn even_length_write_is_word_only() {
        let mut port = DataPort::default();
        transfer_out(&mut port, &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(port.written, vec![0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(port.word_accesses, 2);
        assert_eq!(port.byte_accesses, 0);
    }
}
