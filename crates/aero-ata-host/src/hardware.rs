//! Hooks a concrete controller implements on top of its register port.

use crate::buffer::DoubleBuffer;
use crate::command::{Command, Unit};
use crate::device::PacketDelivery;
use crate::error::{AtaError, Result};
use crate::regs::RegisterPort;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketType {
    #[default]
    Unknown,
    Internal,
    MediaBay,
    PcCard,
}

/// Capabilities of the controller, for drivers choosing transfer modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusInfo {
    pub socket: SocketType,
    /// Bitmap of supported PIO modes (bit n = mode n).
    pub pio_modes: u8,
    pub multiword_dma_modes: u8,
    pub ultra_dma_modes: u16,
    pub supports_dma: bool,
    pub supports_lba48: bool,
    pub units: u8,
}

/// Transfer timing selected for one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceTimingConfig {
    pub pio_mode: u8,
    pub multiword_dma_mode: Option<u8>,
    pub ultra_dma_mode: Option<u8>,
    pub packet_delivery: PacketDelivery,
}

/// Controller-specific behaviour the bus engine calls into.
///
/// Everything except the register port has a default: DMA and configuration
/// hooks report [`AtaError::Unsupported`], timing selection does nothing and
/// the double buffer comes from the heap.
pub trait AtaHardware: RegisterPort {
    /// Programs the DMA engine for `command` and starts it.
    fn start_dma(&mut self, _command: &Command) -> Result<()> {
        Err(AtaError::Unsupported)
    }

    /// Stops any DMA in flight. Must be harmless when nothing is running.
    fn stop_dma(&mut self) -> Result<()> {
        Err(AtaError::Unsupported)
    }

    /// Reprograms per-device bus timing before `unit` is selected.
    fn select_io_timing(&mut self, _unit: Unit) {}

    fn allocate_double_buffer(&mut self) -> Result<DoubleBuffer> {
        Ok(DoubleBuffer::heap())
    }

    fn provide_bus_info(&self) -> Result<BusInfo> {
        Err(AtaError::Unsupported)
    }

    fn select_config(&mut self, _unit: Unit, _config: &DeviceTimingConfig) -> Result<()> {
        Err(AtaError::Unsupported)
    }

    fn get_config(&self, _unit: Unit) -> Result<DeviceTimingConfig> {
        Err(AtaError::Unsupported)
    }
}
