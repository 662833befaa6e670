use crate::error::{AtaError, Result};

pub const SECTOR_SIZE: usize = 512;

/// Sectors staged per double-buffer slice.
pub const DOUBLE_BUFFER_SECTORS: usize = 8;
pub const DOUBLE_BUFFER_SIZE: usize = DOUBLE_BUFFER_SECTORS * SECTOR_SIZE;

/// Memory a command transfers to or from.
///
/// Offsets are relative to the start of the descriptor. Implementations
/// reject accesses outside `[0, len)`.
pub trait MemoryDescriptor: Send {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<()>;
    fn write_bytes(&mut self, offset: usize, src: &[u8]) -> Result<()>;
}

fn checked_range(offset: usize, len: usize, total: usize) -> Result<std::ops::Range<usize>> {
    let end = offset
        .checked_add(len)
        .ok_or(AtaError::InvalidArgument("descriptor offset overflow"))?;
    if end > total {
        return Err(AtaError::InvalidArgument("descriptor access out of bounds"));
    }
    Ok(offset..end)
}

impl MemoryDescriptor for Vec<u8> {
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        let range = checked_range(offset, dst.len(), self.as_slice().len())?;
        dst.copy_from_slice(&self[range]);
        Ok(())
    }

    fn write_bytes(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        let range = checked_range(offset, src.len(), self.as_slice().len())?;
        self[range].copy_from_slice(src);
        Ok(())
    }
}

/// Scratch memory PIO transfers are staged through.
///
/// The physical address is what a concrete controller would hand to a DMA
/// engine; the engine itself only touches the logical bytes.
#[derive(Debug)]
pub struct DoubleBuffer {
    bytes: Box<[u8]>,
    physical: u64,
}

impl DoubleBuffer {
    pub fn new(bytes: Box<[u8]>, physical: u64) -> Result<Self> {
        if bytes.len() != DOUBLE_BUFFER_SIZE {
            return Err(AtaError::InvalidArgument(
                "double buffer must hold exactly eight sectors",
            ));
        }
        Ok(Self { bytes, physical })
    }

    /// Heap-backed buffer with no meaningful physical address.
    pub fn heap() -> Self {
        Self {
            bytes: vec![0u8; DOUBLE_BUFFER_SIZE].into_boxed_slice(),
            physical: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn physical_address(&self) -> u64 {
        self.physical
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}
