use std::convert::TryFrom;
use std::io::{Error, ErrorKind};

/// Byte offset of a data block inside the container.
pub type BlockOffset = u64;

pub const DEFAULT_BLOCK_SIZE: usize = 64;
pub const DEFAULT_HEADER_SIZE: usize = 4096;
pub const DEFAULT_BLOCK_COUNT: u64 = 1024;

/// Layout of a container file.
///
/// ```text
/// ===========================================================
/// | Header region (header_size) | Data region (n * block_size) |
/// ===========================================================
/// ```
///
/// Bytes past the last whole block are never addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    block_size: usize,
    header_size: usize,
    total_size: u64,
}

fn invalid(msg: &str) -> Error {
    Error::new(ErrorKind::InvalidInput, msg.to_string())
}

impl Geometry {
    pub fn new(block_size: usize, header_size: usize, total_size: u64) -> std::io::Result<Self> {
        if block_size == 0 {
            return Err(invalid("block size must be non-zero"));
        }
        if header_size == 0 {
            return Err(invalid("header region must be non-empty"));
        }
        // Both sizes are recorded as 32-bit fields in the header image.
        if u32::try_from(block_size).is_err() || u32::try_from(header_size).is_err() {
            return Err(invalid("block and header sizes must fit in 32 bits"));
        }
        if total_size < header_size as u64 {
            return Err(invalid("container is smaller than its header region"));
        }
        Ok(Self {
            block_size,
            header_size,
            total_size,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Number of whole blocks in the data region.
    pub fn block_count(&self) -> usize {
        ((self.total_size - self.header_size as u64) / self.block_size as u64) as usize
    }

    /// Container offset of the block with the given index.
    pub fn offset_of(&self, index: usize) -> BlockOffset {
        self.header_size as u64 + index as u64 * self.block_size as u64
    }

    /// Inverse of [`Geometry::offset_of`]. Returns `None` for offsets that are
    /// misaligned or fall outside the data region.
    pub fn index_of(&self, offset: BlockOffset) -> Option<usize> {
        let rel = offset.checked_sub(self.header_size as u64)?;
        if rel % self.block_size as u64 != 0 {
            return None;
        }
        let index = (rel / self.block_size as u64) as usize;
        if index < self.block_count() {
            Some(index)
        } else {
            None
        }
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            header_size: DEFAULT_HEADER_SIZE,
            total_size: DEFAULT_HEADER_SIZE as u64 + DEFAULT_BLOCK_SIZE as u64 * DEFAULT_BLOCK_COUNT,
        }
    }
}
