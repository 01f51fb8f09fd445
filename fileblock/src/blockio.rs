use crate::geometry::{BlockOffset, Geometry};
use std::path::Path;

/// Storage for a single container: a fixed-size header region followed by a
/// block-addressed data region (see [`Geometry`]).
///
/// Blocks are addressed by their byte offset inside the container rather than
/// by index, so callers can hand the offsets they got from an allocator
/// straight back to the device.
pub trait BlockStorage {
    /// Opens an existing container at the specified path. This method does not
    /// validate the header region, it is up for clients to ensure containers are
    /// appropriately initialized.
    fn open_disk<P: AsRef<Path>>(path: P, geometry: Geometry) -> std::io::Result<Self>
    where
        Self: std::marker::Sized;
    /// The layout this storage was configured with.
    fn geometry(&self) -> Geometry;
    /// Reads the first `buf.len()` bytes of the header region.
    ///
    /// # Errors
    ///
    /// Attempting to read more than the header region holds will return an error.
    fn read_header(&mut self, buf: &mut [u8]) -> std::io::Result<()>;
    /// Replaces the whole header region. The buffer must be exactly the size
    /// of the header region so a short image can never leave stale bytes
    /// behind.
    fn write_header(&mut self, buf: &[u8]) -> std::io::Result<()>;
    /// Reads the block starting at `offset` into the first block-size bytes of
    /// the provided buffer.
    ///
    /// # Errors
    ///
    /// Reading an offset outside the data region, one that is not aligned to a
    /// block boundary, or into a buffer smaller than a block returns an error.
    fn read_block(&mut self, offset: BlockOffset, buf: &mut [u8]) -> std::io::Result<()>;
    /// Writes the provided buffer at the start of the block at `offset`.
    ///
    /// # Errors
    ///
    /// Same addressing rules as [`BlockStorage::read_block`]; a buffer larger
    /// than one block is rejected instead of spilling into the next block.
    fn write_block(&mut self, offset: BlockOffset, buf: &[u8]) -> std::io::Result<()>;
    /// Flush any buffered disk IO from memory. This is useful if it must guaranteed
    /// the disk writes actually occurred, for instance, if being re-read from
    /// disk.
    fn sync_disk(&mut self) -> std::io::Result<()>;
}
