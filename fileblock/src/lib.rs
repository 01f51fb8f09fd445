//! A userspace block device backed by a single host file, split into a fixed
//! header region and a block-addressed data region.

mod blockio;
mod emulator;
mod geometry;

pub use crate::blockio::BlockStorage;
pub use crate::emulator::{FileBlockEmulator, FileBlockEmulatorBuilder};
pub use crate::geometry::{
    BlockOffset, Geometry, DEFAULT_BLOCK_COUNT, DEFAULT_BLOCK_SIZE, DEFAULT_HEADER_SIZE,
};
