//! A block-structured filesystem emulated inside one host container file.
//!
//! The container starts with a fixed header region holding the serialized
//! free-block bitmap and directory tree, followed by a data region of
//! fixed-size blocks that hold file content. [`Volume`] ties the pieces
//! together and is the only type most callers need.
//!
//! ```no_run
//! use containerfs::{Geometry, Volume};
//!
//! let mut volume = Volume::open_or_create("sample.dat", Geometry::default())?;
//! volume.create("/notes/today.txt")?;
//! let handle = volume.open("/notes/today.txt", "w+")?;
//! volume.write(handle, b"hello world", Some(0))?;
//! assert_eq!(volume.read(handle, Some(0), Some(5))?, b"hello");
//! volume.close(handle)?;
//! # Ok::<(), containerfs::FsError>(())
//! ```

mod alloc;
mod file;
mod fs;
mod header;
mod node;
mod path;
mod tree;

pub use crate::alloc::{Bitmap, BlockAllocator, State};
pub use crate::file::{Disposition, FileContent, FileReport, OpenFlags, OpenMode};
pub use crate::fs::{FileHandle, FsError, Result, Volume};
pub use crate::header::PREAMBLE_LEN;
pub use crate::node::{DirEntry, DirNode, Entry, FileNode, NodeId, NodeKind, NodeTable};
pub use crate::tree::{Namespace, Resolved};
pub use fileblock::{
    BlockOffset, BlockStorage, FileBlockEmulator, FileBlockEmulatorBuilder, Geometry,
};
