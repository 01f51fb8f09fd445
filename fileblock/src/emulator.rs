use crate::blockio::BlockStorage;
use crate::geometry::{BlockOffset, Geometry};
use std::fs::{File, OpenOptions};
use std::io::prelude::*;
use std::io::{BufWriter, ErrorKind, SeekFrom};
use std::path::Path;

pub struct FileBlockEmulator {
    /// The file must be at least `geometry.total_size()` bytes long.
    fd: File,
    /// Header/data split of the container.
    geometry: Geometry,
}

/// Emulates a block device in userspace using one host file as the container.
/// The header region and every data block live at fixed offsets inside it.
impl FileBlockEmulator {
    /// Returns ownership of the underlying file descriptor to the caller.
    pub fn into_file(self) -> File {
        self.fd
    }

    fn check_block(&self, offset: BlockOffset) -> std::io::Result<()> {
        if self.geometry.index_of(offset).is_none() {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("offset {} is not a block in the data region", offset),
            ));
        }
        Ok(())
    }
}

impl BlockStorage for FileBlockEmulator {
    fn open_disk<P: AsRef<Path>>(dest: P, geometry: Geometry) -> std::io::Result<Self>
    where
        Self: std::marker::Sized,
    {
        // Return error if the file does not exist rather than create one.
        let file = OpenOptions::new().read(true).write(true).open(dest)?;
        FileBlockEmulatorBuilder::from(file)
            .with_geometry(geometry)
            .clear_medium(false)
            .build()
    }

    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn read_header(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        if buf.len() > self.geometry.header_size() {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "read exceeds the header region",
            ));
        }
        self.fd.seek(SeekFrom::Start(0))?;
        self.fd.read_exact(buf)
    }

    fn write_header(&mut self, buf: &[u8]) -> std::io::Result<()> {
        if buf.len() != self.geometry.header_size() {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "header image must cover the whole header region",
            ));
        }
        self.fd.seek(SeekFrom::Start(0))?;
        self.fd.write_all(buf)
    }

    fn read_block(&mut self, offset: BlockOffset, buf: &mut [u8]) -> std::io::Result<()> {
        self.check_block(offset)?;
        let block_size = self.geometry.block_size();
        if buf.len() < block_size {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "buffer does not contain enough space to read block",
            ));
        }
        self.fd.seek(SeekFrom::Start(offset))?;
        // Limit the read to just the block specified.
        self.fd.read_exact(&mut buf[..block_size])
    }

    fn write_block(&mut self, offset: BlockOffset, buf: &[u8]) -> std::io::Result<()> {
        self.check_block(offset)?;
        if buf.len() > self.geometry.block_size() {
            return Err(std::io::Error::new(
                ErrorKind::InvalidInput,
                "buffer is larger than a block",
            ));
        }
        self.fd.seek(SeekFrom::Start(offset))?;
        self.fd.write_all(buf)
    }

    fn sync_disk(&mut self) -> std::io::Result<()> {
        self.fd.sync_all()?;
        Ok(())
    }
}

pub struct FileBlockEmulatorBuilder {
    fd: File,
    geometry: Geometry,
    clear: bool,
}

impl From<File> for FileBlockEmulatorBuilder {
    fn from(fd: File) -> Self {
        FileBlockEmulatorBuilder {
            fd,
            geometry: Geometry::default(),
            clear: true,
        }
    }
}

impl FileBlockEmulatorBuilder {
    /// Sets the header/data layout of the container.
    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// Whether `build` zero-fills the container. Disable this to reopen a
    /// container that already holds a volume.
    pub fn clear_medium(mut self, clear: bool) -> Self {
        self.clear = clear;
        self
    }

    /// This builder assumes ownership of the file descriptor used and, unless
    /// `clear_medium(false)` was set, does destructive things to prepare the
    /// file for use.
    pub fn build(mut self) -> std::io::Result<FileBlockEmulator> {
        if self.clear {
            self.zero_medium()?;
        } else {
            let len = self.fd.metadata()?.len();
            if len < self.geometry.total_size() {
                return Err(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!(
                        "container holds {} bytes, layout needs {}",
                        len,
                        self.geometry.total_size()
                    ),
                ));
            }
        }
        Ok(FileBlockEmulator {
            fd: self.fd,
            geometry: self.geometry,
        })
    }

    fn zero_medium(&mut self) -> std::io::Result<()> {
        self.fd.seek(SeekFrom::Start(0))?;
        let total = self.geometry.total_size();
        let chunk = vec![0x00; self.geometry.block_size().max(4096)];
        let mut bfd = BufWriter::new(&self.fd);
        // Zero out the whole container, buffering each write to prevent excessive syscalls.
        let mut written = 0_u64;
        while written < total {
            let n = chunk.len().min((total - written) as usize);
            bfd.write_all(&chunk[..n])?;
            written += n as u64;
        }
        bfd.flush()?;
        drop(bfd);
        self.fd.set_len(total)
    }
}
