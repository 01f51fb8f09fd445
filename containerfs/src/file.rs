use std::collections::BTreeMap;
use std::str::FromStr;

use crate::alloc::BlockAllocator;
use crate::fs::{FsError, Result};
use crate::node::FileNode;
use fileblock::{BlockOffset, BlockStorage};
use log::debug;

/// Access granted to an open file. `Closed` is the state of every file that
/// has no handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Closed,
    Read,
    Append,
    Write,
    ReadWrite,
}

impl Default for OpenMode {
    fn default() -> Self {
        OpenMode::Closed
    }
}

impl OpenMode {
    pub fn can_read(self) -> bool {
        matches!(self, OpenMode::Read | OpenMode::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, OpenMode::Append | OpenMode::Write | OpenMode::ReadWrite)
    }
}

/// What `open` does to the file before a handle is handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The file must already exist.
    Existing,
    /// Create the file when it is missing.
    CreateMissing,
    /// Discard existing content.
    Truncate,
}

/// A parsed `fopen`-style mode string: one of `r`, `a`, `w`, optionally
/// followed by `+` to grant both read and write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub mode: OpenMode,
    pub disposition: Disposition,
}

impl FromStr for OpenFlags {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        let (base, plus) = match s.as_bytes() {
            [base] => (*base, false),
            [base, b'+'] => (*base, true),
            _ => return Err(FsError::InvalidMode(s.to_string())),
        };
        let (mode, disposition) = match base {
            b'r' => (OpenMode::Read, Disposition::Existing),
            b'a' => (OpenMode::Append, Disposition::CreateMissing),
            b'w' => (OpenMode::Write, Disposition::Truncate),
            _ => return Err(FsError::InvalidMode(s.to_string())),
        };
        Ok(OpenFlags {
            mode: if plus { OpenMode::ReadWrite } else { mode },
            disposition,
        })
    }
}

/// Snapshot of a file for diagnostic listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub name: String,
    pub mode: OpenMode,
    pub size: u64,
    pub blocks: Vec<BlockOffset>,
}

impl FileNode {
    pub fn describe(&self) -> FileReport {
        FileReport {
            name: self.name.clone(),
            mode: self.mode,
            size: self.size,
            blocks: self.blocks.clone(),
        }
    }
}

fn blocks_for(size: u64, block_size: usize) -> usize {
    let block_size = block_size as u64;
    (size / block_size + u64::from(size % block_size != 0)) as usize
}

/// Original bytes of every block rewritten in place during one operation.
#[derive(Debug, Default)]
pub(crate) struct BlockJournal {
    saved: BTreeMap<BlockOffset, Vec<u8>>,
}

impl BlockJournal {
    pub(crate) fn clear(&mut self) {
        self.saved.clear();
    }

    /// Puts every saved block back on the device and empties the journal.
    pub(crate) fn restore<T: BlockStorage>(&mut self, dev: &mut T) -> std::io::Result<()> {
        for (offset, bytes) in std::mem::take(&mut self.saved) {
            dev.write_block(offset, &bytes)?;
        }
        Ok(())
    }
}

/// Byte-level view of one file's content, borrowing the allocator and the
/// device it needs for the duration of one operation.
///
/// Logical byte `n` lives in `blocks[n / block_size]` at `n % block_size`.
/// Bytes past `size` in the last block are undefined and never returned.
pub struct FileContent<'a, T: BlockStorage> {
    file: &'a mut FileNode,
    alloc: &'a mut BlockAllocator,
    dev: &'a mut T,
    journal: Option<&'a mut BlockJournal>,
}

impl<'a, T: BlockStorage> FileContent<'a, T> {
    pub fn new(file: &'a mut FileNode, alloc: &'a mut BlockAllocator, dev: &'a mut T) -> Self {
        Self {
            file,
            alloc,
            dev,
            journal: None,
        }
    }

    /// Records the old bytes of each block before its first rewrite.
    pub(crate) fn with_journal(mut self, journal: &'a mut BlockJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    fn block_size(&self) -> usize {
        self.alloc.geometry().block_size()
    }

    fn require(&self, op: &'static str, allowed: bool) -> Result<()> {
        if allowed {
            Ok(())
        } else {
            Err(FsError::PermissionDenied {
                op,
                mode: self.file.mode,
            })
        }
    }

    /// Writes `data` at `position`, end-of-file by default. A handle opened
    /// with `a` always appends. Writing past the end zero-fills the gap.
    /// Returns the number of bytes written.
    pub fn write(&mut self, data: &[u8], position: Option<u64>) -> Result<usize> {
        self.require("write", self.file.mode.can_write())?;
        let pos = match self.file.mode {
            OpenMode::Append => self.file.size,
            _ => position.unwrap_or(self.file.size),
        };
        self.write_at(pos, data)?;
        Ok(data.len())
    }

    /// Returns `length` bytes from `start` (defaults: whole file), clamped to
    /// the current size.
    pub fn read(&mut self, start: Option<u64>, length: Option<u64>) -> Result<Vec<u8>> {
        self.require("read", self.file.mode.can_read())?;
        let size = self.file.size;
        let start = start.unwrap_or(0);
        if start >= size {
            return Ok(Vec::new());
        }
        let end = match length {
            Some(length) => size.min(start.saturating_add(length)),
            None => size,
        };
        self.read_range(start, (end - start) as usize)
    }

    /// Copies `[src, src + len)` to `[dst, dst + len)`. The source must lie in
    /// the current content; the destination may extend the file.
    pub fn move_within(&mut self, src: u64, dst: u64, len: u64) -> Result<()> {
        self.require("move", self.file.mode.can_write())?;
        let src_end = src
            .checked_add(len)
            .filter(|end| *end <= self.file.size)
            .ok_or_else(|| {
                FsError::InvalidArgument(format!(
                    "range {}+{} is outside {} bytes of content",
                    src, len, self.file.size
                ))
            })?;
        if len == 0 {
            return Ok(());
        }
        let bytes = self.read_range(src, (src_end - src) as usize)?;
        self.write_at(dst, &bytes)
    }

    pub fn truncate(&mut self, new_size: u64) -> Result<()> {
        self.require("truncate", self.file.mode.can_write())?;
        if new_size > self.file.size {
            return Err(FsError::InvalidArgument(format!(
                "can not truncate {} bytes up to {}",
                self.file.size, new_size
            )));
        }
        self.shrink_to(new_size)
    }

    /// Truncation without the mode check, used when deleting files.
    pub(crate) fn shrink_to(&mut self, new_size: u64) -> Result<()> {
        self.release_beyond(new_size)?;
        self.file.size = new_size;
        Ok(())
    }

    fn write_at(&mut self, pos: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let old_size = self.file.size;
        let end = pos
            .checked_add(data.len() as u64)
            .ok_or_else(|| FsError::InvalidArgument(format!("write at {} overflows", pos)))?;
        let capacity = self.alloc.geometry().block_count() as u64 * self.block_size() as u64;
        if end > capacity {
            return Err(FsError::OutOfSpace);
        }
        let new_size = old_size.max(end);
        self.reserve(new_size)?;
        if let Err(err) = self.fill(old_size, pos, data) {
            self.release_beyond(old_size)?;
            return Err(err);
        }
        self.file.size = new_size;
        Ok(())
    }

    fn fill(&mut self, old_size: u64, pos: u64, data: &[u8]) -> Result<()> {
        if pos > old_size {
            let gap = vec![0_u8; (pos - old_size) as usize];
            self.write_range(old_size, &gap)?;
        }
        self.write_range(pos, data)
    }

    /// Grows the block list to cover `size` bytes. Either every needed block
    /// is allocated or none are.
    fn reserve(&mut self, size: u64) -> Result<()> {
        let needed = blocks_for(size, self.block_size());
        let mut fresh = Vec::new();
        while self.file.blocks.len() + fresh.len() < needed {
            match self.alloc.allocate() {
                Ok(offset) => fresh.push(offset),
                Err(err) => {
                    for offset in fresh.into_iter().rev() {
                        self.alloc.free(offset)?;
                    }
                    return Err(err);
                }
            }
        }
        if !fresh.is_empty() {
            debug!("{} grew by {} block(s)", self.file.name, fresh.len());
        }
        self.file.blocks.extend(fresh);
        Ok(())
    }

    fn release_beyond(&mut self, size: u64) -> Result<()> {
        let keep = blocks_for(size, self.block_size());
        if keep >= self.file.blocks.len() {
            return Ok(());
        }
        let released = self.file.blocks.split_off(keep);
        debug!("{} released {} block(s)", self.file.name, released.len());
        for offset in released.into_iter().rev() {
            self.alloc.free(offset)?;
        }
        Ok(())
    }

    fn block_at(&self, index: usize) -> Result<BlockOffset> {
        self.file.blocks.get(index).copied().ok_or_else(|| {
            FsError::InvalidArgument(format!("{} has no block {}", self.file.name, index))
        })
    }

    fn write_range(&mut self, start: u64, bytes: &[u8]) -> Result<()> {
        let bs = self.block_size();
        let mut block = vec![0_u8; bs];
        let mut cursor = start;
        let mut rest = bytes;
        while !rest.is_empty() {
            let within = (cursor % bs as u64) as usize;
            let take = (bs - within).min(rest.len());
            let offset = self.block_at((cursor / bs as u64) as usize)?;
            let unsaved = match &self.journal {
                Some(journal) => !journal.saved.contains_key(&offset),
                None => false,
            };
            // Partial blocks keep the bytes around the written span.
            if take < bs || unsaved {
                self.dev.read_block(offset, &mut block)?;
            }
            if unsaved {
                if let Some(journal) = self.journal.as_mut() {
                    journal.saved.insert(offset, block.clone());
                }
            }
            block[within..within + take].copy_from_slice(&rest[..take]);
            self.dev.write_block(offset, &block)?;
            cursor += take as u64;
            rest = &rest[take..];
        }
        Ok(())
    }

    fn read_range(&mut self, start: u64, len: usize) -> Result<Vec<u8>> {
        let bs = self.block_size();
        let mut block = vec![0_u8; bs];
        let mut out = Vec::with_capacity(len);
        let mut cursor = start;
        while out.len() < len {
            let within = (cursor % bs as u64) as usize;
            let take = (bs - within).min(len - out.len());
            let offset = self.block_at((cursor / bs as u64) as usize)?;
            self.dev.read_block(offset, &mut block)?;
            out.extend_from_slice(&block[within..within + take]);
            cursor += take as u64;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fileblock::{FileBlockEmulator, FileBlockEmulatorBuilder, Geometry};

    struct Fixture {
        dev: FileBlockEmulator,
        alloc: BlockAllocator,
        file: FileNode,
    }

    impl Fixture {
        fn new(blocks: u64, mode: OpenMode) -> Self {
            let geometry = Geometry::new(16, 64, 64 + 16 * blocks).unwrap();
            let dev = FileBlockEmulatorBuilder::from(tempfile::tempfile().unwrap())
                .with_geometry(geometry)
                .build()
                .unwrap();
            let mut file = FileNode::new("f");
            file.mode = mode;
            Self {
                dev,
                alloc: BlockAllocator::new(geometry),
                file,
            }
        }

        fn content(&mut self) -> FileContent<'_, FileBlockEmulator> {
            FileContent::new(&mut self.file, &mut self.alloc, &mut self.dev)
        }
    }

    #[test]
    fn parses_every_valid_mode() {
        let cases = [
            ("r", OpenMode::Read, Disposition::Existing),
            ("a", OpenMode::Append, Disposition::CreateMissing),
            ("w", OpenMode::Write, Disposition::Truncate),
            ("r+", OpenMode::ReadWrite, Disposition::Existing),
            ("a+", OpenMode::ReadWrite, Disposition::CreateMissing),
            ("w+", OpenMode::ReadWrite, Disposition::Truncate),
        ];
        for (text, mode, disposition) in cases.iter() {
            let flags: OpenFlags = text.parse().unwrap();
            assert_eq!(flags.mode, *mode, "mode for {}", text);
            assert_eq!(flags.disposition, *disposition, "disposition for {}", text);
        }
    }

    #[test]
    fn rejects_invalid_modes() {
        for text in ["", "x", "rw", "r++", "+", "R", "w+ "].iter() {
            assert!(
                matches!(text.parse::<OpenFlags>(), Err(FsError::InvalidMode(_))),
                "accepted {:?}",
                text
            );
        }
    }

    #[test]
    fn write_then_read_spans_blocks() {
        let mut fx = Fixture::new(8, OpenMode::ReadWrite);
        let data: Vec<u8> = (0..50).collect();
        assert_eq!(fx.content().write(&data, Some(0)).unwrap(), 50);

        assert_eq!(fx.file.size, 50);
        assert_eq!(fx.file.blocks.len(), 4);
        assert_eq!(fx.content().read(None, None).unwrap(), data);
        assert_eq!(fx.content().read(Some(14), Some(4)).unwrap(), vec![14, 15, 16, 17]);
    }

    #[test]
    fn overwrite_keeps_surrounding_bytes() {
        let mut fx = Fixture::new(4, OpenMode::ReadWrite);
        fx.content().write(b"hello world", Some(0)).unwrap();
        fx.content().write(b"J", Some(0)).unwrap();
        fx.content().write(b"W", Some(6)).unwrap();
        assert_eq!(fx.content().read(None, None).unwrap(), b"Jello World".to_vec());
        assert_eq!(fx.file.size, 11);
    }

    #[test]
    fn default_position_appends() {
        let mut fx = Fixture::new(4, OpenMode::ReadWrite);
        fx.content().write(b"abc", None).unwrap();
        fx.content().write(b"def", None).unwrap();
        assert_eq!(fx.content().read(None, None).unwrap(), b"abcdef".to_vec());
    }

    #[test]
    fn append_mode_ignores_position() {
        let mut fx = Fixture::new(4, OpenMode::Append);
        fx.content().write(b"abc", Some(0)).unwrap();
        fx.content().write(b"def", Some(0)).unwrap();
        fx.file.mode = OpenMode::Read;
        assert_eq!(fx.content().read(None, None).unwrap(), b"abcdef".to_vec());
    }

    #[test]
    fn gap_reads_as_zero_even_over_stale_blocks() {
        let mut fx = Fixture::new(2, OpenMode::ReadWrite);
        fx.content().write(&[0xFF; 32], Some(0)).unwrap();
        fx.content().truncate(0).unwrap();
        assert_eq!(fx.alloc.used_count(), 0);

        fx.content().write(b"ab", Some(20)).unwrap();
        let mut expected = vec![0_u8; 20];
        expected.extend_from_slice(b"ab");
        assert_eq!(fx.content().read(None, None).unwrap(), expected);
    }

    #[test]
    fn reads_are_clamped_to_size() {
        let mut fx = Fixture::new(2, OpenMode::ReadWrite);
        fx.content().write(b"hello", None).unwrap();
        assert_eq!(fx.content().read(Some(3), Some(100)).unwrap(), b"lo".to_vec());
        assert!(fx.content().read(Some(5), None).unwrap().is_empty());
        assert!(fx.content().read(Some(50), Some(1)).unwrap().is_empty());
    }

    #[test]
    fn truncate_releases_trailing_blocks() {
        let mut fx = Fixture::new(8, OpenMode::Write);
        fx.content().write(&[7; 40], None).unwrap();
        let owned = fx.file.blocks.clone();
        assert_eq!(owned.len(), 3);

        fx.content().truncate(16).unwrap();
        assert_eq!(fx.file.blocks, owned[..1].to_vec());
        assert_eq!(fx.file.size, 16);
        assert_eq!(fx.alloc.used_offsets(), owned[..1].to_vec());

        fx.content().truncate(0).unwrap();
        assert!(fx.file.blocks.is_empty());
        assert_eq!(fx.alloc.used_count(), 0);
    }

    #[test]
    fn truncate_cannot_grow() {
        let mut fx = Fixture::new(2, OpenMode::Write);
        fx.content().write(b"abc", None).unwrap();
        assert!(matches!(
            fx.content().truncate(4),
            Err(FsError::InvalidArgument(_))
        ));
        fx.content().truncate(3).unwrap();
        assert_eq!(fx.file.size, 3);
    }

    #[test]
    fn failed_write_allocates_nothing() {
        let mut fx = Fixture::new(2, OpenMode::ReadWrite);
        fx.content().write(b"0123456789", None).unwrap();
        let before = fx.file.clone();

        match fx.content().write(&[1; 40], None) {
            Err(FsError::OutOfSpace) => (),
            other => panic!("expected out of space, got {:?}", other),
        }
        assert_eq!(fx.file, before);
        assert_eq!(fx.alloc.used_count(), 1);
    }

    #[test]
    fn write_far_past_capacity_is_out_of_space() {
        let mut fx = Fixture::new(8, OpenMode::ReadWrite);
        assert!(matches!(
            fx.content().write(b"abcde", Some(u64::MAX - 10)),
            Err(FsError::OutOfSpace)
        ));
        assert!(matches!(
            fx.content().write(b"abcde", Some(u64::MAX - 2)),
            Err(FsError::InvalidArgument(_))
        ));
        fx.content().write(b"abc", None).unwrap();
        assert!(matches!(
            fx.content().move_within(0, u64::MAX - 10, 3),
            Err(FsError::OutOfSpace)
        ));
        assert_eq!(fx.file.size, 3);
        assert_eq!(fx.alloc.used_count(), 1);
    }

    #[test]
    fn block_count_does_not_overflow() {
        assert_eq!(blocks_for(0, 16), 0);
        assert_eq!(blocks_for(17, 16), 2);
        assert_eq!(blocks_for(u64::MAX, 16), (u64::MAX / 16 + 1) as usize);
    }

    #[test]
    fn journal_restores_rewritten_blocks() {
        let mut fx = Fixture::new(4, OpenMode::ReadWrite);
        fx.content().write(&[1; 20], None).unwrap();
        let mut journal = BlockJournal::default();
        FileContent::new(&mut fx.file, &mut fx.alloc, &mut fx.dev)
            .with_journal(&mut journal)
            .write(&[2; 20], Some(0))
            .unwrap();
        assert_eq!(fx.content().read(None, None).unwrap(), vec![2; 20]);

        journal.restore(&mut fx.dev).unwrap();
        assert_eq!(fx.content().read(None, None).unwrap(), vec![1; 20]);
    }

    #[test]
    fn mode_is_enforced() {
        let mut fx = Fixture::new(2, OpenMode::Read);
        assert!(matches!(
            fx.content().write(b"x", None),
            Err(FsError::PermissionDenied { op: "write", .. })
        ));
        assert!(fx.content().truncate(0).is_err());

        fx.file.mode = OpenMode::Write;
        fx.content().write(b"x", None).unwrap();
        assert!(matches!(
            fx.content().read(None, None),
            Err(FsError::PermissionDenied { op: "read", .. })
        ));

        fx.file.mode = OpenMode::Closed;
        assert!(fx.content().write(b"x", None).is_err());
        assert!(fx.content().read(None, None).is_err());
    }

    #[test]
    fn move_within_copies_range() {
        let mut fx = Fixture::new(4, OpenMode::ReadWrite);
        fx.content().write(b"abcdefghij", Some(0)).unwrap();
        fx.content().move_within(0, 3, 5).unwrap();
        // Overlapping ranges copy from the original bytes.
        assert_eq!(fx.content().read(Some(3), Some(5)).unwrap(), b"abcde".to_vec());
        assert_eq!(fx.content().read(None, None).unwrap(), b"abcabcdeij".to_vec());
    }

    #[test]
    fn move_within_can_extend_file() {
        let mut fx = Fixture::new(4, OpenMode::ReadWrite);
        fx.content().write(b"xyz", None).unwrap();
        fx.content().move_within(0, 20, 3).unwrap();
        assert_eq!(fx.file.size, 23);
        assert_eq!(fx.file.blocks.len(), 2);
        assert_eq!(fx.content().read(Some(3), Some(17)).unwrap(), vec![0; 17]);
        assert_eq!(fx.content().read(Some(20), None).unwrap(), b"xyz".to_vec());
    }

    #[test]
    fn move_within_rejects_source_past_end() {
        let mut fx = Fixture::new(2, OpenMode::ReadWrite);
        fx.content().write(b"abc", None).unwrap();
        assert!(matches!(
            fx.content().move_within(2, 0, 5),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn describe_reports_state() {
        let mut fx = Fixture::new(4, OpenMode::Write);
        fx.content().write(&[0; 20], None).unwrap();
        let report = fx.file.describe();
        assert_eq!(report.name, "f");
        assert_eq!(report.mode, OpenMode::Write);
        assert_eq!(report.size, 20);
        assert_eq!(report.blocks, vec![64, 80]);
    }
}
