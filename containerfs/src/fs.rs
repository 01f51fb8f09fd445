use std::collections::HashSet;
use std::fs::OpenOptions;
use std::path::Path;

use crate::alloc::{BlockAllocator, State};
use crate::file::{BlockJournal, Disposition, FileContent, FileReport, OpenFlags, OpenMode};
use crate::header;
use crate::node::{DirEntry, Entry, NodeId, NodeKind};
use crate::tree::Namespace;
use fileblock::{BlockStorage, FileBlockEmulator, FileBlockEmulatorBuilder, Geometry};
use log::{debug, info, warn};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("{0} does not exist")]
    NotFound(String),
    #[error("directory {0} does not exist")]
    DirectoryNotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("invalid path: {0:?}")]
    InvalidPath(String),
    #[error("invalid mode: {0:?}")]
    InvalidMode(String),
    #[error("{0} is already open")]
    AlreadyOpen(String),
    #[error("file is not open")]
    NotOpen,
    #[error("{op} is not permitted in mode {mode:?}")]
    PermissionDenied { op: &'static str, mode: OpenMode },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no free block left in the data region")]
    OutOfSpace,
    #[error("directory tree needs {needed} bytes but the header region holds {capacity}")]
    HeaderOverflow { needed: usize, capacity: usize },
    #[error("invalid header region: {0}")]
    InvalidHeader(String),
    #[error("can not move {src} into its own subtree {dst}")]
    CyclicMove { src: String, dst: String },
    #[error("{0} has open files")]
    FileBusy(String),
    #[error("container i/o failed")]
    Io(#[from] std::io::Error),
    #[error("header image encoding failed")]
    Encoding(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// An open file. Valid until passed to [`Volume::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(NodeId);

/// A filesystem living inside one container.
///
/// # Layout
/// =====================================================
/// | Header region (bitmap + tree image) | Data region |
/// =====================================================
///
/// Every operation that changes the bitmap or the tree rewrites the whole
/// header region before returning.
pub struct Volume<T: BlockStorage> {
    dev: T,
    alloc: BlockAllocator,
    namespace: Namespace,
    /// Directories from the root down to the current directory.
    cwd: Vec<NodeId>,
    /// Open files in the order they were opened.
    open: Vec<NodeId>,
    /// Block contents overwritten by the mutation in progress.
    journal: BlockJournal,
}

impl Volume<FileBlockEmulator> {
    /// Opens the container at `path`. A missing or empty file is created and
    /// formatted first.
    pub fn open_or_create<P: AsRef<Path>>(path: P, geometry: Geometry) -> Result<Self> {
        let path = path.as_ref();
        let initialized = std::fs::metadata(path).map_or(false, |meta| meta.len() > 0);
        if initialized {
            Volume::mount(FileBlockEmulator::open_disk(path, geometry)?)
        } else {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)?;
            let dev = FileBlockEmulatorBuilder::from(file)
                .with_geometry(geometry)
                .build()?;
            Volume::format(dev)
        }
    }
}

impl<T: BlockStorage> Volume<T> {
    /// Initializes an empty filesystem onto owned storage: a bare root
    /// directory and an all-free bitmap.
    pub fn format(dev: T) -> Result<Self> {
        let geometry = dev.geometry();
        let mut volume = Volume {
            alloc: BlockAllocator::new(geometry),
            namespace: Namespace::new(),
            cwd: vec![NodeId::ROOT],
            open: Vec::new(),
            journal: BlockJournal::default(),
            dev,
        };
        volume.save()?;
        volume.dev.sync_disk()?;
        info!(
            "formatted volume with {} blocks of {} bytes",
            geometry.block_count(),
            geometry.block_size()
        );
        Ok(volume)
    }

    /// Restores the filesystem recorded in the storage's header region.
    pub fn mount(mut dev: T) -> Result<Self> {
        let geometry = dev.geometry();
        let mut region = vec![0; geometry.header_size()];
        dev.read_header(&mut region)?;
        let (bitmap, namespace) = header::decode(&geometry, &region)?;
        let volume = Volume {
            alloc: BlockAllocator::from_bitmap(bitmap, geometry)?,
            namespace,
            cwd: vec![NodeId::ROOT],
            open: Vec::new(),
            journal: BlockJournal::default(),
            dev,
        };
        volume.verify()?;
        info!(
            "mounted volume with {} nodes, {} of {} blocks free",
            volume.namespace.nodes().len(),
            volume.alloc.free_count(),
            geometry.block_count()
        );
        Ok(volume)
    }

    /// Writes the bitmap and namespace to the header region. Nothing is written
    /// when the image does not fit.
    pub fn save(&mut self) -> Result<()> {
        let geometry = self.dev.geometry();
        let region = header::encode(&geometry, self.alloc.bitmap(), &self.namespace)?;
        self.dev.write_header(&region)?;
        debug!("saved header image");
        Ok(())
    }

    /// Checks that the blocks marked used are exactly the blocks owned by
    /// files, with no block owned twice.
    pub fn verify(&self) -> Result<()> {
        let mut owned = HashSet::new();
        for (_, entry) in self.namespace.nodes().iter() {
            if let Entry::File(file) = entry {
                for &offset in &file.blocks {
                    if !owned.insert(offset) {
                        return Err(FsError::InvalidHeader(format!(
                            "block {} is owned twice",
                            offset
                        )));
                    }
                    if self.alloc.state(offset) != Some(State::Used) {
                        return Err(FsError::InvalidHeader(format!(
                            "{} owns block {} which is not marked used",
                            file.name, offset
                        )));
                    }
                }
            }
        }
        if owned.len() != self.alloc.used_count() {
            return Err(FsError::InvalidHeader(format!(
                "{} blocks marked used but {} owned by files",
                self.alloc.used_count(),
                owned.len()
            )));
        }
        Ok(())
    }

    fn cwd(&self) -> NodeId {
        self.cwd.last().copied().unwrap_or(NodeId::ROOT)
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn allocator(&self) -> &BlockAllocator {
        &self.alloc
    }

    pub fn geometry(&self) -> Geometry {
        self.dev.geometry()
    }

    pub fn free_blocks(&self) -> usize {
        self.alloc.free_count()
    }

    pub fn used_blocks(&self) -> usize {
        self.alloc.used_count()
    }

    /// Runs a mutation and persists its result. If either step fails the
    /// in-memory state and any data blocks rewritten in place are rolled back
    /// to what they were before, so nothing drifts from the last image that
    /// was written.
    fn commit<R>(&mut self, op: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let namespace = self.namespace.clone();
        let alloc = self.alloc.clone();
        let cwd = self.cwd.clone();
        let open = self.open.clone();
        self.journal.clear();
        let result = match op(&mut *self) {
            Ok(value) => self.save().map(|()| value),
            Err(err) => Err(err),
        };
        if result.is_err() {
            if let Err(err) = self.journal.restore(&mut self.dev) {
                warn!("could not restore rewritten blocks: {}", err);
            }
            self.namespace = namespace;
            self.alloc = alloc;
            self.cwd = cwd;
            self.open = open;
        }
        self.journal.clear();
        result
    }

    pub fn create(&mut self, path: &str) -> Result<()> {
        let cwd = self.cwd();
        self.commit(|vol| vol.namespace.make_path(path, NodeKind::File, cwd).map(drop))
    }

    pub fn make_directory(&mut self, path: &str) -> Result<()> {
        let cwd = self.cwd();
        self.commit(|vol| {
            vol.namespace
                .make_path(path, NodeKind::Directory, cwd)
                .map(drop)
        })
    }

    /// Not persisted; the current directory belongs to this session only.
    pub fn change_directory(&mut self, path: &str) -> Result<()> {
        self.namespace.change_directory(&mut self.cwd, path)
    }

    /// Absolute path of the current directory.
    pub fn current_path(&self) -> String {
        let names: Vec<&str> = self.cwd[1..]
            .iter()
            .filter_map(|&id| self.namespace.entry(id))
            .map(|entry| entry.name())
            .collect();
        format!("/{}", names.join("/"))
    }

    /// Children of the current directory in creation order.
    pub fn list(&self) -> Vec<DirEntry> {
        self.namespace.list(self.cwd())
    }

    /// Releases the file's blocks, then removes it from its directory.
    pub fn delete_file(&mut self, path: &str) -> Result<()> {
        let resolved = self.namespace.resolve(path, NodeKind::File, self.cwd())?;
        let parent = resolved
            .parent
            .ok_or_else(|| FsError::InvalidPath(path.to_string()))?;
        self.commit(|vol| {
            vol.release_subtree(path, resolved.node)?;
            vol.namespace.unlink(parent, resolved.node)
        })
    }

    /// Releases the blocks of every file below the directory, then removes the
    /// whole subtree from its parent.
    pub fn delete_directory(&mut self, path: &str) -> Result<()> {
        let resolved = self
            .namespace
            .resolve(path, NodeKind::Directory, self.cwd())?;
        let parent = resolved
            .parent
            .ok_or_else(|| FsError::InvalidPath(path.to_string()))?;
        self.commit(|vol| {
            vol.release_subtree(path, resolved.node)?;
            vol.namespace.unlink(parent, resolved.node)?;
            // Step out of the deleted directory if the cwd was inside it.
            if let Some(depth) = vol.cwd.iter().position(|&id| id == resolved.node) {
                vol.cwd.truncate(depth);
            }
            Ok(())
        })
    }

    /// Empties every file below `id`. Refuses up front if any of them is open.
    fn release_subtree(&mut self, path: &str, id: NodeId) -> Result<()> {
        let files = self.namespace.files_in(id);
        if files.iter().any(|f| self.open.contains(f)) {
            warn!("refusing to delete {} while files in it are open", path);
            return Err(FsError::FileBusy(path.to_string()));
        }
        for file in files {
            if let Some(node) = self.namespace.nodes_mut().file_mut(file) {
                FileContent::new(node, &mut self.alloc, &mut self.dev).shrink_to(0)?;
            }
        }
        Ok(())
    }

    pub fn move_file(&mut self, src: &str, dst: &str) -> Result<()> {
        let cwd = self.cwd();
        self.commit(|vol| vol.namespace.move_node(src, dst, NodeKind::File, cwd))
    }

    pub fn move_directory(&mut self, src: &str, dst: &str) -> Result<()> {
        let cwd = self.cwd();
        let moved = self.namespace.resolve(src, NodeKind::Directory, cwd)?.node;
        self.commit(|vol| {
            vol.namespace.move_node(src, dst, NodeKind::Directory, cwd)?;
            // The cwd stack spells a path; rebuild it if it ran through the moved directory.
            if vol.cwd.contains(&moved) {
                vol.cwd = vol.path_to(cwd);
            }
            Ok(())
        })
    }

    fn path_to(&self, target: NodeId) -> Vec<NodeId> {
        let mut trail = vec![NodeId::ROOT];
        while let Some(&at) = trail.last() {
            if at == target {
                return trail;
            }
            let next = self.namespace.dir(at).and_then(|dir| {
                dir.children
                    .iter()
                    .copied()
                    .find(|&child| self.namespace.contains(child, target))
            });
            match next {
                Some(child) => trail.push(child),
                None => break,
            }
        }
        vec![NodeId::ROOT]
    }

    /// Opens the file at `path` with an `fopen`-style mode string. A file can
    /// only have one handle at a time.
    pub fn open(&mut self, path: &str, mode: &str) -> Result<FileHandle> {
        let flags: OpenFlags = mode.parse()?;
        let cwd = self.cwd();
        let existing = match self.namespace.resolve(path, NodeKind::File, cwd) {
            Ok(resolved) => Some(resolved.node),
            Err(FsError::NotFound(_)) | Err(FsError::DirectoryNotFound(_))
                if flags.disposition == Disposition::CreateMissing =>
            {
                None
            }
            Err(err) => return Err(err),
        };
        if let Some(id) = existing {
            if self.open.contains(&id) {
                return Err(FsError::AlreadyOpen(path.to_string()));
            }
        }

        let handle = self.commit(|vol| {
            let id = match existing {
                Some(id) => id,
                None => vol.namespace.make_path(path, NodeKind::File, cwd)?,
            };
            let node = vol
                .namespace
                .nodes_mut()
                .file_mut(id)
                .ok_or_else(|| FsError::NotFound(path.to_string()))?;
            if flags.disposition == Disposition::Truncate {
                FileContent::new(&mut *node, &mut vol.alloc, &mut vol.dev).shrink_to(0)?;
            }
            node.mode = flags.mode;
            vol.open.push(id);
            Ok(FileHandle(id))
        })?;
        debug!("opened {} as {:?}", path, flags.mode);
        Ok(handle)
    }

    /// Closing a handle that is not open is an error.
    pub fn close(&mut self, handle: FileHandle) -> Result<()> {
        let slot = self
            .open
            .iter()
            .position(|&id| id == handle.0)
            .ok_or(FsError::NotOpen)?;
        self.open.remove(slot);
        if let Some(node) = self.namespace.file_mut(handle.0) {
            node.mode = OpenMode::Closed;
        }
        Ok(())
    }

    fn content(&mut self, handle: FileHandle) -> Result<FileContent<'_, T>> {
        if !self.open.contains(&handle.0) {
            return Err(FsError::NotOpen);
        }
        let node = self
            .namespace
            .nodes_mut()
            .file_mut(handle.0)
            .ok_or(FsError::NotOpen)?;
        Ok(FileContent::new(node, &mut self.alloc, &mut self.dev)
            .with_journal(&mut self.journal))
    }

    /// Writes `data` at `position`, or at the end of the file when `None`.
    pub fn write(&mut self, handle: FileHandle, data: &[u8], position: Option<u64>) -> Result<usize> {
        self.commit(|vol| vol.content(handle)?.write(data, position))
    }

    pub fn read(
        &mut self,
        handle: FileHandle,
        start: Option<u64>,
        length: Option<u64>,
    ) -> Result<Vec<u8>> {
        self.content(handle)?.read(start, length)
    }

    pub fn move_within_file(&mut self, handle: FileHandle, src: u64, dst: u64, len: u64) -> Result<()> {
        self.commit(|vol| vol.content(handle)?.move_within(src, dst, len))
    }

    pub fn truncate(&mut self, handle: FileHandle, size: u64) -> Result<()> {
        self.commit(|vol| vol.content(handle)?.truncate(size))
    }

    /// Mode, size and blocks of every open file, in opening order.
    pub fn describe_open_handles(&self) -> Vec<FileReport> {
        self.open
            .iter()
            .filter_map(|&id| self.namespace.file(id))
            .map(|file| file.describe())
            .collect()
    }

    /// Flushes the container to the host.
    pub fn sync(&mut self) -> Result<()> {
        self.dev.sync_disk()?;
        Ok(())
    }

    /// Returns ownership of the storage to the caller.
    pub fn into_device(self) -> T {
        self.dev
    }
}
