use crate::file::OpenMode;
use fileblock::BlockOffset;
use serde::{Deserialize, Serialize};

/// Index of a node in the [`NodeTable`]. Slot 0 always holds the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    fn slot(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Directory,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirNode {
    pub name: String,
    /// Children in insertion order.
    pub children: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileNode {
    pub name: String,
    /// Handles never outlive the process, so the mode is not part of the image.
    #[serde(skip)]
    pub mode: OpenMode,
    /// Logical length in bytes.
    pub size: u64,
    /// Data blocks in file order, as container offsets.
    pub blocks: Vec<BlockOffset>,
}

impl FileNode {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            mode: OpenMode::Closed,
            size: 0,
            blocks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Entry {
    Directory(DirNode),
    File(FileNode),
}

impl Entry {
    pub fn directory(name: &str) -> Self {
        Entry::Directory(DirNode {
            name: name.to_string(),
            children: Vec::new(),
        })
    }

    pub fn file(name: &str) -> Self {
        Entry::File(FileNode::new(name))
    }

    pub fn name(&self) -> &str {
        match self {
            Entry::Directory(dir) => &dir.name,
            Entry::File(file) => &file.name,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Entry::Directory(_) => NodeKind::Directory,
            Entry::File(_) => NodeKind::File,
        }
    }
}

/// A child of a directory as reported by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
}

/// Flat arena of namespace nodes. Directories refer to their children by
/// [`NodeId`]; removed slots are left empty and reused by later inserts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTable {
    slots: Vec<Option<Entry>>,
}

impl NodeTable {
    pub fn with_root() -> Self {
        Self {
            slots: vec![Some(Entry::directory("/"))],
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&Entry> {
        self.slots.get(id.slot()).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Entry> {
        self.slots.get_mut(id.slot()).and_then(Option::as_mut)
    }

    pub fn dir(&self, id: NodeId) -> Option<&DirNode> {
        match self.get(id) {
            Some(Entry::Directory(dir)) => Some(dir),
            _ => None,
        }
    }

    pub fn dir_mut(&mut self, id: NodeId) -> Option<&mut DirNode> {
        match self.get_mut(id) {
            Some(Entry::Directory(dir)) => Some(dir),
            _ => None,
        }
    }

    pub fn file(&self, id: NodeId) -> Option<&FileNode> {
        match self.get(id) {
            Some(Entry::File(file)) => Some(file),
            _ => None,
        }
    }

    pub fn file_mut(&mut self, id: NodeId) -> Option<&mut FileNode> {
        match self.get_mut(id) {
            Some(Entry::File(file)) => Some(file),
            _ => None,
        }
    }

    pub fn insert(&mut self, entry: Entry) -> NodeId {
        match self.slots.iter().position(Option::is_none) {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                NodeId(slot as u32)
            }
            None => {
                self.slots.push(Some(entry));
                NodeId((self.slots.len() - 1) as u32)
            }
        }
    }

    /// Empties the slot. The root can not be removed.
    pub fn remove(&mut self, id: NodeId) -> Option<Entry> {
        if id == NodeId::ROOT {
            return None;
        }
        let entry = self.slots.get_mut(id.slot())?.take();
        // Keep the table compact so the header image does not grow with churn.
        while let Some(None) = self.slots.last() {
            self.slots.pop();
        }
        entry
    }

    /// Number of live nodes, root included.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Entry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| entry.as_ref().map(|e| (NodeId(slot as u32), e)))
    }
}
