use std::collections::HashSet;

use crate::fs::{FsError, Result};
use crate::node::{DirEntry, DirNode, Entry, FileNode, NodeId, NodeKind, NodeTable};
use crate::path::{self, Anchor, PARENT};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// A path resolved to a node, together with the directory listing it. The
/// parent is `None` only when the path named the starting directory itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub node: NodeId,
    pub parent: Option<NodeId>,
}

/// Rooted tree of directories and files stored in a flat [`NodeTable`].
///
/// Names are unique per (name, kind) pair within a directory, so a file and a
/// directory may share a name. There are no parent links; callers thread the
/// current directory through explicitly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    nodes: NodeTable,
}

fn dangling(id: NodeId) -> FsError {
    FsError::InvalidHeader(format!("node {:?} is not a directory", id))
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

impl Namespace {
    pub fn new() -> Self {
        Self {
            nodes: NodeTable::with_root(),
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    pub fn nodes(&self) -> &NodeTable {
        &self.nodes
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut NodeTable {
        &mut self.nodes
    }

    pub fn entry(&self, id: NodeId) -> Option<&Entry> {
        self.nodes.get(id)
    }

    pub fn dir(&self, id: NodeId) -> Option<&DirNode> {
        self.nodes.dir(id)
    }

    pub fn file(&self, id: NodeId) -> Option<&FileNode> {
        self.nodes.file(id)
    }

    pub fn file_mut(&mut self, id: NodeId) -> Option<&mut FileNode> {
        self.nodes.file_mut(id)
    }

    /// Node a path starts from, and the segments left to walk.
    pub fn start<'p>(&self, path: &'p str, cwd: NodeId) -> (NodeId, Vec<&'p str>) {
        let (anchor, segments) = path::split(path);
        let node = match anchor {
            Anchor::Root => NodeId::ROOT,
            Anchor::Cwd => cwd,
        };
        (node, segments)
    }

    pub fn lookup_child(&self, dir: NodeId, name: &str, kind: NodeKind) -> Option<NodeId> {
        self.nodes.dir(dir)?.children.iter().copied().find(|&child| {
            self.nodes
                .get(child)
                .map_or(false, |e| e.name() == name && e.kind() == kind)
        })
    }

    /// Walks every segment but the last as a directory and resolves the last
    /// one as `kind`.
    pub fn resolve(&self, path: &str, kind: NodeKind, cwd: NodeId) -> Result<Resolved> {
        let (anchor, segments) = path::split(path);
        let mut node = match anchor {
            Anchor::Root => NodeId::ROOT,
            Anchor::Cwd => cwd,
        };
        let (last, dirs) = match segments.split_last() {
            Some(split) => split,
            None if kind == NodeKind::Directory => return Ok(Resolved { node, parent: None }),
            None => return Err(FsError::InvalidPath(path.to_string())),
        };
        for (i, name) in dirs.iter().enumerate() {
            node = self
                .lookup_child(node, name, NodeKind::Directory)
                .ok_or_else(|| FsError::DirectoryNotFound(path::prefix(anchor, &segments, i + 1)))?;
        }
        let found = self
            .lookup_child(node, last, kind)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        Ok(Resolved {
            node: found,
            parent: Some(node),
        })
    }

    /// Creates the final segment of `path` as `kind`, creating any missing
    /// intermediate directories on the way. Existing directories are reused;
    /// only a final segment that already exists with the same kind is an error.
    pub fn make_path(&mut self, path: &str, kind: NodeKind, cwd: NodeId) -> Result<NodeId> {
        let (mut node, segments) = self.start(path, cwd);
        if segments.iter().any(|s| *s == PARENT) {
            return Err(FsError::InvalidPath(path.to_string()));
        }
        let (last, dirs) = segments
            .split_last()
            .ok_or_else(|| FsError::InvalidPath(path.to_string()))?;

        if self.resolve(path, kind, cwd).is_ok() {
            return Err(FsError::AlreadyExists(path.to_string()));
        }

        for name in dirs {
            node = match self.lookup_child(node, name, NodeKind::Directory) {
                Some(existing) => existing,
                None => self.attach_new(node, Entry::directory(name))?,
            };
        }
        let entry = match kind {
            NodeKind::Directory => Entry::directory(last),
            NodeKind::File => Entry::file(last),
        };
        let id = self.attach_new(node, entry)?;
        debug!("created {:?} {}", kind, path);
        Ok(id)
    }

    fn attach_new(&mut self, parent: NodeId, entry: Entry) -> Result<NodeId> {
        if self.nodes.dir(parent).is_none() {
            return Err(dangling(parent));
        }
        let id = self.nodes.insert(entry);
        self.nodes
            .dir_mut(parent)
            .ok_or_else(|| dangling(parent))?
            .children
            .push(id);
        Ok(id)
    }

    /// `..` pops one level (not past the root), an absolute path first resets
    /// to the root. A segment that does not exist is skipped and resolution
    /// carries on with the next one; the first such prefix is reported once
    /// the walk finishes, with the stack left where the walk ended.
    pub fn change_directory(&self, stack: &mut Vec<NodeId>, path: &str) -> Result<()> {
        let (anchor, segments) = path::split(path);
        if anchor == Anchor::Root || stack.is_empty() {
            stack.clear();
            stack.push(NodeId::ROOT);
        }
        let mut missing = None;
        for (i, name) in segments.iter().enumerate() {
            if *name == PARENT {
                if stack.len() > 1 {
                    stack.pop();
                }
                continue;
            }
            let top = stack.last().copied().unwrap_or(NodeId::ROOT);
            match self.lookup_child(top, name, NodeKind::Directory) {
                Some(found) => stack.push(found),
                None => {
                    if missing.is_none() {
                        missing = Some(path::prefix(anchor, &segments, i + 1));
                    }
                }
            }
        }
        match missing {
            Some(prefix) => Err(FsError::DirectoryNotFound(prefix)),
            None => Ok(()),
        }
    }

    /// Checks that the table is a tree: every node is reachable from the root
    /// through exactly one parent, and every child id names a node.
    pub fn check_shape(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let mut pending = vec![NodeId::ROOT];
        while let Some(id) = pending.pop() {
            if !seen.insert(id) {
                return Err(FsError::InvalidHeader(format!(
                    "node {:?} is linked more than once",
                    id
                )));
            }
            match self.nodes.get(id) {
                Some(Entry::Directory(dir)) => pending.extend(dir.children.iter().copied()),
                Some(Entry::File(_)) => (),
                None => {
                    return Err(FsError::InvalidHeader(format!(
                        "node {:?} does not exist",
                        id
                    )))
                }
            }
        }
        if seen.len() != self.nodes.len() {
            return Err(FsError::InvalidHeader(format!(
                "{} of {} nodes are unreachable from the root",
                self.nodes.len() - seen.len(),
                self.nodes.len()
            )));
        }
        Ok(())
    }

    /// Every node in the subtree rooted at `id`, `id` first.
    pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut found = Vec::new();
        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            found.push(next);
            if let Some(dir) = self.nodes.dir(next) {
                pending.extend(dir.children.iter().rev().copied());
            }
        }
        found
    }

    /// Files anywhere below (or at) `id`.
    pub fn files_in(&self, id: NodeId) -> Vec<NodeId> {
        self.subtree(id)
            .into_iter()
            .filter(|&n| self.nodes.file(n).is_some())
            .collect()
    }

    pub fn contains(&self, ancestor: NodeId, node: NodeId) -> bool {
        self.subtree(ancestor).contains(&node)
    }

    /// Detaches `id` from `parent` and drops its whole subtree from the table.
    /// Any blocks the subtree owned must already have been released.
    pub fn unlink(&mut self, parent: NodeId, id: NodeId) -> Result<()> {
        let doomed = self.subtree(id);
        let dir = self.nodes.dir_mut(parent).ok_or_else(|| dangling(parent))?;
        dir.children.retain(|&child| child != id);
        for node in doomed {
            self.nodes.remove(node);
        }
        debug!("unlinked node {:?} from {:?}", id, parent);
        Ok(())
    }

    /// Moves the entry at `src` into the directory at `dst`. Moving a directory
    /// into itself or one of its descendants is rejected.
    pub fn move_node(&mut self, src: &str, dst: &str, kind: NodeKind, cwd: NodeId) -> Result<()> {
        let source = self.resolve(src, kind, cwd)?;
        let dest = self.resolve(dst, NodeKind::Directory, cwd)?;
        let parent = source
            .parent
            .ok_or_else(|| FsError::InvalidPath(src.to_string()))?;

        if kind == NodeKind::Directory && self.contains(source.node, dest.node) {
            warn!("refusing to move {} into its own subtree {}", src, dst);
            return Err(FsError::CyclicMove {
                src: src.to_string(),
                dst: dst.to_string(),
            });
        }
        if dest.node == parent {
            return Ok(());
        }

        let name = match self.nodes.get(source.node) {
            Some(entry) => entry.name().to_string(),
            None => return Err(FsError::NotFound(src.to_string())),
        };
        if self.lookup_child(dest.node, &name, kind).is_some() {
            return Err(FsError::AlreadyExists(format!(
                "{}/{}",
                dst.trim_end_matches('/'),
                name
            )));
        }

        self.nodes
            .dir_mut(parent)
            .ok_or_else(|| dangling(parent))?
            .children
            .retain(|&child| child != source.node);
        self.nodes
            .dir_mut(dest.node)
            .ok_or_else(|| dangling(dest.node))?
            .children
            .push(source.node);
        debug!("moved {} into {}", src, dst);
        Ok(())
    }

    pub fn list(&self, dir: NodeId) -> Vec<DirEntry> {
        self.nodes
            .dir(dir)
            .map(|d| {
                d.children
                    .iter()
                    .filter_map(|&child| self.nodes.get(child))
                    .map(|entry| DirEntry {
                        name: entry.name().to_string(),
                        kind: entry.kind(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: NodeId = NodeId::ROOT;

    fn names(ns: &Namespace, dir: NodeId) -> Vec<String> {
        ns.list(dir).into_iter().map(|e| e.name).collect()
    }

    #[test]
    fn resolves_absolute_and_relative_paths() {
        let mut ns = Namespace::new();
        let b = ns.make_path("/a/b", NodeKind::Directory, ROOT).unwrap();
        let f = ns.make_path("/a/b/f", NodeKind::File, ROOT).unwrap();
        let a = ns.lookup_child(ROOT, "a", NodeKind::Directory).unwrap();

        assert_eq!(ns.resolve("/a/b/f", NodeKind::File, ROOT).unwrap().node, f);
        assert_eq!(ns.resolve("b/f", NodeKind::File, a).unwrap().node, f);
        let resolved = ns.resolve("//a//b/", NodeKind::Directory, ROOT).unwrap();
        assert_eq!(resolved, Resolved { node: b, parent: Some(a) });
    }

    #[test]
    fn resolution_respects_kind() {
        let mut ns = Namespace::new();
        ns.make_path("/x", NodeKind::File, ROOT).unwrap();
        assert!(matches!(
            ns.resolve("/x", NodeKind::Directory, ROOT),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn missing_intermediate_names_prefix() {
        let ns = Namespace::new();
        match ns.resolve("/nope/deeper/f", NodeKind::File, ROOT) {
            Err(FsError::DirectoryNotFound(p)) => assert_eq!(p, "/nope"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn make_path_reuses_existing_directories() {
        let mut ns = Namespace::new();
        ns.make_path("/dir", NodeKind::Directory, ROOT).unwrap();
        ns.make_path("/dir/a.txt", NodeKind::File, ROOT).unwrap();
        ns.make_path("/dir/b.txt", NodeKind::File, ROOT).unwrap();
        let dir = ns.lookup_child(ROOT, "dir", NodeKind::Directory).unwrap();

        assert_eq!(names(&ns, ROOT), vec!["dir"]);
        assert_eq!(names(&ns, dir), vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn make_path_rejects_same_kind_collision_only() {
        let mut ns = Namespace::new();
        ns.make_path("/n", NodeKind::Directory, ROOT).unwrap();
        assert!(matches!(
            ns.make_path("/n", NodeKind::Directory, ROOT),
            Err(FsError::AlreadyExists(_))
        ));
        // A file may share the name of a directory.
        ns.make_path("/n", NodeKind::File, ROOT).unwrap();
        assert_eq!(ns.list(ROOT).len(), 2);
    }

    #[test]
    fn make_path_rejects_empty_and_parent_segments() {
        let mut ns = Namespace::new();
        assert!(matches!(
            ns.make_path("/", NodeKind::Directory, ROOT),
            Err(FsError::InvalidPath(_))
        ));
        assert!(matches!(
            ns.make_path("a/../b", NodeKind::File, ROOT),
            Err(FsError::InvalidPath(_))
        ));
        assert_eq!(ns.nodes().len(), 1);
    }

    #[test]
    fn change_directory_walks_and_pops() {
        let mut ns = Namespace::new();
        let b = ns.make_path("/a/b", NodeKind::Directory, ROOT).unwrap();
        let a = ns.lookup_child(ROOT, "a", NodeKind::Directory).unwrap();
        let mut stack = vec![ROOT];

        ns.change_directory(&mut stack, "/a/b").unwrap();
        assert_eq!(stack, vec![ROOT, a, b]);
        ns.change_directory(&mut stack, "..").unwrap();
        assert_eq!(stack, vec![ROOT, a]);
        ns.change_directory(&mut stack, "../..").unwrap();
        assert_eq!(stack, vec![ROOT]);
    }

    #[test]
    fn change_directory_continues_past_missing_segment() {
        let mut ns = Namespace::new();
        let a = ns.make_path("/a", NodeKind::Directory, ROOT).unwrap();
        let c = ns.make_path("/a/c", NodeKind::Directory, ROOT).unwrap();
        let mut stack = vec![ROOT];

        match ns.change_directory(&mut stack, "/a/missing/c") {
            Err(FsError::DirectoryNotFound(p)) => assert_eq!(p, "/a/missing"),
            other => panic!("unexpected {:?}", other),
        }
        // The walk went on from /a and still found c.
        assert_eq!(stack, vec![ROOT, a, c]);
    }

    #[test]
    fn unlink_drops_whole_subtree() {
        let mut ns = Namespace::new();
        ns.make_path("/a/b/c", NodeKind::Directory, ROOT).unwrap();
        ns.make_path("/a/b/f", NodeKind::File, ROOT).unwrap();
        let a = ns.lookup_child(ROOT, "a", NodeKind::Directory).unwrap();
        assert_eq!(ns.files_in(a).len(), 1);

        ns.unlink(ROOT, a).unwrap();
        assert!(ns.list(ROOT).is_empty());
        assert_eq!(ns.nodes().len(), 1);
    }

    #[test]
    fn move_rejects_cycles() {
        let mut ns = Namespace::new();
        ns.make_path("/a/b", NodeKind::Directory, ROOT).unwrap();
        let before = ns.clone();

        assert!(matches!(
            ns.move_node("/a", "/a/b", NodeKind::Directory, ROOT),
            Err(FsError::CyclicMove { .. })
        ));
        assert!(matches!(
            ns.move_node("/a", "/a", NodeKind::Directory, ROOT),
            Err(FsError::CyclicMove { .. })
        ));
        assert_eq!(ns, before);
    }

    #[test]
    fn move_reparents_entry() {
        let mut ns = Namespace::new();
        let f = ns.make_path("/src/f", NodeKind::File, ROOT).unwrap();
        let dst = ns.make_path("/dst", NodeKind::Directory, ROOT).unwrap();
        let src = ns.lookup_child(ROOT, "src", NodeKind::Directory).unwrap();

        ns.move_node("/src/f", "/dst", NodeKind::File, ROOT).unwrap();
        assert!(ns.list(src).is_empty());
        assert_eq!(ns.resolve("/dst/f", NodeKind::File, ROOT).unwrap().node, f);
        assert_eq!(names(&ns, dst), vec!["f"]);
    }

    #[test]
    fn move_rejects_name_collision() {
        let mut ns = Namespace::new();
        ns.make_path("/one/f", NodeKind::File, ROOT).unwrap();
        ns.make_path("/two/f", NodeKind::File, ROOT).unwrap();
        assert!(matches!(
            ns.move_node("/one/f", "/two", NodeKind::File, ROOT),
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[test]
    fn well_formed_tree_passes_shape_check() {
        let mut ns = Namespace::new();
        ns.make_path("/a/b/f", NodeKind::File, ROOT).unwrap();
        ns.make_path("/c", NodeKind::Directory, ROOT).unwrap();
        ns.check_shape().unwrap();
    }

    #[test]
    fn cycles_and_shared_children_fail_shape_check() {
        let mut ns = Namespace::new();
        let b = ns.make_path("/a/b", NodeKind::Directory, ROOT).unwrap();
        let a = ns.lookup_child(ROOT, "a", NodeKind::Directory).unwrap();

        let mut cyclic = ns.clone();
        cyclic.nodes_mut().dir_mut(b).unwrap().children.push(a);
        assert!(matches!(cyclic.check_shape(), Err(FsError::InvalidHeader(_))));

        let mut shared = ns.clone();
        shared.nodes_mut().dir_mut(ROOT).unwrap().children.push(b);
        assert!(matches!(shared.check_shape(), Err(FsError::InvalidHeader(_))));

        let mut orphaned = ns;
        orphaned.nodes_mut().dir_mut(a).unwrap().children.clear();
        assert!(matches!(orphaned.check_shape(), Err(FsError::InvalidHeader(_))));
    }

    #[test]
    fn root_can_not_be_moved() {
        let mut ns = Namespace::new();
        ns.make_path("/a", NodeKind::Directory, ROOT).unwrap();
        assert!(ns.move_node("/", "/a", NodeKind::Directory, ROOT).is_err());
    }
}
