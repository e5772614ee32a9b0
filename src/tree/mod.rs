//! The virtual file tree.
//!
//! A `VfsNode` maps one virtual path component to a real backing path.
//! Children are keyed by the lowercased component name, so every lookup,
//! insert and erase is case-insensitive while the stored `name` preserves the
//! case the entry was inserted with. Deletions are soft by default: a
//! tombstoned node is hidden from lookups but physically retained so a later
//! create at the same path can resurrect it.
//!
//! Concurrency: each node carries its own reader/writer lock. Operations lock
//! parent before child and never the other way around; walks release a
//! level's lock before descending when they do not mutate the parent/child
//! topology at that level.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tracing::{debug, error, trace};

use crate::util::lower;

/// What a tree entry stands for in the backing filesystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
    /// Backing path did not exist when the entry was added.
    Unknown,
}

/// Errors produced by tree operations, each carrying a fixed errno.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeError {
    /// Empty path or empty real path.
    InvalidArgument,
    /// A path component does not exist (or is tombstoned).
    NotFound,
    /// Entry already exists and updating was not requested.
    AlreadyExists,
    /// Directory still has live descendants.
    NotEmpty,
    /// Operation requires a directory.
    NotADirectory,
}

impl TreeError {
    pub fn errno(self) -> i32 {
        match self {
            TreeError::InvalidArgument => libc::EINVAL,
            TreeError::NotFound => libc::ENOENT,
            TreeError::AlreadyExists => libc::EEXIST,
            TreeError::NotEmpty => libc::ENOTEMPTY,
            TreeError::NotADirectory => libc::ENOTDIR,
        }
    }
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            TreeError::InvalidArgument => "invalid argument",
            TreeError::NotFound => "no such entry",
            TreeError::AlreadyExists => "entry already exists",
            TreeError::NotEmpty => "directory not empty",
            TreeError::NotADirectory => "not a directory",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for TreeError {}

pub type TreeResult<T> = Result<T, TreeError>;

// Bridge inode numbers; 1 is reserved for mount roots.
static NEXT_INO: AtomicU64 = AtomicU64::new(2);

struct NodeInner {
    name: String,
    real_path: String,
    kind: FileKind,
    deleted: bool,
    parent: Weak<VfsNode>,
    children: BTreeMap<String, Arc<VfsNode>>,
}

/// One entry of the virtual file tree. Shared via `Arc`; parents hold the
/// only strong edges to their children, child-to-parent references are weak.
pub struct VfsNode {
    ino: u64,
    inner: RwLock<NodeInner>,
}

impl VfsNode {
    fn alloc(
        name: String,
        real_path: String,
        kind: FileKind,
        deleted: bool,
        parent: Weak<VfsNode>,
    ) -> Arc<Self> {
        Arc::new(VfsNode {
            ino: NEXT_INO.fetch_add(1, Ordering::Relaxed),
            inner: RwLock::new(NodeInner {
                name,
                real_path,
                kind,
                deleted,
                parent,
                children: BTreeMap::new(),
            }),
        })
    }

    /// Create a tree root. Roots conventionally use the name `"/"`; their
    /// `file_path()` is the empty string.
    pub fn new_root(name: &str, real_path: &str, kind: FileKind) -> Arc<Self> {
        trace!(name, real_path, "creating tree root");
        Self::alloc(
            name.to_string(),
            real_path.to_string(),
            kind,
            false,
            Weak::new(),
        )
    }

    /// Process-unique identifier used by the kernel bridge.
    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn name(&self) -> String {
        self.inner.read().unwrap().name.clone()
    }

    /// Replace the display name. Empty names are rejected and ignored.
    pub fn set_name(&self, name: &str) {
        if name.is_empty() {
            error!("attempted to set an empty node name");
            return;
        }
        self.inner.write().unwrap().name = name.to_string();
    }

    pub fn real_path(&self) -> String {
        self.inner.read().unwrap().real_path.clone()
    }

    /// Replace the backing path. Empty paths are rejected and ignored.
    pub fn set_real_path(&self, real_path: &str) {
        if real_path.is_empty() {
            error!("attempted to set an empty real path");
            return;
        }
        self.inner.write().unwrap().real_path = real_path.to_string();
    }

    pub fn kind(&self) -> FileKind {
        self.inner.read().unwrap().kind
    }

    pub fn set_kind(&self, kind: FileKind) {
        self.inner.write().unwrap().kind = kind;
    }

    pub fn is_dir(&self) -> bool {
        self.kind() == FileKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind() == FileKind::File
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.read().unwrap().deleted
    }

    pub fn set_deleted(&self, deleted: bool) {
        self.inner.write().unwrap().deleted = deleted;
    }

    pub fn parent(&self) -> Option<Arc<VfsNode>> {
        self.inner.read().unwrap().parent.upgrade()
    }

    /// Children in lowercased-key order, as `(key, node)` pairs. The order is
    /// observable through `readdir`.
    pub fn children_snapshot(&self) -> Vec<(String, Arc<VfsNode>)> {
        self.inner
            .read()
            .unwrap()
            .children
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Virtual path of this node: ancestor names joined by `/`, starting with
    /// `/`. The root yields the empty string.
    pub fn file_path(&self) -> String {
        let (name, parent) = {
            let inner = self.inner.read().unwrap();
            (inner.name.clone(), inner.parent.clone())
        };
        match parent.upgrade() {
            None => String::new(),
            Some(parent) => {
                let mut path = parent.file_path();
                if !path.ends_with('/') {
                    path.push('/');
                }
                path.push_str(&name);
                path
            }
        }
    }

    /// Insert an entry at `path`, or update an existing one.
    ///
    /// Intermediate components must already exist; they are not created
    /// implicitly. A tombstoned entry at the final component is resurrected:
    /// the tombstone is cleared, the display name and real path are replaced
    /// and the existing handle is returned. A live entry fails with
    /// `AlreadyExists` unless `update_existing` is set, in which case only
    /// its real path is replaced.
    pub fn add(
        self: &Arc<Self>,
        path: &str,
        real_path: &str,
        kind: FileKind,
        update_existing: bool,
    ) -> TreeResult<Arc<VfsNode>> {
        if path.is_empty() || real_path.is_empty() {
            error!("attempted to add an entry with an empty path");
            return Err(TreeError::InvalidArgument);
        }
        trace!(path, real_path, "tree add");

        let stripped = path.strip_prefix('/').unwrap_or(path);
        if stripped.is_empty() {
            // the root itself cannot be re-added
            return Err(TreeError::AlreadyExists);
        }

        let mut components = stripped.split('/').peekable();
        let mut current = self.clone();
        loop {
            let component = components.next().expect("split yields at least one item");
            if components.peek().is_none() {
                return current.add_child(component, real_path, kind, update_existing);
            }
            let key = lower(component);
            let next = current.inner.read().unwrap().children.get(&key).cloned();
            match next {
                Some(child) => current = child,
                None => {
                    debug!(component, path, "intermediate component does not exist");
                    return Err(TreeError::NotFound);
                }
            }
        }
    }

    /// `add` with the kind detected by a `stat` on `real_path`.
    pub fn add_auto(
        self: &Arc<Self>,
        path: &str,
        real_path: &str,
        update_existing: bool,
    ) -> TreeResult<Arc<VfsNode>> {
        let kind = match std::fs::metadata(real_path) {
            Ok(md) if md.is_dir() => FileKind::Dir,
            Ok(_) => FileKind::File,
            Err(_) => FileKind::Unknown,
        };
        self.add(path, real_path, kind, update_existing)
    }

    fn add_child(
        self: &Arc<Self>,
        name: &str,
        real_path: &str,
        kind: FileKind,
        update_existing: bool,
    ) -> TreeResult<Arc<VfsNode>> {
        let key = lower(name);
        let mut inner = self.inner.write().unwrap();
        if let Some(existing) = inner.children.get(&key) {
            let existing = existing.clone();
            drop(inner);
            let mut e = existing.inner.write().unwrap();
            if e.deleted {
                debug!(name, real_path, "resurrecting tombstoned entry");
                e.deleted = false;
                e.name = name.to_string();
                e.real_path = real_path.to_string();
                drop(e);
                return Ok(existing);
            }
            if update_existing {
                debug!(name, real_path, "updating real path of existing entry");
                e.real_path = real_path.to_string();
                drop(e);
                return Ok(existing);
            }
            debug!(name, "entry already exists and should not be updated");
            return Err(TreeError::AlreadyExists);
        }

        let node = VfsNode::alloc(
            name.to_string(),
            real_path.to_string(),
            kind,
            false,
            Arc::downgrade(self),
        );
        inner.children.insert(key, node.clone());
        Ok(node)
    }

    /// Look up `path` case-insensitively. `"/"` and `""` resolve to the
    /// receiver. Tombstoned entries are hidden unless `include_deleted`.
    pub fn find(self: &Arc<Self>, path: &str, include_deleted: bool) -> Option<Arc<VfsNode>> {
        let stripped = path.strip_prefix('/').unwrap_or(path);
        if stripped.is_empty() {
            return Some(self.clone());
        }

        let mut current = self.clone();
        for component in stripped.split('/') {
            if component.is_empty() {
                continue;
            }
            let key = lower(component);
            let next = current.inner.read().unwrap().children.get(&key).cloned();
            match next {
                Some(child) => current = child,
                None => {
                    trace!(path, component, "component not found");
                    return None;
                }
            }
        }
        if current.is_deleted() && !include_deleted {
            trace!(path, "entry is tombstoned");
            return None;
        }
        Some(current)
    }

    /// Remove or tombstone the entry at `path`.
    ///
    /// With `really_erase` the child is physically removed from its parent's
    /// map, which requires that every descendant is already tombstoned
    /// (`NotEmpty` otherwise). Without it, the entry and all its descendants
    /// are tombstoned; live references held elsewhere stay valid.
    pub fn erase(self: &Arc<Self>, path: &str, really_erase: bool) -> TreeResult<()> {
        if path.is_empty() {
            error!("attempted to erase with an empty path");
            return Err(TreeError::InvalidArgument);
        }

        let stripped = path.strip_prefix('/').unwrap_or(path);
        let (parent, last) = match stripped.rfind('/') {
            Some(pos) => {
                let parent = self
                    .find(&stripped[..pos], true)
                    .ok_or(TreeError::NotFound)?;
                (parent, &stripped[pos + 1..])
            }
            None => (self.clone(), stripped),
        };
        let key = lower(last);

        if really_erase {
            let mut inner = parent.inner.write().unwrap();
            let child = inner.children.get(&key).ok_or(TreeError::NotFound)?;
            if !child.subtree_is_tombstoned_or_leaf() {
                return Err(TreeError::NotEmpty);
            }
            inner.children.remove(&key);
            Ok(())
        } else {
            let child = parent
                .inner
                .read()
                .unwrap()
                .children
                .get(&key)
                .cloned()
                .ok_or(TreeError::NotFound)?;
            child.tombstone_recursive();
            Ok(())
        }
    }

    fn tombstone_recursive(&self) {
        let children: Vec<Arc<VfsNode>> = {
            let mut inner = self.inner.write().unwrap();
            inner.deleted = true;
            inner.children.values().cloned().collect()
        };
        for child in children {
            child.tombstone_recursive();
        }
    }

    // A node may be removed once nothing live remains beneath it; its own
    // tombstone state does not matter.
    fn subtree_is_tombstoned_or_leaf(&self) -> bool {
        self.inner
            .read()
            .unwrap()
            .children
            .values()
            .all(|c| c.subtree_all_deleted())
    }

    fn subtree_all_deleted(&self) -> bool {
        let inner = self.inner.read().unwrap();
        inner.deleted && inner.children.values().all(|c| c.subtree_all_deleted())
    }

    /// True iff every descendant, transitively, is tombstoned. This is the
    /// emptiness notion `rmdir` and hard erasure use.
    pub fn is_empty(&self) -> bool {
        self.subtree_is_tombstoned_or_leaf()
    }

    /// Structurally independent deep copy with fresh parent back-references.
    pub fn clone_tree(&self) -> Arc<VfsNode> {
        self.clone_with_parent(Weak::new())
    }

    fn clone_with_parent(&self, parent: Weak<VfsNode>) -> Arc<VfsNode> {
        let inner = self.inner.read().unwrap();
        let node = VfsNode::alloc(
            inner.name.clone(),
            inner.real_path.clone(),
            inner.kind,
            inner.deleted,
            parent,
        );
        let children: BTreeMap<String, Arc<VfsNode>> = inner
            .children
            .iter()
            .map(|(key, child)| (key.clone(), child.clone_with_parent(Arc::downgrade(&node))))
            .collect();
        node.inner.write().unwrap().children = children;
        node
    }

    /// Non-destructive merge of `other` into the receiver.
    ///
    /// The receiver takes over `other`'s real path. Children missing on the
    /// receiver are installed as reparented clones; children present on both
    /// sides are merged recursively. Tombstones on the receiver are never
    /// cleared by a merge.
    pub fn merge(self: &Arc<Self>, other: &Arc<VfsNode>) {
        let mut to_recurse: Vec<(Arc<VfsNode>, Arc<VfsNode>)> = Vec::new();
        {
            let other_inner = other.inner.read().unwrap();
            let mut inner = self.inner.write().unwrap();
            inner.real_path = other_inner.real_path.clone();
            for (key, other_child) in &other_inner.children {
                match inner.children.get(key) {
                    Some(child) => to_recurse.push((child.clone(), other_child.clone())),
                    None => {
                        let clone = other_child.clone_with_parent(Arc::downgrade(self));
                        inner.children.insert(key.clone(), clone);
                    }
                }
            }
        }
        for (child, other_child) in to_recurse {
            child.merge(&other_child);
        }
    }

    /// Virtual paths of the whole subtree in depth-first order.
    pub fn all_item_paths(&self, include_root: bool) -> Vec<String> {
        let mut result = Vec::new();
        let is_root = self.parent().is_none();
        if !is_root || include_root {
            result.push(self.file_path());
        }
        for (_, child) in self.children_snapshot() {
            result.extend(child.all_item_paths(true));
        }
        result
    }

    /// Depth-first textual dump, one line per node, one leading space per
    /// level. Directories get a trailing `/` appended to their name.
    pub fn dump(&self, out: &mut String, level: usize) {
        let inner = self.inner.read().unwrap();
        for _ in 0..level {
            out.push(' ');
        }
        out.push_str(&inner.name);
        if inner.kind == FileKind::Dir && !inner.name.ends_with('/') {
            out.push('/');
        }
        out.push_str(" -> ");
        out.push_str(&inner.real_path);
        out.push('\n');
        for child in inner.children.values() {
            child.dump(out, level + 1);
        }
    }
}

impl fmt::Display for VfsNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "file path: {:?}, real path: {:?}",
            self.file_path(),
            self.real_path()
        )?;
        for (_, child) in self.children_snapshot() {
            write!(f, "{child}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for VfsNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read().unwrap();
        f.debug_struct("VfsNode")
            .field("name", &inner.name)
            .field("real_path", &inner.real_path)
            .field("kind", &inner.kind)
            .field("deleted", &inner.deleted)
            .field("children", &inner.children.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_tree() -> Arc<VfsNode> {
        VfsNode::new_root("/", "/tmp", FileKind::Dir)
    }

    fn add_items(tree: &Arc<VfsNode>) {
        tree.add("/1", "/tmp/a", FileKind::Dir, false).unwrap();
        tree.add("/1/1", "/tmp/a/a", FileKind::Dir, false).unwrap();
        tree.add("/2", "/tmp/b", FileKind::Dir, false).unwrap();
        tree.add("/2/1", "/tmp/b/a", FileKind::Dir, false).unwrap();
        tree.add("/2/2", "/tmp/b/b", FileKind::Dir, false).unwrap();
        tree.add("/2/2/1", "/tmp/b/b/a", FileKind::Dir, false).unwrap();
        tree.add("/2/3", "/tmp/b/c", FileKind::Dir, false).unwrap();
        tree.add("/3", "/tmp/c", FileKind::Dir, false).unwrap();
        tree.add("/3/1", "/tmp/c/a", FileKind::Dir, false).unwrap();
        tree.add("/3/2", "/tmp/c/b", FileKind::Dir, false).unwrap();
        tree.add("/3/2/1", "/tmp/c/b/a", FileKind::Dir, false).unwrap();
    }

    fn find_real(tree: &Arc<VfsNode>, path: &str) -> String {
        tree.find(path, false)
            .map(|n| n.real_path())
            .unwrap_or_default()
    }

    #[test]
    fn add_rejects_duplicates_and_bad_input() {
        let tree = new_tree();
        add_items(&tree);

        assert_eq!(
            tree.add("/3", "/tmp/c", FileKind::File, false).unwrap_err(),
            TreeError::AlreadyExists
        );
        assert_eq!(
            tree.add("", "/tmp/x", FileKind::File, false).unwrap_err(),
            TreeError::InvalidArgument
        );
        assert_eq!(
            tree.add("/x", "", FileKind::File, false).unwrap_err(),
            TreeError::InvalidArgument
        );
        // missing intermediate components are not created implicitly
        assert_eq!(
            tree.add("/9/9", "/tmp/z", FileKind::File, false).unwrap_err(),
            TreeError::NotFound
        );
    }

    #[test]
    fn add_non_ascii_and_find_case_insensitive() {
        let tree = new_tree();
        tree.add("Ä", "/tmp/Ö", FileKind::Dir, false).unwrap();
        tree.add("こんいちわ", "/tmp/テスト", FileKind::Dir, false).unwrap();

        assert_eq!(find_real(&tree, "/ä"), "/tmp/Ö");
        assert_eq!(find_real(&tree, "/こんいちわ"), "/tmp/テスト");
        assert_eq!(
            tree.add("/こんいちわ", "/tmp/テスト", FileKind::File, false)
                .unwrap_err(),
            TreeError::AlreadyExists
        );
    }

    #[test]
    fn dump_matches_expected_layout() {
        let tree = new_tree();
        add_items(&tree);

        let expected = concat!(
            "/ -> /tmp\n",
            " 1/ -> /tmp/a\n",
            "  1/ -> /tmp/a/a\n",
            " 2/ -> /tmp/b\n",
            "  1/ -> /tmp/b/a\n",
            "  2/ -> /tmp/b/b\n",
            "   1/ -> /tmp/b/b/a\n",
            "  3/ -> /tmp/b/c\n",
            " 3/ -> /tmp/c\n",
            "  1/ -> /tmp/c/a\n",
            "  2/ -> /tmp/c/b\n",
            "   1/ -> /tmp/c/b/a\n",
        );

        let mut out = String::new();
        tree.dump(&mut out, 0);
        assert_eq!(out, expected);
    }

    #[test]
    fn dump_non_ascii() {
        let tree = new_tree();
        tree.add("Ä", "/tmp/Ö", FileKind::Dir, false).unwrap();
        tree.add("こんいちわ", "/tmp/テスト", FileKind::Dir, false).unwrap();

        let mut out = String::new();
        tree.dump(&mut out, 0);
        assert_eq!(out, "/ -> /tmp\n Ä/ -> /tmp/Ö\n こんいちわ/ -> /tmp/テスト\n");
    }

    #[test]
    fn display_format_lists_paths_depth_first() {
        let tree = new_tree();
        add_items(&tree);

        let expected = "file path: \"\", real path: \"/tmp\"\n\
                        file path: \"/1\", real path: \"/tmp/a\"\n\
                        file path: \"/1/1\", real path: \"/tmp/a/a\"\n\
                        file path: \"/2\", real path: \"/tmp/b\"\n\
                        file path: \"/2/1\", real path: \"/tmp/b/a\"\n\
                        file path: \"/2/2\", real path: \"/tmp/b/b\"\n\
                        file path: \"/2/2/1\", real path: \"/tmp/b/b/a\"\n\
                        file path: \"/2/3\", real path: \"/tmp/b/c\"\n\
                        file path: \"/3\", real path: \"/tmp/c\"\n\
                        file path: \"/3/1\", real path: \"/tmp/c/a\"\n\
                        file path: \"/3/2\", real path: \"/tmp/c/b\"\n\
                        file path: \"/3/2/1\", real path: \"/tmp/c/b/a\"\n";

        assert_eq!(format!("{tree}"), expected);
    }

    #[test]
    fn find_resolves_every_item() {
        let tree = new_tree();
        add_items(&tree);

        assert_eq!(find_real(&tree, "/1"), "/tmp/a");
        assert_eq!(find_real(&tree, "/1/1"), "/tmp/a/a");
        assert_eq!(find_real(&tree, "/2"), "/tmp/b");
        assert_eq!(find_real(&tree, "/2/1"), "/tmp/b/a");
        assert_eq!(find_real(&tree, "/2/2"), "/tmp/b/b");
        assert_eq!(find_real(&tree, "/2/2/1"), "/tmp/b/b/a");
        assert_eq!(find_real(&tree, "/2/3"), "/tmp/b/c");
        assert_eq!(find_real(&tree, "/3"), "/tmp/c");
        assert_eq!(find_real(&tree, "/3/1"), "/tmp/c/a");
        assert_eq!(find_real(&tree, "/3/2"), "/tmp/c/b");
        assert_eq!(find_real(&tree, "/3/2/1"), "/tmp/c/b/a");

        assert!(tree.find("/missing", false).is_none());
        // "/" and "" resolve to the receiver
        assert!(Arc::ptr_eq(&tree.find("/", false).unwrap(), &tree));
        assert!(Arc::ptr_eq(&tree.find("", false).unwrap(), &tree));
    }

    #[test]
    fn find_is_case_insensitive() {
        let tree = new_tree();
        add_items(&tree);
        tree.add("/A", "/tmp/upper-a", FileKind::Dir, true).unwrap();

        // lookups under any casing return the same handle
        let upper = tree.find("/a", false).unwrap();
        assert!(Arc::ptr_eq(&upper, &tree.find("/A", false).unwrap()));
        assert_eq!(upper.real_path(), "/tmp/upper-a");
        assert_eq!(upper.name(), "A");
    }

    #[test]
    fn overwrite_entries_with_update_existing() {
        let tree = new_tree();
        add_items(&tree);

        tree.add("/1", "/tmp/A", FileKind::Dir, true).unwrap();
        tree.add("/1/1", "/tmp/A/A", FileKind::Dir, true).unwrap();
        tree.add("/2", "/tmp/B", FileKind::Dir, true).unwrap();
        tree.add("/2/1", "/tmp/B/A", FileKind::File, true).unwrap();
        tree.add("/2/2", "/tmp/B/B", FileKind::Dir, true).unwrap();
        tree.add("/2/2/1", "/tmp/B/B/A", FileKind::File, true).unwrap();
        tree.add("/2/2/1", "/tmp/b/b/abc", FileKind::File, true).unwrap();
        tree.add("/2/3", "/tmp/B/C", FileKind::File, true).unwrap();
        tree.add("/3", "/tmp/C", FileKind::Dir, true).unwrap();

        assert_eq!(find_real(&tree, "/1"), "/tmp/A");
        assert_eq!(find_real(&tree, "/1/1"), "/tmp/A/A");
        assert_eq!(find_real(&tree, "/2"), "/tmp/B");
        assert_eq!(find_real(&tree, "/2/1"), "/tmp/B/A");
        assert_eq!(find_real(&tree, "/2/2"), "/tmp/B/B");
        assert_eq!(find_real(&tree, "/2/2/1"), "/tmp/b/b/abc");
        assert_eq!(find_real(&tree, "/2/3"), "/tmp/B/C");
        assert_eq!(find_real(&tree, "/3"), "/tmp/C");
        assert_eq!(find_real(&tree, "/3/1"), "/tmp/c/a");
        assert_eq!(find_real(&tree, "/3/2"), "/tmp/c/b");
    }

    #[test]
    fn update_existing_is_idempotent() {
        let tree = new_tree();
        let first = tree.add("/x", "/tmp/x", FileKind::File, true).unwrap();
        let second = tree.add("/x", "/tmp/x", FileKind::File, true).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.real_path(), "/tmp/x");
    }

    #[test]
    fn merge_overlays_other_tree() {
        let tree = new_tree();
        tree.add("/1", "/tmp/1", FileKind::File, false).unwrap();
        tree.add("/2", "/tmp/2", FileKind::File, false).unwrap();
        tree.add("/3", "/tmp/3", FileKind::Dir, false).unwrap();
        tree.add("/3/1", "/tmp/3/1", FileKind::Dir, false).unwrap();
        tree.add("/3/1/1", "/tmp/3/1/1", FileKind::Dir, false).unwrap();

        let other = new_tree();
        other.add("/1", "/tmp/A", FileKind::Dir, false).unwrap();
        other.add("/3", "/tmp/3", FileKind::Dir, false).unwrap();
        other.add("/3/1", "/tmp/3/1", FileKind::Dir, false).unwrap();
        other.add("/3/1/1", "/tmp/3/1/1", FileKind::Dir, false).unwrap();
        other.add("/3/1/1/1", "/tmp/3/1/1/1", FileKind::Dir, false).unwrap();
        other.add("/3/2", "/tmp/3/2", FileKind::Dir, false).unwrap();
        other.add("/4", "/tmp/4", FileKind::Dir, false).unwrap();
        other.add("/4/4", "/tmp/4/4", FileKind::Dir, false).unwrap();
        other.add("/4/4/4", "/tmp/4/4/4", FileKind::Dir, false).unwrap();

        tree.merge(&other);

        assert_eq!(find_real(&tree, "/1"), "/tmp/A");
        assert_eq!(find_real(&tree, "/2"), "/tmp/2");
        assert_eq!(find_real(&tree, "/3/1/1"), "/tmp/3/1/1");
        assert_eq!(find_real(&tree, "/3/1/1/1"), "/tmp/3/1/1/1");
        assert_eq!(find_real(&tree, "/3/2"), "/tmp/3/2");
        assert_eq!(find_real(&tree, "/4/4/4"), "/tmp/4/4/4");

        // merged-in children are owned by the receiver, not shared
        let merged = tree.find("/4/4", false).unwrap();
        assert!(Arc::ptr_eq(&merged.parent().unwrap(), &tree.find("/4", false).unwrap()));
    }

    #[test]
    fn merge_clone_is_identity() {
        let tree = new_tree();
        add_items(&tree);

        let copy = tree.clone_tree();
        copy.merge(&tree);

        let mut lhs = String::new();
        let mut rhs = String::new();
        tree.dump(&mut lhs, 0);
        copy.dump(&mut rhs, 0);
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn clone_tree_is_independent() {
        let tree = new_tree();
        add_items(&tree);

        let copy = tree.clone_tree();
        drop(tree);

        assert_eq!(find_real(&copy, "/1"), "/tmp/a");
        assert_eq!(find_real(&copy, "/2/2/1"), "/tmp/b/b/a");
        assert_eq!(find_real(&copy, "/3/2/1"), "/tmp/c/b/a");

        // fresh parent back-references terminate at the copied root
        let leaf = copy.find("/3/2/1", false).unwrap();
        let mut cursor = leaf;
        let mut depth = 0;
        while let Some(parent) = cursor.parent() {
            cursor = parent;
            depth += 1;
            assert!(depth <= 3);
        }
        assert!(Arc::ptr_eq(&cursor, &copy));
    }

    #[test]
    fn parent_chain_and_key_coherence() {
        let tree = new_tree();
        add_items(&tree);

        for path in tree.all_item_paths(false) {
            let node = tree.find(&path, true).unwrap();
            let parent = node.parent().expect("non-root node has a live parent");
            let reachable = parent
                .children_snapshot()
                .into_iter()
                .find(|(key, _)| *key == lower(&node.name()))
                .map(|(_, child)| child)
                .expect("parent indexes child by lowercased name");
            assert!(Arc::ptr_eq(&reachable, &node));
        }
    }

    #[test]
    fn erase_tombstones_recursively_and_hides_entries() {
        let tree = new_tree();
        add_items(&tree);

        tree.erase("/1/1", false).unwrap();
        assert!(tree.find("/1/1", false).is_none());
        assert!(tree.find("/1/1", true).is_some());

        tree.erase("/2", false).unwrap();
        assert!(tree.find("/2", false).is_none());
        assert!(tree.find("/2", true).is_some());
        // descendants are tombstoned as well
        assert!(tree.find("/2/1", false).is_none());
        assert!(tree.find("/2/1", true).is_some());
        assert!(tree.find("/2/2/1", false).is_none());

        // everything below /2 is tombstoned, so hard erasure is allowed now
        tree.erase("/2", true).unwrap();
        assert!(tree.find("/2/3", true).is_none());
    }

    #[test]
    fn erase_rejects_live_subtrees_and_bad_paths() {
        let tree = new_tree();
        add_items(&tree);

        assert_eq!(tree.erase("", true).unwrap_err(), TreeError::InvalidArgument);
        assert_eq!(tree.erase("/missing", true).unwrap_err(), TreeError::NotFound);
        assert_eq!(tree.erase("/2", true).unwrap_err(), TreeError::NotEmpty);

        // leaves are erasable outright
        tree.erase("/2/2/1", true).unwrap();
        assert!(tree.find("/2/2/1", true).is_none());
    }

    #[test]
    fn round_trip_erase_then_find() {
        let tree = new_tree();
        add_items(&tree);

        tree.erase("/3/2/1", true).unwrap();
        assert!(tree.find("/3/2/1", false).is_none());

        let original = tree.find("/3/1", false).unwrap();
        tree.erase("/3/1", false).unwrap();
        assert!(tree.find("/3/1", false).is_none());
        let resurrected = tree.find("/3/1", true).unwrap();
        assert!(Arc::ptr_eq(&original, &resurrected));
    }

    #[test]
    fn insert_after_erase_reuses_the_slot() {
        let tree = new_tree();
        add_items(&tree);

        tree.erase("/1/1", true).unwrap();
        tree.add_auto("/1/1", "/tmp/1/1", false).unwrap();
        assert_eq!(find_real(&tree, "/1/1"), "/tmp/1/1");

        tree.erase("/1/1", false).unwrap();
        tree.add_auto("/1/1", "/tmp/A/A", false).unwrap();
        assert_eq!(find_real(&tree, "/1/1"), "/tmp/A/A");
    }

    #[test]
    fn resurrection_returns_the_same_handle() {
        let tree = new_tree();
        add_items(&tree);

        let original = tree.find("/2", false).unwrap();
        tree.erase("/2", false).unwrap();

        let resurrected = tree.add("/2", "/tmp/B", FileKind::Dir, false).unwrap();
        assert!(Arc::ptr_eq(&original, &resurrected));
        assert!(!resurrected.is_deleted());
        assert_eq!(find_real(&tree, "/2"), "/tmp/B");
    }

    #[test]
    fn file_path_walks_ancestors() {
        let tree = new_tree();
        add_items(&tree);

        assert_eq!(tree.file_path(), "");
        assert_eq!(tree.find("/1", false).unwrap().file_path(), "/1");
        assert_eq!(tree.find("/2/2/1", false).unwrap().file_path(), "/2/2/1");
    }

    #[test]
    fn concurrent_mutations_on_disjoint_subtrees() {
        let tree = new_tree();
        tree.add("/left", "/tmp/left", FileKind::Dir, false).unwrap();
        tree.add("/right", "/tmp/right", FileKind::Dir, false).unwrap();

        let writers: Vec<_> = ["left", "right"]
            .into_iter()
            .map(|side| {
                let tree = tree.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        tree.add(
                            &format!("/{side}/{i}"),
                            &format!("/tmp/{side}/{i}"),
                            FileKind::File,
                            false,
                        )
                        .unwrap();
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..2)
            .map(|_| {
                let tree = tree.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        // readers see fully inserted entries or nothing
                        if let Some(node) = tree.find(&format!("/LEFT/{i}"), false) {
                            assert_eq!(node.real_path(), format!("/tmp/left/{i}"));
                        }
                    }
                })
            })
            .collect();

        for handle in writers.into_iter().chain(readers) {
            handle.join().unwrap();
        }

        for i in 0..100 {
            assert!(tree.find(&format!("/left/{i}"), false).is_some());
            assert!(tree.find(&format!("/right/{i}"), false).is_some());
        }
    }

    #[test]
    fn detached_node_stays_readable() {
        let tree = new_tree();
        add_items(&tree);

        let node = tree.find("/2/2/1", false).unwrap();
        tree.erase("/2/2/1", false).unwrap();
        tree.erase("/2/2/1", true).unwrap();

        // no longer reachable from the root, but the handle still works
        assert!(tree.find("/2/2/1", true).is_none());
        assert_eq!(node.real_path(), "/tmp/b/b/a");
    }
}
