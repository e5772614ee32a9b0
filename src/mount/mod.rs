//! Per-mount state.
//!
//! A `MountState` is one pending or active virtual filesystem instance: the
//! mountpoint, the virtual file tree backing it, the directory fds every
//! callback resolves through, the optional write-through upper directory and
//! the inode registry the kernel bridge addresses nodes by.

mod fdmap;

pub use fdmap::FdMap;

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use crate::tree::VfsNode;
use crate::util::{iequals, lower};

/// The kernel addresses the mount root as inode 1.
pub const ROOT_INO: u64 = 1;

/// Registry of nodes the kernel has been told about, by bridge inode number.
/// Entries are weak so a hard-erased node disappears on its own; stale inos
/// simply stop resolving (the bridge treats that as ENOENT).
#[derive(Default)]
pub struct InodeTable {
    map: RwLock<HashMap<u64, Weak<VfsNode>>>,
}

impl InodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: &Arc<VfsNode>) {
        self.map
            .write()
            .unwrap()
            .insert(node.ino(), Arc::downgrade(node));
    }

    pub fn get(&self, ino: u64) -> Option<Arc<VfsNode>> {
        self.map.read().unwrap().get(&ino)?.upgrade()
    }
}

pub struct MountState {
    pub mountpoint: String,
    pub file_tree: Arc<VfsNode>,
    pub fd_map: FdMap,
    pub upper_dir: RwLock<Option<String>>,
    pub inodes: InodeTable,
    /// Create-target redirects: lowercased virtual directory (`""` for the
    /// mount root) to the real directory creations inside it go to.
    create_targets: RwLock<HashMap<String, String>>,
}

impl MountState {
    pub fn new(mountpoint: String, file_tree: Arc<VfsNode>, fd_map: FdMap) -> Arc<Self> {
        let state = Arc::new(MountState {
            mountpoint,
            file_tree,
            fd_map,
            upper_dir: RwLock::new(None),
            inodes: InodeTable::new(),
            create_targets: RwLock::new(HashMap::new()),
        });
        state.inodes.register(&state.file_tree);
        state
    }

    pub fn upper_dir(&self) -> Option<String> {
        self.upper_dir.read().unwrap().clone()
    }

    pub fn set_upper_dir(&self, upper_dir: String) {
        *self.upper_dir.write().unwrap() = Some(upper_dir);
    }

    /// Register `source` as the create target for `virtual_dir` (`""` or
    /// `"/"` for the mount root). Only one target per directory: a later
    /// registration for the same directory replaces the earlier one.
    pub fn set_create_target(&self, virtual_dir: &str, source: &str) {
        let key = lower(virtual_dir.trim_matches('/'));
        self.create_targets
            .write()
            .unwrap()
            .insert(key, source.to_string());
    }

    /// Resolve the create target covering `virtual_dir`, if any: the real
    /// directory creations inside it redirect to. With targets on nested
    /// directories the innermost one wins.
    pub fn create_target_for(&self, virtual_dir: &str) -> Option<String> {
        let targets = self.create_targets.read().unwrap();
        if targets.is_empty() {
            return None;
        }

        let components: Vec<&str> = virtual_dir.split('/').filter(|c| !c.is_empty()).collect();
        let mut best: Option<(usize, &String)> = None;
        for (prefix, source) in targets.iter() {
            let prefix_components: Vec<&str> =
                prefix.split('/').filter(|c| !c.is_empty()).collect();
            if prefix_components.len() > components.len() {
                continue;
            }
            let covered = prefix_components
                .iter()
                .zip(&components)
                .all(|(p, c)| iequals(p, c));
            if covered && best.map_or(true, |(depth, _)| prefix_components.len() > depth) {
                best = Some((prefix_components.len(), source));
            }
        }

        let (depth, source) = best?;
        let mut path = source.clone();
        for component in &components[depth..] {
            path.push('/');
            path.push_str(component);
        }
        Some(path)
    }

    /// Resolve a bridge inode to a live tree node.
    pub fn node_by_ino(&self, ino: u64) -> Option<Arc<VfsNode>> {
        if ino == ROOT_INO {
            return Some(self.file_tree.clone());
        }
        self.inodes.get(ino)
    }

    /// Inode number the bridge should report for `node`.
    pub fn bridge_ino(&self, node: &Arc<VfsNode>) -> u64 {
        if Arc::ptr_eq(node, &self.file_tree) {
            ROOT_INO
        } else {
            node.ino()
        }
    }
}
