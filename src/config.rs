//! Mount profiles.
//!
//! A profile is a JSON file describing the link operations and policies a
//! mount session consists of, so a whole overlay setup can be applied with a
//! single CLI invocation.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::manager::{LinkFlags, VfsManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    File,
    Dir,
}

impl Default for LinkKind {
    fn default() -> Self {
        LinkKind::Dir
    }
}

fn default_recursive() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkEntry {
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub kind: LinkKind,
    #[serde(default = "default_recursive")]
    pub recursive: bool,
    #[serde(default)]
    pub fail_if_exists: bool,
    #[serde(default)]
    pub fail_if_skipped: bool,
    /// Redirect creations under the destination to this link's source.
    #[serde(default)]
    pub create_target: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForcedLibraryEntry {
    pub process: String,
    pub library: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountProfile {
    #[serde(default)]
    pub links: Vec<LinkEntry>,
    #[serde(default)]
    pub upper_dir: Option<String>,
    #[serde(default)]
    pub skip_suffixes: Vec<String>,
    #[serde(default)]
    pub skip_directories: Vec<String>,
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub force_load: Vec<ForcedLibraryEntry>,
    #[serde(default)]
    pub use_mount_namespace: bool,
}

impl MountProfile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read profile {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("cannot parse profile {}", path.display()))
    }

    fn flags_for(entry: &LinkEntry) -> LinkFlags {
        let mut flags = LinkFlags::empty();
        if entry.recursive {
            flags |= LinkFlags::RECURSIVE;
        }
        if entry.fail_if_exists {
            flags |= LinkFlags::FAIL_IF_EXISTS;
        }
        if entry.fail_if_skipped {
            flags |= LinkFlags::FAIL_IF_SKIPPED;
        }
        if entry.create_target {
            flags |= LinkFlags::CREATE_TARGET;
        }
        flags
    }

    /// Install the profile's policies and link operations into `manager`.
    pub fn apply(&self, manager: &VfsManager) -> Result<()> {
        for suffix in &self.skip_suffixes {
            manager.add_skip_file_suffix(suffix);
        }
        for directory in &self.skip_directories {
            manager.add_skip_directory(directory);
        }
        for executable in &self.blacklist {
            manager.blacklist_executable(executable);
        }
        for forced in &self.force_load {
            manager.force_load_library(&forced.process, &forced.library);
        }
        if let Some(upper_dir) = &self.upper_dir {
            manager.set_upper_dir(upper_dir);
        }
        manager.set_use_mount_namespace(self.use_mount_namespace);

        for entry in &self.links {
            let flags = Self::flags_for(entry);
            match entry.kind {
                LinkKind::File => {
                    manager.virtual_link_file(&entry.source, &entry.destination, flags)?
                }
                LinkKind::Dir => manager.virtual_link_directory_static(
                    &entry.source,
                    &entry.destination,
                    flags,
                )?,
            }
        }
        Ok(())
    }
}
