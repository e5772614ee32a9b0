//! The mount manager.
//!
//! `VfsManager` accumulates link operations into pending mount states,
//! activates them on `mount`, tears them down on `unmount` and launches
//! hooked child processes that see the composed namespace. Policy sets
//! (skip suffixes, skip directories, executable blacklist, forced libraries)
//! live behind the same lock as the mount lists; the lock is never held
//! across an await.

use std::collections::BTreeSet;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use bitflags::bitflags;
use nix::unistd::Pid;
use rfuse3::raw::MountHandle;
use tracing::{debug, error, info, trace, warn};
use walkdir::WalkDir;

use crate::fuse;
use crate::mount::{FdMap, MountState};
use crate::process::{self, NamespacedMount};
use crate::tree::{FileKind, VfsNode};
use crate::util::sys::OPEN_FLAGS;
use crate::util::{file_name, iends_with, iequals, parent_path, sys};

bitflags! {
    /// Behavior switches for the link operations.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LinkFlags: u32 {
        /// Linking fails if the destination exists, physically or virtually.
        const FAIL_IF_EXISTS = 0x0000_0001;
        /// Reserved: watch the source for changes. Accepted, no effect yet.
        const MONITOR_CHANGES = 0x0000_0002;
        /// Redirect entry creation under the destination to the link source.
        /// One create target per directory: a later link replaces it, and
        /// the innermost target wins for nested directories.
        const CREATE_TARGET = 0x0000_0004;
        /// Link directories recursively.
        const RECURSIVE = 0x0000_0008;
        /// Fail instead of silently continuing when a skip rule filters an
        /// entry.
        const FAIL_IF_SKIPPED = 0x0000_0010;
    }
}

struct ForcedLibrary {
    process_name: String,
    library_path: String,
}

enum MountBackend {
    /// Served by a tokio task inside this process.
    Task(MountHandle),
    /// Served by a child process owning a user+mount namespace.
    Namespaced(NamespacedMount),
}

struct ActiveMount {
    state: Arc<MountState>,
    backend: MountBackend,
}

#[derive(Default)]
struct ManagerInner {
    skip_file_suffixes: BTreeSet<String>,
    skip_directories: BTreeSet<String>,
    executable_blacklist: BTreeSet<String>,
    force_load_libraries: Vec<ForcedLibrary>,
    pending_mounts: Vec<Arc<MountState>>,
    mounts: Vec<ActiveMount>,
    spawned_processes: Vec<Pid>,
    upper_dir: Option<String>,
    use_mount_namespace: bool,
    ns_pidfd: Option<OwnedFd>,
    debug_mode: bool,
    process_delay: Duration,
}

/// Process-wide mount manager. `instance()` hands out the shared one; tests
/// build isolated managers with `new()`.
#[derive(Default)]
pub struct VfsManager {
    inner: RwLock<ManagerInner>,
}

/// Walk `path` on disk into a fresh tree rooted at it, opening one stable fd
/// per directory (including the root itself).
fn snapshot_tree(path: &str, fd_map: &FdMap) -> Result<Arc<VfsNode>> {
    debug!(path, "creating file tree");
    let tree = VfsNode::new_root("/", path, FileKind::Dir);

    let fd = sys::open(path, OPEN_FLAGS)
        .map_err(|e| anyhow!("error opening directory {path}: {}", errno_msg(e)))?;
    fd_map.insert(path, fd);

    for entry in WalkDir::new(path).min_depth(1).follow_links(false) {
        let entry = entry.with_context(|| format!("error walking {path}"))?;
        let full = entry.path().to_string_lossy().into_owned();
        let relative = entry
            .path()
            .strip_prefix(path)
            .expect("walkdir yields children of its root")
            .to_string_lossy()
            .into_owned();

        trace!(%relative, "adding entry to file tree");
        let kind = if entry.file_type().is_dir() {
            FileKind::Dir
        } else {
            FileKind::File
        };
        tree.add(&relative, &full, kind, false)
            .map_err(|e| anyhow!("error adding {relative} to file tree: {e}"))?;

        if entry.file_type().is_dir() {
            let fd = sys::open(&full, OPEN_FLAGS)
                .map_err(|e| anyhow!("error opening directory {full}: {}", errno_msg(e)))?;
            fd_map.insert(&full, fd);
        }
    }
    Ok(tree)
}

fn errno_msg(errno: i32) -> String {
    std::io::Error::from_raw_os_error(errno).to_string()
}

impl VfsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide manager instance; created lazily, torn down with the
    /// process.
    pub fn instance() -> &'static VfsManager {
        static INSTANCE: OnceLock<VfsManager> = OnceLock::new();
        INSTANCE.get_or_init(VfsManager::new)
    }

    // ----- link operations -----

    /// Make `source` appear at the virtual path `destination`.
    ///
    /// The destination's directory has to exist, at least virtually. A source
    /// matching a skip suffix is quietly accepted unless `FAIL_IF_SKIPPED`.
    pub fn virtual_link_file(
        &self,
        source: &str,
        destination: &str,
        flags: LinkFlags,
    ) -> Result<()> {
        trace!(source, destination, "virtual_link_file");
        let mut inner = self.inner.write().unwrap();

        if inner.in_skip_suffixes(file_name(source)) {
            debug!(source, "file should be skipped");
            if flags.contains(LinkFlags::FAIL_IF_SKIPPED) {
                bail!("file {source} skipped by suffix rule");
            }
            return Ok(());
        }

        if flags.contains(LinkFlags::FAIL_IF_EXISTS) && inner.path_exists(destination) {
            debug!(destination, "destination exists, not linking");
            bail!("destination {destination} already exists");
        }

        let dst_dir = parent_path(destination);
        let dst_name = file_name(destination);

        // an existing pending mount for the destination directory takes the
        // file directly
        for state in &inner.pending_mounts {
            if state.mountpoint == dst_dir {
                debug!(dst_dir, "mountpoint already pending, adding to its tree");
                state
                    .file_tree
                    .add(dst_name, source, FileKind::File, false)
                    .map_err(|e| anyhow!("error adding {destination}: {e}"))?;
                let src_parent = parent_path(source);
                let fd = sys::open(src_parent, OPEN_FLAGS)
                    .map_err(|e| anyhow!("error opening {src_parent}: {}", errno_msg(e)))?;
                state.fd_map.insert(src_parent, fd);
                if flags.contains(LinkFlags::CREATE_TARGET) {
                    state.set_create_target("", src_parent);
                }
                return Ok(());
            }
        }

        let fd_map = FdMap::new();
        let src_parent = parent_path(source);
        let fd = sys::open(src_parent, OPEN_FLAGS)
            .map_err(|e| anyhow!("error opening {src_parent}: {}", errno_msg(e)))?;
        fd_map.insert(src_parent, fd);

        // snapshot whatever physically exists at the destination directory,
        // then layer the linked file on top
        let tree = snapshot_tree(dst_dir, &fd_map)?;
        tree.add(dst_name, source, FileKind::File, true)
            .map_err(|e| anyhow!("error adding {destination}: {e}"))?;

        let state = MountState::new(dst_dir.to_string(), tree, fd_map);
        if flags.contains(LinkFlags::CREATE_TARGET) {
            state.set_create_target("", src_parent);
        }
        inner.pending_mounts.push(state);
        Ok(())
    }

    /// Make the directory `source` appear at `destination`, recursively when
    /// `RECURSIVE` is set. Repeated links onto the same destination merge,
    /// later links winning on conflicts.
    pub fn virtual_link_directory_static(
        &self,
        source: &str,
        destination: &str,
        flags: LinkFlags,
    ) -> Result<()> {
        trace!(source, destination, "virtual_link_directory_static");
        let mut inner = self.inner.write().unwrap();

        if flags.contains(LinkFlags::FAIL_IF_EXISTS) && inner.path_exists(destination) {
            bail!("destination {destination} already exists");
        }

        let fd_map = FdMap::new();
        let fd = sys::open(source, OPEN_FLAGS)
            .map_err(|e| anyhow!("error opening {source}: {}", errno_msg(e)))?;
        fd_map.insert(source, fd);

        let source_tree = VfsNode::new_root("/", source, FileKind::Dir);
        if flags.contains(LinkFlags::RECURSIVE) {
            let mut walker = WalkDir::new(source).min_depth(1).follow_links(false).into_iter();
            while let Some(entry) = walker.next() {
                let entry = entry.with_context(|| format!("error walking {source}"))?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let is_dir = entry.file_type().is_dir();

                if (is_dir && inner.in_skip_directories(&name))
                    || (!is_dir && inner.in_skip_suffixes(&name))
                {
                    if flags.contains(LinkFlags::FAIL_IF_SKIPPED) {
                        debug!(%name, is_dir, "entry skipped, failing as requested");
                        bail!("entry {name} skipped by filter rule");
                    }
                    if is_dir {
                        walker.skip_current_dir();
                    }
                    continue;
                }

                let full = entry.path().to_string_lossy().into_owned();
                let relative = entry
                    .path()
                    .strip_prefix(source)
                    .expect("walkdir yields children of its root")
                    .to_string_lossy()
                    .into_owned();

                debug!(%relative, "adding entry to file tree");
                let new_item = source_tree
                    .add(
                        &relative,
                        &full,
                        if is_dir { FileKind::Dir } else { FileKind::File },
                        false,
                    )
                    .map_err(|e| anyhow!("error adding {relative} to file tree: {e}"))?;

                if is_dir {
                    let fd = sys::open(&full, OPEN_FLAGS)
                        .map_err(|e| anyhow!("error opening {full}: {}", errno_msg(e)))?;
                    trace!(fd, real_path = %new_item.real_path(), "adding directory fd");
                    fd_map.insert(&full, fd);
                }
            }
        }

        // merge into an existing pending mount for the same destination
        for state in &inner.pending_mounts {
            if state.mountpoint == destination {
                state.file_tree.merge(&source_tree);
                state.fd_map.absorb(&fd_map);
                if flags.contains(LinkFlags::CREATE_TARGET) {
                    state.set_create_target("", source);
                }
                return Ok(());
            }
        }

        let destination_tree = snapshot_tree(destination, &fd_map)?;
        destination_tree.merge(&source_tree);

        let state = MountState::new(destination.to_string(), destination_tree, fd_map);
        if flags.contains(LinkFlags::CREATE_TARGET) {
            state.set_create_target("", source);
        }
        inner.pending_mounts.push(state);
        Ok(())
    }

    /// Drop all pending link operations.
    pub fn clear_virtual_mappings(&self) {
        self.inner.write().unwrap().pending_mounts.clear();
    }

    // ----- mount lifecycle -----

    /// Activate every pending mount. Thread-backed mounts report readiness
    /// through the awaited mount future; namespaced mounts through their
    /// startup pipe. Fails fast on the first mount that cannot come up;
    /// pending states are dropped either way.
    pub async fn mount(&self) -> Result<()> {
        let (to_mount, upper_dir, use_ns, debug_mode) = {
            let mut inner = self.inner.write().unwrap();
            if inner.pending_mounts.is_empty() {
                return Ok(());
            }
            (
                std::mem::take(&mut inner.pending_mounts),
                inner.upper_dir.clone(),
                inner.use_mount_namespace,
                inner.debug_mode,
            )
        };

        info!("mounting {} mount points", to_mount.len());

        for state in to_mount {
            if let Some(upper) = &upper_dir {
                let fd = sys::open(upper, OPEN_FLAGS)
                    .map_err(|e| anyhow!("failed to open upper directory {upper}: {}", errno_msg(e)))?;
                state.fd_map.insert(upper, fd);
                state.set_upper_dir(upper.clone());
            }

            if use_ns {
                let ns_fd = {
                    let inner = self.inner.read().unwrap();
                    inner.ns_pidfd.as_ref().map(|fd| fd.as_raw_fd())
                };
                let ns = process::spawn_namespaced_mount(state.clone(), ns_fd, debug_mode)?;

                let mut inner = self.inner.write().unwrap();
                if inner.ns_pidfd.is_none() {
                    // the first child's pidfd is the canonical namespace handle
                    inner.ns_pidfd = Some(
                        ns.pidfd
                            .try_clone()
                            .context("failed to duplicate namespace pidfd")?,
                    );
                }
                inner.mounts.push(ActiveMount {
                    state,
                    backend: MountBackend::Namespaced(ns),
                });
            } else {
                let handle = fuse::mount_state(state.clone(), debug_mode)
                    .await
                    .with_context(|| format!("mount failed for {}", state.mountpoint))?;
                info!("successfully mounted {}", state.mountpoint);

                let mut inner = self.inner.write().unwrap();
                inner.mounts.push(ActiveMount {
                    state,
                    backend: MountBackend::Task(handle),
                });
            }
        }
        Ok(())
    }

    /// Detach every active mount. Refuses (returning `false`) while any
    /// spawned hooked process is still running.
    pub async fn unmount(&self) -> bool {
        let mounts = {
            let mut inner = self.inner.write().unwrap();
            if inner.mounts.is_empty() {
                return true;
            }
            if inner
                .spawned_processes
                .iter()
                .any(|pid| process::still_running(*pid))
            {
                warn!("there is still at least one process running, not unmounting");
                return false;
            }
            info!("unmounting {} mounts", inner.mounts.len());
            std::mem::take(&mut inner.mounts)
        };

        let mut ok = true;
        for mount in mounts {
            debug!(mountpoint = %mount.state.mountpoint, "unmounting");
            match mount.backend {
                MountBackend::Task(handle) => {
                    if let Err(e) = handle.unmount().await {
                        error!(mountpoint = %mount.state.mountpoint, "unmount failed: {e}");
                        ok = false;
                    }
                }
                MountBackend::Namespaced(ns) => {
                    if let Err(e) = process::pidfd_send_signal(ns.pidfd.as_raw_fd(), libc::SIGINT)
                    {
                        error!("failed to signal namespaced mount: {e}");
                        ok = false;
                        continue;
                    }
                    match nix::sys::wait::waitpid(ns.pid, None) {
                        Ok(status) => debug!(?status, "namespaced mount exited"),
                        Err(e) => {
                            error!("waitpid failed: {e}");
                            ok = false;
                        }
                    }
                }
            }
        }
        ok
    }

    pub fn is_mounted(&self) -> bool {
        !self.inner.read().unwrap().mounts.is_empty()
    }

    // ----- hooked processes -----

    /// Spawn `<file> <arg>` so that it sees the composed namespace. Mount
    /// states still pending are realized first unless `file` is blacklisted.
    pub async fn create_process_hooked(
        &self,
        file: &str,
        arg: &str,
        work_dir: Option<&str>,
        env: Option<Vec<String>>,
    ) -> Result<Pid> {
        {
            let inner = self.inner.read().unwrap();
            if !inner.mounts.is_empty() && inner.use_mount_namespace && inner.ns_pidfd.is_none() {
                bail!("mounted without any reference to a namespace, aborting");
            }
        }
        trace!(file, arg, "create_process_hooked");

        let blacklisted = {
            let inner = self.inner.read().unwrap();
            inner.executable_blacklist.contains(file)
        };
        if !blacklisted {
            self.mount().await?;
        }

        let mut env = env.unwrap_or_else(process::current_env);

        // wine and proton get the forced-library list as dll overrides
        let wine = iends_with(file, "wine")
            || iends_with(file, "wine-staging")
            || iends_with(file, "wine64")
            || iends_with(file, "wine64-staging");
        let proton = iends_with(file, "proton");
        if wine || proton {
            let process_name = {
                let mut tokens = arg.split_whitespace();
                let first = tokens.next().unwrap_or("");
                if wine {
                    first.to_string()
                } else {
                    tokens.next().unwrap_or(first).to_string()
                }
            };
            trace!(%process_name, "using process name");
            let libraries = {
                let inner = self.inner.read().unwrap();
                inner.libraries_to_force_load(&process_name)
            };
            if !libraries.is_empty() {
                let overrides = libraries
                    .iter()
                    .map(|lib| format!("{lib}=n,b"))
                    .collect::<Vec<_>>()
                    .join(";");
                let entry = format!("WINEDLLOVERRIDES=\"{overrides}\"");
                debug!(%entry, "adding dll overrides to process");
                env.push(entry);
            }
        }

        let delay = self.inner.read().unwrap().process_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let work_dir = match work_dir {
            Some(dir) => dir.to_string(),
            None => std::env::current_dir()
                .context("cannot determine working directory")?
                .to_string_lossy()
                .into_owned(),
        };

        let (ns_fd, use_ns) = {
            let inner = self.inner.read().unwrap();
            (
                inner.ns_pidfd.as_ref().map(|fd| fd.as_raw_fd()),
                inner.use_mount_namespace,
            )
        };
        let pid = process::spawn_hooked(
            file,
            arg,
            &work_dir,
            env,
            if use_ns { ns_fd } else { None },
        )?;

        self.inner.write().unwrap().spawned_processes.push(pid);
        Ok(pid)
    }

    /// Pids of every hooked process spawned so far.
    pub fn process_list(&self) -> Vec<Pid> {
        self.inner.read().unwrap().spawned_processes.clone()
    }

    // ----- introspection -----

    /// Readable dump of every pending and active tree.
    pub fn create_vfs_dump(&self) -> String {
        let inner = self.inner.read().unwrap();
        debug!(
            pending = inner.pending_mounts.len(),
            active = inner.mounts.len(),
            "dumping mounts"
        );
        let mut out = String::new();
        for state in &inner.pending_mounts {
            state.file_tree.dump(&mut out, 0);
        }
        for mount in &inner.mounts {
            mount.state.file_tree.dump(&mut out, 0);
        }
        out
    }

    pub fn pending_count(&self) -> usize {
        self.inner.read().unwrap().pending_mounts.len()
    }

    // ----- policies -----

    /// Keep `executable_name` away from the virtual file system.
    pub fn blacklist_executable(&self, executable_name: &str) {
        debug!(executable_name, "blacklisting");
        self.inner
            .write()
            .unwrap()
            .executable_blacklist
            .insert(executable_name.to_string());
    }

    pub fn clear_executable_blacklist(&self) {
        debug!("clearing blacklist");
        self.inner.write().unwrap().executable_blacklist.clear();
    }

    /// Skip files whose name ends with `file_suffix` during linking. Both
    /// `.txt` and `some_file.txt` are valid suffixes.
    pub fn add_skip_file_suffix(&self, file_suffix: &str) {
        if file_suffix.is_empty() {
            return;
        }
        debug!(file_suffix, "added skip file suffix");
        self.inner
            .write()
            .unwrap()
            .skip_file_suffixes
            .insert(file_suffix.to_string());
    }

    pub fn clear_skip_file_suffixes(&self) {
        debug!("clearing skip file suffixes");
        self.inner.write().unwrap().skip_file_suffixes.clear();
    }

    /// Skip directories with this name (not path) during directory linking.
    pub fn add_skip_directory(&self, directory: &str) {
        if directory.is_empty() {
            return;
        }
        debug!(directory, "added skip directory");
        self.inner
            .write()
            .unwrap()
            .skip_directories
            .insert(directory.to_string());
    }

    pub fn clear_skip_directories(&self) {
        debug!("clearing skip directories");
        self.inner.write().unwrap().skip_directories.clear();
    }

    /// Force `library_path` to load when a process named `process_name` is
    /// spawned through the hook.
    pub fn force_load_library(&self, process_name: &str, library_path: &str) {
        debug!(process_name, library_path, "adding forced library");
        self.inner
            .write()
            .unwrap()
            .force_load_libraries
            .push(ForcedLibrary {
                process_name: process_name.to_string(),
                library_path: library_path.to_string(),
            });
    }

    pub fn clear_library_force_loads(&self) {
        debug!("clearing forced libraries");
        self.inner.write().unwrap().force_load_libraries.clear();
    }

    /// Redirect entry creation under mountpoints into `upper_dir` instead of
    /// the backing source directories.
    pub fn set_upper_dir(&self, upper_dir: &str) {
        self.inner.write().unwrap().upper_dir = if upper_dir.is_empty() {
            None
        } else {
            Some(upper_dir.to_string())
        };
    }

    /// Serve mounts from child processes owning a private user+mount
    /// namespace instead of in-process tasks.
    pub fn set_use_mount_namespace(&self, value: bool) {
        self.inner.write().unwrap().use_mount_namespace = value;
    }

    pub fn set_debug_mode(&self, value: bool) {
        self.inner.write().unwrap().debug_mode = value;
    }

    pub fn set_process_delay(&self, delay: Duration) {
        self.inner.write().unwrap().process_delay = delay;
    }
}

impl ManagerInner {
    fn in_skip_suffixes(&self, file_name: &str) -> bool {
        self.skip_file_suffixes.iter().any(|suffix| {
            if iends_with(file_name, suffix) {
                debug!(file_name, suffix, "file matches skip suffix");
                true
            } else {
                false
            }
        })
    }

    fn in_skip_directories(&self, directory_name: &str) -> bool {
        self.skip_directories
            .iter()
            .any(|suffix| iends_with(directory_name, suffix))
    }

    /// Whether `path` exists on disk or inside any pending tree.
    fn path_exists(&self, path: &str) -> bool {
        if std::path::Path::new(path).exists() {
            return true;
        }
        for state in &self.pending_mounts {
            if let Some(rest) = path.strip_prefix(&state.mountpoint) {
                if state.file_tree.find(rest, false).is_some() {
                    return true;
                }
            }
        }
        false
    }

    fn libraries_to_force_load(&self, process_name: &str) -> Vec<String> {
        self.force_load_libraries
            .iter()
            .filter(|lib| iequals(&lib.process_name, process_name))
            .map(|lib| lib.library_path.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn setup_dirs(tmp: &std::path::Path) -> (String, String) {
        let src = tmp.join("src");
        let mnt = tmp.join("mnt");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::create_dir_all(&mnt).unwrap();
        fs::write(src.join("one.txt"), b"one").unwrap();
        fs::write(src.join("sub/two.txt"), b"two").unwrap();
        (
            src.to_str().unwrap().to_string(),
            mnt.to_str().unwrap().to_string(),
        )
    }

    #[test]
    fn link_directory_builds_pending_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let (src, mnt) = setup_dirs(tmp.path());
        let manager = VfsManager::new();

        manager
            .virtual_link_directory_static(&src, &mnt, LinkFlags::RECURSIVE)
            .unwrap();
        assert_eq!(manager.pending_count(), 1);

        // merging the source layer onto the snapshot points the root at the
        // source directory
        let dump = manager.create_vfs_dump();
        assert!(dump.contains(&format!("/ -> {src}")));
        assert!(!dump.contains(&format!("/ -> {mnt}")));
        assert!(dump.contains("one.txt ->"));
        assert!(dump.contains("sub/ ->"));
        assert!(dump.contains("two.txt ->"));
    }

    #[test]
    fn link_directory_skips_filtered_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let (src, mnt) = setup_dirs(tmp.path());
        fs::create_dir_all(format!("{src}/.git")).unwrap();
        fs::write(format!("{src}/.git/config"), b"x").unwrap();
        fs::write(format!("{src}/notes.meta"), b"x").unwrap();

        let manager = VfsManager::new();
        manager.add_skip_directory(".git");
        manager.add_skip_file_suffix(".meta");

        manager
            .virtual_link_directory_static(&src, &mnt, LinkFlags::RECURSIVE)
            .unwrap();

        let dump = manager.create_vfs_dump();
        assert!(!dump.contains(".git"));
        assert!(!dump.contains("notes.meta"));
        assert!(dump.contains("one.txt"));
    }

    #[test]
    fn fail_if_skipped_propagates() {
        let tmp = tempfile::tempdir().unwrap();
        let (src, mnt) = setup_dirs(tmp.path());
        fs::write(format!("{src}/notes.meta"), b"x").unwrap();

        let manager = VfsManager::new();
        manager.add_skip_file_suffix(".meta");

        assert!(manager
            .virtual_link_directory_static(
                &src,
                &mnt,
                LinkFlags::RECURSIVE | LinkFlags::FAIL_IF_SKIPPED
            )
            .is_err());
    }

    #[test]
    fn fail_if_exists_checks_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let (src, mnt) = setup_dirs(tmp.path());

        let manager = VfsManager::new();
        assert!(manager
            .virtual_link_directory_static(&src, &mnt, LinkFlags::FAIL_IF_EXISTS)
            .is_err());
    }

    #[test]
    fn link_file_snapshots_destination_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let (src, mnt) = setup_dirs(tmp.path());
        fs::write(format!("{mnt}/existing.txt"), b"old").unwrap();

        let manager = VfsManager::new();
        manager
            .virtual_link_file(
                &format!("{src}/one.txt"),
                &format!("{mnt}/linked.txt"),
                LinkFlags::empty(),
            )
            .unwrap();

        let dump = manager.create_vfs_dump();
        assert!(dump.contains(&format!("linked.txt -> {src}/one.txt")));
        assert!(dump.contains("existing.txt ->"));
    }

    #[test]
    fn link_file_respects_skip_suffix() {
        let tmp = tempfile::tempdir().unwrap();
        let (src, mnt) = setup_dirs(tmp.path());

        let manager = VfsManager::new();
        manager.add_skip_file_suffix(".txt");

        // silently skipped
        manager
            .virtual_link_file(
                &format!("{src}/one.txt"),
                &format!("{mnt}/one.txt"),
                LinkFlags::empty(),
            )
            .unwrap();
        assert_eq!(manager.pending_count(), 0);

        // failing skip
        assert!(manager
            .virtual_link_file(
                &format!("{src}/one.txt"),
                &format!("{mnt}/one.txt"),
                LinkFlags::FAIL_IF_SKIPPED,
            )
            .is_err());
    }

    #[test]
    fn link_file_joins_pending_mount_for_same_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let (src, mnt) = setup_dirs(tmp.path());

        let manager = VfsManager::new();
        manager
            .virtual_link_directory_static(&src, &mnt, LinkFlags::RECURSIVE)
            .unwrap();
        manager
            .virtual_link_file(
                &format!("{src}/sub/two.txt"),
                &format!("{mnt}/extra.txt"),
                LinkFlags::empty(),
            )
            .unwrap();

        // still one pending mount, now carrying the extra file
        assert_eq!(manager.pending_count(), 1);
        assert!(manager.create_vfs_dump().contains("extra.txt"));
    }

    #[test]
    fn directory_links_merge_with_later_links_winning() {
        let tmp = tempfile::tempdir().unwrap();
        let (src, mnt) = setup_dirs(tmp.path());
        let src2 = tmp.path().join("src2");
        fs::create_dir_all(&src2).unwrap();
        fs::write(src2.join("one.txt"), b"override").unwrap();
        let src2 = src2.to_str().unwrap().to_string();

        let manager = VfsManager::new();
        manager
            .virtual_link_directory_static(&src, &mnt, LinkFlags::RECURSIVE)
            .unwrap();
        manager
            .virtual_link_directory_static(&src2, &mnt, LinkFlags::RECURSIVE)
            .unwrap();

        assert_eq!(manager.pending_count(), 1);
        let dump = manager.create_vfs_dump();
        assert!(dump.contains(&format!("one.txt -> {src2}/one.txt")));
        // entries only present in the first link survive the merge
        assert!(dump.contains("two.txt"));
    }

    #[test]
    fn create_target_links_register_redirects() {
        let tmp = tempfile::tempdir().unwrap();
        let (src, mnt) = setup_dirs(tmp.path());

        let manager = VfsManager::new();
        manager
            .virtual_link_directory_static(
                &src,
                &mnt,
                LinkFlags::RECURSIVE | LinkFlags::CREATE_TARGET,
            )
            .unwrap();

        let inner = manager.inner.read().unwrap();
        let state = &inner.pending_mounts[0];
        assert_eq!(state.create_target_for(""), Some(src.clone()));
        assert_eq!(state.create_target_for("/new"), Some(format!("{src}/new")));
    }

    #[test]
    fn later_create_target_link_replaces_earlier() {
        let tmp = tempfile::tempdir().unwrap();
        let (src, mnt) = setup_dirs(tmp.path());
        let src2 = tmp.path().join("src2");
        fs::create_dir_all(&src2).unwrap();
        let src2 = src2.to_str().unwrap().to_string();

        let manager = VfsManager::new();
        manager
            .virtual_link_directory_static(
                &src,
                &mnt,
                LinkFlags::RECURSIVE | LinkFlags::CREATE_TARGET,
            )
            .unwrap();
        manager
            .virtual_link_directory_static(
                &src2,
                &mnt,
                LinkFlags::RECURSIVE | LinkFlags::CREATE_TARGET,
            )
            .unwrap();

        let inner = manager.inner.read().unwrap();
        assert_eq!(inner.pending_mounts.len(), 1);
        assert_eq!(
            inner.pending_mounts[0].create_target_for(""),
            Some(src2.clone())
        );
    }

    #[test]
    fn create_target_file_link_covers_destination_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let (src, mnt) = setup_dirs(tmp.path());

        let manager = VfsManager::new();
        manager
            .virtual_link_file(
                &format!("{src}/one.txt"),
                &format!("{mnt}/one.txt"),
                LinkFlags::CREATE_TARGET,
            )
            .unwrap();

        let inner = manager.inner.read().unwrap();
        assert_eq!(inner.pending_mounts[0].create_target_for(""), Some(src.clone()));
    }

    #[test]
    fn clear_virtual_mappings_drops_pendings() {
        let tmp = tempfile::tempdir().unwrap();
        let (src, mnt) = setup_dirs(tmp.path());

        let manager = VfsManager::new();
        manager
            .virtual_link_directory_static(&src, &mnt, LinkFlags::RECURSIVE)
            .unwrap();
        assert_eq!(manager.pending_count(), 1);
        manager.clear_virtual_mappings();
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn policy_sets_are_clearable() {
        let manager = VfsManager::new();
        manager.add_skip_file_suffix(".tmp");
        manager.add_skip_file_suffix("");
        manager.add_skip_directory(".svn");
        manager.blacklist_executable("updater.exe");
        manager.force_load_library("game.exe", "/opt/hook.so");

        {
            let inner = manager.inner.read().unwrap();
            assert_eq!(inner.skip_file_suffixes.len(), 1);
            assert_eq!(inner.skip_directories.len(), 1);
            assert!(inner.executable_blacklist.contains("updater.exe"));
            assert_eq!(inner.libraries_to_force_load("GAME.EXE"), vec!["/opt/hook.so"]);
        }

        manager.clear_skip_file_suffixes();
        manager.clear_skip_directories();
        manager.clear_executable_blacklist();
        manager.clear_library_force_loads();

        let inner = manager.inner.read().unwrap();
        assert!(inner.skip_file_suffixes.is_empty());
        assert!(inner.skip_directories.is_empty());
        assert!(inner.executable_blacklist.is_empty());
        assert!(inner.libraries_to_force_load("game.exe").is_empty());
    }

    #[tokio::test]
    async fn unmount_without_mounts_is_trivially_true() {
        let manager = VfsManager::new();
        assert!(manager.unmount().await);
        assert!(!manager.is_mounted());
    }

    #[tokio::test]
    async fn hooked_process_runs_with_pending_mounts_realized() {
        // without FUSE available the mount itself cannot be exercised here;
        // blacklisting keeps the pending mount unrealized while the process
        // side of the call is still covered
        let tmp = tempfile::tempdir().unwrap();
        let (src, mnt) = setup_dirs(tmp.path());

        let manager = VfsManager::new();
        manager
            .virtual_link_directory_static(&src, &mnt, LinkFlags::RECURSIVE)
            .unwrap();
        manager.blacklist_executable("true");

        let pid = manager
            .create_process_hooked("true", "", Some(&mnt), None)
            .await
            .unwrap();
        assert!(pid.as_raw() > 0);
        assert_eq!(manager.process_list(), vec![pid]);
        // the pending mount was left untouched by the blacklisted executable
        assert_eq!(manager.pending_count(), 1);

        nix::sys::wait::waitpid(pid, None).unwrap();
    }

    #[tokio::test]
    async fn wine_process_gets_dll_overrides() {
        // no mounts pending: create_process_hooked goes straight to spawn
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("overrides.txt");

        let manager = VfsManager::new();
        manager.force_load_library("game.exe", "hookA");
        manager.force_load_library("GAME.exe", "hookB");
        manager.force_load_library("other.exe", "hookC");

        // a fake wine binary: prints the overrides variable
        let fake_wine = tmp.path().join("wine");
        fs::write(
            &fake_wine,
            format!("#!/bin/sh\nprintenv WINEDLLOVERRIDES > {}\n", marker.display()),
        )
        .unwrap();
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&fake_wine, fs::Permissions::from_mode(0o755)).unwrap();

        let pid = manager
            .create_process_hooked(
                fake_wine.to_str().unwrap(),
                "game.exe",
                Some(tmp.path().to_str().unwrap()),
                None,
            )
            .await
            .unwrap();
        nix::sys::wait::waitpid(pid, None).unwrap();

        let content = fs::read_to_string(&marker).unwrap_or_default();
        assert_eq!(content.trim(), "\"hookA=n,b;hookB=n,b\"");
    }
}
