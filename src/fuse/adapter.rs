//! The kernel-bridge adapter.
//!
//! Implements `rfuse3::raw::Filesystem` over one `MountState`. Every request
//! resolves its inode to a virtual-file-tree node, computes the real backing
//! location as a (directory fd, last component) pair and performs the syscall
//! there. Inode numbers are handed out per node and registered in the mount's
//! `InodeTable` when the kernel first learns about an entry; `forget` is a
//! no-op, stale inodes simply stop resolving.

use std::ffi::{OsStr, OsString};
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyCreated, ReplyData,
    ReplyDirectory, ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs,
    ReplyWrite,
};
use rfuse3::raw::{Filesystem, Request};
use rfuse3::{Errno, FileType, Result as FuseResult, SetAttr, Timestamp};
use tracing::{debug, error, info, trace, warn};

use crate::mount::MountState;
use crate::tree::{FileKind, TreeError, VfsNode};
use crate::util::sys::OPEN_FLAGS;
use crate::util::{file_name, parent_path, sys};

const TTL: Duration = Duration::from_secs(1);

/// Probe name some file managers stat below every directory; a missing child
/// with this name resolves to the directory itself.
const DIRECTORY_PROBE: &str = ".directory";

impl From<TreeError> for Errno {
    fn from(value: TreeError) -> Self {
        Errno::from(value.errno())
    }
}

fn kind_from_mode(mode: libc::mode_t) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        _ => FileType::RegularFile,
    }
}

fn kind_to_file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::Dir => FileType::Directory,
        FileKind::File | FileKind::Unknown => FileType::RegularFile,
    }
}

fn stat_to_attr(st: &libc::stat, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: Timestamp::new(st.st_atime, st.st_atime_nsec as u32),
        mtime: Timestamp::new(st.st_mtime, st.st_mtime_nsec as u32),
        ctime: Timestamp::new(st.st_ctime, st.st_ctime_nsec as u32),
        #[cfg(target_os = "macos")]
        crtime: Timestamp::new(st.st_ctime, st.st_ctime_nsec as u32),
        kind: kind_from_mode(st.st_mode),
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: st.st_blksize as u32,
    }
}

/// One mounted virtual filesystem instance.
pub struct VirtualFs {
    state: Arc<MountState>,
}

impl VirtualFs {
    pub fn new(state: Arc<MountState>) -> Self {
        VirtualFs { state }
    }

    fn dirfd(&self, real_dir: &str) -> RawFd {
        self.state.fd_map.at(real_dir)
    }

    fn node(&self, ino: u64) -> FuseResult<Arc<VfsNode>> {
        self.state.node_by_ino(ino).ok_or_else(|| {
            error!(ino, "no mount state entry for inode");
            Errno::from(libc::ENOENT)
        })
    }

    /// Stat `node` through its retained directory fd (directories) or its
    /// parent's fd (everything else).
    fn attr_for_node(&self, node: &Arc<VfsNode>) -> Result<FileAttr, i32> {
        let ino = self.state.bridge_ino(node);
        let real = node.real_path();
        let st = if node.is_dir() {
            let fd = self.dirfd(&real);
            sys::fstatat(fd, "", libc::AT_SYMLINK_NOFOLLOW | libc::AT_EMPTY_PATH)
        } else {
            let fd = self.dirfd(parent_path(&real));
            sys::fstatat(fd, file_name(&real), libc::AT_SYMLINK_NOFOLLOW)
        };
        match st {
            Ok(st) => Ok(stat_to_attr(&st, ino)),
            Err(e) => {
                debug!(%real, errno = e, "fstatat failed");
                Err(e)
            }
        }
    }

    /// Real directory the write-redirect policy selects for creating entries
    /// under `parent`: the upper dir joined with the virtual path when an
    /// upper dir is configured, else the innermost create-target redirect
    /// covering the parent, else the originally bound path.
    fn real_parent_for_create(&self, parent: &Arc<VfsNode>) -> String {
        let virtual_path = parent.file_path();
        if let Some(upper) = self.state.upper_dir() {
            return format!("{upper}{virtual_path}");
        }
        if let Some(redirected) = self.state.create_target_for(&virtual_path) {
            return redirected;
        }
        parent.real_path()
    }

    /// Directory fd for `real_dir`, materializing the directory chain on disk
    /// when it is missing and an upper dir is configured.
    fn create_dirfd(&self, real_dir: &str, mode: libc::mode_t) -> Result<RawFd, i32> {
        let fd = self.dirfd(real_dir);
        if fd >= 0 {
            return Ok(fd);
        }
        if self.state.upper_dir().is_none() {
            // nothing to materialize into; let the syscall fail with EBADF
            return Ok(fd);
        }
        self.materialize_upper_chain(real_dir, mode)
    }

    fn materialize_upper_chain(&self, real_dir: &str, mode: libc::mode_t) -> Result<RawFd, i32> {
        let fd = self.dirfd(real_dir);
        if fd >= 0 {
            return Ok(fd);
        }
        let parent = parent_path(real_dir);
        if parent == real_dir || parent.is_empty() {
            error!(real_dir, "cannot materialize directory chain past the root");
            return Err(libc::EIO);
        }
        let name = file_name(real_dir);
        let parent_fd = self.materialize_upper_chain(parent, mode)?;

        trace!(real_dir, "creating parent directory");
        match sys::mkdirat(parent_fd, name, mode) {
            Ok(()) | Err(libc::EEXIST) => {}
            Err(e) => {
                error!(real_dir, errno = e, "mkdirat failed");
                return Err(e);
            }
        }
        let fd = sys::openat(parent_fd, name, OPEN_FLAGS, 0).map_err(|e| {
            error!(real_dir, errno = e, "error opening parent directory");
            e
        })?;
        self.state.fd_map.insert(real_dir, fd);
        Ok(fd)
    }

    fn do_lookup(&self, parent: &Arc<VfsNode>, name: &str) -> Result<Arc<VfsNode>, i32> {
        match parent.find(name, false) {
            Some(child) => {
                self.state.inodes.register(&child);
                Ok(child)
            }
            // stat probes on <dir>/.directory resolve to the directory itself
            None if name == DIRECTORY_PROBE => Ok(parent.clone()),
            None => Err(libc::ENOENT),
        }
    }

    fn do_mkdir(
        &self,
        parent: &Arc<VfsNode>,
        name: &str,
        mode: libc::mode_t,
    ) -> Result<(Arc<VfsNode>, FileAttr), i32> {
        // tombstoned entries are resurrected instead of recreated
        if let Some(existing) = parent.find(name, true) {
            if !existing.is_deleted() {
                return Err(libc::EEXIST);
            }
            info!(
                path = %existing.file_path(),
                "rerouting directory creation to original location of deleted entry"
            );
            existing.set_deleted(false);
            existing.set_name(name);
            self.state.inodes.register(&existing);
            match self.attr_for_node(&existing) {
                Ok(attr) => return Ok((existing, attr)),
                Err(_) => {
                    // backing directory is gone; recreate it in place
                    let real = existing.real_path();
                    let parent_fd = self.dirfd(parent_path(&real));
                    sys::mkdirat(parent_fd, file_name(&real), mode)?;
                    let fd = sys::openat(parent_fd, file_name(&real), OPEN_FLAGS, 0)?;
                    self.state.fd_map.insert(&real, fd);
                    let attr = self.attr_for_node(&existing)?;
                    return Ok((existing, attr));
                }
            }
        }

        let real_parent = self.real_parent_for_create(parent);
        let real_path = format!("{real_parent}/{name}");
        trace!(%real_parent, name, "creating directory");

        let parent_fd = self.create_dirfd(&real_parent, mode)?;
        sys::mkdirat(parent_fd, name, mode).map_err(|e| {
            error!(%real_parent, name, errno = e, "mkdirat failed");
            e
        })?;

        // keep a stable fd so later operations survive path races
        let fd = sys::openat(parent_fd, name, OPEN_FLAGS, 0).map_err(|e| {
            error!(%real_path, errno = e, "openat failed");
            e
        })?;
        self.state.fd_map.insert(&real_path, fd);

        let node = parent
            .add(name, &real_path, FileKind::Dir, false)
            .map_err(|_| libc::EIO)?;
        self.state.inodes.register(&node);
        let attr = self.attr_for_node(&node)?;
        Ok((node, attr))
    }

    fn do_unlink(&self, parent: &Arc<VfsNode>, name: &str) -> Result<(), i32> {
        let item = parent.find(name, false).ok_or(libc::ENOENT)?;
        if item.is_dir() {
            return Err(libc::EISDIR);
        }

        let real = item.real_path();
        let real_parent = parent_path(&real);
        trace!(real_parent, name = file_name(&real), "unlinkat");
        sys::unlinkat(self.dirfd(real_parent), file_name(&real), 0).map_err(|e| {
            error!(%real, errno = e, "unlink failed");
            e
        })?;

        parent.erase(name, false).map_err(TreeError::errno)
    }

    fn do_rmdir(&self, parent: &Arc<VfsNode>, name: &str) -> Result<(), i32> {
        let item = parent.find(name, false).ok_or(libc::ENOENT)?;
        if !item.is_dir() {
            return Err(libc::ENOTDIR);
        }
        if !item.is_empty() {
            return Err(libc::ENOTEMPTY);
        }

        let real = item.real_path();
        sys::unlinkat(
            self.dirfd(parent_path(&real)),
            file_name(&real),
            libc::AT_REMOVEDIR,
        )
        .map_err(|e| {
            error!(%real, errno = e, "rmdir failed");
            e
        })?;

        item.set_deleted(true);
        Ok(())
    }

    /// Rename with full flag handling. The bridge delivers flagless renames;
    /// RENAME_NOREPLACE / RENAME_EXCHANGE are honored for direct callers.
    pub fn do_rename(
        &self,
        parent: &Arc<VfsNode>,
        name: &str,
        new_parent: &Arc<VfsNode>,
        new_name: &str,
        flags: u32,
    ) -> Result<(), i32> {
        let old_item = parent.find(name, false).ok_or(libc::ENOENT)?;

        if new_parent.find(new_name, false).is_some() && flags & libc::RENAME_NOREPLACE != 0 {
            error!(new_name, "rename target exists");
            return Err(libc::EEXIST);
        }

        let new_real_parent = self.real_parent_for_create(new_parent);
        let old_real = old_item.real_path();
        let old_real_parent = parent_path(&old_real);

        let old_fd = self.dirfd(old_real_parent);
        let new_fd = self.dirfd(&new_real_parent);
        let exchange = flags & libc::RENAME_EXCHANGE;
        sys::renameat2(old_fd, file_name(&old_real), new_fd, new_name, exchange).map_err(|e| {
            error!(
                from = %old_real,
                to = %new_real_parent,
                new_name,
                errno = e,
                "renameat2 failed"
            );
            e
        })?;

        // mirror the rename in the tree: install the new entry, drop the old
        // one. The on-disk rename is not reverted if this fails. The recorded
        // real path is the new real parent with the full virtual destination
        // path appended.
        let to = {
            let mut path = new_parent.file_path();
            path.push('/');
            path.push_str(new_name);
            path
        };
        let new_real = format!("{new_real_parent}{to}");
        let new_node = new_parent
            .add(new_name, &new_real, old_item.kind(), false)
            .map_err(|e| {
                error!(new_name, "error inserting renamed entry into file tree");
                e.errno()
            })?;
        self.state.inodes.register(&new_node);

        if let Err(e) = parent.erase(name, true) {
            error!(name, "error removing renamed entry from file tree");
            let _ = new_parent.erase(new_name, true);
            return Err(e.errno());
        }
        Ok(())
    }

    fn do_create(
        &self,
        parent: &Arc<VfsNode>,
        name: &str,
        mode: libc::mode_t,
        flags: i32,
    ) -> Result<(Arc<VfsNode>, FileAttr, RawFd), i32> {
        let real_parent = self.real_parent_for_create(parent);
        let parent_fd = self.create_dirfd(&real_parent, mode)?;

        let fd = sys::openat(parent_fd, name, libc::O_CREAT | flags, mode).map_err(|e| {
            error!(%real_parent, name, errno = e, "openat failed");
            e
        })?;

        let node = match parent.find(name, false) {
            Some(node) => node,
            // a tombstoned entry at this name is resurrected by the add
            None => {
                let real_path = format!("{real_parent}/{name}");
                match parent.add(name, &real_path, FileKind::File, false) {
                    Ok(node) => node,
                    Err(e) => {
                        error!(name, %e, "error adding created file to file tree");
                        sys::close(fd);
                        return Err(e.errno());
                    }
                }
            }
        };
        self.state.inodes.register(&node);

        let attr = match sys::fstat(fd) {
            Ok(st) => stat_to_attr(&st, self.state.bridge_ino(&node)),
            Err(e) => {
                sys::close(fd);
                return Err(e);
            }
        };
        Ok((node, attr, fd))
    }

    fn do_setattr(&self, node: &Arc<VfsNode>, fh: Option<u64>, set_attr: &SetAttr) -> Result<(), i32> {
        let real = node.real_path();
        let real_parent = parent_path(&real);
        let name = file_name(&real);
        let fd = fh.filter(|fh| *fh > 0).map(|fh| fh as RawFd);

        if let Some(mode) = set_attr.mode {
            match fd {
                Some(fd) => sys::fchmod(fd, mode as libc::mode_t)?,
                None => sys::fchmodat(self.dirfd(real_parent), name, mode as libc::mode_t)?,
            }
        }

        if set_attr.uid.is_some() || set_attr.gid.is_some() {
            // (uid_t)-1 leaves the respective id unchanged
            let uid = set_attr.uid.unwrap_or(libc::uid_t::MAX);
            let gid = set_attr.gid.unwrap_or(libc::gid_t::MAX);
            match fd {
                Some(fd) => sys::fchown(fd, uid, gid)?,
                None => sys::fchownat(self.dirfd(real_parent), name, uid, gid)?,
            }
        }

        if let Some(size) = set_attr.size {
            match fd {
                Some(fd) => sys::ftruncate(fd, size as i64)?,
                None => {
                    let fd = sys::openat(self.dirfd(real_parent), name, libc::O_WRONLY, 0)
                        .map_err(|e| {
                            error!(%real, errno = e, "openat for truncate failed");
                            e
                        })?;
                    let result = sys::ftruncate(fd, size as i64);
                    sys::close(fd);
                    result?;
                }
            }
        }

        Ok(())
    }
}

#[allow(refining_impl_trait_reachable)]
impl Filesystem for VirtualFs {
    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        Ok(ReplyInit::default())
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        trace!(unique = req.unique, parent, name = %name.to_string_lossy(), "fuse.lookup");
        let parent_node = self.node(parent)?;
        let name = name.to_string_lossy();
        let child = self.do_lookup(&parent_node, &name).map_err(Errno::from)?;
        let attr = self.attr_for_node(&child).map_err(Errno::from)?;
        Ok(ReplyEntry {
            ttl: TTL,
            attr,
            generation: 0,
        })
    }

    async fn getattr(
        &self,
        req: Request,
        ino: u64,
        fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        trace!(unique = req.unique, ino, fh = ?fh, "fuse.getattr");

        // a live handle wins over path resolution
        if let Some(fh) = fh.filter(|fh| *fh > 0) {
            let st = sys::fstat(fh as RawFd).map_err(Errno::from)?;
            return Ok(ReplyAttr {
                ttl: TTL,
                attr: stat_to_attr(&st, ino),
            });
        }

        let node = self.node(ino)?;
        let attr = self.attr_for_node(&node).map_err(Errno::from)?;
        Ok(ReplyAttr { ttl: TTL, attr })
    }

    async fn setattr(
        &self,
        req: Request,
        ino: u64,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        debug!(unique = req.unique, ino, set_attr = ?set_attr, "fuse.setattr");
        let node = self.node(ino)?;
        self.do_setattr(&node, fh, &set_attr).map_err(Errno::from)?;
        let attr = self.attr_for_node(&node).map_err(Errno::from)?;
        Ok(ReplyAttr { ttl: TTL, attr })
    }

    async fn open(&self, _req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        trace!(ino, flags, "fuse.open");
        let node = self.node(ino)?;
        let real = node.real_path();
        let fd = sys::openat(
            self.dirfd(parent_path(&real)),
            file_name(&real),
            flags as i32,
            0,
        )
        .map_err(Errno::from)?;
        Ok(ReplyOpen {
            fh: fd as u64,
            flags,
        })
    }

    async fn read(
        &self,
        _req: Request,
        ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        trace!(ino, fh, offset, size, "fuse.read");
        let mut buf = vec![0u8; size as usize];
        let n = if fh > 0 {
            sys::pread(fh as RawFd, &mut buf, offset as i64).map_err(Errno::from)?
        } else {
            // stateless fallback: open, read, close
            let node = self.node(ino)?;
            let real = node.real_path();
            let fd = sys::openat(
                self.dirfd(parent_path(&real)),
                file_name(&real),
                libc::O_RDONLY,
                0,
            )
            .map_err(Errno::from)?;
            let result = sys::pread(fd, &mut buf, offset as i64);
            sys::close(fd);
            result.map_err(Errno::from)?
        };
        buf.truncate(n);
        Ok(ReplyData {
            data: Bytes::from(buf),
        })
    }

    async fn write(
        &self,
        _req: Request,
        ino: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        trace!(ino, fh, offset, size = data.len(), "fuse.write");
        if fh == 0 {
            return Err(libc::EBADF.into());
        }
        let n = sys::pwrite(fh as RawFd, data, offset as i64).map_err(Errno::from)?;
        Ok(ReplyWrite { written: n as u32 })
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        trace!(fh, "fuse.release");
        if fh != 0 {
            sys::close(fh as RawFd);
        }
        Ok(())
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        trace!(ino, "fuse.opendir");
        let node = self.node(ino)?;
        if !node.is_dir() {
            return Err(libc::ENOTDIR.into());
        }
        // readdir is stateless; no directory handle needed
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<BoxStream<'a, FuseResult<DirectoryEntry>>>> {
        trace!(ino, fh, offset, "fuse.readdir");
        let node = self.node(ino)?;
        if !node.is_dir() {
            return Err(libc::ENOTDIR.into());
        }

        let parent_ino = node
            .parent()
            .map(|p| self.state.bridge_ino(&p))
            .unwrap_or(crate::mount::ROOT_INO);

        let mut all: Vec<DirectoryEntry> = Vec::new();
        all.push(DirectoryEntry {
            inode: ino,
            kind: FileType::Directory,
            name: OsString::from("."),
            offset: 1,
        });
        all.push(DirectoryEntry {
            inode: parent_ino,
            kind: FileType::Directory,
            name: OsString::from(".."),
            offset: 2,
        });

        // children in lowercased-key order; entries carry their display name
        for (_, child) in node.children_snapshot() {
            if child.is_deleted() {
                continue;
            }
            self.state.inodes.register(&child);
            all.push(DirectoryEntry {
                inode: self.state.bridge_ino(&child),
                kind: kind_to_file_type(child.kind()),
                name: OsString::from(child.name()),
                offset: all.len() as i64 + 1,
            });
        }

        let entries = all.into_iter().skip(offset.max(0) as usize).map(Ok);
        let boxed: BoxStream<'a, FuseResult<DirectoryEntry>> = Box::pin(stream::iter(entries));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        req: Request,
        parent: u64,
        fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<BoxStream<'a, FuseResult<DirectoryEntryPlus>>>> {
        trace!(unique = req.unique, parent, fh, offset, "fuse.readdirplus");
        let node = self.node(parent)?;
        if !node.is_dir() {
            return Err(libc::ENOTDIR.into());
        }

        let parent_node = node.parent().unwrap_or_else(|| self.state.file_tree.clone());
        let self_attr = self.attr_for_node(&node).map_err(Errno::from)?;
        let parent_attr = self.attr_for_node(&parent_node).map_err(Errno::from)?;

        let mut all: Vec<DirectoryEntryPlus> = Vec::new();
        all.push(DirectoryEntryPlus {
            inode: parent,
            generation: 0,
            kind: FileType::Directory,
            name: OsString::from("."),
            offset: 1,
            attr: self_attr,
            entry_ttl: TTL,
            attr_ttl: TTL,
        });
        all.push(DirectoryEntryPlus {
            inode: self.state.bridge_ino(&parent_node),
            generation: 0,
            kind: FileType::Directory,
            name: OsString::from(".."),
            offset: 2,
            attr: parent_attr,
            entry_ttl: TTL,
            attr_ttl: TTL,
        });

        for (_, child) in node.children_snapshot() {
            if child.is_deleted() {
                continue;
            }
            self.state.inodes.register(&child);
            let attr = self.attr_for_node(&child).map_err(Errno::from)?;
            all.push(DirectoryEntryPlus {
                inode: self.state.bridge_ino(&child),
                generation: 0,
                kind: attr.kind,
                name: OsString::from(child.name()),
                offset: all.len() as i64 + 1,
                attr,
                entry_ttl: TTL,
                attr_ttl: TTL,
            });
        }

        let entries = all.into_iter().skip(offset as usize).map(Ok);
        let boxed: BoxStream<'a, FuseResult<DirectoryEntryPlus>> = Box::pin(stream::iter(entries));
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    async fn releasedir(&self, _req: Request, _inode: u64, fh: u64, _flags: u32) -> FuseResult<()> {
        trace!(fh, "fuse.releasedir");
        Ok(())
    }

    async fn mkdir(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        trace!(unique = req.unique, parent, name = %name.to_string_lossy(), mode, "fuse.mkdir");
        let parent_node = self.node(parent)?;
        let name = name.to_string_lossy();
        let (_node, attr) = self
            .do_mkdir(&parent_node, &name, mode as libc::mode_t)
            .map_err(Errno::from)?;
        Ok(ReplyEntry {
            ttl: TTL,
            attr,
            generation: 0,
        })
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        trace!(parent, name = %name.to_string_lossy(), "fuse.unlink");
        let parent_node = self.node(parent)?;
        self.do_unlink(&parent_node, &name.to_string_lossy())
            .map_err(Errno::from)
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        trace!(parent, name = %name.to_string_lossy(), "fuse.rmdir");
        let parent_node = self.node(parent)?;
        self.do_rmdir(&parent_node, &name.to_string_lossy())
            .map_err(Errno::from)
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        trace!(
            parent,
            name = %name.to_string_lossy(),
            new_parent,
            new_name = %new_name.to_string_lossy(),
            "fuse.rename"
        );
        let parent_node = self.node(parent)?;
        let new_parent_node = self.node(new_parent)?;
        self.do_rename(
            &parent_node,
            &name.to_string_lossy(),
            &new_parent_node,
            &new_name.to_string_lossy(),
            0,
        )
        .map_err(Errno::from)
    }

    async fn create(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> FuseResult<ReplyCreated> {
        trace!(unique = req.unique, parent, name = %name.to_string_lossy(), mode, flags, "fuse.create");
        let parent_node = self.node(parent)?;
        let (_node, attr, fd) = self
            .do_create(&parent_node, &name.to_string_lossy(), mode as libc::mode_t, flags as i32)
            .map_err(Errno::from)?;
        Ok(ReplyCreated {
            ttl: TTL,
            attr,
            generation: 0,
            fh: fd as u64,
            flags: 0,
        })
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        let fd = self.dirfd(&self.state.mountpoint);
        let st = sys::fstatvfs(fd).map_err(|e| {
            error!(mountpoint = %self.state.mountpoint, errno = e, "fstatvfs failed");
            Errno::from(e)
        })?;
        Ok(ReplyStatFs {
            blocks: st.f_blocks,
            bfree: st.f_bfree,
            bavail: st.f_bavail,
            files: st.f_files,
            ffree: st.f_ffree,
            bsize: st.f_bsize as u32,
            namelen: st.f_namemax as u32,
            frsize: st.f_frsize as u32,
        })
    }

    async fn readlink(&self, _req: Request, ino: u64) -> FuseResult<ReplyData> {
        trace!(ino, "fuse.readlink");
        let node = self.node(ino)?;
        let real = node.real_path();
        let mut buf = vec![0u8; libc::PATH_MAX as usize];
        let n = if node.is_dir() {
            sys::readlinkat(self.dirfd(&real), "", &mut buf)
        } else {
            sys::readlinkat(self.dirfd(parent_path(&real)), file_name(&real), &mut buf)
        }
        .map_err(Errno::from)?;
        buf.truncate(n);
        Ok(ReplyData {
            data: Bytes::from(buf),
        })
    }

    // ===== deliberately unimplemented operations =====

    async fn symlink(
        &self,
        _req: Request,
        _parent: u64,
        name: &OsStr,
        link: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        warn!(name = %name.to_string_lossy(), link = %link.to_string_lossy(), "fuse.symlink not implemented");
        Err(libc::ENOSYS.into())
    }

    async fn link(
        &self,
        _req: Request,
        _ino: u64,
        _new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        warn!(new_name = %new_name.to_string_lossy(), "fuse.link not implemented");
        Err(libc::ENOSYS.into())
    }

    async fn flush(&self, _req: Request, _inode: u64, fh: u64, _lock_owner: u64) -> FuseResult<()> {
        trace!(fh, "fuse.flush not implemented");
        Err(libc::ENOSYS.into())
    }

    async fn fsync(&self, _req: Request, _inode: u64, fh: u64, _datasync: bool) -> FuseResult<()> {
        trace!(fh, "fuse.fsync not implemented");
        Err(libc::ENOSYS.into())
    }

    async fn fsyncdir(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _datasync: bool,
    ) -> FuseResult<()> {
        trace!(fh, "fuse.fsyncdir not implemented");
        Err(libc::ENOSYS.into())
    }

    // no inode reference tracking; stale inodes stop resolving on their own
    async fn forget(&self, _req: Request, _inode: u64, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[(u64, u64)]) {}

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}
