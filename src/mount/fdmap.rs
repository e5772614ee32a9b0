//! Directory capability fds, keyed by lowercased real path.
//!
//! Missing keys yield the sentinel `-1` instead of an error so callbacks can
//! branch on "no fd yet" without unwinding. The map owns its fds: each one is
//! closed exactly once, either when it is replaced or when the map drops.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::RwLock;

use tracing::{debug, trace};

use crate::util::{lower, sys};

#[derive(Default)]
pub struct FdMap {
    map: RwLock<HashMap<String, RawFd>>,
}

impl FdMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fd for `path`, or `-1` when none has been recorded.
    pub fn at(&self, path: &str) -> RawFd {
        match self.map.read().unwrap().get(&lower(path)) {
            Some(fd) => *fd,
            None => {
                debug!(path, "no directory fd recorded");
                -1
            }
        }
    }

    /// Record `fd` under the lowercased `path`. A previous fd for the same
    /// path is closed.
    pub fn insert(&self, path: &str, fd: RawFd) {
        trace!(path, fd, "recording directory fd");
        if let Some(old) = self.map.write().unwrap().insert(lower(path), fd) {
            if old != fd {
                sys::close(old);
            }
        }
    }

    /// Move every entry of `other` into this map. `other` is left empty so
    /// ownership of the fds transfers without double-closing.
    pub fn absorb(&self, other: &FdMap) {
        let drained: Vec<(String, RawFd)> = other.map.write().unwrap().drain().collect();
        let mut map = self.map.write().unwrap();
        for (path, fd) in drained {
            if let Some(old) = map.insert(path, fd) {
                if old != fd {
                    sys::close(old);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().unwrap().is_empty()
    }
}

impl Drop for FdMap {
    fn drop(&mut self) {
        for (path, fd) in self.map.get_mut().unwrap().drain() {
            trace!(%path, fd, "closing directory fd");
            sys::close(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::sys::OPEN_FLAGS;

    #[test]
    fn missing_key_yields_sentinel() {
        let map = FdMap::new();
        assert_eq!(map.at("/does/not/exist"), -1);
    }

    #[test]
    fn keys_are_case_folded() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().to_str().unwrap();
        let fd = sys::open(path, OPEN_FLAGS).unwrap();

        let map = FdMap::new();
        map.insert(&path.to_uppercase(), fd);
        assert_eq!(map.at(path), fd);
        assert_eq!(map.at(&path.to_uppercase()), fd);
    }

    #[test]
    fn absorb_transfers_ownership() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().to_str().unwrap();
        let fd = sys::open(path, OPEN_FLAGS).unwrap();

        let source = FdMap::new();
        source.insert(path, fd);
        let target = FdMap::new();
        target.absorb(&source);

        assert!(source.is_empty());
        assert_eq!(target.at(path), fd);
        drop(source);

        // the fd must still be alive: stat through it
        sys::fstatat(fd, "", libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW).unwrap();
    }

    #[test]
    fn every_inserted_fd_is_closed_exactly_once() {
        let tmp = tempfile::tempdir().unwrap();
        let mut fds = Vec::new();
        {
            let map = FdMap::new();
            for name in ["a", "b", "c"] {
                let dir = tmp.path().join(name);
                std::fs::create_dir(&dir).unwrap();
                let path = dir.to_str().unwrap().to_string();
                let fd = sys::open(&path, OPEN_FLAGS).unwrap();
                map.insert(&path, fd);
                fds.push(fd);
            }
            // replacing an entry closes the replaced fd immediately
            let dir = tmp.path().join("a").to_str().unwrap().to_string();
            let replacement = sys::open(&dir, OPEN_FLAGS).unwrap();
            map.insert(&dir, replacement);
            assert_eq!(
                sys::fstatat(fds[0], "", libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW)
                    .unwrap_err(),
                libc::EBADF
            );
            fds[0] = replacement;
        }

        // everything else went down with the map
        for fd in fds {
            assert_eq!(
                sys::fstatat(fd, "", libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW)
                    .unwrap_err(),
                libc::EBADF
            );
        }
    }

    #[test]
    fn drop_closes_every_fd_exactly_once() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().to_str().unwrap();
        let fd = sys::open(path, OPEN_FLAGS).unwrap();

        {
            let map = FdMap::new();
            map.insert(path, fd);
        }

        // closed by the map's drop
        assert_eq!(
            sys::fstatat(fd, "", libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW).unwrap_err(),
            libc::EBADF
        );
    }
}
