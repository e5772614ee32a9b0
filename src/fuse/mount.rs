//! Mount helpers for starting/stopping FUSE
//!
//! Notes:
//! - Only supported on Linux; unprivileged mounts go through fusermount3.
//! - Thin wrappers over the rfuse3 Session API.

use std::sync::Arc;

use rfuse3::raw::{MountHandle, Session};
use rfuse3::MountOptions;

use crate::fuse::VirtualFs;
use crate::mount::MountState;

fn default_mount_options(debug: bool) -> MountOptions {
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };

    let mut options = MountOptions::default();
    options
        .fs_name("weavefs")
        .uid(uid)
        .gid(gid)
        .default_permissions(true);
    if debug {
        options.custom_options("debug");
    }
    options
}

/// Attach `state` to its mountpoint using unprivileged mode. The returned
/// handle keeps the session alive; `MountHandle::unmount` detaches it.
#[cfg(target_os = "linux")]
pub async fn mount_state(state: Arc<MountState>, debug: bool) -> std::io::Result<MountHandle> {
    let mountpoint = state.mountpoint.clone();
    let fs = VirtualFs::new(state);
    let session = Session::new(default_mount_options(debug));
    session.mount_with_unprivileged(fs, mountpoint).await
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_state(_state: Arc<MountState>, _debug: bool) -> std::io::Result<MountHandle> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mounts are only supported on Linux in this build",
    ))
}
