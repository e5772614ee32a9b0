//! Hooked child processes and namespaced mount children.
//!
//! Two kinds of children are spawned here: the hooked target process (fork,
//! optional `setns` into the mount namespace, `chdir`, exec through
//! `/bin/sh -c`) and the namespaced mount server (fork, fresh user+mount
//! namespace with uid/gid maps, FUSE session on a private runtime). Exec
//! failures travel back over a close-on-exec pipe as a single errno so the
//! parent can tell them apart from a successful start.

use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use nix::fcntl::OFlag;
use nix::sched::{setns, unshare, CloneFlags};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, pipe2, ForkResult, Pid};
use tracing::{debug, error, info};

use crate::fuse;
use crate::mount::MountState;

/// How long to wait for an immediate failure report from a namespaced mount
/// child before assuming it came up.
const MOUNT_POLL_TIMEOUT_MS: i32 = 10;

/// A mount served from inside its own user+mount namespace.
pub struct NamespacedMount {
    pub pid: Pid,
    pub pidfd: OwnedFd,
}

pub fn pidfd_open(pid: Pid) -> Result<OwnedFd> {
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
    if fd < 0 {
        bail!(
            "pidfd_open failed for pid {pid}: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

pub fn pidfd_send_signal(pidfd: RawFd, signal: i32) -> Result<()> {
    let res = unsafe { libc::syscall(libc::SYS_pidfd_send_signal, pidfd, signal, 0usize, 0usize) };
    if res < 0 {
        bail!(
            "pidfd_send_signal failed: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

/// Whether `pid` is a live child of this process.
pub fn still_running(pid: Pid) -> bool {
    matches!(
        waitpid(pid, Some(WaitPidFlag::WNOHANG)),
        Ok(WaitStatus::StillAlive)
    )
}

fn setns_into(pidfd: RawFd) -> nix::Result<()> {
    let borrowed = unsafe { std::os::unix::io::BorrowedFd::borrow_raw(pidfd) };
    setns(borrowed, CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS)
}

/// Spawn `<file> <arg>` through `/bin/sh -c`, optionally inside the mount
/// namespace behind `ns_pidfd`. Returns the child pid once the exec is known
/// to have succeeded.
pub fn spawn_hooked(
    file: &str,
    arg: &str,
    work_dir: &str,
    env: Vec<String>,
    ns_pidfd: Option<RawFd>,
) -> Result<Pid> {
    let cmd = format!("'{file}' {arg}");
    debug!(%cmd, work_dir, "spawning hooked process");

    // everything the child needs is allocated before the fork
    let sh = CString::new("/bin/sh").unwrap();
    let argv = [
        CString::new("/bin/sh").unwrap(),
        CString::new("-c").unwrap(),
        CString::new(cmd).context("command contains an interior NUL")?,
    ];
    let envp: Vec<CString> = env
        .into_iter()
        .filter_map(|entry| CString::new(entry).ok())
        .collect();
    let work_dir_c = CString::new(work_dir).context("work dir contains an interior NUL")?;

    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC).context("pipe2 failed")?;

    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Child => {
            // exec or report errno over the pipe; nothing here may touch
            // state shared with the parent
            drop(read_end);
            if let Some(pidfd) = ns_pidfd {
                if setns_into(pidfd).is_err() {
                    let error: i32 = std::io::Error::last_os_error()
                        .raw_os_error()
                        .unwrap_or(libc::EIO);
                    unsafe {
                        libc::write(
                            write_end.as_raw_fd(),
                            &error as *const i32 as *const libc::c_void,
                            std::mem::size_of::<i32>(),
                        );
                        libc::_exit(libc::EXIT_FAILURE);
                    }
                }
            }
            unsafe {
                libc::chdir(work_dir_c.as_ptr());
            }
            let argv_ptrs: Vec<*const libc::c_char> = argv
                .iter()
                .map(|a| a.as_ptr())
                .chain(std::iter::once(std::ptr::null()))
                .collect();
            let envp_ptrs: Vec<*const libc::c_char> = envp
                .iter()
                .map(|e| e.as_ptr())
                .chain(std::iter::once(std::ptr::null()))
                .collect();
            unsafe {
                libc::execve(sh.as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr());
                // exec failed; hand the errno to the parent
                let error: i32 = std::io::Error::last_os_error()
                    .raw_os_error()
                    .unwrap_or(libc::EIO);
                libc::write(
                    write_end.as_raw_fd(),
                    &error as *const i32 as *const libc::c_void,
                    std::mem::size_of::<i32>(),
                );
                libc::_exit(libc::EXIT_FAILURE);
            }
        }
        ForkResult::Parent { child } => {
            drop(write_end);
            let mut pipe = File::from(read_end);
            let mut buf = [0u8; 4];
            let count = pipe.read(&mut buf).unwrap_or(0);
            if count == 0 {
                // pipe closed by the exec: success
                return Ok(child);
            }
            let error = i32::from_ne_bytes(buf);
            error!(file, errno = error, "exec failed in hooked child");
            bail!(
                "exec of '{file}' failed: {}",
                std::io::Error::from_raw_os_error(error)
            );
        }
    }
}

/// Fork a child that serves `state` over FUSE from inside a user+mount
/// namespace. The first child unshares a fresh namespace and writes its own
/// uid/gid maps; later children join the namespace behind `ns_pidfd`. The
/// parent waits up to 10 ms for an immediate failure report; silence counts
/// as success.
pub fn spawn_namespaced_mount(
    state: Arc<MountState>,
    ns_pidfd: Option<RawFd>,
    debug_mode: bool,
) -> Result<NamespacedMount> {
    let uid = nix::unistd::getuid();
    let gid = nix::unistd::getgid();
    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC).context("pipe2 failed")?;

    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Child => {
            drop(read_end);
            let status = namespaced_child(state, ns_pidfd, debug_mode, uid, gid, &write_end);
            let error: i32 = status.err().unwrap_or(0);
            if error != 0 {
                unsafe {
                    libc::write(
                        write_end.as_raw_fd(),
                        &error as *const i32 as *const libc::c_void,
                        std::mem::size_of::<i32>(),
                    );
                }
            }
            unsafe {
                libc::_exit(if error != 0 { libc::EXIT_FAILURE } else { 0 });
            }
        }
        ForkResult::Parent { child } => {
            drop(write_end);

            // catch children that die straight away; anything slower is
            // indistinguishable from success and treated as such
            let mut pfd = libc::pollfd {
                fd: read_end.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let res = unsafe { libc::poll(&mut pfd, 1, MOUNT_POLL_TIMEOUT_MS) };
            if res == 1 {
                let mut pipe = File::from(read_end);
                let mut buf = [0u8; 4];
                if pipe.read(&mut buf).unwrap_or(0) == 4 {
                    let error = i32::from_ne_bytes(buf);
                    if error != 0 {
                        let _ = waitpid(child, None);
                        bail!(
                            "namespaced mount failed for {}: {}",
                            state.mountpoint,
                            std::io::Error::from_raw_os_error(error)
                        );
                    }
                }
            }

            let pidfd = pidfd_open(child)?;
            info!(pid = child.as_raw(), mountpoint = %state.mountpoint, "namespaced mount is up");
            Ok(NamespacedMount { pid: child, pidfd })
        }
    }
}

/// Body of the namespaced mount child. Runs with the parent's address space
/// snapshot; returns an errno on failure so the caller can report it.
fn namespaced_child(
    state: Arc<MountState>,
    ns_pidfd: Option<RawFd>,
    debug_mode: bool,
    uid: nix::unistd::Uid,
    gid: nix::unistd::Gid,
    _write_end: &OwnedFd,
) -> std::result::Result<(), i32> {
    match ns_pidfd {
        Some(pidfd) => {
            setns_into(pidfd).map_err(|e| e as i32)?;
        }
        None => {
            unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS)
                .map_err(|e| e as i32)?;
            // become root inside the new namespace, see user_namespaces(7)
            std::fs::write("/proc/self/uid_map", format!("0 {uid} 1"))
                .map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;
            std::fs::write("/proc/self/setgroups", "deny")
                .map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;
            std::fs::write("/proc/self/gid_map", format!("0 {gid} 1"))
                .map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;
        }
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;

    runtime.block_on(async move {
        let handle = match fuse::mount_state(state, debug_mode).await {
            Ok(handle) => handle,
            Err(e) => return Err(e.raw_os_error().unwrap_or(libc::EIO)),
        };

        // serve until SIGINT, then detach cleanly
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
                .map_err(|e| e.raw_os_error().unwrap_or(libc::EIO))?;
        sigint.recv().await;
        let _ = handle.unmount().await;
        Ok(())
    })
}

/// The parent environment as `KEY=value` entries.
pub fn current_env() -> Vec<String> {
    std::env::vars().map(|(k, v)| format!("{k}={v}")).collect()
}
