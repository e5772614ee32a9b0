//! Thin safe wrappers over the `*at` syscall family.
//!
//! Every mutating operation under a mountpoint goes through a stable
//! directory file descriptor plus a last-component name, which keeps the
//! callbacks immune to path races below the mountpoint. Errors carry the raw
//! `errno` so callers can hand them straight back to the kernel bridge.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;

use libc::{c_int, c_uint, gid_t, mode_t, uid_t};

/// Flags used for directory capability fds held in an `FdMap`.
pub const OPEN_FLAGS: c_int = libc::O_PATH | libc::O_DIRECTORY | libc::O_NOFOLLOW;

pub type SysResult<T> = Result<T, i32>;

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

fn cstr(s: &str) -> SysResult<CString> {
    CString::new(s).map_err(|_| libc::EINVAL)
}

pub fn open(path: &str, flags: c_int) -> SysResult<RawFd> {
    let path = cstr(path)?;
    let fd = unsafe { libc::open(path.as_ptr(), flags) };
    if fd < 0 {
        return Err(last_errno());
    }
    Ok(fd)
}

pub fn openat(dirfd: RawFd, name: &str, flags: c_int, mode: mode_t) -> SysResult<RawFd> {
    let name = cstr(name)?;
    let fd = unsafe { libc::openat(dirfd, name.as_ptr(), flags, mode as c_uint) };
    if fd < 0 {
        return Err(last_errno());
    }
    Ok(fd)
}

pub fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

pub fn mkdirat(dirfd: RawFd, name: &str, mode: mode_t) -> SysResult<()> {
    let name = cstr(name)?;
    if unsafe { libc::mkdirat(dirfd, name.as_ptr(), mode) } < 0 {
        return Err(last_errno());
    }
    Ok(())
}

pub fn unlinkat(dirfd: RawFd, name: &str, flags: c_int) -> SysResult<()> {
    let name = cstr(name)?;
    if unsafe { libc::unlinkat(dirfd, name.as_ptr(), flags) } < 0 {
        return Err(last_errno());
    }
    Ok(())
}

/// `fstatat` with an explicit flag set; an empty `name` requires
/// `AT_EMPTY_PATH` and stats the fd itself.
pub fn fstatat(dirfd: RawFd, name: &str, flags: c_int) -> SysResult<libc::stat> {
    let name = cstr(name)?;
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
    if unsafe { libc::fstatat(dirfd, name.as_ptr(), st.as_mut_ptr(), flags) } < 0 {
        return Err(last_errno());
    }
    Ok(unsafe { st.assume_init() })
}

pub fn fstat(fd: RawFd) -> SysResult<libc::stat> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
    if unsafe { libc::fstat(fd, st.as_mut_ptr()) } < 0 {
        return Err(last_errno());
    }
    Ok(unsafe { st.assume_init() })
}

pub fn renameat2(
    old_dirfd: RawFd,
    old_name: &str,
    new_dirfd: RawFd,
    new_name: &str,
    flags: c_uint,
) -> SysResult<()> {
    let old_name = cstr(old_name)?;
    let new_name = cstr(new_name)?;
    let res = unsafe {
        libc::renameat2(
            old_dirfd,
            old_name.as_ptr(),
            new_dirfd,
            new_name.as_ptr(),
            flags,
        )
    };
    if res < 0 {
        return Err(last_errno());
    }
    Ok(())
}

pub fn fchmod(fd: RawFd, mode: mode_t) -> SysResult<()> {
    if unsafe { libc::fchmod(fd, mode) } < 0 {
        return Err(last_errno());
    }
    Ok(())
}

pub fn fchmodat(dirfd: RawFd, name: &str, mode: mode_t) -> SysResult<()> {
    let name = cstr(name)?;
    if unsafe { libc::fchmodat(dirfd, name.as_ptr(), mode, 0) } < 0 {
        return Err(last_errno());
    }
    Ok(())
}

pub fn fchown(fd: RawFd, uid: uid_t, gid: gid_t) -> SysResult<()> {
    if unsafe { libc::fchown(fd, uid, gid) } < 0 {
        return Err(last_errno());
    }
    Ok(())
}

pub fn fchownat(dirfd: RawFd, name: &str, uid: uid_t, gid: gid_t) -> SysResult<()> {
    let name = cstr(name)?;
    if unsafe { libc::fchownat(dirfd, name.as_ptr(), uid, gid, 0) } < 0 {
        return Err(last_errno());
    }
    Ok(())
}

pub fn ftruncate(fd: RawFd, size: i64) -> SysResult<()> {
    if unsafe { libc::ftruncate(fd, size) } < 0 {
        return Err(last_errno());
    }
    Ok(())
}

pub fn readlinkat(dirfd: RawFd, name: &str, buf: &mut [u8]) -> SysResult<usize> {
    let name = cstr(name)?;
    let res = unsafe {
        libc::readlinkat(
            dirfd,
            name.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    };
    if res < 0 {
        return Err(last_errno());
    }
    Ok(res as usize)
}

pub fn fstatvfs(fd: RawFd) -> SysResult<libc::statvfs> {
    let mut st = std::mem::MaybeUninit::<libc::statvfs>::uninit();
    if unsafe { libc::fstatvfs(fd, st.as_mut_ptr()) } < 0 {
        return Err(last_errno());
    }
    Ok(unsafe { st.assume_init() })
}

pub fn pread(fd: RawFd, buf: &mut [u8], offset: i64) -> SysResult<usize> {
    let res = unsafe { libc::pread(fd, buf.as_mut_ptr().cast(), buf.len(), offset) };
    if res < 0 {
        return Err(last_errno());
    }
    Ok(res as usize)
}

pub fn pwrite(fd: RawFd, buf: &[u8], offset: i64) -> SysResult<usize> {
    let res = unsafe { libc::pwrite(fd, buf.as_ptr().cast(), buf.len(), offset) };
    if res < 0 {
        return Err(last_errno());
    }
    Ok(res as usize)
}
