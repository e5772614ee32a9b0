//! FUSE adapter and request handling
//!
//! Responsibilities:
//! - Implement the kernel-bridge callbacks and translate filesystem requests
//!   into virtual-file-tree resolution plus `*at` syscalls through retained
//!   directory fds.
//! - Provide mount helpers for attaching a `MountState` to its mountpoint.
//! - Hand errno codes back to the kernel unchanged.
//!
//! Submodules:
//! - `adapter`: the `rfuse3::raw::Filesystem` implementation over a mount state
//! - `mount`: mount option construction and unprivileged mount helpers

pub mod adapter;
pub mod mount;

pub use adapter::VirtualFs;
pub use mount::mount_state;
