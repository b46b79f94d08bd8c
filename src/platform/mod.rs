//! Capability seam between the mount supervisor and the host OS.

use std::path::Path;

use nix::sys::statfs::Statfs;
use nix::unistd::Gid;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;

#[cfg(target_os = "linux")]
pub use linux::Linux as Native;
#[cfg(target_os = "macos")]
pub use macos::MacOs as Native;

/// What the mount supervisor needs from the host platform.
pub trait Platform {
    /// Whether the calling user is a member of `gid`.
    fn is_user_in_group(&self, gid: Gid) -> bool;

    /// Close every open file descriptor above 2.
    fn close_non_std_fds(&self);

    /// Whether `statfs` output describes a squashfuse mount.
    fn is_squashfs_mounted(&self, statfs: &Statfs) -> bool;

    /// Candidate mount roots, in preference order.
    fn default_mount_roots(&self) -> &'static [&'static str];

    /// Remediation text for when no candidate mount root qualifies.
    fn no_mount_roots_help(&self) -> String;

    /// Unmount command for a dead FUSE mount; the supervisor appends the
    /// mountpoint path as the final argument.
    fn unmount_cmd(&self) -> &'static str;

    /// Whether the FUSE configuration at `fuse_conf_path` lets users other
    /// than the mount owner see the mount.
    fn fuse_allows_visible_mounts(&self, fuse_conf_path: &Path) -> bool;
}

/// The platform this binary was built for.
pub fn native() -> &'static Native {
    &Native
}
