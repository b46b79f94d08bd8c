use std::ffi::CString;
use std::path::Path;

use nix::sys::statfs::Statfs;
use nix::unistd::{geteuid, Gid, User};

use xar_tools::io::close_no_int;

use super::Platform;

const DATA_MOUNT_ROOT: &str = "/System/Volumes/Data/mnt/xarfuse";
const ROOT_MOUNT_ROOT: &str = "/mnt/xarfuse";

// proc_pidinfo flavor listing the process's open file descriptors.
const PROC_PIDLISTFDS: libc::c_int = 1;
const PROX_FDTYPE_VNODE: u32 = 1;

#[repr(C)]
#[derive(Clone, Copy)]
struct ProcFdInfo {
    proc_fd: i32,
    proc_fdtype: u32,
}

extern "C" {
    fn proc_pidinfo(
        pid: libc::c_int,
        flavor: libc::c_int,
        arg: u64,
        buffer: *mut libc::c_void,
        buffersize: libc::c_int,
    ) -> libc::c_int;
}

pub struct MacOs;

impl Platform for MacOs {
    fn is_user_in_group(&self, gid: Gid) -> bool {
        let user = match User::from_uid(geteuid()) {
            Ok(Some(user)) => user,
            _ => return false,
        };
        let name = match CString::new(user.name.as_str()) {
            Ok(name) => name,
            Err(_) => return false,
        };

        // getgroups(2) is capped on macOS; getgrouplist with a growing
        // buffer sees the full membership.
        let mut capacity: libc::c_int = 16;
        loop {
            let mut groups = vec![0 as libc::c_int; capacity as usize];
            let mut count = capacity;
            let rc = unsafe {
                libc::getgrouplist(
                    name.as_ptr(),
                    user.gid.as_raw() as libc::c_int,
                    groups.as_mut_ptr(),
                    &mut count,
                )
            };
            if rc != -1 {
                groups.truncate(count as usize);
                return groups
                    .into_iter()
                    .any(|group| group as libc::gid_t == gid.as_raw());
            }
            capacity *= 2;
            if capacity > 4096 {
                return false;
            }
        }
    }

    fn close_non_std_fds(&self) {
        let pid = unsafe { libc::getpid() };
        let size = unsafe { proc_pidinfo(pid, PROC_PIDLISTFDS, 0, std::ptr::null_mut(), 0) };
        if size <= 0 {
            return;
        }

        let count = size as usize / std::mem::size_of::<ProcFdInfo>();
        let mut fds = vec![
            ProcFdInfo {
                proc_fd: 0,
                proc_fdtype: 0,
            };
            count
        ];
        let size = unsafe {
            proc_pidinfo(
                pid,
                PROC_PIDLISTFDS,
                0,
                fds.as_mut_ptr() as *mut libc::c_void,
                size,
            )
        };
        if size <= 0 {
            return;
        }

        let filled = size as usize / std::mem::size_of::<ProcFdInfo>();
        for info in &fds[..filled.min(fds.len())] {
            if info.proc_fdtype == PROX_FDTYPE_VNODE && info.proc_fd > 2 {
                let _ = close_no_int(info.proc_fd);
            }
        }
    }

    fn is_squashfs_mounted(&self, statfs: &Statfs) -> bool {
        // The FUSE filesystem type name has changed across macFUSE releases.
        matches!(
            statfs.filesystem_type_name(),
            "osxfuse" | "osxfusefs" | "macfuse"
        )
    }

    fn default_mount_roots(&self) -> &'static [&'static str] {
        &[DATA_MOUNT_ROOT, ROOT_MOUNT_ROOT, "/dev/shm"]
    }

    fn no_mount_roots_help(&self) -> String {
        format!(
            "Unable to find a suitable 01777 mount root. Try: mkdir $DIR && chmod 01777 $DIR \
             with DIR={} on macOS 10.15 Catalina or later, and DIR={} on earlier versions",
            DATA_MOUNT_ROOT, ROOT_MOUNT_ROOT
        )
    }

    fn unmount_cmd(&self) -> &'static str {
        "umount"
    }

    fn fuse_allows_visible_mounts(&self, _fuse_conf_path: &Path) -> bool {
        false
    }
}
