use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use nix::dir::Dir;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::sys::statfs::{FsType, Statfs};
use nix::unistd::{getgroups, Gid};

use xar_tools::io::close_no_int;

use super::Platform;

// statfs(2) reports FUSE filesystems with this f_type; squashfuse mounts
// have no type of their own.
const FUSE_SUPER_MAGIC: libc::__fsword_t = 0x65735546;

const DEFAULT_MOUNT_ROOT: &str = "/mnt/xarfuse";

pub struct Linux;

impl Platform for Linux {
    fn is_user_in_group(&self, gid: Gid) -> bool {
        let groups = match getgroups() {
            Ok(groups) => groups,
            Err(err) => fatal!("getgroups failed: {}", err),
        };
        groups.contains(&gid)
    }

    fn close_non_std_fds(&self) {
        let mut dir = match Dir::open(
            "/proc/self/fd",
            OFlag::O_RDONLY | OFlag::O_DIRECTORY,
            Mode::empty(),
        ) {
            Ok(dir) => dir,
            Err(_) => return,
        };
        let dir_fd = dir.as_raw_fd();

        // Collect first: closing descriptors while the readdir loop still
        // needs them invalidates the iteration.
        let mut fds: Vec<RawFd> = Vec::new();
        for entry in dir.iter().flatten() {
            if let Ok(name) = entry.file_name().to_str() {
                if let Ok(fd) = name.parse::<RawFd>() {
                    if fd > 2 && fd != dir_fd {
                        fds.push(fd);
                    }
                }
            }
        }
        drop(dir);

        for fd in fds {
            let _ = close_no_int(fd);
        }
    }

    fn is_squashfs_mounted(&self, statfs: &Statfs) -> bool {
        statfs.filesystem_type() == FsType(FUSE_SUPER_MAGIC)
    }

    fn default_mount_roots(&self) -> &'static [&'static str] {
        &[DEFAULT_MOUNT_ROOT, "/dev/shm"]
    }

    fn no_mount_roots_help(&self) -> String {
        format!(
            "Unable to find a suitable 01777 mount root. Try: mkdir {} && chmod 01777 {}",
            DEFAULT_MOUNT_ROOT, DEFAULT_MOUNT_ROOT
        )
    }

    fn unmount_cmd(&self) -> &'static str {
        "/bin/fusermount -z -q -u"
    }

    fn fuse_allows_visible_mounts(&self, fuse_conf_path: &Path) -> bool {
        let file = match File::open(fuse_conf_path) {
            Ok(file) => file,
            Err(_) => return false,
        };
        BufReader::new(file)
            .lines()
            .flatten()
            .any(|line| line == "user_allow_other")
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_fuse_allows_visible_mounts() {
        let mut conf = tempfile::NamedTempFile::new().unwrap();
        writeln!(conf, "# mount_max = 1000").unwrap();
        writeln!(conf, "user_allow_other").unwrap();
        conf.flush().unwrap();
        assert!(Linux.fuse_allows_visible_mounts(conf.path()));
    }

    #[test]
    fn test_fuse_conf_commented_out_or_mangled() {
        let mut conf = tempfile::NamedTempFile::new().unwrap();
        writeln!(conf, "#user_allow_other").unwrap();
        writeln!(conf, "user_allow_other  ").unwrap();
        conf.flush().unwrap();
        assert!(!Linux.fuse_allows_visible_mounts(conf.path()));
    }

    #[test]
    fn test_fuse_conf_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!Linux.fuse_allows_visible_mounts(&dir.path().join("fuse.conf")));
    }

    #[test]
    fn test_current_egid_is_in_groups() {
        // getgroups() always reports the process's supplementary groups;
        // egid membership goes through the same check the sanity pass uses.
        let egid = nix::unistd::getegid();
        let in_group = Linux.is_user_in_group(egid);
        let supplementary = getgroups().unwrap();
        assert_eq!(in_group, supplementary.contains(&egid));
    }
}
