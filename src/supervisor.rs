//! Mount supervisor: idempotently mounts a XAR's squashfs payload and hands
//! off to the bootstrap script inside it.
//!
//! Concurrency model: everything between taking the exclusive lockfile lock
//! and the final exec (or exit) is a critical section, serialized across all
//! launches sharing the same mount directory. The kernel drops the lock on
//! exec/exit; the lockfile itself is never removed here, its mtime is the
//! liveness signal external reapers honor.

use std::ffi::CString;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, format_err, Error};
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg, OFlag};
use nix::sys::stat::{stat, umask, Mode};
use nix::sys::statfs::statfs;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chown, execv, execvp, fork, getegid, geteuid, mkdir, ForkResult, Gid};

use xar_parser::XarHeader;
use xar_tools::command::run_command;
use xar_tools::fd::Fd;
use xar_tools::io::{close_no_int, open_no_int};

use crate::platform::{self, Platform};

const SQUASHFUSE_EXECUTABLE: &str = "squashfuse_ll";

// 14.5 minutes; the stale-mount janitor reaps at 15.
const SQUASHFUSE_DEFAULT_TIMEOUT: u64 = 870;
const TIMEOUT_OVERRIDE_FILE: &str = "/var/lib/xarexec_timeout_override";

const MOUNT_READINESS_DEADLINE: Duration = Duration::from_secs(9);
const MOUNT_READINESS_POLL: Duration = Duration::from_micros(100);

/// What to do once the mount is live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaunchMode {
    /// Mount if needed, then exec the bootstrap script.
    Exec,
    /// Mount if needed, print the mountpoint, exit.
    MountOnly,
    /// Print the mountpoint without mounting, exit.
    PrintOnly,
}

/// One launch request, assembled by the launcher binary.
pub struct Launch<'a> {
    pub header: &'a XarHeader,
    pub xar_path: &'a str,
    pub mode: LaunchMode,
    /// Arguments forwarded to the bootstrap script.
    pub args: &'a [String],
    /// The caller's umask, restored immediately before exec.
    pub saved_umask: Mode,
}

// For check_file_sanity: do we expect a file, or a directory?
#[derive(Clone, Copy, PartialEq, Eq)]
enum Expectation {
    Directory,
    File,
}

// Make sure a path we are about to trust matches the expected type, owner
// and permissions.
fn check_file_sanity(
    platform: &dyn Platform,
    path: &str,
    expected: Expectation,
    perms: libc::mode_t,
) -> Result<(), Error> {
    let st = stat(path).map_err(|err| format_err!("stat failed for {}: {}", path, err))?;

    if st.st_uid != geteuid().as_raw() {
        bail!("Invalid owner of {}", path);
    }
    // The group must be our egid or one of our supplementary groups.
    if st.st_gid != getegid().as_raw() && !platform.is_user_in_group(Gid::from_raw(st.st_gid)) {
        bail!("Invalid group of {}", path);
    }

    let is_dir = st.st_mode & libc::S_IFMT == libc::S_IFDIR;
    let is_reg = st.st_mode & libc::S_IFMT == libc::S_IFREG;
    if expected == Expectation::Directory && !is_dir {
        bail!("Should be a directory: {}", path);
    }
    if expected == Expectation::File && !is_reg {
        bail!("Should be a normal file: {}", path);
    }

    if st.st_mode & 0o7777 != perms {
        bail!(
            "Invalid permissions on {}, expected {:o}, got {:o}",
            path,
            perms,
            st.st_mode & 0o7777
        );
    }
    Ok(())
}

// First candidate root that exists with sticky world-writable permissions.
fn select_mount_root(platform: &dyn Platform) -> Option<String> {
    platform
        .default_mount_roots()
        .iter()
        .find(|root| match stat(**root) {
            Ok(st) => st.st_mode & 0o7777 == 0o1777,
            Err(_) => false,
        })
        .map(|root| root.to_string())
}

// Per-user directory below the mount root, created on demand.
fn user_basedir(platform: &dyn Platform, mount_root: &str) -> Result<String, Error> {
    let dir = format!("{}/uid-{}", mount_root, geteuid());

    // Best effort; the sanity check below catches real problems.
    let _ = mkdir(dir.as_str(), Mode::from_bits_truncate(0o755));

    if cfg!(target_os = "macos") {
        // mkdir inherits the enclosing directory's group on macOS, which is
        // not necessarily one of ours.
        let _ = chown(dir.as_str(), Some(geteuid()), Some(getegid()));
    }

    check_file_sanity(platform, &dir, Expectation::Directory, 0o755)?;
    Ok(dir)
}

fn inode_of(path: &str) -> Option<u64> {
    stat(path).ok().map(|st| st.st_ino)
}

// Inode of the cgroup this process runs in, resolved from a cgroup(7)
// listing (hierarchy:controllers:path) against the given filesystem roots.
fn cgroup_inode(cgroup_file: &str, roots: &[&str]) -> Option<u64> {
    let file = File::open(cgroup_file).ok()?;
    for line in BufReader::new(file).lines().flatten() {
        let mut fields = line.splitn(3, ':');
        let path = match (fields.next(), fields.next(), fields.next()) {
            (Some(_), Some(_), Some(path)) => path,
            _ => continue,
        };
        for root in roots {
            if let Some(inode) = inode_of(&format!("{}{}", root, path)) {
                return Some(inode);
            }
        }
    }
    None
}

// Shared mtab environments need more than uuid and uid to tell concurrent
// mounts apart. A user-provided seed wins; otherwise the pid namespace
// (plus cgroup, since cgroup termination can kill a shared squashfuse
// without a namespace change) stands in. The kernel recycles namespace ids
// aggressively, so the mount namespace id is appended independently.
fn compose_mount_directory(
    uuid: &str,
    seed: Option<&str>,
    nspid_inode: Option<u64>,
    cgroup_inode: Option<u64>,
    nsmnt_inode: Option<u64>,
) -> String {
    let mut name = uuid.to_string();
    if let Some(seed) = seed {
        name.push_str("-seed-");
        name.push_str(seed);
    } else if let Some(inode) = nspid_inode {
        name.push_str(&format!("-seed-nspid{}", inode));
        if let Some(inode) = cgroup_inode {
            name.push_str(&format!("_cgpid{}", inode));
        }
    }
    if let Some(inode) = nsmnt_inode {
        name.push_str(&format!("-ns-{}", inode));
    }
    name
}

/// Name of the mount directory for this XAR in this execution context.
pub fn mount_directory_name(uuid: &str) -> String {
    let seed = std::env::var("XAR_MOUNT_SEED")
        .ok()
        .filter(|seed| !seed.is_empty() && !seed.contains('/'));
    compose_mount_directory(
        uuid,
        seed.as_deref(),
        inode_of("/proc/self/ns/pid"),
        cgroup_inode("/proc/self/cgroup", &["/sys/fs/cgroup", "/cgroup2"]),
        inode_of("/proc/self/ns/mnt"),
    )
}

// Leading-digits parse in the strtoul tradition: garbage parses as zero.
fn parse_leading_u64(value: &str) -> u64 {
    let value = value.trim_start();
    let end = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    value[..end].parse().unwrap_or(0)
}

fn timeout_from(env_timeout: Option<&str>, override_path: &Path) -> u64 {
    if let Some(value) = env_timeout {
        return parse_leading_u64(value);
    }
    if let Ok(body) = std::fs::read_to_string(override_path) {
        if let Some(timeout) = body.split_whitespace().next().and_then(|t| t.parse().ok()) {
            return timeout;
        }
    }
    SQUASHFUSE_DEFAULT_TIMEOUT
}

/// Idle timeout passed to squashfuse_ll, in seconds; zero disables it.
pub fn squashfuse_timeout() -> u64 {
    let env_timeout = std::env::var("XAR_MOUNT_TIMEOUT").ok();
    timeout_from(env_timeout.as_deref(), Path::new(TIMEOUT_OVERRIDE_FILE))
}

// Open or create the lockfile and block until the exclusive lock is ours.
// No timeout; the user can interrupt.
fn grab_lock(platform: &dyn Platform, lockfile: &str) -> Result<Fd, Error> {
    let fd = open_no_int(
        lockfile,
        OFlag::O_RDWR | OFlag::O_CREAT | OFlag::O_CLOEXEC,
        Mode::from_bits_truncate(0o600),
    )
    .map_err(|err| format_err!("can't open lockfile {}: {}", lockfile, err))?;
    let fd = Fd::new(fd);

    check_file_sanity(platform, lockfile, Expectation::File, 0o600)?;

    flock(fd.as_raw_fd(), FlockArg::LockExclusive)
        .map_err(|err| format_err!("can't flock lockfile {}: {}", lockfile, err))?;
    Ok(fd)
}

fn force_unmount(platform: &dyn Platform, path: &str) -> Result<(), Error> {
    let mut parts = platform.unmount_cmd().split(' ');
    let program = match parts.next() {
        Some(program) => program,
        None => bail!("empty unmount command"),
    };
    let mut command = std::process::Command::new(program);
    command.args(parts).arg(path);
    run_command(command)?;
    Ok(())
}

/// Probe whether `path` currently holds a live squashfuse mount.
///
/// With `try_fix`, a transport-dead mount (`ENOTCONN`/`ECONNABORTED`) is
/// lazily unmounted and reported as absent so the caller mounts fresh.
pub fn is_squashfuse_mounted(platform: &dyn Platform, path: &str, try_fix: bool) -> bool {
    match statfs(path) {
        Ok(buf) => platform.is_squashfs_mounted(&buf),
        Err(errno) => {
            if !try_fix {
                return false;
            }
            if errno == Errno::ENOTCONN || errno == Errno::ECONNABORTED {
                log::warn!("mountpoint {} is dead ({}), unmounting", path, errno);
                if let Err(err) = force_unmount(platform, path) {
                    fatal!(
                        "unable to unmount broken mount, try '{} {}' by hand: {}",
                        platform.unmount_cmd(),
                        path,
                        err
                    );
                }
                return false;
            }
            fatal!("statfs failed for {}: {}", path, errno);
        }
    }
}

fn cstring(value: &str) -> CString {
    match CString::new(value) {
        Ok(cstring) => cstring,
        Err(_) => fatal!("embedded NUL in argument: {:?}", value),
    }
}

// In the squashfuse child: drop inherited descriptors and make sure the
// standard three exist before exec.
fn sanitize_file_descriptors(platform: &dyn Platform) {
    platform.close_non_std_fds();

    // open(2) returns the lowest free descriptor, so filling 0 through 2
    // with /dev/null is a matter of opening until we get one above 2.
    let in_fd = match open_no_int("/dev/null", OFlag::O_RDONLY, Mode::empty()) {
        Ok(fd) => fd,
        Err(err) => fatal!("can't open /dev/null for reading: {}", err),
    };
    if in_fd > 0 {
        let _ = close_no_int(in_fd);
    }
    loop {
        let out_fd = match open_no_int("/dev/null", OFlag::O_WRONLY, Mode::empty()) {
            Ok(fd) => fd,
            Err(err) => fatal!("can't open /dev/null for writing: {}", err),
        };
        if out_fd > 2 {
            let _ = close_no_int(out_fd);
            break;
        }
    }
}

// Fork and exec squashfuse_ll, waiting for it to daemonize. The child owns
// the kernel mount from here on.
fn mount_squashfuse(
    platform: &dyn Platform,
    xar_path: &str,
    mount_path: &str,
    offset: u64,
    idle_timeout: u64,
) {
    match unsafe { fork() } {
        Err(err) => fatal!("fork failed: {}", err),
        Ok(ForkResult::Child) => {
            sanitize_file_descriptors(platform);

            let mut opts = format!("-ooffset={}", offset);
            if idle_timeout > 0 {
                opts.push_str(&format!(",timeout={}", idle_timeout));
            }
            if platform.fuse_allows_visible_mounts(Path::new("/etc/fuse.conf")) {
                opts.push_str(",allow_root");
            }

            let argv = [
                cstring(SQUASHFUSE_EXECUTABLE),
                cstring(&opts),
                cstring(xar_path),
                cstring(mount_path),
            ];
            let err = match execvp(&argv[0], &argv) {
                Err(err) => err,
                Ok(infallible) => match infallible {},
            };
            fatal!(
                "Failed to exec {}: {}. Try installing squashfuse from \
                 https://github.com/vasi/squashfuse/releases.",
                SQUASHFUSE_EXECUTABLE,
                err
            );
        }
        Ok(ForkResult::Parent { child }) => match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, 0)) => {}
            Ok(WaitStatus::Exited(_, code)) => {
                fatal!("{} failed with exit status {}", SQUASHFUSE_EXECUTABLE, code)
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                fatal!("{} failed with signal {}", SQUASHFUSE_EXECUTABLE, signal)
            }
            Ok(status) => fatal!(
                "{} failed with unexpected wait status {:?}",
                SQUASHFUSE_EXECUTABLE,
                status
            ),
            Err(err) => fatal!("waitpid failed: {}", err),
        },
    }
}

/// Mount the XAR if necessary and finish according to the launch mode.
/// Either execs the bootstrap script, prints the mountpoint and exits, or
/// aborts with a fatal diagnostic.
pub fn run(launch: Launch) -> ! {
    let platform = platform::native();
    let header = launch.header;

    let mount_root = match &header.mount_root {
        Some(root) => root.clone(),
        None => match select_mount_root(platform) {
            Some(root) => root,
            None => fatal!("{}", platform.no_mount_roots_help()),
        },
    };

    // The root must hold 01777 at use time no matter where it came from.
    match stat(mount_root.as_str()) {
        Ok(st) if st.st_mode & 0o7777 == 0o1777 => {}
        Ok(st) => fatal!(
            "Mount root '{}' permissions should be 01777, got {:o}",
            mount_root,
            st.st_mode & 0o7777
        ),
        Err(err) => fatal!("Failed to stat mount root '{}': {}", mount_root, err),
    }

    let user_basedir = match user_basedir(platform, &mount_root) {
        Ok(dir) => dir,
        Err(err) => fatal!("bad user base directory: {}", err),
    };

    let mount_directory = mount_directory_name(&header.uuid);
    let mount_path = format!("{}/{}", user_basedir, mount_directory);

    if launch.mode == LaunchMode::PrintOnly {
        println!("{}", mount_path);
        std::process::exit(0);
    }

    let lockfile = format!("{}/lockfile.{}", user_basedir, mount_directory);
    let lock_fd = match grab_lock(platform, &lockfile) {
        Ok(fd) => fd,
        Err(err) => fatal!("{}", err),
    };

    match mkdir(mount_path.as_str(), Mode::from_bits_truncate(0o755)) {
        Ok(()) => {
            if cfg!(target_os = "macos") {
                // Same group inheritance problem as the user base directory.
                if let Err(err) = chown(mount_path.as_str(), Some(geteuid()), Some(getegid())) {
                    fatal!("chown failed for {}: {}", mount_path, err);
                }
            }
        }
        Err(Errno::EEXIST) => {}
        Err(err) => fatal!("mkdir failed for {}: {}", mount_path, err),
    }

    let exec_path = format!("{}/{}", mount_path, header.xarexec_target);

    // Pin a file inside the mount open as early as possible, and without
    // close-on-exec: the final exec targets a shell script inside the XAR,
    // and between the kernel parsing the shebang and the interpreter
    // re-opening the script the idle unmount could win. The pin keeps the
    // mount busy through that window. On a fresh mount the path does not
    // exist yet, so failure is fine here.
    let mut bootstrap_fd = open_no_int(exec_path.as_str(), OFlag::O_RDONLY, Mode::empty())
        .ok()
        .map(Fd::new);

    let mut new_mount = false;
    if !is_squashfuse_mounted(platform, &mount_path, true) {
        // Whatever we pinned referenced a dead tree.
        bootstrap_fd = None;

        // Permissions may legitimately differ once mounted, so the check
        // only makes sense while we still own the empty directory.
        if let Err(err) = check_file_sanity(platform, &mount_path, Expectation::Directory, 0o755) {
            fatal!("bad mountpoint: {}", err);
        }

        mount_squashfuse(
            platform,
            launch.xar_path,
            &mount_path,
            header.offset,
            squashfuse_timeout(),
        );
        new_mount = true;
    }

    let start = Instant::now();
    while !is_squashfuse_mounted(platform, &mount_path, false) {
        if start.elapsed() > MOUNT_READINESS_DEADLINE {
            fatal!("timed out waiting for squashfs mount at {}", mount_path);
        }
        std::thread::sleep(MOUNT_READINESS_POLL);
    }

    // Bump the lockfile mtime; reapers treat it as proof of recent use.
    if unsafe { libc::futimes(lock_fd.as_raw_fd(), std::ptr::null()) } != 0 {
        fatal!("futimes failed on lockfile {}: {}", lockfile, Errno::last());
    }

    if launch.mode == LaunchMode::MountOnly {
        println!("{}", mount_path);
        std::process::exit(0);
    }

    let bootstrap_fd = match bootstrap_fd {
        Some(fd) => fd,
        None => match open_no_int(exec_path.as_str(), OFlag::O_RDONLY, Mode::empty()) {
            Ok(fd) => Fd::new(fd),
            Err(err) => fatal!("Unable to open {}: {}", exec_path, err),
        },
    };
    // Deliberately leaked: the pin must survive the exec below.
    let _pinned: RawFd = bootstrap_fd.into_raw_fd();

    let mut argv = vec![
        cstring("/bin/sh"),
        cstring("-e"),
        cstring(&exec_path),
        cstring(launch.xar_path),
    ];
    for arg in launch.args {
        argv.push(cstring(arg));
    }
    for arg in &argv {
        log::debug!("exec arg: {:?}", arg);
    }

    if new_mount {
        std::env::set_var("XARFUSE_NEW_MOUNT", "1");
    }
    umask(launch.saved_umask);

    let err = match execv(&argv[0], &argv) {
        Err(err) => err,
        Ok(infallible) => match infallible {},
    };
    fatal!("execv failed: {} (cmd /bin/sh)", err);
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn test_compose_mount_directory_seed_wins() {
        let name = compose_mount_directory("d770950c", Some("jobid9"), Some(11), Some(22), Some(33));
        assert_eq!(name, "d770950c-seed-jobid9-ns-33");
    }

    #[test]
    fn test_compose_mount_directory_nspid_and_cgroup() {
        let name = compose_mount_directory("d770950c", None, Some(11), Some(22), Some(33));
        assert_eq!(name, "d770950c-seed-nspid11_cgpid22-ns-33");
    }

    #[test]
    fn test_compose_mount_directory_no_cgroup_without_nspid() {
        let name = compose_mount_directory("d770950c", None, None, Some(22), Some(33));
        assert_eq!(name, "d770950c-ns-33");
    }

    #[test]
    fn test_compose_mount_directory_bare() {
        assert_eq!(
            compose_mount_directory("d770950c", None, None, None, None),
            "d770950c"
        );
    }

    #[test]
    fn test_parse_leading_u64() {
        assert_eq!(parse_leading_u64(""), 0);
        assert_eq!(parse_leading_u64("120"), 120);
        assert_eq!(parse_leading_u64("15abc"), 15);
        assert_eq!(parse_leading_u64("abc"), 0);
        assert_eq!(parse_leading_u64("  42"), 42);
    }

    #[test]
    fn test_timeout_env_beats_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"300\n").unwrap();

        assert_eq!(timeout_from(Some("120"), file.path()), 120);
        assert_eq!(timeout_from(Some(""), file.path()), 0);
        assert_eq!(timeout_from(None, file.path()), 300);
    }

    #[test]
    fn test_timeout_fallbacks() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("override");
        assert_eq!(timeout_from(None, &missing), SQUASHFUSE_DEFAULT_TIMEOUT);

        let mut garbage = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut garbage, b"not a number\n").unwrap();
        assert_eq!(
            timeout_from(None, garbage.path()),
            SQUASHFUSE_DEFAULT_TIMEOUT
        );
    }

    #[test]
    fn test_cgroup_inode_resolution() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("job42")).unwrap();
        let expected = stat(&root.path().join("job42")).unwrap().st_ino;

        let mut listing = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut listing, b"malformed line\n0::/job42\n").unwrap();

        let root_str = root.path().to_str().unwrap();
        let inode = cgroup_inode(listing.path().to_str().unwrap(), &[root_str]);
        assert_eq!(inode, Some(expected));
    }

    #[test]
    fn test_cgroup_inode_no_match() {
        let root = tempfile::tempdir().unwrap();
        let mut listing = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut listing, b"0::/does-not-exist\n").unwrap();

        let root_str = root.path().to_str().unwrap();
        assert_eq!(cgroup_inode(listing.path().to_str().unwrap(), &[root_str]), None);
        assert_eq!(cgroup_inode("/definitely/not/a/file", &[root_str]), None);
    }

    #[test]
    fn test_check_file_sanity_accepts_own_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        let path = dir.path().to_str().unwrap();
        check_file_sanity(platform::native(), path, Expectation::Directory, 0o755).unwrap();
    }

    #[test]
    fn test_check_file_sanity_rejects_wrong_mode() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700)).unwrap();
        let path = dir.path().to_str().unwrap();
        let err = check_file_sanity(platform::native(), path, Expectation::Directory, 0o755)
            .unwrap_err()
            .to_string();
        assert!(err.contains("Invalid permissions"), "{}", err);
    }

    #[test]
    fn test_check_file_sanity_rejects_wrong_type() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600)).unwrap();
        let path = file.path().to_str().unwrap();
        let err = check_file_sanity(platform::native(), path, Expectation::Directory, 0o600)
            .unwrap_err()
            .to_string();
        assert!(err.contains("Should be a directory"), "{}", err);

        check_file_sanity(platform::native(), path, Expectation::File, 0o600).unwrap();
    }

    #[test]
    fn test_check_file_sanity_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone");
        let err = check_file_sanity(
            platform::native(),
            missing.to_str().unwrap(),
            Expectation::File,
            0o600,
        )
        .unwrap_err()
        .to_string();
        assert!(err.contains("stat failed"), "{}", err);
    }

    #[test]
    fn test_grab_lock_creates_and_locks() {
        let dir = tempfile::tempdir().unwrap();
        let lockfile = dir.path().join("lockfile.test");
        let lockfile = lockfile.to_str().unwrap();

        let fd = grab_lock(platform::native(), lockfile).unwrap();

        // A second non-blocking attempt on an independent open must fail
        // while the first lock is held.
        let other = open_no_int(lockfile, OFlag::O_RDWR, Mode::empty()).map(Fd::new).unwrap();
        assert!(flock(other.as_raw_fd(), FlockArg::LockExclusiveNonblock).is_err());

        drop(fd);
        assert!(flock(other.as_raw_fd(), FlockArg::LockExclusiveNonblock).is_ok());
    }

    #[test]
    fn test_is_squashfuse_mounted_plain_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_squashfuse_mounted(
            platform::native(),
            dir.path().to_str().unwrap(),
            false
        ));
    }
}
