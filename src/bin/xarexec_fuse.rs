//! Launcher for self-executing XAR files.
//!
//! Normally run via the shebang at the top of a XAR: mounts the embedded
//! squashfs if needed, then execs the bootstrap script inside the mount with
//! the XAR path and any user arguments appended.

use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::stat::{umask, Mode};
use nix::unistd::{geteuid, getuid};

use xar::supervisor::{self, Launch, LaunchMode};

fn usage() {
    eprintln!("Usage: xarexec [-m|-n] /path/to/file.xar");
    eprintln!("Options:");
    eprintln!("     -m: mount and print mountpoint, do not execute payload");
    eprintln!("     -n: print the mountpoint but don't mount");
}

fn main() {
    env_logger::init();

    // Let the bootstrapped process see when its launch really started.
    let launch_time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    std::env::set_var(
        "XAREXEC_LAUNCH_TIMESTAMP",
        format!("{:.6}", launch_time.as_secs_f64()),
    );

    // When installed setuid, a real/effective uid mismatch means someone is
    // trying to borrow our privileges. Refuse.
    if getuid() != geteuid() {
        xar::fatal!(
            "refusing to run with real uid {} != effective uid {}",
            getuid(),
            geteuid()
        );
    }

    // Good default for everything we create; the caller's value is restored
    // right before the final exec.
    let saved_umask = umask(Mode::from_bits_truncate(0o022));

    let mut args = std::env::args().skip(1).peekable();
    let mut mount_only = false;
    let mut print_only = false;
    while let Some(arg) = args.peek() {
        if !arg.starts_with('-') {
            break;
        }
        match arg.as_str() {
            "-m" => mount_only = true,
            "-n" => print_only = true,
            "-h" => {
                usage();
                std::process::exit(0);
            }
            _ => {
                usage();
                std::process::exit(1);
            }
        }
        args.next();
    }
    let xar_path = match args.next() {
        Some(path) => path,
        None => {
            usage();
            std::process::exit(1);
        }
    };
    let user_args: Vec<String> = args.collect();

    let header = match xar_parser::parse_xar_header(&xar_path) {
        Ok(header) => header,
        Err(err) => xar::fatal!("Error parsing XAR header of {}: {}", xar_path, err),
    };

    if !mount_only && !print_only && header.xarexec_target.is_empty() {
        xar::fatal!("No XAREXEC_TARGET in XAR header of {}", xar_path);
    }
    if header.uuid.is_empty() {
        xar::fatal!("uuid must be non-empty");
    }
    if !header.uuid.chars().all(|c| c.is_ascii_hexdigit()) {
        xar::fatal!("uuid must only contain hex digits");
    }

    let mode = if print_only {
        LaunchMode::PrintOnly
    } else if mount_only {
        LaunchMode::MountOnly
    } else {
        LaunchMode::Exec
    };

    supervisor::run(Launch {
        header: &header,
        xar_path: &xar_path,
        mode,
        args: &user_args,
        saved_umask,
    });
}
