//! Abort-with-one-line fatal reporting.
//!
//! The launcher may be installed setuid, which rules out the usual logging
//! stacks in the failure path. `fatal!` formats a single line, writes it to
//! stderr with the EINTR-safe write path and aborts. The formatted buffer
//! stays reachable until the abort so the message is recoverable from a core
//! dump even when stderr was lost.

use std::os::unix::io::RawFd;

const STDERR_FILENO: RawFd = 2;

#[doc(hidden)]
pub fn fatal_impl(file: &str, line: u32, args: std::fmt::Arguments) -> ! {
    let buffer = format!("FATAL {}:{}: {}\n", file, line, args);
    let _ = xar_tools::io::write_full(STDERR_FILENO, buffer.as_bytes());
    std::hint::black_box(&buffer);
    std::process::abort();
}

/// Report a fatal condition and abort. A partially configured mountpoint is
/// worse than a crash; the next invocation re-enters the critical section
/// cleanly.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::fatal::fatal_impl(file!(), line!(), format_args!($($arg)*))
    };
}
