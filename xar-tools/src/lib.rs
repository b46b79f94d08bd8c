//! Low level I/O, fd and process helpers shared by the xar crates.

pub mod command;
pub mod fd;
pub mod io;
