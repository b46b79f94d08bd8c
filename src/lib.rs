//! Mount-and-exec core for self-executing XAR archives.
//!
//! A XAR is a squashfs image behind a small textual header (parsed by the
//! `xar-parser` crate). This crate supervises mounting that image via
//! squashfuse at a per-user, per-instance mountpoint and hands off to the
//! bootstrap script inside it.

#[macro_use]
pub mod fatal;

pub mod platform;

pub mod supervisor;
