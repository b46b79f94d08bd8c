//! Parser for the textual header at the front of a XAR file.
//!
//! A XAR starts with a shebang line, followed by `NAME="VALUE"` parameter
//! lines up to a `#xar_stop` marker; the squashfs image begins at the byte
//! offset declared by the `OFFSET` parameter. The parser is a total
//! function: it never aborts, never writes to stderr, and reports every
//! failure through [`XarParserError`].

use std::collections::HashSet;
use std::num::IntErrorKind;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::{lseek, Whence};

use xar_tools::fd::Fd;
use xar_tools::io::{open_no_int, read_full};

mod json;

pub use json::serialize_header_as_json;

/// Shebang expected on the first line of the header.
pub const SHEBANG: &str = "#!/usr/bin/env xarexec_fuse";

/// Marker line terminating the header section.
pub const XAR_STOP: &str = "#xar_stop";

/// Trampoline name that must be present whenever trampoline names are given.
pub const GUARANTEED_TRAMPOLINE_NAME: &str = "invoke_xar_via_trampoline";

pub const OFFSET_NAME: &str = "OFFSET";
pub const UUID_NAME: &str = "UUID";
pub const VERSION_NAME: &str = "VERSION";
pub const XAREXEC_TARGET_NAME: &str = "XAREXEC_TARGET";
pub const XAREXEC_TRAMPOLINE_NAMES_NAME: &str = "XAREXEC_TRAMPOLINE_NAMES";
pub const MOUNT_ROOT_NAME: &str = "MOUNT_ROOT";

// OFFSET must be a multiple of this.
const HEADER_SIZE_BASE: u64 = 4096;

// Upper bound on the header size the parser supports, which is also how
// much it reads. Headers are 4096 bytes in practice.
const MAX_HEADER_SIZE: u64 = 8192;

// First bytes of a squashfs image ("hsqs").
const SQUASHFS_MAGIC: [u8; 4] = [0x68, 0x73, 0x71, 0x73];

/// Metadata parsed from a XAR header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XarHeader {
    /// Byte offset of the squashfs image from the start of the file.
    pub offset: u64,
    pub uuid: String,
    pub version: String,
    /// Path of the bootstrap script, relative to the mount root.
    pub xarexec_target: String,
    /// Names under which the XAR may be invoked, in header order. These are
    /// not shell-unescaped and so may differ from the escaped names in the
    /// header.
    pub xarexec_trampoline_names: Vec<String>,
    /// Overrides the default mount root search when present.
    pub mount_root: Option<String>,
}

/// Error produced by the XAR header parser. Every variant carries a detail
/// string with diagnostic context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum XarParserError {
    DuplicateParameter(String),
    FileOpen(String),
    FileRead(String),
    IncorrectMagic(String),
    InvalidOffset(String),
    InvalidShebang(String),
    MalformedLine(String),
    MissingParameters(String),
    TrampolineError(String),
    UnexpectedEndOfFile(String),
}

impl XarParserError {
    fn base_message(&self) -> &'static str {
        match self {
            XarParserError::DuplicateParameter(_) => "Variable is assigned more than once: ",
            XarParserError::FileOpen(_) => "Failed to open file for reading: ",
            XarParserError::FileRead(_) => "Failed to read file: ",
            XarParserError::IncorrectMagic(_) => "Incorrect squashfs magic: ",
            XarParserError::InvalidOffset(_) => "Invalid offset: ",
            XarParserError::InvalidShebang(_) => "Invalid shebang: ",
            XarParserError::MalformedLine(_) => "Failed to parse line: ",
            XarParserError::MissingParameters(_) => "Missing required parameters: ",
            XarParserError::TrampolineError(_) => "Error parsing trampoline names: ",
            XarParserError::UnexpectedEndOfFile(_) => "Unexpected end of file reached: ",
        }
    }

    fn detail(&self) -> &str {
        match self {
            XarParserError::DuplicateParameter(detail)
            | XarParserError::FileOpen(detail)
            | XarParserError::FileRead(detail)
            | XarParserError::IncorrectMagic(detail)
            | XarParserError::InvalidOffset(detail)
            | XarParserError::InvalidShebang(detail)
            | XarParserError::MalformedLine(detail)
            | XarParserError::MissingParameters(detail)
            | XarParserError::TrampolineError(detail)
            | XarParserError::UnexpectedEndOfFile(detail) => detail,
        }
    }
}

impl std::fmt::Display for XarParserError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}{}", self.base_message(), self.detail())
    }
}

impl std::error::Error for XarParserError {}

/// A valid header or the first error encountered, never both.
pub type XarParserResult = Result<XarHeader, XarParserError>;

// Parse an unsigned integer, requiring the entire string to be consumed.
fn parse_u64_full(value: &str) -> Result<u64, &'static str> {
    match value.parse::<u64>() {
        Ok(parsed) => Ok(parsed),
        Err(err) => match err.kind() {
            IntErrorKind::PosOverflow => Err("Out of range"),
            _ => Err("Cannot be parsed as an unsigned integer"),
        },
    }
}

// Parse trampoline names from the unquoted parameter value: names wrapped in
// single quotes, joined by exactly one space, no leading or trailing
// whitespace inside the value.
fn parse_trampoline_names(value: &str) -> Result<Vec<String>, XarParserError> {
    if value.len() <= 2 {
        return Err(XarParserError::TrampolineError(
            "There must be at least one trampoline name. Trampoline names must be \
             non-empty and wrapped in single quotes"
                .to_string(),
        ));
    }
    if !value.starts_with('\'') || !value.ends_with('\'') {
        return Err(XarParserError::TrampolineError(
            "Expected first and last characters to be single quotes that wrap \
             trampoline names"
                .to_string(),
        ));
    }
    // Trim the outer quotes before splitting so a literal ' ' name cannot
    // confuse the delimiter search.
    let inner = &value[1..value.len() - 1];
    let names: Vec<String> = inner.split("' '").map(str::to_owned).collect();
    let mut found_required_trampoline = false;
    for name in &names {
        if name.is_empty() {
            return Err(XarParserError::TrampolineError(
                "Trampoline names must be non-empty".to_string(),
            ));
        }
        if name.contains('\'') || name.contains('"') {
            return Err(XarParserError::TrampolineError(
                "Single or double quotes are not allowed in trampoline names. Maybe \
                 there is more than one space between names?"
                    .to_string(),
            ));
        }
        if name == GUARANTEED_TRAMPOLINE_NAME {
            found_required_trampoline = true;
        }
    }
    if !found_required_trampoline {
        return Err(XarParserError::TrampolineError(format!(
            "Missing required trampoline name: {}",
            GUARANTEED_TRAMPOLINE_NAME
        )));
    }
    Ok(names)
}

// Parse one `NAME="VALUE"` line into the header under construction.
fn parse_line(
    line: &str,
    header: &mut XarHeader,
    found_names: &mut HashSet<String>,
) -> Result<(), XarParserError> {
    let mut parts = line.splitn(2, '=');
    let name = parts.next().unwrap_or("");
    let wrapped_value = match parts.next() {
        Some(value) => value,
        None => return Err(XarParserError::MalformedLine(line.to_string())),
    };

    if name.is_empty()
        || wrapped_value.len() < 2
        || !wrapped_value.starts_with('"')
        || !wrapped_value.ends_with('"')
    {
        return Err(XarParserError::MalformedLine(line.to_string()));
    }
    let value = &wrapped_value[1..wrapped_value.len() - 1];
    if value.contains('"') {
        return Err(XarParserError::MalformedLine(line.to_string()));
    }

    if !found_names.insert(name.to_string()) {
        // Assigned twice; possibly ignorable, but almost certainly a
        // builder bug.
        return Err(XarParserError::DuplicateParameter(name.to_string()));
    }

    match name {
        OFFSET_NAME => {
            header.offset = parse_u64_full(value)
                .map_err(|msg| XarParserError::InvalidOffset(msg.to_string()))?;
            if header.offset == 0 || header.offset % HEADER_SIZE_BASE != 0 {
                return Err(XarParserError::InvalidOffset(format!(
                    "{} is not a positive multiple of {}",
                    header.offset, HEADER_SIZE_BASE
                )));
            }
        }
        VERSION_NAME => header.version = value.to_string(),
        UUID_NAME => header.uuid = value.to_string(),
        XAREXEC_TARGET_NAME => header.xarexec_target = value.to_string(),
        XAREXEC_TRAMPOLINE_NAMES_NAME => {
            header.xarexec_trampoline_names = parse_trampoline_names(value)?;
        }
        MOUNT_ROOT_NAME => header.mount_root = Some(value.to_string()),
        // Unknown parameter; ignored for forward compatibility.
        _ => {}
    }
    Ok(())
}

fn parse_header_bytes(buf: &[u8]) -> XarParserResult {
    let mut lines = buf.split(|&byte| byte == b'\n');

    match lines.next() {
        Some(first) if first.starts_with(SHEBANG.as_bytes()) => {}
        Some(_) => return Err(XarParserError::InvalidShebang(String::new())),
        None => {
            return Err(XarParserError::UnexpectedEndOfFile(
                "Failed to get first line which should contain the shebang".to_string(),
            ))
        }
    }

    let mut header = XarHeader::default();
    let mut found_names = HashSet::new();

    // OFFSET is guaranteed to be the first parameter.
    let offset_line = match lines.next() {
        Some(line) => line_to_str(line)?,
        None => {
            return Err(XarParserError::UnexpectedEndOfFile(
                "Failed to get second line which should contain the offset".to_string(),
            ))
        }
    };
    parse_line(offset_line, &mut header, &mut found_names)?;
    if !found_names.contains(OFFSET_NAME) {
        return Err(XarParserError::MissingParameters(format!(
            "Expected {} to be the first parameter",
            OFFSET_NAME
        )));
    }

    // Bound the offset by how much we read, so the magic check below is
    // meaningful. Not part of the format contract, but headers need some
    // upper bound.
    if header.offset > MAX_HEADER_SIZE {
        return Err(XarParserError::InvalidOffset(format!(
            "{} is greater than the maximal header size of {}",
            header.offset, MAX_HEADER_SIZE
        )));
    }

    let mut saw_stop = false;
    for line in lines {
        let line = line_to_str(line)?;
        if line == XAR_STOP {
            saw_stop = true;
            break;
        }
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        parse_line(line, &mut header, &mut found_names)?;
    }
    if !saw_stop {
        return Err(XarParserError::UnexpectedEndOfFile(format!(
            "Failed to find {}",
            XAR_STOP
        )));
    }

    let required = [OFFSET_NAME, UUID_NAME, VERSION_NAME, XAREXEC_TARGET_NAME];
    let missing: Vec<&str> = required
        .iter()
        .filter(|name| !found_names.contains(**name))
        .copied()
        .collect();
    if !missing.is_empty() {
        return Err(XarParserError::MissingParameters(missing.join(", ")));
    }

    let magic_end = header.offset as usize + SQUASHFS_MAGIC.len();
    if magic_end > buf.len() {
        return Err(XarParserError::UnexpectedEndOfFile(format!(
            "{} (offset plus size of squashfs magic) is greater than the size of \
             the read buffer {}",
            magic_end,
            buf.len()
        )));
    }
    if buf[header.offset as usize..magic_end] != SQUASHFS_MAGIC {
        return Err(XarParserError::IncorrectMagic(String::new()));
    }

    Ok(header)
}

fn line_to_str(line: &[u8]) -> Result<&str, XarParserError> {
    std::str::from_utf8(line)
        .map_err(|_| XarParserError::MalformedLine(String::from_utf8_lossy(line).into_owned()))
}

/// Parse the XAR header read from `fd`.
///
/// The descriptor is seeked to the beginning first; up to the maximal header
/// size plus the squashfs magic is read. The descriptor is not mutated
/// beyond seeking and reading.
pub fn parse_xar_header_fd(fd: RawFd) -> XarParserResult {
    if let Err(err) = lseek(fd, 0, Whence::SeekSet) {
        return Err(XarParserError::FileRead(format!(
            "File offset for fd {} could not be zeroed: {}",
            fd, err
        )));
    }

    let mut buf = vec![0u8; MAX_HEADER_SIZE as usize + SQUASHFS_MAGIC.len()];
    match read_full(fd, &mut buf) {
        Ok(0) => Err(XarParserError::FileRead(format!(
            "Failed to read bytes from fd {}: read returned 0",
            fd
        ))),
        Ok(count) => {
            buf.truncate(count);
            parse_header_bytes(&buf)
        }
        Err(err) => Err(XarParserError::FileRead(format!(
            "Failed to read bytes from fd {}: {}",
            fd, err
        ))),
    }
}

/// Parse the XAR header of the file at `path`.
pub fn parse_xar_header<P: AsRef<Path>>(path: P) -> XarParserResult {
    let path = path.as_ref();
    let fd = match open_no_int(path, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty()) {
        Ok(fd) => Fd::new(fd),
        Err(err) => {
            return Err(XarParserError::FileOpen(format!(
                "{}: {}",
                path.display(),
                err
            )))
        }
    };
    parse_xar_header_fd(fd.as_raw_fd())
}
