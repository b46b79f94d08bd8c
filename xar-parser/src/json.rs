//! JSON rendering of a parsed header.

use serde_json::json;

use crate::XarHeader;

/// Serialize `header` as a single line of JSON with no whitespace outside of
/// string values.
///
/// Keys are the parameter names as they appear in the header; `OFFSET` is a
/// bare integer, everything else a string, trampoline names an array.
/// serde_json emits object keys in sorted order, which is exactly the
/// documented field order.
pub fn serialize_header_as_json(header: &XarHeader) -> String {
    json!({
        "OFFSET": header.offset,
        "UUID": header.uuid,
        "VERSION": header.version,
        "XAREXEC_TARGET": header.xarexec_target,
        "XAREXEC_TRAMPOLINE_NAMES": header.xarexec_trampoline_names,
    })
    .to_string()
}
