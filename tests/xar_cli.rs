use std::io::Write;
use std::process::Command;

const SQUASHFS_MAGIC: &[u8] = &[0x68, 0x73, 0x71, 0x73];

fn make_xar(header: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let mut data = header.as_bytes().to_vec();
    data.resize(4096, b'\n');
    data.extend_from_slice(SQUASHFS_MAGIC);
    data.extend_from_slice(b"squashfs image bytes");
    file.write_all(&data).unwrap();
    file.flush().unwrap();
    file
}

const VALID_HEADER: &str = "#!/usr/bin/env xarexec_fuse\n\
                            OFFSET=\"4096\"\n\
                            UUID=\"d770950c\"\n\
                            VERSION=\"1628211316\"\n\
                            XAREXEC_TARGET=\"xar_bootstrap.sh\"\n\
                            XAREXEC_TRAMPOLINE_NAMES=\"'lookup.xar' 'invoke_xar_via_trampoline'\"\n\
                            #xar_stop\n";

#[test]
fn test_parser_cli_prints_json() {
    let file = make_xar(VALID_HEADER);
    let output = Command::new(env!("CARGO_BIN_EXE_xar_parser_cli"))
        .arg(file.path())
        .output()
        .unwrap();
    assert!(output.status.success());
    assert_eq!(
        String::from_utf8(output.stdout).unwrap(),
        "{\"OFFSET\":4096,\"UUID\":\"d770950c\",\"VERSION\":\"1628211316\",\
         \"XAREXEC_TARGET\":\"xar_bootstrap.sh\",\
         \"XAREXEC_TRAMPOLINE_NAMES\":[\"lookup.xar\",\"invoke_xar_via_trampoline\"]}\n"
    );
}

#[test]
fn test_parser_cli_reports_parse_errors() {
    let file = make_xar(
        "#!/usr/bin/env xarexec_fuse\n\
         OFFSET=\"4096\"\n\
         #xar_stop\n",
    );
    let output = Command::new(env!("CARGO_BIN_EXE_xar_parser_cli"))
        .arg(file.path())
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(
        stderr.contains("Error parsing XAR header: Missing required parameters"),
        "{}",
        stderr
    );
}

#[test]
fn test_parser_cli_usage() {
    let output = Command::new(env!("CARGO_BIN_EXE_xar_parser_cli"))
        .output()
        .unwrap();
    assert!(!output.status.success());

    let output = Command::new(env!("CARGO_BIN_EXE_xar_parser_cli"))
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8(output.stdout).unwrap().contains("usage:"));
}

#[test]
fn test_launcher_help_and_usage_errors() {
    let output = Command::new(env!("CARGO_BIN_EXE_xarexec_fuse"))
        .arg("-h")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8(output.stderr).unwrap().contains("Usage:"));

    // no xar path
    let output = Command::new(env!("CARGO_BIN_EXE_xarexec_fuse"))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));

    // unknown flag
    let output = Command::new(env!("CARGO_BIN_EXE_xarexec_fuse"))
        .arg("-x")
        .arg("whatever.xar")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_launcher_rejects_bad_header() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"#!/bin/sh\necho not a xar\n").unwrap();
    file.flush().unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_xarexec_fuse"))
        .arg("-n")
        .arg(file.path())
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr).unwrap();
    assert!(stderr.contains("Invalid shebang"), "{}", stderr);
}
