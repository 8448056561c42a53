#![cfg(all(unix, feature = "cli"))]

use std::path::PathBuf;
use std::process::{Command, Output};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/sycamore-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn sycamore(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_sycamore"))
        .args(["--log-level", "error", "--format", "json"])
        .args(args)
        .output()
        .expect("sycamore should run")
}

fn write_file(dir: &std::path::Path, name: &str, bytes: &[u8]) -> String {
    let path = dir.join(name);
    std::fs::write(&path, bytes).expect("capture should be writable");
    path.to_string_lossy().into_owned()
}

fn drt_payload(entries: &[(u16, u32, u32)]) -> Vec<u8> {
    let mut raw = Vec::new();
    raw.extend_from_slice(&1u16.to_be_bytes());
    raw.extend_from_slice(&0xC594u16.to_be_bytes());
    raw.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    raw.resize(32, 0);
    for &(device_id, flags, size) in entries {
        let start = raw.len();
        raw.extend_from_slice(&device_id.to_be_bytes());
        raw.extend_from_slice(&0u16.to_be_bytes());
        raw.extend_from_slice(&flags.to_be_bytes());
        raw.extend_from_slice(&0x1000_0000u32.to_be_bytes());
        raw.extend_from_slice(&size.to_be_bytes());
        raw.resize(start + 32, 0);
    }
    raw
}

#[test]
fn decode_prints_frames_fed_byte_by_byte() {
    let dir = unique_temp_dir("decode");
    let mut capture = vec![0x00, 0x55];
    capture.extend_from_slice(&[0xDC, 0x00, 0x00, 0x00, 0x00]);
    capture.extend_from_slice(&[0xDC, 0x01, 0x02, 0x00, 0x02, b'h', b'i']);
    let path = write_file(&dir, "capture.bin", &capture);

    let output = sycamore(&["decode", &path, "--chunk-size", "1"]);

    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("\"kind\":\"PING\""));
    assert!(lines[1].contains("\"kind\":\"DATA\",\"slot\":2"));
    assert!(lines[1].contains("\"payload\":\"hi\""));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn decode_flags_malformed_capture() {
    let dir = unique_temp_dir("decode-bad");
    let mut capture = vec![0xDC, 0x7F, 0x00, 0x00, 0x00];
    capture.extend_from_slice(&[0xDC, 0x00, 0x00, 0x00, 0x00]);
    let path = write_file(&dir, "capture.bin", &capture);

    let output = sycamore(&["decode", &path]);

    assert_eq!(output.status.code(), Some(60));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.lines().count(), 1);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn decode_command_direction_uses_host_marker() {
    let dir = unique_temp_dir("decode-cmd");
    let path = write_file(&dir, "capture.bin", &[0xCD, 0x02, 0x00, 0x00, 0x00]);

    let output = sycamore(&["decode", &path, "--direction", "command"]);

    assert!(output.status.success(), "{output:?}");
    assert!(String::from_utf8_lossy(&output.stdout).contains("DISCOVERY"));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn drt_lists_devices() {
    let dir = unique_temp_dir("drt");
    let path = write_file(
        &dir,
        "drt.bin",
        &drt_payload(&[(0x0001, 0, 0), (0x0005, 1, 0x4000)]),
    );

    let output = sycamore(&["drt", &path]);

    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"device_count\":2"));
    assert!(stdout.contains("\"total_memory_size\":16384"));
    assert!(stdout.contains("\"device_id\":\"0x0005\""));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn drt_rejects_bad_magic() {
    let dir = unique_temp_dir("drt-bad");
    let mut raw = drt_payload(&[(0x0001, 0, 0)]);
    raw[2] = 0x00;
    let path = write_file(&dir, "drt.bin", &raw);

    let output = sycamore(&["drt", &path]);

    assert_eq!(output.status.code(), Some(60));
    assert!(String::from_utf8_lossy(&output.stderr).contains("magic"));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn drt_respects_max_devices() {
    let dir = unique_temp_dir("drt-max");
    let path = write_file(
        &dir,
        "drt.bin",
        &drt_payload(&[(1, 0, 0), (2, 0, 0), (3, 0, 0)]),
    );

    let output = sycamore(&["drt", &path, "--max-devices", "2"]);

    assert_eq!(output.status.code(), Some(60));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn simulate_echoes_through_device() {
    let output = sycamore(&[
        "simulate",
        "--devices",
        "0x0001,0x0005",
        "--slot",
        "1",
        "--data",
        "hello",
        "--chunk-size",
        "2",
    ]);

    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"device_id\":\"0x0005\""));
    assert!(stdout.contains("\"received\":\"hello\""));
    assert!(stdout.contains("\"echoed\":true"));
    assert!(stdout.contains("\"protocol_errors\":0"));
}

#[test]
fn simulate_rejects_unannounced_slot() {
    let output = sycamore(&["simulate", "--devices", "0x0001", "--slot", "4"]);
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn attach_missing_socket_fails() {
    let dir = unique_temp_dir("attach");
    let sock = dir.join("missing.sock");

    let output = sycamore(&["attach", &sock.to_string_lossy(), "--duration", "1s"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("connect"));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn version_names_the_tool() {
    let output = sycamore(&["version", "--extended"]);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("sycamore "));
    assert!(stdout.contains("features: async=true, sim=true, cli=true"));
}
