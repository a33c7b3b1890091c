//! Command line integration tests
//!
//! Exercises the binary paths that don't need hardware:
//! - Help output
//! - Configuration loading failures
//! - Configuration file format

use std::process::Command;

fn binary() -> Command {
    Command::new(env!("CARGO_BIN_EXE_fifo-stream"))
}

const FULL_CONFIG: &str = r#"
[device]
vendor_id = "0x0403"
product_id = "0x6010"
interface = "B"
read_timeout_ms = 1000

[stream]
packets_per_transfer = 16
num_transfers = 128
progress_interval_ms = 500
drain_rounds = 3

[output]
path = "~/capture.bin"
byte_limit = 1048576
duration_secs = 60

[logging]
level = "debug"
"#;

#[test]
fn test_help_describes_tool() {
    let output = binary().arg("--help").output().unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("FIFO mode"));
    assert!(stdout.contains("--packets-per-transfer"));
    assert!(stdout.contains("--list-devices"));
}

#[test]
fn test_missing_config_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = binary()
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .output()
        .unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Failed to load configuration"));
}

#[test]
fn test_invalid_override_fails_before_usb() {
    let output = binary().args(["--vid", "0403"]).output().unwrap();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Invalid configuration"));
}

#[test]
fn test_invalid_config_values_fail() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[stream]\nnum_transfers = 0\n").unwrap();

    let output = binary().arg("--config").arg(&path).output().unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_parse_full_config() {
    let config: toml::Value = toml::from_str(FULL_CONFIG).unwrap();

    let device = config.get("device").unwrap();
    assert_eq!(device.get("product_id").unwrap().as_str().unwrap(), "0x6010");
    assert_eq!(device.get("interface").unwrap().as_str().unwrap(), "B");

    let stream = config.get("stream").unwrap();
    assert_eq!(
        stream.get("packets_per_transfer").unwrap().as_integer().unwrap(),
        16
    );
    assert_eq!(stream.get("drain_rounds").unwrap().as_integer().unwrap(), 3);

    let output = config.get("output").unwrap();
    assert_eq!(
        output.get("byte_limit").unwrap().as_integer().unwrap(),
        1048576
    );
}
