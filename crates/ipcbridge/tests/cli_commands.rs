#![cfg(feature = "cli")]

use std::path::PathBuf;
use std::process::{Command, Output};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "ipcbridge-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn ipcbridge(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ipcbridge"))
        .args(["--log-level", "error"])
        .args(args)
        .output()
        .expect("ipcbridge should run")
}

fn manifest_file(tag: &str, contents: &str) -> (PathBuf, PathBuf) {
    let dir = unique_temp_dir(tag);
    let path = dir.join("api.json");
    std::fs::write(&path, contents).expect("manifest should be writable");
    (dir, path)
}

#[test]
fn manifest_lists_methods_as_json() {
    let (dir, path) = manifest_file(
        "valid",
        r#"{"addOne": "sync", "fetch": "promise", "numbers": "readable"}"#,
    );
    let path_arg = path.to_string_lossy().to_string();

    let output = ipcbridge(&["--format", "json", "manifest", &path_arg]);
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let doc: serde_json::Value =
        serde_json::from_str(stdout.trim()).expect("output should be one JSON document");
    assert_eq!(doc["valid"], serde_json::json!(true));
    let methods = doc["methods"].as_array().expect("methods should be a list");
    assert_eq!(methods.len(), 3);
    assert!(methods
        .iter()
        .any(|m| m["name"] == "numbers" && m["call_type"] == "readable" && m["stream"] == true));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn manifest_with_unknown_call_type_is_data_invalid() {
    let (dir, path) = manifest_file("unknown-type", r#"{"addOne": "eventually"}"#);
    let path_arg = path.to_string_lossy().to_string();

    let output = ipcbridge(&["manifest", &path_arg]);
    assert_eq!(output.status.code(), Some(60));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("eventually"));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn manifest_with_reserved_name_is_data_invalid() {
    let (dir, path) = manifest_file("reserved", r#"{"stream-data": "sync"}"#);
    let path_arg = path.to_string_lossy().to_string();

    let output = ipcbridge(&["manifest", &path_arg]);
    assert_eq!(output.status.code(), Some(60));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn missing_manifest_file_is_a_failure() {
    let dir = unique_temp_dir("missing");
    let path_arg = dir.join("nope.json").to_string_lossy().to_string();

    let output = ipcbridge(&["manifest", &path_arg]);
    assert_eq!(output.status.code(), Some(1));

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn demo_exercises_every_call_type() {
    let output = ipcbridge(&["--format", "json", "demo", "--timeout", "2s"]);
    assert!(
        output.status.success(),
        "demo failed: {}",
        String::from_utf8_lossy(&output.stdout)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    let outcomes: Vec<serde_json::Value> = stdout
        .lines()
        .map(|line| serde_json::from_str(line).expect("each line should be JSON"))
        .collect();
    let call_types: Vec<&str> = outcomes
        .iter()
        .filter_map(|o| o["call_type"].as_str())
        .collect();
    assert_eq!(
        call_types,
        vec!["sync", "async", "promise", "readable", "writable", "duplex"]
    );
    assert!(outcomes.iter().all(|o| o["ok"] == true));
}

#[test]
fn demo_rejects_bad_timeout() {
    let output = ipcbridge(&["demo", "--timeout", "soon"]);
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn version_prints_package_version() {
    let output = ipcbridge(&["version"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(
        stdout.trim(),
        format!("ipcbridge {}", env!("CARGO_PKG_VERSION"))
    );
}
