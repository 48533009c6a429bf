// SPDX-License-Identifier: GPL-2.0-or-later

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use anyhow::{ensure, Result};

const BINARY_PATH: &str = env!("CARGO_BIN_EXE_qemu-compose");

fn run_with_store(store: &Path, args: &[&str]) -> Output {
    Command::new(BINARY_PATH)
        .args(args)
        .env("XDG_DATA_HOME", store)
        .env("RUST_BACKTRACE", "1")
        .output()
        .unwrap()
}

fn seed_image(store: &Path, id: &str, manifest: serde_json::Value) {
    let dir = store.join("qemu-compose/image").join(id);
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("manifest.json"),
        serde_json::to_string(&manifest).unwrap(),
    )
    .unwrap();
}

fn seed_instance(store: &Path, vmid: &str, name: &str) {
    let dir = store.join("qemu-compose/instance").join(vmid);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("name"), name).unwrap();
    fs::write(dir.join("cid"), "1000").unwrap();
}

#[test]
fn version_prints_to_stderr() {
    let tmp = tempfile::tempdir().unwrap();

    let output = run_with_store(tmp.path(), &["version"]);
    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("qemu-compose version v0.6.2"));

    let output = run_with_store(tmp.path(), &["version", "--short"]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("v0.6.2"));
    assert!(!stderr.contains("qemu-compose version"));
}

#[test]
fn images_lists_seeded_manifest() {
    let tmp = tempfile::tempdir().unwrap();
    seed_image(
        tmp.path(),
        "abc123abc123",
        serde_json::json!({
            "id": "abc123abc123",
            "digest": "sha256:0123456789abcdef",
            "created": "2024-01-02T03:04:05Z",
            "repo_tags": ["archlinux:latest"],
            "disks": [["disk.qcow2"]],
        }),
    );

    let output = run_with_store(tmp.path(), &["images"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("REPOSITORY"));
    assert!(stdout.contains("archlinux"));
    assert!(stdout.contains("0123456789ab"));
}

#[test]
fn images_on_empty_store_prints_header_only() {
    let tmp = tempfile::tempdir().unwrap();

    let output = run_with_store(tmp.path(), &["images"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.lines().count(), 1);
}

#[test]
fn ps_all_shows_exited_instance() {
    let tmp = tempfile::tempdir().unwrap();
    seed_instance(tmp.path(), "abcdefabcdef", "my-vm");

    let output = run_with_store(tmp.path(), &["ps", "-a"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("abcdefabcdef"));
    assert!(stdout.contains("my-vm"));
    assert!(stdout.contains("exited"));

    // without -a the exited instance is filtered out
    let output = run_with_store(tmp.path(), &["ps"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains("abcdefabcdef"));
}

#[test]
fn run_with_unknown_image_exits_126() {
    let tmp = tempfile::tempdir().unwrap();

    let output = run_with_store(tmp.path(), &["run", "no-such-image"]);
    assert_eq!(output.status.code(), Some(126));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("image not found"));
}

#[test]
fn run_with_ambiguous_prefix_exits_1() {
    let tmp = tempfile::tempdir().unwrap();
    seed_image(tmp.path(), "abc111", serde_json::json!({"id": "abc111"}));
    seed_image(tmp.path(), "abc222", serde_json::json!({"id": "abc222"}));

    let output = run_with_store(tmp.path(), &["run", "abc"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("ambiguous"));
    assert!(stderr.contains("abc111"));
}

#[test]
fn start_with_unknown_instance_exits_125() {
    let tmp = tempfile::tempdir().unwrap();

    let output = run_with_store(tmp.path(), &["start", "missing"]);
    assert_eq!(output.status.code(), Some(125));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("instance not found"));
}

#[test]
fn ssh_prints_constructed_command() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    seed_instance(tmp.path(), "abcdefabcdef", "my-vm");
    fs::write(
        tmp.path().join("qemu-compose/instance/abcdefabcdef/ssh-key"),
        "key material",
    )?;

    let output = run_with_store(tmp.path(), &["ssh", "my-vm"]);
    ensure!(output.status.success(), "ssh helper failed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    ensure!(stdout.contains("root@vsock%1000"), "stdout: {stdout}");
    ensure!(stdout.contains("StrictHostKeyChecking=no"), "stdout: {stdout}");
    Ok(())
}
