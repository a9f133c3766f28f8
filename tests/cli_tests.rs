// Command-line behaviour of the insntrace binary

#![allow(deprecated)] // Command::cargo_bin is deprecated but still functional

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_help_lists_options() {
    Command::cargo_bin("insntrace")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--output-dir"))
        .stdout(predicate::str::contains("--buffer-records"))
        .stdout(predicate::str::contains("--no-follow-forks"));
}

#[test]
fn test_missing_command_fails() {
    Command::cargo_bin("insntrace")
        .unwrap()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Must specify a command"));
}

#[test]
fn test_zero_buffer_rejected_before_tracing() {
    Command::cargo_bin("insntrace")
        .unwrap()
        .args(["--buffer-records", "0", "--", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("insn_buffer_records"));
}

#[test]
fn test_bad_config_file_fails() {
    let tmp = TempDir::new().unwrap();
    let config = tmp.path().join("tracer.toml");
    fs::write(&config, "log_registers = \"sometimes\"\n").unwrap();

    Command::cargo_bin("insntrace")
        .unwrap()
        .arg("--config")
        .arg(&config)
        .args(["--", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load config"));
}

#[test]
#[ignore] // Needs ptrace permission in the test environment
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn test_trace_true_end_to_end() {
    let tmp = TempDir::new().unwrap();

    Command::cargo_bin("insntrace")
        .unwrap()
        .arg("-o")
        .arg(tmp.path())
        .args(["--", "true"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Main thread starts"))
        .stdout(predicate::str::contains("Total number of instructions seen"));

    let roots: Vec<_> = fs::read_dir(tmp.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(roots.len(), 1);
    let root = &roots[0];
    assert!(root.join("insn.bytemap").exists());
    assert!(root.join("process_tree.txt").exists());

    let sessions = insntrace::reader::session_dirs(root).unwrap();
    assert_eq!(sessions.len(), 1);
    let dir = &sessions[0].1;
    let pcs: Vec<insntrace::records::InsnRef> =
        insntrace::reader::read_stream(dir, insntrace::Stream::Insn).unwrap();
    assert!(!pcs.is_empty());
    let regs: Vec<insntrace::regfile::Amd64RegFile> =
        insntrace::reader::read_regfiles(dir).unwrap();
    assert_eq!(regs.len(), pcs.len());
    assert!(dir.join("proc_map").exists());
}
