//! Binary-level CLI tests: version flag and startup exit codes.
use std::io::Write;
use std::process::Command;

#[test]
fn version_flag_prints_and_exits_clean() {
    let exe = env!("CARGO_BIN_EXE_cloakd");
    let out = Command::new(exe)
        .arg("--version")
        .output()
        .expect("run cloakd");
    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.starts_with("cloakd "), "got: {stdout}");
}

#[test]
fn missing_config_is_a_fatal_init_error() {
    let exe = env!("CARGO_BIN_EXE_cloakd");
    let out = Command::new(exe).output().expect("run cloakd");
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn unreadable_config_path_exits_one() {
    let exe = env!("CARGO_BIN_EXE_cloakd");
    let out = Command::new(exe)
        .args(["--config", "/nonexistent/cloakd.json"])
        .output()
        .expect("run cloakd");
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn invalid_config_json_exits_one() {
    let exe = env!("CARGO_BIN_EXE_cloakd");
    let mut cfg = tempfile::NamedTempFile::new().expect("temp config");
    write!(cfg, "{{ not json").unwrap();
    let out = Command::new(exe)
        .args(["--config", cfg.path().to_str().unwrap()])
        .output()
        .expect("run cloakd");
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn missing_model_artifact_exits_one() {
    let exe = env!("CARGO_BIN_EXE_cloakd");
    let mut cfg = tempfile::NamedTempFile::new().expect("temp config");
    write!(
        cfg,
        r#"{{
            "processes": {{ "CPU": "cpu_miner" }},
            "model_path": "/nonexistent/model.json"
        }}"#
    )
    .unwrap();
    let out = Command::new(exe)
        .args(["--config", cfg.path().to_str().unwrap()])
        .output()
        .expect("run cloakd");
    assert_eq!(out.status.code(), Some(1));
}
