use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::tempdir;

fn write_config(root: &Path, extra: &str) -> PathBuf {
    let data_root = root.join("docker");
    fs::create_dir_all(data_root.join("volumes")).unwrap();
    fs::write(data_root.join("volumes/metadata.db"), vec![0u8; 64]).unwrap();

    let config_path = root.join("config.toml");
    let contents = format!(
        "[paths]\ndata_root = \"{}\"\nrepository = \"{}\"\nlock = \"{}\"\nstaging = \"{}\"\n{extra}",
        data_root.display(),
        root.join("repo").display(),
        root.join("run.lock").display(),
        root.join("staging").display(),
    );
    fs::write(&config_path, contents).unwrap();
    config_path
}

fn dockvault(config: &Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_dockvault"))
        .arg("--config")
        .arg(config)
        .arg("--no-color")
        .args(args)
        .output()
        .unwrap()
}

#[test]
fn busy_lock_exits_with_lock_code_and_names_owner() {
    let tmp = tempdir().unwrap();
    let config_path = write_config(tmp.path(), "");
    let lock = tmp.path().join("run.lock");
    fs::create_dir_all(&lock).unwrap();
    let owner = std::process::id();
    fs::write(lock.join("pid"), format!("{owner}\n")).unwrap();

    let output = dockvault(&config_path, &["backup"]);

    assert_eq!(output.status.code(), Some(3));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains(&format!("pid {owner}")), "stderr: {stderr}");
    // The other run's lock is left alone.
    assert_eq!(
        fs::read_to_string(lock.join("pid")).unwrap().trim(),
        owner.to_string()
    );
}

#[test]
fn unreadable_config_exits_with_precondition_code() {
    let tmp = tempdir().unwrap();
    let config_path = tmp.path().join("config.toml");
    fs::write(&config_path, "[paths\nrepository = ").unwrap();

    let output = dockvault(&config_path, &["list"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to parse config"));
}

#[test]
fn dry_run_backup_reports_plan_without_locking() {
    let tmp = tempdir().unwrap();
    let config_path = write_config(tmp.path(), "");

    let output = dockvault(&config_path, &["backup", "--dry-run"]);

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("as docker-data (64 B)"), "stdout: {stdout}");
    assert!(!tmp.path().join("run.lock").exists());
}

#[test]
fn restore_without_terminal_needs_force() {
    let tmp = tempdir().unwrap();
    let config_path = write_config(tmp.path(), "");

    let output = Command::new(env!("CARGO_BIN_EXE_dockvault"))
        .arg("--config")
        .arg(&config_path)
        .args(["restore", "latest"])
        .stdin(std::process::Stdio::null())
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("--force"));
    assert!(!tmp.path().join("run.lock").exists());
}

#[test]
fn download_without_remote_is_a_precondition() {
    let tmp = tempdir().unwrap();
    let config_path = write_config(tmp.path(), "");

    let output = dockvault(&config_path, &["download"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no remote is configured"));
}
