use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::io::Write;

/// hostkit with config, state and VM locations pointed into `home`, so the
/// invoking user's real files never leak in.
fn hostkit(home: &tempfile::TempDir) -> assert_cmd::Command {
    let mut cmd: assert_cmd::Command = cargo_bin_cmd!("hostkit").into();
    cmd.env("HOME", home.path())
        .env("XDG_CONFIG_HOME", home.path().join("config"))
        .env("XDG_STATE_HOME", home.path().join("state"))
        .env("NO_COLOR", "1")
        .env_remove("VM_FOLDER")
        .env_remove("USERNAME")
        .env_remove("RUST_LOG");
    cmd
}

fn write_config(dir: &tempfile::TempDir, contents: &str) -> std::path::PathBuf {
    let config_path = dir.path().join("hostkit.toml");
    let mut f = std::fs::File::create(&config_path).unwrap();
    write!(f, "{contents}").unwrap();
    config_path
}

#[test]
fn help_works() {
    let home = tempfile::tempdir().unwrap();
    hostkit(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("QEMU VM launcher"));
}

#[test]
fn unsupported_architecture_touches_nothing() {
    let home = tempfile::tempdir().unwrap();
    let vms = tempfile::tempdir().unwrap();

    hostkit(&home)
        .env("VM_FOLDER", vms.path())
        .args(["vm", "create", "-a", "aarch64", "-n", "t1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not currently supported"));

    assert_eq!(std::fs::read_dir(vms.path()).unwrap().count(), 0);
}

#[test]
fn missing_vm_folder_is_fatal() {
    let home = tempfile::tempdir().unwrap();
    hostkit(&home)
        .args(["vm", "setup", "-a", "x86_64", "-n", "t1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("VM_FOLDER is undefined"));

    assert!(
        !home.path().join("state").exists(),
        "no log directory before VM_FOLDER is known"
    );
}

#[test]
fn vm_folder_from_config_file() {
    let home = tempfile::tempdir().unwrap();
    let vms = tempfile::tempdir().unwrap();
    let config_path = write_config(
        &home,
        &format!("[vm]\nfolder = \"{}\"\n", vms.path().display()),
    );

    hostkit(&home)
        .args(["--config", config_path.to_str().unwrap()])
        .args(["vm", "run", "-a", "x86_64", "-n", "t1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("uninitialized"));
}

#[test]
fn missing_config_shows_error() {
    let home = tempfile::tempdir().unwrap();
    hostkit(&home)
        .args(["--config", "/nonexistent/hostkit.toml", "host", "preflight"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn invalid_config_is_rejected() {
    let home = tempfile::tempdir().unwrap();
    let config_path = write_config(&home, "[vm]\nssh_port = 0\n");

    hostkit(&home)
        .args(["--config", config_path.to_str().unwrap(), "host", "preflight"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ssh_port must not be 0"));
}

#[test]
fn setup_before_create_is_an_invalid_state() {
    let home = tempfile::tempdir().unwrap();
    let vms = tempfile::tempdir().unwrap();

    hostkit(&home)
        .env("VM_FOLDER", vms.path())
        .args(["vm", "setup", "-a", "x86_64", "-n", "t1"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("uninitialized"));
}

#[test]
fn static_ip_rejects_bad_address() {
    let home = tempfile::tempdir().unwrap();
    hostkit(&home)
        .args(["host", "static-ip", "192.168.4.300"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("not a valid IP address"));
}

#[test]
fn partition_rejects_unknown_device_naming() {
    let home = tempfile::tempdir().unwrap();
    hostkit(&home)
        .args(["host", "partition", "-d", "/dev/vda"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("cannot derive a partition name"));
}

#[test]
fn mount_units_rejects_services() {
    let home = tempfile::tempdir().unwrap();
    hostkit(&home)
        .args(["host", "mount-units", "--from"])
        .arg(home.path())
        .arg("sshd.service")
        .assert()
        .failure()
        .stderr(predicate::str::contains("not a .mount or .automount"));
}

#[test]
fn podman_needs_a_user() {
    let home = tempfile::tempdir().unwrap();
    hostkit(&home)
        .args(["host", "podman"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("no user given"));
}
