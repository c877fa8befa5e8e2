use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_help_lists_limit_flags() {
    Command::cargo_bin("limitbox")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--cpu"))
        .stdout(predicate::str::contains("--memory"))
        .stdout(predicate::str::contains("--existing"));
}

#[test]
fn test_missing_command_is_usage_error() {
    Command::cargo_bin("limitbox")
        .unwrap()
        .args(["--cpu", "50"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_invalid_memory_is_rejected() {
    Command::cargo_bin("limitbox")
        .unwrap()
        .args(["--memory", "12X", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid memory value"));
}

#[cfg(target_os = "linux")]
#[test]
fn test_exit_code_is_mirrored_through_fake_cgroupfs() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("cgroup.controllers"), "cpu memory\n").unwrap();

    Command::cargo_bin("limitbox")
        .unwrap()
        .arg("--cgroup-root")
        .arg(root.path())
        .args(["--name", "cli-test", "--cpu", "50", "sh", "-c", "exit 4"])
        .assert()
        .code(4);

    // A plain directory keeps its control files, so removal fails and the group stays
    let cpu_max = std::fs::read_to_string(root.path().join("cli-test/cpu.max")).unwrap();
    assert_eq!(cpu_max, "50000 100000");
}

#[cfg(target_os = "linux")]
#[test]
fn test_existing_group_must_exist() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("cgroup.controllers"), "cpu memory\n").unwrap();

    Command::cargo_bin("limitbox")
        .unwrap()
        .arg("--cgroup-root")
        .arg(root.path())
        .args(["--existing", "--name", "missing", "true"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("failed to open cgroup missing"));
}
