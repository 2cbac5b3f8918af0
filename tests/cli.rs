//! CLI tests for forge-steps.
//!
//! Only commands that never reach git or a container runtime are exercised
//! here.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn forge_steps(dir: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("forge-steps");
    cmd.current_dir(dir)
        .env_remove("FORGE_DB_PATH")
        .env_remove("FORGE_PORT_RANGE_START")
        .env_remove("FORGE_PORT_RANGE_END")
        .env_remove("FORGE_PROJECT_ID")
        .env("RUST_LOG", "warn");
    cmd
}

fn write_workflow(dir: &Path, name: &str, content: &str) {
    let workflows = dir.join(".forge").join("workflows");
    fs::create_dir_all(&workflows).unwrap();
    fs::write(workflows.join(format!("{}.yaml", name)), content).unwrap();
}

const NOTES: &str = r#"
name: notes
phases:
  - name: Write
    steps:
      - name: Save Notes
        type: artifact
        artifact: notes
        value: {lines: 3}
"#;

mod basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = TempDir::new().unwrap();
        forge_steps(dir.path())
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("preview"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        forge_steps(dir.path()).arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        let dir = TempDir::new().unwrap();
        forge_steps(dir.path()).arg("deploy").assert().failure();
    }
}

mod workflows {
    use super::*;

    #[test]
    fn test_run_then_inspect_steps() {
        let dir = TempDir::new().unwrap();
        write_workflow(dir.path(), "notes", NOTES);

        forge_steps(dir.path())
            .args(["run", "notes", "--args", r#"{"issue": 7}"#])
            .assert()
            .success()
            .stdout(predicate::str::contains("completed"));

        forge_steps(dir.path())
            .args(["steps", "1", "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("write.save-notes"));

        forge_steps(dir.path())
            .arg("runs")
            .assert()
            .success()
            .stdout(predicate::str::contains("notes"));
    }

    #[test]
    fn test_resume_completed_run_is_noop() {
        let dir = TempDir::new().unwrap();
        write_workflow(dir.path(), "notes", NOTES);
        forge_steps(dir.path()).args(["run", "notes"]).assert().success();

        forge_steps(dir.path())
            .args(["resume", "1", "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"status\": \"completed\""));
    }

    #[test]
    fn test_run_missing_workflow_fails() {
        let dir = TempDir::new().unwrap();
        forge_steps(dir.path())
            .args(["run", "missing"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Workflow 'missing' not found"));
    }

    #[test]
    fn test_invalid_args_json_fails() {
        let dir = TempDir::new().unwrap();
        write_workflow(dir.path(), "notes", NOTES);
        forge_steps(dir.path())
            .args(["run", "notes", "--args", "{not json"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--args must be valid JSON"));
    }

    #[test]
    fn test_cancel_unknown_run_fails() {
        let dir = TempDir::new().unwrap();
        forge_steps(dir.path())
            .args(["cancel", "42"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Workflow run 42 not found"));
    }
}

mod git {
    use super::*;

    #[test]
    fn test_switch_rejects_invalid_branch_name() {
        let dir = TempDir::new().unwrap();
        forge_steps(dir.path())
            .args(["git", "switch", "bad branch"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid branch name"));
    }

    #[test]
    fn test_commit_requires_message() {
        let dir = TempDir::new().unwrap();
        forge_steps(dir.path())
            .args(["git", "commit", "--message", "  "])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Commit message must not be empty"));
    }
}

mod previews {
    use super::*;

    #[test]
    fn test_ports_reports_configured_range() {
        let dir = TempDir::new().unwrap();
        let forge = dir.path().join(".forge");
        fs::create_dir_all(&forge).unwrap();
        fs::write(
            forge.join("engine.toml"),
            "[ports]\nrange_start = 7100\nrange_end = 7199\n",
        )
        .unwrap();

        forge_steps(dir.path())
            .args(["ports", "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"range_start\": 7100"))
            .stdout(predicate::str::contains("\"in_use\": []"));
    }

    #[test]
    fn test_start_without_container_config_fails() {
        let dir = TempDir::new().unwrap();
        forge_steps(dir.path())
            .args(["preview", "start", "--json"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No container configuration found"));
    }

    #[test]
    fn test_stop_unknown_preview_fails() {
        let dir = TempDir::new().unwrap();
        forge_steps(dir.path())
            .args(["preview", "stop", "9"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Container record 9 not found"));
    }

    #[test]
    fn test_invalid_slot_is_rejected_by_parser() {
        let dir = TempDir::new().unwrap();
        forge_steps(dir.path())
            .args(["preview", "start", "--slot", "api=notaport"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("invalid port"));
    }

    #[test]
    fn test_list_empty() {
        let dir = TempDir::new().unwrap();
        forge_steps(dir.path())
            .args(["preview", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No previews."));
    }
}
