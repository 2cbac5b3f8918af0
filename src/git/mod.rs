//! Git state reconciliation.
//!
//! Brings a working tree to a requested branch/commit state regardless of
//! where it starts. Mutations go through the git CLI (hooks, sparse checkout
//! and credential helpers keep working). Each operation returns the
//! state-changing commands it ran, in order, for audit; read-only probes
//! (`status`, `symbolic-ref`, `show-ref`, `rev-parse`) are not listed.
//!
//! Every public operation runs under one deadline (`GitSettings::timeout`,
//! 120s by default). Exceeding it yields `GitError::GitOperationTimeout`.
//!
//! The reconciler assumes exclusive use of a project path while an operation
//! runs; callers serialize git steps per project.

mod pull_request;

use std::future::Future;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::{debug, info, instrument};

use crate::config::GitSettings;
use crate::errors::{GitError, ProcessError};
use crate::models::{GitOperationKind, GitOperationOutcome};
use crate::process::{self, CommandSpec, ProcessOutput, ProcessRunner};
use crate::timeout;

static BRANCH_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_./-]+$").expect("branch name pattern is valid")
});

/// Reject anything outside `[A-Za-z0-9_./-]` before a process is spawned.
/// A leading `-` would reach git as an option.
pub fn validate_branch_name(name: &str) -> Result<(), GitError> {
    if BRANCH_NAME.is_match(name) && !name.starts_with('-') {
        Ok(())
    } else {
        Err(GitError::InvalidBranchName(name.to_string()))
    }
}

/// Message used when uncommitted work is saved before a branch switch.
pub fn auto_commit_message(target_branch: &str) -> String {
    format!("WIP: save uncommitted changes before switching to {}", target_branch)
}

pub struct GitReconciler {
    runner: Arc<dyn ProcessRunner>,
    settings: GitSettings,
}

impl GitReconciler {
    pub fn new(runner: Arc<dyn ProcessRunner>, settings: GitSettings) -> Self {
        Self { runner, settings }
    }

    fn git<I, S>(&self, path: &Path, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(&self.settings.git_cmd, path).args(args)
    }

    /// Run the whole operation under the configured deadline.
    async fn guarded<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, GitError>>,
    ) -> Result<T, GitError> {
        timeout::guard_result(self.settings.timeout(), fut, |after| {
            GitError::GitOperationTimeout { operation, after }
        })
        .await
    }

    /// Read-only command; not recorded.
    async fn query(&self, spec: CommandSpec) -> Result<ProcessOutput, GitError> {
        Ok(process::run_checked(self.runner.as_ref(), &spec, None).await?)
    }

    /// State-changing command; recorded in `commands` once it has run.
    async fn exec(
        &self,
        spec: CommandSpec,
        commands: &mut Vec<String>,
    ) -> Result<ProcessOutput, GitError> {
        let line = spec.to_string();
        debug!(command = %line, "git");
        let output = process::run_checked(self.runner.as_ref(), &spec, None).await?;
        commands.push(line);
        Ok(output)
    }

    /// Current branch, or `None` on a detached HEAD. Works on unborn branches.
    pub async fn current_branch(&self, path: &Path) -> Result<Option<String>, GitError> {
        let spec = self.git(path, ["symbolic-ref", "--short", "-q", "HEAD"]);
        let output = self.runner.run(&spec).await?;
        match output.code {
            Some(0) => Ok(Some(output.stdout.trim().to_string())),
            Some(1) => Ok(None),
            code => Err(GitError::Process(ProcessError::NonZeroExit {
                command: spec.to_string(),
                code,
                stderr: output.stderr.trim().to_string(),
            })),
        }
    }

    /// True when `git status --porcelain` reports nothing.
    pub async fn is_clean(&self, path: &Path) -> Result<bool, GitError> {
        let output = self.query(self.git(path, ["status", "--porcelain"])).await?;
        Ok(output.stdout.trim().is_empty())
    }

    pub async fn branch_exists(&self, path: &Path, branch: &str) -> Result<bool, GitError> {
        validate_branch_name(branch)?;
        let spec = self.git(
            path,
            [
                "show-ref".to_string(),
                "--verify".to_string(),
                "--quiet".to_string(),
                format!("refs/heads/{}", branch),
            ],
        );
        let output = self.runner.run(&spec).await?;
        match output.code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            code => Err(GitError::Process(ProcessError::NonZeroExit {
                command: spec.to_string(),
                code,
                stderr: output.stderr.trim().to_string(),
            })),
        }
    }

    pub async fn head_sha(&self, path: &Path) -> Result<String, GitError> {
        let output = self.query(self.git(path, ["rev-parse", "HEAD"])).await?;
        Ok(output.stdout.trim().to_string())
    }

    /// Stage `files` (everything when `None`) and commit.
    ///
    /// A clean working tree is a caller error (`NothingToCommit`); use
    /// [`commit_and_branch`](Self::commit_and_branch) for an idempotent commit.
    #[instrument(skip(self, message, files), fields(path = %path.display()))]
    pub async fn commit(
        &self,
        path: &Path,
        message: &str,
        files: Option<&[String]>,
    ) -> Result<GitOperationOutcome, GitError> {
        if message.trim().is_empty() {
            return Err(GitError::EmptyCommitMessage);
        }
        self.guarded("commit", async {
            if self.is_clean(path).await? {
                return Err(GitError::NothingToCommit {
                    path: path.to_path_buf(),
                });
            }
            let mut outcome = GitOperationOutcome::new(GitOperationKind::Commit);
            let sha = self
                .stage_and_commit(path, message, files, &mut outcome.commands)
                .await?;
            outcome.commit_sha = Some(sha);
            outcome.branch = self.current_branch(path).await?;
            outcome.success = true;
            info!(commit = ?outcome.commit_sha, "committed changes");
            Ok(outcome)
        })
        .await
    }

    async fn stage_and_commit(
        &self,
        path: &Path,
        message: &str,
        files: Option<&[String]>,
        commands: &mut Vec<String>,
    ) -> Result<String, GitError> {
        let add = match files {
            Some(files) if !files.is_empty() => self
                .git(path, ["add", "--"])
                .args(files.iter().cloned()),
            _ => self.git(path, ["add", "-A"]),
        };
        self.exec(add, commands).await?;
        self.exec(self.git(path, ["commit", "-m", message]), commands)
            .await?;
        self.head_sha(path).await
    }

    /// Make `branch` the current branch.
    ///
    /// 1. Already on `branch`: nothing runs, empty command list.
    /// 2. `branch` exists locally: check it out.
    /// 3. Otherwise: check out `from` when given, then `checkout -b`.
    ///
    /// In cases 2 and 3 uncommitted changes are committed first so a switch
    /// never drops work.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn create_and_switch_branch(
        &self,
        path: &Path,
        branch: &str,
        from: Option<&str>,
    ) -> Result<GitOperationOutcome, GitError> {
        validate_branch_name(branch)?;
        if let Some(base) = from {
            validate_branch_name(base)?;
        }
        self.guarded("branch", async {
            let mut outcome = GitOperationOutcome::new(GitOperationKind::Branch);
            self.switch_branch(path, branch, from, &mut outcome).await?;
            Ok(outcome)
        })
        .await
    }

    async fn switch_branch(
        &self,
        path: &Path,
        branch: &str,
        from: Option<&str>,
        outcome: &mut GitOperationOutcome,
    ) -> Result<(), GitError> {
        outcome.branch = Some(branch.to_string());

        if self.current_branch(path).await?.as_deref() == Some(branch) {
            debug!(branch, "already on branch");
            outcome.success = true;
            return Ok(());
        }

        let exists = self.branch_exists(path, branch).await?;

        if !self.is_clean(path).await? {
            let sha = self
                .stage_and_commit(path, &auto_commit_message(branch), None, &mut outcome.commands)
                .await?;
            info!(commit = %sha, branch, "saved uncommitted changes before switching");
            outcome.commit_sha = Some(sha);
        }

        if exists {
            self.exec(self.git(path, ["checkout", branch]), &mut outcome.commands)
                .await?;
        } else {
            if let Some(base) = from {
                self.exec(self.git(path, ["checkout", base]), &mut outcome.commands)
                    .await?;
            }
            self.exec(
                self.git(path, ["checkout", "-b", branch]),
                &mut outcome.commands,
            )
            .await?;
        }

        info!(branch, created = !exists, "switched branch");
        outcome.success = true;
        Ok(())
    }

    /// Idempotent composite: reconcile the branch as
    /// [`create_and_switch_branch`](Self::create_and_switch_branch) does, then
    /// commit whatever is still uncommitted on it. A clean tree skips the
    /// commit and still succeeds.
    #[instrument(skip(self, message), fields(path = %path.display()))]
    pub async fn commit_and_branch(
        &self,
        path: &Path,
        branch: &str,
        from: Option<&str>,
        message: &str,
    ) -> Result<GitOperationOutcome, GitError> {
        validate_branch_name(branch)?;
        if let Some(base) = from {
            validate_branch_name(base)?;
        }
        if message.trim().is_empty() {
            return Err(GitError::EmptyCommitMessage);
        }
        self.guarded("commit-and-branch", async {
            let mut outcome = GitOperationOutcome::new(GitOperationKind::CommitAndBranch);
            self.switch_branch(path, branch, from, &mut outcome).await?;
            if self.is_clean(path).await? {
                debug!(branch, "working tree clean, skipping commit");
            } else {
                let sha = self
                    .stage_and_commit(path, message, None, &mut outcome.commands)
                    .await?;
                outcome.commit_sha = Some(sha);
            }
            outcome.success = true;
            Ok(outcome)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::process::fake::{FakeRunner, Reply};
    use std::time::Duration;

    fn reconciler(runner: Arc<FakeRunner>) -> GitReconciler {
        GitReconciler::new(runner, GitSettings::default())
    }

    fn dirty_repo_on_main() -> FakeRunner {
        FakeRunner::new()
            .on("git symbolic-ref", Reply::ok("main\n"))
            .on("git show-ref", Reply::fail(1, ""))
            .on_seq(
                "git status --porcelain",
                vec![Reply::ok(" M src/a.rs\n M src/b.rs\n"), Reply::ok("")],
            )
            .on("git rev-parse HEAD", Reply::ok("0123456789abcdef0123456789abcdef01234567\n"))
    }

    #[test]
    fn test_validate_branch_name() {
        for ok in ["main", "feature/x", "fix_1.2", "release-2024/v1.0"] {
            assert!(validate_branch_name(ok).is_ok(), "{ok} should be valid");
        }
        for bad in ["", "feature x", "a;rm -rf", "naïve", "x~1", "$(whoami)", "-f", "--detach"] {
            assert!(
                matches!(validate_branch_name(bad), Err(GitError::InvalidBranchName(_))),
                "{bad} should be invalid"
            );
        }
    }

    #[tokio::test]
    async fn test_option_like_base_branch_spawns_nothing() {
        let runner = Arc::new(FakeRunner::new());
        let git = reconciler(runner.clone());
        let err = git
            .create_and_switch_branch(Path::new("/repo"), "feature/x", Some("--detach"))
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::InvalidBranchName(ref name) if name == "--detach"));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_branch_name_spawns_nothing() {
        let runner = Arc::new(FakeRunner::new());
        let git = reconciler(runner.clone());
        let err = git
            .create_and_switch_branch(Path::new("/repo"), "bad name", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_switch_to_new_branch_commits_dirty_tree_first() {
        let runner = Arc::new(dirty_repo_on_main());
        let git = reconciler(runner.clone());

        let outcome = git
            .create_and_switch_branch(Path::new("/repo"), "feature/x", Some("main"))
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.kind, GitOperationKind::Branch);
        assert_eq!(outcome.branch.as_deref(), Some("feature/x"));
        assert_eq!(
            outcome.commands,
            vec![
                "git add -A".to_string(),
                format!("git commit -m \"{}\"", auto_commit_message("feature/x")),
                "git checkout main".to_string(),
                "git checkout -b feature/x".to_string(),
            ]
        );
        assert!(outcome.commit_sha.is_some());
    }

    #[tokio::test]
    async fn test_switch_is_noop_when_already_on_branch() {
        let runner = Arc::new(
            FakeRunner::new()
                .on_seq(
                    "git symbolic-ref",
                    vec![Reply::ok("main\n"), Reply::ok("feature/x\n")],
                )
                .on("git show-ref", Reply::fail(1, "")),
        );
        let git = reconciler(runner.clone());

        let first = git
            .create_and_switch_branch(Path::new("/repo"), "feature/x", None)
            .await
            .unwrap();
        assert_eq!(first.commands, vec!["git checkout -b feature/x".to_string()]);

        let second = git
            .create_and_switch_branch(Path::new("/repo"), "feature/x", None)
            .await
            .unwrap();
        assert!(second.success);
        assert!(second.commands.is_empty());
    }

    #[tokio::test]
    async fn test_switch_checks_out_existing_branch() {
        let runner = Arc::new(
            FakeRunner::new()
                .on("git symbolic-ref", Reply::ok("main\n"))
                .on("git show-ref", Reply::ok("")),
        );
        let git = reconciler(runner.clone());

        let outcome = git
            .create_and_switch_branch(Path::new("/repo"), "develop", Some("main"))
            .await
            .unwrap();
        assert_eq!(outcome.commands, vec!["git checkout develop".to_string()]);
    }

    #[tokio::test]
    async fn test_commit_on_clean_tree_is_rejected() {
        let runner = Arc::new(FakeRunner::new().on("git status --porcelain", Reply::ok("")));
        let git = reconciler(runner.clone());

        let err = git
            .commit(Path::new("/repo"), "Update docs", None)
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::NothingToCommit { .. }));
        assert!(!runner.calls().iter().any(|c| c.starts_with("git add")));
    }

    #[tokio::test]
    async fn test_commit_stages_given_files() {
        let runner = Arc::new(
            FakeRunner::new()
                .on("git status --porcelain", Reply::ok(" M README.md\n"))
                .on("git rev-parse HEAD", Reply::ok("abc123\n"))
                .on("git symbolic-ref", Reply::ok("main\n")),
        );
        let git = reconciler(runner.clone());
        let files = vec!["README.md".to_string(), "docs/guide.md".to_string()];

        let outcome = git
            .commit(Path::new("/repo"), "Update docs", Some(&files))
            .await
            .unwrap();
        assert_eq!(
            outcome.commands,
            vec![
                "git add -- README.md docs/guide.md".to_string(),
                "git commit -m \"Update docs\"".to_string(),
            ]
        );
        assert_eq!(outcome.commit_sha.as_deref(), Some("abc123"));
        assert_eq!(outcome.branch.as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn test_commit_rejects_empty_message() {
        let runner = Arc::new(FakeRunner::new());
        let git = reconciler(runner.clone());
        let err = git.commit(Path::new("/repo"), "  ", None).await.unwrap_err();
        assert!(matches!(err, GitError::EmptyCommitMessage));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_commit_failure_carries_stderr() {
        let runner = Arc::new(
            FakeRunner::new()
                .on("git status --porcelain", Reply::ok("?? new.txt\n"))
                .on("git commit", Reply::fail(1, "pre-commit hook failed\n")),
        );
        let git = reconciler(runner);
        let err = git
            .commit(Path::new("/repo"), "Add file", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalProcessFailure);
        match err {
            GitError::Process(ProcessError::NonZeroExit { stderr, .. }) => {
                assert_eq!(stderr, "pre-commit hook failed")
            }
            other => panic!("Expected NonZeroExit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_commit_and_branch_skips_commit_on_clean_tree() {
        let runner = Arc::new(
            FakeRunner::new()
                .on("git symbolic-ref", Reply::ok("feature/x\n"))
                .on("git status --porcelain", Reply::ok("")),
        );
        let git = reconciler(runner);

        let outcome = git
            .commit_and_branch(Path::new("/repo"), "feature/x", None, "Save work")
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.kind, GitOperationKind::CommitAndBranch);
        assert!(outcome.commands.is_empty());
        assert!(outcome.commit_sha.is_none());
    }

    #[tokio::test]
    async fn test_commit_and_branch_commits_on_current_branch() {
        let runner = Arc::new(
            FakeRunner::new()
                .on("git symbolic-ref", Reply::ok("feature/x\n"))
                .on("git status --porcelain", Reply::ok(" M lib.rs\n"))
                .on("git rev-parse HEAD", Reply::ok("feedface\n")),
        );
        let git = reconciler(runner);

        let outcome = git
            .commit_and_branch(Path::new("/repo"), "feature/x", None, "Save work")
            .await
            .unwrap();
        assert_eq!(
            outcome.commands,
            vec![
                "git add -A".to_string(),
                "git commit -m \"Save work\"".to_string()
            ]
        );
        assert_eq!(outcome.commit_sha.as_deref(), Some("feedface"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_git_surfaces_operation_timeout() {
        let runner = Arc::new(FakeRunner::new().on("git symbolic-ref", Reply::Hang));
        let git = reconciler(runner);

        let err = git
            .create_and_switch_branch(Path::new("/repo"), "feature/x", None)
            .await
            .unwrap_err();
        match &err {
            GitError::GitOperationTimeout { operation, after } => {
                assert_eq!(*operation, "branch");
                assert_eq!(*after, Duration::from_secs(120));
            }
            other => panic!("Expected GitOperationTimeout, got {other:?}"),
        }
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_current_branch_detached_head() {
        let runner = Arc::new(FakeRunner::new().on("git symbolic-ref", Reply::fail(1, "")));
        let git = reconciler(runner);
        assert_eq!(git.current_branch(Path::new("/repo")).await.unwrap(), None);
    }
}
