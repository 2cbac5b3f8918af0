use std::path::Path;

use tracing::{info, instrument, warn};

use super::{GitReconciler, validate_branch_name};
use crate::errors::{GitError, ProcessError};
use crate::models::{GitOperationKind, GitOperationOutcome};
use crate::process::{self, CommandSpec};

const EMPTY_BODY: &str = "No description provided.";

/// The PR URL is the last non-empty line `gh pr create` prints.
fn parse_pr_url(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .map(str::to_string)
}

impl GitReconciler {
    fn gh<I, S>(&self, path: &Path, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new(&self.settings.gh_cmd, path).args(args)
    }

    /// Push the current branch and open a pull request against `base`.
    ///
    /// When a pull request for the branch already exists its URL is returned
    /// instead of failing.
    #[instrument(skip(self, title, description), fields(path = %path.display()))]
    pub async fn create_pull_request(
        &self,
        path: &Path,
        title: &str,
        description: &str,
        base: &str,
    ) -> Result<GitOperationOutcome, GitError> {
        if title.trim().is_empty() {
            return Err(GitError::EmptyPrTitle);
        }
        validate_branch_name(base)?;

        self.guarded("pr", async {
            let mut outcome = GitOperationOutcome::new(GitOperationKind::Pr);
            let branch = self.current_branch(path).await?.ok_or_else(|| {
                GitError::UnexpectedOutput {
                    command: format!("{} symbolic-ref --short -q HEAD", self.settings.git_cmd),
                    message: "HEAD is detached; check out a branch before opening a PR".into(),
                }
            })?;
            outcome.branch = Some(branch.clone());

            self.exec(
                self.git(path, ["push", "-u", self.settings.remote.as_str(), branch.as_str()]),
                &mut outcome.commands,
            )
            .await?;

            let body = if description.trim().is_empty() {
                EMPTY_BODY
            } else {
                description
            };
            let create = self.gh(
                path,
                [
                    "pr",
                    "create",
                    "--title",
                    title,
                    "--body",
                    body,
                    "--base",
                    base,
                    "--head",
                    branch.as_str(),
                ],
            );
            let line = create.to_string();
            let output = self.runner.run(&create).await?;

            let url = if output.success() {
                outcome.commands.push(line.clone());
                parse_pr_url(&output.stdout)
            } else if output.stderr.contains("already exists") {
                warn!(branch = %branch, "pull request already exists, reusing it");
                let view = self.gh(path, ["pr", "view", branch.as_str(), "--json", "url", "--jq", ".url"]);
                let existing = process::run_checked(self.runner.as_ref(), &view, None).await?;
                parse_pr_url(&existing.stdout)
            } else {
                return Err(GitError::Process(ProcessError::NonZeroExit {
                    command: line,
                    code: output.code,
                    stderr: output.stderr.trim().to_string(),
                }));
            };

            let url = url.ok_or_else(|| GitError::UnexpectedOutput {
                command: line,
                message: "no pull request URL in output".into(),
            })?;
            info!(url = %url, "pull request ready");
            outcome.pr_url = Some(url);
            outcome.success = true;
            Ok(outcome)
        })
        .await
    }
}
