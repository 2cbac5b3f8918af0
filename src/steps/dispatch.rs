use std::sync::Arc;

use serde_json::{Value, json};
use tracing::debug;

use super::StepContext;
use super::config::{ArtifactStep, ContainerStep, GitStep, StepConfig};
use crate::container::PreviewService;
use crate::db::DbHandle;
use crate::errors::StepError;
use crate::git::GitReconciler;
use crate::models::{ContainerRecord, SlotRequest};

/// Routes a validated [`StepConfig`] to the collaborator that performs it and
/// turns the outcome into the step payload.
pub struct StepDispatcher {
    db: DbHandle,
    git: Arc<GitReconciler>,
    previews: Arc<PreviewService>,
}

fn to_payload<T: serde::Serialize>(value: &T) -> Result<Value, StepError> {
    serde_json::to_value(value).map_err(|e| StepError::Handler(e.into()))
}

impl StepDispatcher {
    pub fn new(db: DbHandle, git: Arc<GitReconciler>, previews: Arc<PreviewService>) -> Self {
        Self { db, git, previews }
    }

    pub async fn dispatch(&self, ctx: &StepContext, config: &StepConfig) -> Result<Value, StepError> {
        config.validate()?;
        debug!(run = ctx.run_id, kind = config.kind(), "dispatching step");
        match config {
            StepConfig::Git(step) => self.git_step(ctx, step).await,
            StepConfig::Container(step) => self.container_step(ctx, step).await,
            StepConfig::Artifact(step) => self.artifact_step(ctx, step).await,
        }
    }

    async fn git_step(&self, ctx: &StepContext, step: &GitStep) -> Result<Value, StepError> {
        let path = ctx.project_path.as_path();
        let outcome = match step {
            GitStep::Commit { message, files } => {
                self.git.commit(path, message, files.as_deref()).await?
            }
            GitStep::Branch { branch, from } => {
                self.git
                    .create_and_switch_branch(path, branch, from.as_deref())
                    .await?
            }
            GitStep::Pr {
                title,
                description,
                base,
            } => {
                self.git
                    .create_pull_request(path, title, description, base)
                    .await?
            }
            GitStep::CommitAndBranch {
                branch,
                from,
                message,
            } => {
                self.git
                    .commit_and_branch(path, branch, from.as_deref(), message)
                    .await?
            }
        };
        to_payload(&outcome)
    }

    async fn container_step(
        &self,
        ctx: &StepContext,
        step: &ContainerStep,
    ) -> Result<Value, StepError> {
        match step {
            ContainerStep::Start {
                slots,
                config,
                artifact,
            } => {
                let slots = if slots.is_empty() {
                    SlotRequest::from([("app".to_string(), None)])
                } else {
                    slots.clone()
                };
                let record = self
                    .previews
                    .start(ctx.project_id, &ctx.project_path, config.as_deref(), slots)
                    .await?;
                let payload = to_payload(&record)?;
                self.put_artifact(ctx.run_id, artifact, payload.clone())
                    .await?;
                Ok(payload)
            }
            ContainerStep::Stop { artifact } => {
                let record = self.preview_from_artifact(ctx.run_id, artifact).await?;
                let stopped = self.previews.stop(record.id).await?;
                to_payload(&stopped)
            }
            ContainerStep::Logs { artifact } => {
                let record = self.preview_from_artifact(ctx.run_id, artifact).await?;
                let logs = self.previews.logs(record.id).await?;
                Ok(json!({ "record_id": record.id, "logs": logs }))
            }
        }
    }

    async fn artifact_step(&self, ctx: &StepContext, step: &ArtifactStep) -> Result<Value, StepError> {
        self.put_artifact(ctx.run_id, &step.artifact, step.value.clone())
            .await?;
        Ok(json!({ "artifact": step.artifact, "value": step.value }))
    }

    async fn put_artifact(&self, run_id: i64, name: &str, value: Value) -> Result<(), StepError> {
        let name = name.to_string();
        self.db
            .call(move |db| db.put_artifact(run_id, &name, &value))
            .await
            .map_err(StepError::Store)?;
        Ok(())
    }

    async fn preview_from_artifact(
        &self,
        run_id: i64,
        artifact: &str,
    ) -> Result<ContainerRecord, StepError> {
        let name = artifact.to_string();
        let stored = self
            .db
            .call(move |db| db.get_artifact(run_id, &name))
            .await
            .map_err(StepError::Store)?
            .ok_or_else(|| {
                StepError::InvalidConfig(format!(
                    "artifact '{}' not found; run a container start step first",
                    artifact
                ))
            })?;
        serde_json::from_value(stored.value).map_err(|e| {
            StepError::InvalidConfig(format!(
                "artifact '{}' does not hold a preview record: {}",
                artifact, e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContainerSettings, GitSettings, PortSettings};
    use crate::container::ContainerManager;
    use crate::db::EngineDb;
    use crate::errors::ErrorKind;
    use crate::models::{ContainerStatus, GitOperationOutcome, RunStatus};
    use crate::ports::PortAllocator;
    use crate::process::fake::{FakeRunner, Reply};
    use std::fs;

    struct Fixture {
        db: DbHandle,
        dispatcher: StepDispatcher,
        runner: Arc<FakeRunner>,
        ctx: StepContext,
        _dir: tempfile::TempDir,
    }

    async fn fixture(runner: FakeRunner) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM scratch\n").unwrap();
        let runner = Arc::new(runner);
        let db = DbHandle::new(EngineDb::new_in_memory().unwrap());
        let run = db
            .call(|db| {
                let run = db.create_run(1, "preview", &serde_json::Value::Null)?;
                db.update_run_status(run.id, RunStatus::Running, None)
            })
            .await
            .unwrap();

        let ports = PortSettings {
            probe: false,
            ..PortSettings::default()
        };
        let allocator = PortAllocator::new(db.clone(), &ports).unwrap();
        let manager = ContainerManager::new(runner.clone(), ContainerSettings::default());
        let previews = Arc::new(PreviewService::new(db.clone(), allocator, manager));
        let git = Arc::new(GitReconciler::new(runner.clone(), GitSettings::default()));

        Fixture {
            dispatcher: StepDispatcher::new(db.clone(), git, previews),
            ctx: StepContext {
                run_id: run.id,
                project_id: 1,
                project_path: dir.path().to_path_buf(),
                phase: "preview".into(),
            },
            db,
            runner,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_git_branch_payload_lists_commands() {
        let f = fixture(
            FakeRunner::new()
                .on("git symbolic-ref", Reply::ok("main\n"))
                .on("git show-ref", Reply::fail(1, "")),
        )
        .await;
        let config = StepConfig::Git(GitStep::Branch {
            branch: "feature/x".into(),
            from: None,
        });

        let payload = f.dispatcher.dispatch(&f.ctx, &config).await.unwrap();
        let outcome: GitOperationOutcome = serde_json::from_value(payload).unwrap();
        assert_eq!(outcome.commands, vec!["git checkout -b feature/x".to_string()]);
        assert_eq!(
            f.runner.specs().last().unwrap().cwd,
            f.ctx.project_path
        );
    }

    #[tokio::test]
    async fn test_invalid_config_runs_nothing() {
        let f = fixture(FakeRunner::new()).await;
        let config = StepConfig::Git(GitStep::Branch {
            branch: "no spaces allowed".into(),
            from: None,
        });
        let err = f.dispatcher.dispatch(&f.ctx, &config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(f.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_artifact_step_persists_value() {
        let f = fixture(FakeRunner::new()).await;
        let config = StepConfig::Artifact(ArtifactStep {
            artifact: "plan".into(),
            value: json!({"files": ["a.rs"]}),
        });
        f.dispatcher.dispatch(&f.ctx, &config).await.unwrap();

        let run_id = f.ctx.run_id;
        let stored = f
            .db
            .call(move |db| db.get_artifact(run_id, "plan"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.value, json!({"files": ["a.rs"]}));
    }

    #[tokio::test]
    async fn test_container_start_then_stop_through_artifact() {
        let f = fixture(FakeRunner::new().on("docker run", Reply::ok("cafe\n"))).await;

        let start = StepConfig::Container(ContainerStep::Start {
            slots: SlotRequest::new(),
            config: None,
            artifact: "preview".into(),
        });
        let payload = f.dispatcher.dispatch(&f.ctx, &start).await.unwrap();
        let record: ContainerRecord = serde_json::from_value(payload).unwrap();
        assert_eq!(record.ports["app"], 5000);
        assert_eq!(record.container_ids, vec!["cafe".to_string()]);

        let stop = StepConfig::Container(ContainerStep::Stop {
            artifact: "preview".into(),
        });
        let payload = f.dispatcher.dispatch(&f.ctx, &stop).await.unwrap();
        let stopped: ContainerRecord = serde_json::from_value(payload).unwrap();
        assert_eq!(stopped.status, ContainerStatus::Stopped);
        assert!(f.runner.calls().contains(&"docker rm -f cafe".to_string()));
    }

    #[tokio::test]
    async fn test_stop_without_start_is_invalid() {
        let f = fixture(FakeRunner::new()).await;
        let stop = StepConfig::Container(ContainerStep::Stop {
            artifact: "preview".into(),
        });
        let err = f.dispatcher.dispatch(&f.ctx, &stop).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(f.runner.calls().is_empty());
    }
}
