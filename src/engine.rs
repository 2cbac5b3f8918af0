//! Composition root: builds every collaborator from an [`EngineConfig`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::EngineConfig;
use crate::container::{ContainerManager, PreviewService};
use crate::db::{DbHandle, EngineDb};
use crate::driver::WorkflowDriver;
use crate::git::GitReconciler;
use crate::ports::PortAllocator;
use crate::process::{ProcessRunner, SystemRunner};
use crate::steps::StepDispatcher;

pub struct Engine {
    pub config: EngineConfig,
    pub project_dir: PathBuf,
    pub db: DbHandle,
    pub git: Arc<GitReconciler>,
    pub ports: PortAllocator,
    pub previews: Arc<PreviewService>,
    pub driver: Arc<WorkflowDriver>,
}

impl Engine {
    /// Load `.forge/engine.toml` from `project_dir` and open the store it
    /// names. External commands run as real processes.
    pub fn open(project_dir: &Path) -> Result<Self> {
        let config = EngineConfig::load(project_dir)?;
        Self::open_with(project_dir, config)
    }

    pub fn open_with(project_dir: &Path, config: EngineConfig) -> Result<Self> {
        let db = EngineDb::new(&config.db_path)
            .with_context(|| format!("Failed to open {}", config.db_path.display()))?;
        Self::assemble(project_dir, config, DbHandle::new(db), Arc::new(SystemRunner))
    }

    /// Wire the engine over an existing store and process runner.
    pub fn assemble(
        project_dir: &Path,
        config: EngineConfig,
        db: DbHandle,
        runner: Arc<dyn ProcessRunner>,
    ) -> Result<Self> {
        config.validate()?;
        let git = Arc::new(GitReconciler::new(runner.clone(), config.git.clone()));
        let ports = PortAllocator::new(db.clone(), &config.ports)?;
        let manager = ContainerManager::new(runner, config.container.clone());
        let previews = Arc::new(PreviewService::new(db.clone(), ports.clone(), manager));
        let dispatcher = Arc::new(StepDispatcher::new(db.clone(), git.clone(), previews.clone()));
        let driver = Arc::new(WorkflowDriver::new(
            db.clone(),
            dispatcher,
            config.steps.retry.clone(),
            config.steps.timeout(),
        ));
        debug!(project = %project_dir.display(), db = %config.db_path.display(), "engine assembled");

        Ok(Self {
            config,
            project_dir: project_dir.to_path_buf(),
            db,
            git,
            ports,
            previews,
            driver,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{WorkflowDefinition, WorkflowStartRequest};
    use crate::models::RunStatus;
    use crate::process::fake::FakeRunner;
    use std::fs;

    #[test]
    fn test_open_creates_store_under_project() {
        let dir = tempfile::tempdir().unwrap();
        let forge = dir.path().join(".forge");
        fs::create_dir_all(&forge).unwrap();
        fs::write(forge.join("engine.toml"), "[ports]\nrange_start = 7000\nrange_end = 7009\n")
            .unwrap();

        let engine = Engine::open(dir.path()).unwrap();
        assert_eq!(engine.ports.range().start(), 7000);
        assert_eq!(engine.ports.range().len(), 10);
        assert!(dir.path().join(".forge").join("engine.db").exists());
    }

    #[test]
    fn test_assemble_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.steps.retry.max_attempts = 0;
        let db = DbHandle::new(EngineDb::new_in_memory().unwrap());
        assert!(Engine::assemble(dir.path(), config, db, Arc::new(FakeRunner::new())).is_err());
    }

    #[tokio::test]
    async fn test_assembled_engine_runs_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let db = DbHandle::new(EngineDb::new_in_memory().unwrap());
        let engine = Engine::assemble(
            dir.path(),
            EngineConfig::default(),
            db,
            Arc::new(FakeRunner::new()),
        )
        .unwrap();
        let def: WorkflowDefinition = serde_yaml::from_str(
            "name: note\nphases:\n  - name: only\n    steps:\n      - name: save\n        type: artifact\n        artifact: note\n        value: hi\n",
        )
        .unwrap();
        let request = WorkflowStartRequest {
            workflow: "note".into(),
            args: serde_json::Value::Null,
        };

        let run = engine
            .driver
            .start(1, dir.path(), &request, &def)
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
    }
}
