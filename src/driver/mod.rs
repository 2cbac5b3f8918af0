//! Workflow driver.
//!
//! Walks a [`WorkflowDefinition`] phase by phase, running each step through
//! the [`StepRuntime`] and moving the run through its statuses. Retries follow
//! the configured [`RetryPolicy`]; a run resumed after a failure replays every
//! step that already succeeded and re-executes the rest.

mod definition;

pub use definition::{PhaseDefinition, StepDefinition, WorkflowDefinition, workflows_dir};

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::db::DbHandle;
use crate::errors::{ErrorKind, StepError};
use crate::models::{RunStatus, WorkflowRun};
use crate::steps::{StepContext, StepDispatcher, StepRuntime};

/// Which step failures are worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryOn {
    Timeout,
    Any,
    Never,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per step, including the first.
    pub max_attempts: u32,
    pub retry_on: RetryOn,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            retry_on: RetryOn::Timeout,
        }
    }
}

impl RetryPolicy {
    /// Bad input and cancellation never succeed on a second try.
    pub fn should_retry(&self, kind: ErrorKind) -> bool {
        match self.retry_on {
            RetryOn::Never => false,
            RetryOn::Timeout => kind == ErrorKind::Timeout,
            RetryOn::Any => !matches!(kind, ErrorKind::InvalidInput | ErrorKind::Cancelled),
        }
    }
}

/// Inbound request to start a workflow. `args` are stored with the run and
/// not interpreted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStartRequest {
    pub workflow: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

pub struct WorkflowDriver {
    db: DbHandle,
    dispatcher: Arc<StepDispatcher>,
    retry: RetryPolicy,
    default_timeout: Option<Duration>,
    active: Mutex<HashMap<i64, CancellationToken>>,
}

enum Halt {
    Failed(String),
    Cancelled,
}

impl WorkflowDriver {
    pub fn new(
        db: DbHandle,
        dispatcher: Arc<StepDispatcher>,
        retry: RetryPolicy,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            db,
            dispatcher,
            retry,
            default_timeout,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Record a pending run for `request` without executing it.
    pub async fn prepare(
        &self,
        project_id: i64,
        request: &WorkflowStartRequest,
    ) -> Result<WorkflowRun> {
        let workflow = request.workflow.clone();
        let args = request.args.clone();
        self.db
            .call(move |db| db.create_run(project_id, &workflow, &args))
            .await
    }

    /// Create a run for `request` and drive it to a terminal status.
    pub async fn start(
        &self,
        project_id: i64,
        project_path: &Path,
        request: &WorkflowStartRequest,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowRun> {
        definition.validate()?;
        let run = self.prepare(project_id, request).await?;
        info!(run = run.id, workflow = %definition.name, "workflow started");
        self.execute(run, project_path, definition).await
    }

    /// Continue an existing run. Completed and cancelled runs are returned
    /// unchanged.
    pub async fn resume(
        &self,
        run_id: i64,
        project_path: &Path,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowRun> {
        definition.validate()?;
        let run = self
            .db
            .call(move |db| db.get_run(run_id))
            .await?
            .with_context(|| format!("Workflow run {} not found", run_id))?;
        if matches!(run.status, RunStatus::Completed | RunStatus::Cancelled) {
            info!(run = run_id, status = run.status.as_str(), "nothing to resume");
            return Ok(run);
        }
        info!(run = run_id, workflow = %definition.name, "workflow resumed");
        self.execute(run, project_path, definition).await
    }

    /// Stop scheduling further steps of `run_id`.
    ///
    /// A run executing in this process has its token fired; the driver marks
    /// it cancelled once the current step settles. A run that is `running`
    /// elsewhere gets `cancel_requested` set and halts before its next step.
    /// Runs nobody is executing are cancelled on the spot. Terminal runs are
    /// returned unchanged.
    pub async fn cancel(&self, run_id: i64) -> Result<WorkflowRun> {
        let local = self.lock_active()?.get(&run_id).cloned();
        let run = self
            .db
            .call(move |db| db.get_run(run_id))
            .await?
            .with_context(|| format!("Workflow run {} not found", run_id))?;
        if run.status.is_terminal() {
            return Ok(run);
        }
        if let Some(token) = local {
            info!(run = run_id, step = ?run.current_step, "cancelling after current step");
            token.cancel();
            return Ok(run);
        }
        if run.status == RunStatus::Running {
            info!(run = run_id, "cancel requested for run executing elsewhere");
            return self.db.call(move |db| db.request_cancel(run_id)).await;
        }
        info!(run = run_id, "workflow cancelled");
        self.db
            .call(move |db| db.update_run_status(run_id, RunStatus::Cancelled, None))
            .await
    }

    fn lock_active(&self) -> Result<std::sync::MutexGuard<'_, HashMap<i64, CancellationToken>>> {
        self.active
            .lock()
            .map_err(|e| anyhow::anyhow!("Active run registry poisoned: {}", e))
    }

    async fn execute(
        &self,
        run: WorkflowRun,
        project_path: &Path,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowRun> {
        let token = CancellationToken::new();
        self.lock_active()?.insert(run.id, token.clone());
        let result = self.drive(&run, project_path, definition, token).await;
        self.lock_active()?.remove(&run.id);
        result
    }

    async fn drive(
        &self,
        run: &WorkflowRun,
        project_path: &Path,
        definition: &WorkflowDefinition,
        token: CancellationToken,
    ) -> Result<WorkflowRun> {
        let run_id = run.id;
        self.db
            .call(move |db| db.update_run_status(run_id, RunStatus::Running, None))
            .await?;
        let runtime = StepRuntime::new(Arc::new(self.db.clone()), token.clone());

        for phase in &definition.phases {
            let phase_name = phase.name.clone();
            self.db
                .call(move |db| db.set_current_phase(run_id, Some(&phase_name)))
                .await?;
            let ctx = StepContext {
                run_id,
                project_id: run.project_id,
                project_path: project_path.to_path_buf(),
                phase: phase.name.clone(),
            };

            for step in &phase.steps {
                if self.cancel_pending(run_id, &token).await? {
                    return self.finish(run_id, Halt::Cancelled).await;
                }
                if let Err(halt) = self.run_step(&runtime, &ctx, step).await {
                    return self.finish(run_id, halt).await;
                }
            }
        }
        if self.cancel_pending(run_id, &token).await? {
            return self.finish(run_id, Halt::Cancelled).await;
        }

        self.db
            .call(move |db| {
                let current = db.get_run(run_id)?;
                match current {
                    Some(run) if run.status.is_terminal() => Ok(run),
                    _ => db.update_run_status(run_id, RunStatus::Completed, None),
                }
            })
            .await
            .inspect(|run| info!(run = run.id, status = run.status.as_str(), "workflow finished"))
    }

    async fn run_step(
        &self,
        runtime: &StepRuntime,
        ctx: &StepContext,
        step: &StepDefinition,
    ) -> Result<(), Halt> {
        let options = step.options(self.default_timeout);
        let mut attempt = 1;
        loop {
            let outcome = runtime
                .run(ctx, &step.name, options, || {
                    self.dispatcher.dispatch(ctx, &step.config)
                })
                .await;
            let err = match outcome {
                Ok(_) => return Ok(()),
                Err(e) => e,
            };
            if matches!(err, StepError::Cancelled { .. }) || runtime.cancel_token().is_cancelled() {
                return Err(Halt::Cancelled);
            }
            if attempt < self.retry.max_attempts && self.retry.should_retry(err.kind()) {
                warn!(
                    run = ctx.run_id,
                    step = %step.name,
                    attempt,
                    max_attempts = self.retry.max_attempts,
                    error = %err,
                    "retrying step"
                );
                attempt += 1;
                continue;
            }
            return Err(Halt::Failed(err.to_string()));
        }
    }

    async fn cancel_pending(&self, run_id: i64, token: &CancellationToken) -> Result<bool> {
        if token.is_cancelled() {
            return Ok(true);
        }
        let run = self.db.call(move |db| db.get_run(run_id)).await?;
        Ok(run.is_some_and(|r| r.cancel_requested || r.status == RunStatus::Cancelled))
    }

    async fn finish(&self, run_id: i64, halt: Halt) -> Result<WorkflowRun> {
        let (status, error) = match halt {
            Halt::Failed(message) => (RunStatus::Failed, Some(message)),
            Halt::Cancelled => (RunStatus::Cancelled, None),
        };
        let run = self
            .db
            .call(move |db| {
                if let Some(run) = db.get_run(run_id)?
                    && run.status.is_terminal()
                {
                    return Ok(run);
                }
                db.update_run_status(run_id, status, error.as_deref())
            })
            .await?;
        match run.status {
            RunStatus::Failed => warn!(
                run = run_id,
                error = run.error.as_deref().unwrap_or_default(),
                "workflow failed"
            ),
            _ => info!(run = run_id, status = run.status.as_str(), "workflow halted"),
        }
        Ok(run)
    }
}
