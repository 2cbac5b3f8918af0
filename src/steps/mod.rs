//! Durable step execution.
//!
//! A step is identified by `<phase>.<step>`, both parts normalized to
//! kebab-case so "Commit Changes" and "commit-changes" name the same step.
//! A successful result is stored once per run and replayed on re-entry; the
//! handler is not called again. Failed invocations are stored for audit and
//! re-executed on the next attempt.

mod config;
mod dispatch;

pub use config::{ArtifactStep, ContainerStep, GitStep, StepConfig};
pub use dispatch::StepDispatcher;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::StepStore;
use crate::errors::StepError;
use crate::models::StepResult;
use crate::naming::kebab_case;
use crate::timeout;

/// Ambient context of the step being run.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: i64,
    pub project_id: i64,
    pub project_path: PathBuf,
    pub phase: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepOptions {
    /// Deadline for the handler. `None` leaves it to the handler's own
    /// operation deadlines.
    pub timeout: Option<Duration>,
    /// Abort the handler as soon as the run is cancelled instead of letting it
    /// settle.
    pub interruptible: bool,
}

/// Canonical kebab-case form of a step label.
pub fn normalize_step_id(label: &str) -> Result<String, StepError> {
    let id = kebab_case(label);
    if id.is_empty() {
        return Err(StepError::InvalidStepId(label.to_string()));
    }
    Ok(id)
}

/// `<phase>.<step>`, both normalized.
pub fn qualified_step_id(phase: &str, label: &str) -> Result<String, StepError> {
    Ok(format!(
        "{}.{}",
        normalize_step_id(phase)?,
        normalize_step_id(label)?
    ))
}

pub struct StepRuntime {
    store: Arc<dyn StepStore>,
    cancel: CancellationToken,
}

impl StepRuntime {
    pub fn new(store: Arc<dyn StepStore>, cancel: CancellationToken) -> Self {
        Self { store, cancel }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `handler` as step `label` of `ctx.phase`, unless it already
    /// succeeded in this run.
    ///
    /// Returns the stored result on replay (`replayed == true`). A handler
    /// error is persisted as a failed result and then returned.
    pub async fn run<F, Fut>(
        &self,
        ctx: &StepContext,
        label: &str,
        options: StepOptions,
        handler: F,
    ) -> Result<StepResult, StepError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, StepError>>,
    {
        let step_id = qualified_step_id(&ctx.phase, label)?;

        if let Some(mut memo) = self
            .store
            .find_step_result(ctx.run_id, &step_id)
            .await
            .map_err(StepError::Store)?
        {
            debug!(run = ctx.run_id, step = %step_id, "replaying completed step");
            memo.replayed = true;
            return Ok(memo);
        }

        if self.cancel.is_cancelled() {
            return Err(StepError::Cancelled { step_id });
        }

        self.store
            .set_current_step(ctx.run_id, Some(&step_id))
            .await
            .map_err(StepError::Store)?;
        info!(run = ctx.run_id, step = %step_id, "step started");

        let started = Instant::now();
        let outcome = self.execute(&step_id, options, handler()).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match &outcome {
            Ok(payload) => StepResult {
                run_id: ctx.run_id,
                step_id: step_id.clone(),
                success: true,
                payload: payload.clone(),
                duration_ms,
                error: None,
                error_kind: None,
                replayed: false,
            },
            Err(e) => StepResult {
                run_id: ctx.run_id,
                step_id: step_id.clone(),
                success: false,
                payload: Value::Null,
                duration_ms,
                error: Some(e.to_string()),
                error_kind: Some(e.kind()),
                replayed: false,
            },
        };

        self.store
            .save_step_result(&result)
            .await
            .map_err(StepError::Store)?;
        self.store
            .set_current_step(ctx.run_id, None)
            .await
            .map_err(StepError::Store)?;

        match outcome {
            Ok(_) => {
                info!(run = ctx.run_id, step = %step_id, duration_ms, "step succeeded");
                Ok(result)
            }
            Err(e) => {
                warn!(run = ctx.run_id, step = %step_id, kind = e.kind().as_str(), error = %e, "step failed");
                Err(e)
            }
        }
    }

    async fn execute<Fut>(
        &self,
        step_id: &str,
        options: StepOptions,
        fut: Fut,
    ) -> Result<Value, StepError>
    where
        Fut: Future<Output = Result<Value, StepError>>,
    {
        let bounded = async {
            match options.timeout {
                Some(after) => {
                    timeout::guard_result(after, fut, |after| StepError::Timeout {
                        step_id: step_id.to_string(),
                        after,
                    })
                    .await
                }
                None => fut.await,
            }
        };

        if !options.interruptible {
            return bounded.await;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StepError::Cancelled {
                step_id: step_id.to_string(),
            }),
            result = bounded => result,
        }
    }
}
