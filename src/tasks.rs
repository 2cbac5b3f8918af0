//! Fire-and-forget side work (best-effort cleanup).
//!
//! Tasks are spawned on the current tokio runtime. Failures are logged and
//! never reach the caller that spawned them.

use std::future::Future;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub fn spawn_logged<F>(name: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    debug!(task = name, "spawning background task");
    tokio::spawn(async move {
        match fut.await {
            Ok(()) => debug!(task = name, "background task finished"),
            Err(e) => warn!(task = name, error = %format!("{e:#}"), "background task failed"),
        }
    })
}
