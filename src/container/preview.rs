use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{info, instrument, warn};

use super::{BuildRequest, ContainerHandle, ContainerManager, detect_config};
use crate::db::DbHandle;
use crate::errors::ContainerError;
use crate::models::{ContainerRecord, ContainerStatus, SlotRequest};
use crate::ports::PortAllocator;
use crate::tasks;

/// Ties port reservation, the container runtime and the containers table
/// together: a preview is a ContainerRecord plus whatever runs under its name.
pub struct PreviewService {
    db: DbHandle,
    allocator: PortAllocator,
    manager: ContainerManager,
}

pub fn preview_name(record_id: i64) -> String {
    format!("forge-preview-{}", record_id)
}

impl PreviewService {
    pub fn new(db: DbHandle, allocator: PortAllocator, manager: ContainerManager) -> Self {
        Self {
            db,
            allocator,
            manager,
        }
    }

    /// Detect the configuration, reserve ports, build and run. A failed start
    /// releases the reservation before the error is returned; a start that is
    /// dropped midway (step timeout, cancellation) releases it in the
    /// background.
    #[instrument(skip(self, slots), fields(dir = %dir.display()))]
    pub async fn start(
        &self,
        project_id: i64,
        dir: &Path,
        custom_config: Option<&Path>,
        slots: SlotRequest,
    ) -> Result<ContainerRecord, ContainerError> {
        let config = detect_config(dir, custom_config)?;
        let record = self.allocator.allocate(project_id, dir, slots).await?;

        let request = BuildRequest {
            config,
            ports: record.ports.clone(),
            name: preview_name(record.id),
        };
        let pending = PendingStart {
            allocator: self.allocator.clone(),
            manager: self.manager.clone(),
            record_id: record.id,
            dir: dir.to_path_buf(),
            handle: ContainerHandle::by_name(&request),
            armed: true,
        };

        // The manager cleans up after its own failures.
        let handle = match self.manager.build_and_run(&request).await {
            Ok(handle) => handle,
            Err(e) => {
                pending.release().await;
                return Err(e);
            }
        };

        let record_id = record.id;
        let runtime = handle.clone();
        let stored = self
            .db
            .call(move |db| {
                db.set_container_runtime(
                    record_id,
                    &runtime.container_ids,
                    runtime.compose_project.as_deref(),
                )
            })
            .await;
        match stored {
            Ok(record) => {
                pending.disarm();
                info!(record = record.id, ports = ?record.ports, "preview running");
                Ok(record)
            }
            Err(e) => {
                pending.tear_down(handle).await;
                Err(ContainerError::Store(e))
            }
        }
    }

    async fn get(&self, record_id: i64) -> Result<ContainerRecord, ContainerError> {
        self.db
            .call(move |db| db.get_container(record_id))
            .await
            .map_err(ContainerError::Store)?
            .ok_or(ContainerError::RecordNotFound { id: record_id })
    }

    /// Tear the preview down and release its ports. Stopping a stopped
    /// preview returns the record unchanged.
    pub async fn stop(&self, record_id: i64) -> Result<ContainerRecord, ContainerError> {
        let record = self.get(record_id).await?;
        if record.status == ContainerStatus::Stopped {
            return Ok(record);
        }
        self.manager
            .stop(Path::new(&record.work_dir), &ContainerHandle::from(&record))
            .await?;
        self.allocator
            .release(record_id)
            .await?
            .ok_or(ContainerError::RecordNotFound { id: record_id })
    }

    pub async fn logs(&self, record_id: i64) -> Result<String, ContainerError> {
        let record = self.get(record_id).await?;
        Ok(self
            .manager
            .get_logs(Path::new(&record.work_dir), &record.container_ids)
            .await)
    }

    pub async fn list(
        &self,
        project_id: Option<i64>,
        running_only: bool,
    ) -> Result<Vec<ContainerRecord>, ContainerError> {
        self.db
            .call(move |db| db.list_containers(project_id, running_only))
            .await
            .map_err(ContainerError::Store)
    }
}

/// A port reservation whose preview has not reported its runtime ids yet.
/// Dropping it armed stops whatever runs under the preview name and releases
/// the ports from a background task.
struct PendingStart {
    allocator: PortAllocator,
    manager: ContainerManager,
    record_id: i64,
    dir: PathBuf,
    handle: ContainerHandle,
    armed: bool,
}

impl PendingStart {
    fn disarm(mut self) {
        self.armed = false;
    }

    /// Nothing was left running; give the ports back.
    async fn release(mut self) {
        self.armed = false;
        if let Err(e) = self.allocator.release(self.record_id).await {
            warn!(record = self.record_id, error = %e, "failed to release ports");
        }
    }

    /// `handle` is running; take it down before giving the ports back.
    async fn tear_down(mut self, handle: ContainerHandle) {
        self.armed = false;
        if let Err(e) =
            tear_down_and_release(&self.manager, &self.allocator, self.record_id, &self.dir, &handle)
                .await
        {
            warn!(record = self.record_id, error = %format!("{e:#}"), "failed to tear down preview");
        }
    }
}

impl Drop for PendingStart {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(record = self.record_id, "preview start abandoned outside a runtime; ports stay reserved");
            return;
        }
        warn!(record = self.record_id, "preview start interrupted, releasing reservation");
        let manager = self.manager.clone();
        let allocator = self.allocator.clone();
        let record_id = self.record_id;
        let dir = self.dir.clone();
        let handle = self.handle.clone();
        tasks::spawn_logged("release-interrupted-preview", async move {
            tear_down_and_release(&manager, &allocator, record_id, &dir, &handle).await
        });
    }
}

/// Ports stay reserved when the teardown fails: something may still be
/// publishing them, and `stop` can retry.
async fn tear_down_and_release(
    manager: &ContainerManager,
    allocator: &PortAllocator,
    record_id: i64,
    dir: &Path,
    handle: &ContainerHandle,
) -> anyhow::Result<()> {
    manager
        .stop(dir, handle)
        .await
        .with_context(|| format!("Preview {} could not be stopped; ports stay reserved", record_id))?;
    allocator.release(record_id).await?;
    Ok(())
}
