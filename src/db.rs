use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};

use crate::errors::{ErrorKind, PortError};
use crate::models::*;

/// Async-safe handle to the engine database.
///
/// Wraps `EngineDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<EngineDb>>,
}

impl DbHandle {
    pub fn new(db: EngineDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&EngineDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

/// Persistence the step runtime needs: memoized lookups and result writes.
#[async_trait]
pub trait StepStore: Send + Sync {
    /// The successful result for `(run_id, step_id)`, if one was recorded.
    async fn find_step_result(&self, run_id: i64, step_id: &str) -> Result<Option<StepResult>>;

    async fn save_step_result(&self, result: &StepResult) -> Result<()>;

    /// Record which step a run is executing (`None` once it settles).
    async fn set_current_step(&self, run_id: i64, step_id: Option<&str>) -> Result<()>;
}

#[async_trait]
impl StepStore for DbHandle {
    async fn find_step_result(&self, run_id: i64, step_id: &str) -> Result<Option<StepResult>> {
        let step_id = step_id.to_string();
        self.call(move |db| db.find_successful_step(run_id, &step_id))
            .await
    }

    async fn save_step_result(&self, result: &StepResult) -> Result<()> {
        let result = result.clone();
        self.call(move |db| db.save_step_result(&result).map(|_| ()))
            .await
    }

    async fn set_current_step(&self, run_id: i64, step_id: Option<&str>) -> Result<()> {
        let step_id = step_id.map(str::to_string);
        self.call(move |db| db.set_current_step(run_id, step_id.as_deref()))
            .await
    }
}

pub struct EngineDb {
    conn: Connection,
}

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

impl EngineDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        conn.busy_timeout(BUSY_TIMEOUT)
            .context("Failed to set busy timeout")?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("Failed to enable WAL")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS workflow_runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL,
                    workflow TEXT NOT NULL,
                    args TEXT NOT NULL DEFAULT 'null',
                    status TEXT NOT NULL DEFAULT 'pending',
                    current_phase TEXT,
                    current_step TEXT,
                    error TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                    completed_at TEXT,
                    cancel_requested INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS step_results (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id INTEGER NOT NULL REFERENCES workflow_runs(id) ON DELETE CASCADE,
                    step_id TEXT NOT NULL,
                    success INTEGER NOT NULL,
                    payload TEXT NOT NULL DEFAULT 'null',
                    duration_ms INTEGER NOT NULL DEFAULT 0,
                    error TEXT,
                    error_kind TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS artifacts (
                    run_id INTEGER NOT NULL REFERENCES workflow_runs(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    value TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    PRIMARY KEY (run_id, name)
                );

                CREATE TABLE IF NOT EXISTS containers (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL,
                    status TEXT NOT NULL DEFAULT 'running',
                    ports TEXT NOT NULL DEFAULT '{}',
                    work_dir TEXT NOT NULL,
                    container_ids TEXT NOT NULL DEFAULT '[]',
                    compose_project TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    stopped_at TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_workflow_runs_project ON workflow_runs(project_id);
                CREATE INDEX IF NOT EXISTS idx_step_results_run ON step_results(run_id, step_id);
                CREATE UNIQUE INDEX IF NOT EXISTS idx_step_results_success
                    ON step_results(run_id, step_id) WHERE success = 1;
                CREATE INDEX IF NOT EXISTS idx_containers_status ON containers(status);
                ",
            )
            .context("Failed to create tables")?;

        // Stores created before cancel requests existed.
        match self.conn.execute(
            "ALTER TABLE workflow_runs ADD COLUMN cancel_requested INTEGER NOT NULL DEFAULT 0",
            [],
        ) {
            Ok(_) => {}
            Err(e) if e.to_string().contains("duplicate column") => {}
            Err(e) => return Err(anyhow::anyhow!("Failed to add cancel_requested column: {}", e)),
        }
        Ok(())
    }

    // ── Workflow runs ─────────────────────────────────────────────────

    pub fn create_run(
        &self,
        project_id: i64,
        workflow: &str,
        args: &serde_json::Value,
    ) -> Result<WorkflowRun> {
        self.conn
            .execute(
                "INSERT INTO workflow_runs (project_id, workflow, args) VALUES (?1, ?2, ?3)",
                params![project_id, workflow, args.to_string()],
            )
            .context("Failed to insert workflow run")?;
        let id = self.conn.last_insert_rowid();
        self.get_run(id)?.context("Workflow run not found after insert")
    }

    pub fn get_run(&self, id: i64) -> Result<Option<WorkflowRun>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, project_id, workflow, args, status, current_phase, current_step, error, created_at, updated_at, completed_at, cancel_requested
                 FROM workflow_runs WHERE id = ?1",
                params![id],
                WorkflowRunRow::from_row,
            )
            .optional()
            .context("Failed to query workflow run")?;
        row.map(WorkflowRunRow::into_workflow_run).transpose()
    }

    /// Runs newest first, optionally for one project.
    pub fn list_runs(&self, project_id: Option<i64>) -> Result<Vec<WorkflowRun>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, project_id, workflow, args, status, current_phase, current_step, error, created_at, updated_at, completed_at, cancel_requested
                 FROM workflow_runs WHERE (?1 IS NULL OR project_id = ?1) ORDER BY id DESC",
            )
            .context("Failed to prepare list_runs")?;
        let rows = stmt
            .query_map(params![project_id], WorkflowRunRow::from_row)
            .context("Failed to query workflow runs")?;
        let mut runs = Vec::new();
        for row in rows {
            let r = row.context("Failed to read workflow_run row")?;
            runs.push(r.into_workflow_run()?);
        }
        Ok(runs)
    }

    /// Move a run to `status`. Terminal statuses clear `current_step` and set
    /// `completed_at`; any other status clears `completed_at` again.
    pub fn update_run_status(
        &self,
        id: i64,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<WorkflowRun> {
        let result = if status.is_terminal() {
            self.conn.execute(
                "UPDATE workflow_runs
                 SET status = ?1, error = ?2, current_step = NULL,
                     updated_at = datetime('now'), completed_at = datetime('now')
                 WHERE id = ?3",
                params![status.as_str(), error, id],
            )
        } else {
            self.conn.execute(
                "UPDATE workflow_runs
                 SET status = ?1, error = ?2, updated_at = datetime('now'), completed_at = NULL,
                     current_step = CASE WHEN ?1 = 'running' THEN current_step ELSE NULL END
                 WHERE id = ?3",
                params![status.as_str(), error, id],
            )
        };
        let updated = result.context("Failed to update workflow run status")?;
        if updated == 0 {
            anyhow::bail!("Workflow run {} not found", id);
        }
        self.get_run(id)?
            .context("Workflow run not found after update")
    }

    /// Flag a non-terminal run for cancellation. The driver executing it
    /// halts before its next step and records the cancelled status itself.
    pub fn request_cancel(&self, id: i64) -> Result<WorkflowRun> {
        self.conn
            .execute(
                "UPDATE workflow_runs SET cancel_requested = 1, updated_at = datetime('now')
                 WHERE id = ?1 AND status NOT IN ('completed', 'failed', 'cancelled')",
                params![id],
            )
            .context("Failed to request cancellation")?;
        self.get_run(id)?
            .with_context(|| format!("Workflow run {} not found", id))
    }

    pub fn set_current_phase(&self, id: i64, phase: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE workflow_runs SET current_phase = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![phase, id],
            )
            .context("Failed to update current phase")?;
        Ok(())
    }

    /// Only a running run may hold a current step; other statuses are left
    /// untouched.
    pub fn set_current_step(&self, id: i64, step_id: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE workflow_runs SET current_step = ?1, updated_at = datetime('now')
                 WHERE id = ?2 AND (?1 IS NULL OR status = 'running')",
                params![step_id, id],
            )
            .context("Failed to update current step")?;
        Ok(())
    }

    // ── Step results ──────────────────────────────────────────────────

    pub fn find_successful_step(&self, run_id: i64, step_id: &str) -> Result<Option<StepResult>> {
        let row = self
            .conn
            .query_row(
                "SELECT run_id, step_id, success, payload, duration_ms, error, error_kind
                 FROM step_results WHERE run_id = ?1 AND step_id = ?2 AND success = 1",
                params![run_id, step_id],
                StepResultRow::from_row,
            )
            .optional()
            .context("Failed to query step result")?;
        row.map(StepResultRow::into_step_result).transpose()
    }

    /// Persist a step result. Returns false when a successful result for the
    /// same step already exists (the first one wins).
    pub fn save_step_result(&self, result: &StepResult) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO step_results
                 (run_id, step_id, success, payload, duration_ms, error, error_kind)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    result.run_id,
                    result.step_id,
                    result.success,
                    result.payload.to_string(),
                    result.duration_ms as i64,
                    result.error,
                    result.error_kind.map(|k| k.as_str()),
                ],
            )
            .context("Failed to insert step result")?;
        Ok(inserted > 0)
    }

    /// Every recorded invocation for a run, oldest first, failures included.
    pub fn list_step_results(&self, run_id: i64) -> Result<Vec<StepResult>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT run_id, step_id, success, payload, duration_ms, error, error_kind
                 FROM step_results WHERE run_id = ?1 ORDER BY id ASC",
            )
            .context("Failed to prepare list_step_results")?;
        let rows = stmt
            .query_map(params![run_id], StepResultRow::from_row)
            .context("Failed to query step results")?;
        let mut results = Vec::new();
        for row in rows {
            let r = row.context("Failed to read step_result row")?;
            results.push(r.into_step_result()?);
        }
        Ok(results)
    }

    // ── Artifacts ─────────────────────────────────────────────────────

    pub fn put_artifact(&self, run_id: i64, name: &str, value: &serde_json::Value) -> Result<Artifact> {
        self.conn
            .execute(
                "INSERT INTO artifacts (run_id, name, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(run_id, name) DO UPDATE SET value = excluded.value, created_at = datetime('now')",
                params![run_id, name, value.to_string()],
            )
            .context("Failed to upsert artifact")?;
        self.get_artifact(run_id, name)?
            .context("Artifact not found after upsert")
    }

    pub fn get_artifact(&self, run_id: i64, name: &str) -> Result<Option<Artifact>> {
        let row = self
            .conn
            .query_row(
                "SELECT run_id, name, value, created_at FROM artifacts WHERE run_id = ?1 AND name = ?2",
                params![run_id, name],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query artifact")?;
        row.map(|(run_id, name, value, created_at)| {
            Ok(Artifact {
                run_id,
                value: serde_json::from_str(&value)
                    .with_context(|| format!("Failed to parse artifact '{}'", name))?,
                name,
                created_at,
            })
        })
        .transpose()
    }

    // ── Containers / port reservations ───────────────────────────────

    /// Reserve ports by inserting a `running` ContainerRecord.
    ///
    /// Runs inside `BEGIN IMMEDIATE`: the write lock is taken before the
    /// ports in use are read, so concurrent allocators (other connections or
    /// other processes) serialize here. `plan` sees every port held by a
    /// running record and returns the assignment; an error from `plan`
    /// rolls back and leaves nothing reserved.
    pub fn reserve_ports<F>(
        &self,
        project_id: i64,
        work_dir: &str,
        plan: F,
    ) -> std::result::Result<ContainerRecord, PortError>
    where
        F: FnOnce(&HashSet<u16>) -> std::result::Result<PortMap, PortError>,
    {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)
            .context("Failed to begin port reservation")
            .map_err(PortError::Store)?;

        let in_use = Self::running_ports_in(&tx).map_err(PortError::Store)?;
        let ports = plan(&in_use)?;

        let ports_json = serde_json::to_string(&ports)
            .context("Failed to serialize ports")
            .map_err(PortError::Store)?;
        tx.execute(
            "INSERT INTO containers (project_id, status, ports, work_dir) VALUES (?1, 'running', ?2, ?3)",
            params![project_id, ports_json, work_dir],
        )
        .context("Failed to insert container record")
        .map_err(PortError::Store)?;
        let id = tx.last_insert_rowid();
        tx.commit()
            .context("Failed to commit port reservation")
            .map_err(PortError::Store)?;

        self.get_container(id)
            .and_then(|r| r.context("Container record not found after insert"))
            .map_err(PortError::Store)
    }

    /// Ports held by every running record.
    pub fn running_ports(&self) -> Result<HashSet<u16>> {
        Self::running_ports_in(&self.conn)
    }

    fn running_ports_in(conn: &Connection) -> Result<HashSet<u16>> {
        let mut stmt = conn
            .prepare("SELECT ports FROM containers WHERE status = 'running'")
            .context("Failed to prepare running ports query")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context("Failed to query running ports")?;
        let mut ports = HashSet::new();
        for row in rows {
            let json = row.context("Failed to read ports column")?;
            let map: PortMap =
                serde_json::from_str(&json).context("Failed to parse container ports")?;
            ports.extend(map.into_values());
        }
        Ok(ports)
    }

    pub fn get_container(&self, id: i64) -> Result<Option<ContainerRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, project_id, status, ports, work_dir, container_ids, compose_project, created_at, stopped_at
                 FROM containers WHERE id = ?1",
                params![id],
                ContainerRow::from_row,
            )
            .optional()
            .context("Failed to query container")?;
        row.map(ContainerRow::into_container_record).transpose()
    }

    pub fn list_containers(
        &self,
        project_id: Option<i64>,
        running_only: bool,
    ) -> Result<Vec<ContainerRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, project_id, status, ports, work_dir, container_ids, compose_project, created_at, stopped_at
                 FROM containers
                 WHERE (?1 IS NULL OR project_id = ?1) AND (?2 = 0 OR status = 'running')
                 ORDER BY id ASC",
            )
            .context("Failed to prepare list_containers")?;
        let rows = stmt
            .query_map(params![project_id, running_only], ContainerRow::from_row)
            .context("Failed to query containers")?;
        let mut records = Vec::new();
        for row in rows {
            let r = row.context("Failed to read container row")?;
            records.push(r.into_container_record()?);
        }
        Ok(records)
    }

    /// Attach the runtime identifiers once the container is up.
    pub fn set_container_runtime(
        &self,
        id: i64,
        container_ids: &[String],
        compose_project: Option<&str>,
    ) -> Result<ContainerRecord> {
        let ids = serde_json::to_string(container_ids).context("Failed to serialize container ids")?;
        self.conn
            .execute(
                "UPDATE containers SET container_ids = ?1, compose_project = ?2 WHERE id = ?3",
                params![ids, compose_project, id],
            )
            .context("Failed to update container runtime ids")?;
        self.get_container(id)?
            .context("Container record not found after update")
    }

    /// Release the record's ports. Stopping a stopped record keeps its
    /// original `stopped_at`.
    pub fn mark_container_stopped(&self, id: i64) -> Result<Option<ContainerRecord>> {
        self.conn
            .execute(
                "UPDATE containers SET status = 'stopped', stopped_at = datetime('now')
                 WHERE id = ?1 AND status = 'running'",
                params![id],
            )
            .context("Failed to mark container stopped")?;
        self.get_container(id)
    }
}

// ── Row types ─────────────────────────────────────────────────────────

struct WorkflowRunRow {
    id: i64,
    project_id: i64,
    workflow: String,
    args: String,
    status: String,
    current_phase: Option<String>,
    current_step: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
    cancel_requested: bool,
}

impl WorkflowRunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            workflow: row.get(2)?,
            args: row.get(3)?,
            status: row.get(4)?,
            current_phase: row.get(5)?,
            current_step: row.get(6)?,
            error: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            completed_at: row.get(10)?,
            cancel_requested: row.get(11)?,
        })
    }

    fn into_workflow_run(self) -> Result<WorkflowRun> {
        let status = RunStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse workflow run status")?;
        let args = serde_json::from_str(&self.args).context("Failed to parse workflow args")?;
        Ok(WorkflowRun {
            id: self.id,
            project_id: self.project_id,
            workflow: self.workflow,
            args,
            status,
            current_phase: self.current_phase,
            current_step: self.current_step,
            error: self.error,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            cancel_requested: self.cancel_requested,
        })
    }
}

struct StepResultRow {
    run_id: i64,
    step_id: String,
    success: bool,
    payload: String,
    duration_ms: i64,
    error: Option<String>,
    error_kind: Option<String>,
}

impl StepResultRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            step_id: row.get(1)?,
            success: row.get(2)?,
            payload: row.get(3)?,
            duration_ms: row.get(4)?,
            error: row.get(5)?,
            error_kind: row.get(6)?,
        })
    }

    fn into_step_result(self) -> Result<StepResult> {
        let error_kind = self
            .error_kind
            .as_deref()
            .map(ErrorKind::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse step error kind")?;
        Ok(StepResult {
            payload: serde_json::from_str(&self.payload).context("Failed to parse step payload")?,
            run_id: self.run_id,
            step_id: self.step_id,
            success: self.success,
            duration_ms: self.duration_ms.max(0) as u64,
            error: self.error,
            error_kind,
            replayed: false,
        })
    }
}

struct ContainerRow {
    id: i64,
    project_id: i64,
    status: String,
    ports: String,
    work_dir: String,
    container_ids: String,
    compose_project: Option<String>,
    created_at: String,
    stopped_at: Option<String>,
}

impl ContainerRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            status: row.get(2)?,
            ports: row.get(3)?,
            work_dir: row.get(4)?,
            container_ids: row.get(5)?,
            compose_project: row.get(6)?,
            created_at: row.get(7)?,
            stopped_at: row.get(8)?,
        })
    }

    fn into_container_record(self) -> Result<ContainerRecord> {
        let status = ContainerStatus::from_str(&self.status)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse container status")?;
        Ok(ContainerRecord {
            id: self.id,
            project_id: self.project_id,
            status,
            ports: serde_json::from_str(&self.ports).context("Failed to parse container ports")?,
            work_dir: self.work_dir,
            container_ids: serde_json::from_str(&self.container_ids)
                .context("Failed to parse container ids")?,
            compose_project: self.compose_project,
            created_at: self.created_at,
            stopped_at: self.stopped_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
