//! Preview container lifecycle.
//!
//! The container CLI (`docker` by default, `podman` works too) is driven as a
//! process. Compose configurations run under a project name (`-p`) so the
//! whole stack is torn down as a unit; single-service builds get memory/CPU
//! ceilings at `run` time and publish every port as `p:p`. Each assigned port
//! reaches the container as `PORT_<SLOT>` (`apiServer` → `PORT_API_SERVER`).

mod detect;
mod preview;

pub use detect::{COMPOSE_FILES, ConfigKind, ContainerConfig, DOCKERFILE, detect_config};
pub use preview::{PreviewService, preview_name};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::ContainerSettings;
use crate::errors::{ContainerError, ProcessError};
use crate::models::{ContainerRecord, PortMap};
use crate::naming::upper_snake_case;
use crate::process::{self, CommandSpec, ProcessRunner};
use crate::tasks;

/// Lines of log output fetched per container.
const LOG_TAIL: &str = "200";

/// Environment variable carrying the port of `slot`.
pub fn env_var_name(prefix: &str, slot: &str) -> String {
    format!("{}{}", prefix, upper_snake_case(slot))
}

/// What to build and run.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub config: ContainerConfig,
    pub ports: PortMap,
    /// Compose project, image tag and container name.
    pub name: String,
}

/// Runtime identifiers of a started preview.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub container_ids: Vec<String>,
    pub compose_project: Option<String>,
}

impl ContainerHandle {
    /// Whatever `request` may have started, addressed by name only. Used to
    /// tear down a start that never reported its runtime ids.
    pub fn by_name(request: &BuildRequest) -> Self {
        match request.config.kind {
            ConfigKind::Compose => Self {
                container_ids: Vec::new(),
                compose_project: Some(request.name.clone()),
            },
            ConfigKind::Dockerfile => Self {
                container_ids: vec![request.name.clone()],
                compose_project: None,
            },
        }
    }
}

impl From<&ContainerRecord> for ContainerHandle {
    fn from(record: &ContainerRecord) -> Self {
        Self {
            container_ids: record.container_ids.clone(),
            compose_project: record.compose_project.clone(),
        }
    }
}

/// Where to run commands for a preview of `dir`. A project directory that
/// has since been removed falls back to the temp dir so teardown still runs.
fn command_dir(dir: &Path) -> PathBuf {
    if dir.is_dir() {
        dir.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

/// Output of a stop that found nothing to stop.
fn is_not_found(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("no such container")
        || stderr.contains("not found")
        || stderr.contains("no such object")
        || stderr.contains("is not running")
}

#[derive(Clone)]
pub struct ContainerManager {
    runner: Arc<dyn ProcessRunner>,
    settings: ContainerSettings,
}

impl ContainerManager {
    pub fn new(runner: Arc<dyn ProcessRunner>, settings: ContainerSettings) -> Self {
        Self { runner, settings }
    }

    fn cli(&self, cwd: impl Into<PathBuf>) -> CommandSpec {
        CommandSpec::new(&self.settings.runtime, cwd.into())
    }

    /// Run `spec` in the background, logging rather than returning failure.
    fn spawn_cleanup(&self, task: &'static str, spec: CommandSpec) {
        let runner = self.runner.clone();
        let deadline = self.settings.command_timeout();
        tasks::spawn_logged(task, async move {
            process::run_checked(runner.as_ref(), &spec, Some(deadline)).await?;
            Ok(())
        });
    }

    fn port_env(&self, ports: &PortMap) -> Vec<(String, String)> {
        ports
            .iter()
            .map(|(slot, port)| (env_var_name(&self.settings.env_prefix, slot), port.to_string()))
            .collect()
    }

    /// Build and start the preview described by `request`.
    #[instrument(skip(self, request), fields(name = %request.name, kind = request.config.kind.as_str()))]
    pub async fn build_and_run(&self, request: &BuildRequest) -> Result<ContainerHandle, ContainerError> {
        match request.config.kind {
            ConfigKind::Compose => self.compose_up(request).await,
            ConfigKind::Dockerfile => self.build_single(request).await,
        }
    }

    async fn compose_up(&self, request: &BuildRequest) -> Result<ContainerHandle, ContainerError> {
        let cwd = request.config.context_dir().to_path_buf();
        let file = request.config.file_path.display().to_string();
        let project = request.name.clone();

        let mut up = self
            .cli(&cwd)
            .args(["compose", "-p", project.as_str(), "-f", file.as_str()])
            .args(["up", "-d", "--build"]);
        for (key, value) in self.port_env(&request.ports) {
            up = up.env(key, value);
        }

        let down = self
            .cli(&cwd)
            .args(["compose", "-p", project.as_str(), "down", "--remove-orphans"]);

        if let Err(e) =
            process::run_checked(self.runner.as_ref(), &up, Some(self.settings.build_timeout())).await
        {
            warn!(project = %project, error = %e, "compose up failed, tearing down");
            self.spawn_cleanup("compose-down-after-failed-up", down);
            return Err(e.into());
        }

        // The stack is up from here on; any failure must take it down again.
        let ps = self
            .cli(&cwd)
            .args(["compose", "-p", project.as_str(), "-f", file.as_str(), "ps", "-q"]);
        let output = match process::run_checked(
            self.runner.as_ref(),
            &ps,
            Some(self.settings.command_timeout()),
        )
        .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!(project = %project, error = %e, "compose ps failed, tearing down");
                self.spawn_cleanup("compose-down-after-failed-ps", down);
                return Err(e.into());
            }
        };
        let container_ids: Vec<String> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();

        info!(project = %project, containers = container_ids.len(), "compose project up");
        Ok(ContainerHandle {
            container_ids,
            compose_project: Some(project),
        })
    }

    async fn build_single(&self, request: &BuildRequest) -> Result<ContainerHandle, ContainerError> {
        let cwd = request.config.context_dir().to_path_buf();
        let file = request.config.file_path.display().to_string();
        let tag = request.name.as_str();

        let build = self
            .cli(&cwd)
            .args(["build", "-t", tag, "-f", file.as_str(), "."]);
        process::run_checked(self.runner.as_ref(), &build, Some(self.settings.build_timeout()))
            .await?;

        let mut run = self.cli(&cwd).args(["run", "-d", "--name", tag]);
        for port in request.ports.values() {
            run = run.arg("-p").arg(format!("{port}:{port}"));
        }
        for (key, value) in self.port_env(&request.ports) {
            run = run.arg("-e").arg(format!("{key}={value}"));
        }
        if let Some(memory) = &self.settings.memory {
            run = run.args(["--memory", memory.as_str()]);
        }
        if let Some(cpus) = self.settings.cpus {
            run = run.arg("--cpus").arg(cpus.to_string());
        }
        run = run.arg(tag);

        let output = match process::run_checked(
            self.runner.as_ref(),
            &run,
            Some(self.settings.command_timeout()),
        )
        .await
        {
            Ok(output) => output,
            Err(e) => {
                // A created-but-failed container would keep the name taken.
                self.spawn_cleanup("rm-after-failed-run", self.cli(&cwd).args(["rm", "-f", tag]));
                return Err(e.into());
            }
        };

        let container_id = output
            .stdout
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .unwrap_or(tag)
            .to_string();
        info!(container = %container_id, "container started");
        Ok(ContainerHandle {
            container_ids: vec![container_id],
            compose_project: None,
        })
    }

    /// Tear down a preview started from `dir`. Missing or already-stopped
    /// containers count as stopped, so stopping twice (or stopping something
    /// never started) is fine.
    #[instrument(skip(self, dir))]
    pub async fn stop(&self, dir: &Path, handle: &ContainerHandle) -> Result<(), ContainerError> {
        let cwd = command_dir(dir);
        if let Some(project) = &handle.compose_project {
            let down = self
                .cli(&cwd)
                .args(["compose", "-p", project.as_str(), "down", "--remove-orphans"]);
            self.run_tolerating_missing(&down).await?;
            return Ok(());
        }
        for id in &handle.container_ids {
            let rm = self.cli(&cwd).args(["rm", "-f", id.as_str()]);
            self.run_tolerating_missing(&rm).await?;
        }
        Ok(())
    }

    async fn run_tolerating_missing(&self, spec: &CommandSpec) -> Result<(), ContainerError> {
        match process::run_checked(self.runner.as_ref(), spec, Some(self.settings.command_timeout()))
            .await
        {
            Ok(_) => Ok(()),
            Err(ProcessError::NonZeroExit { ref stderr, .. }) if is_not_found(stderr) => {
                debug!(command = %spec, "nothing to stop");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Recent logs of every container, fetched concurrently. A container whose
    /// logs cannot be read gets the error text in its section instead.
    pub async fn get_logs(&self, dir: &Path, container_ids: &[String]) -> String {
        let cwd = command_dir(dir);
        let fetches = container_ids.iter().map(|id| {
            let spec = self
                .cli(&cwd)
                .args(["logs", "--tail", LOG_TAIL, id.as_str()]);
            async move {
                let body = match process::run_checked(
                    self.runner.as_ref(),
                    &spec,
                    Some(self.settings.command_timeout()),
                )
                .await
                {
                    // `logs` replays the container's stderr on stderr.
                    Ok(out) => format!("{}{}", out.stdout, out.stderr),
                    Err(e) => format!("[error fetching logs] {e}\n"),
                };
                format!("=== {} ===\n{}", id, body)
            }
        });
        join_all(fetches).await.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::process::fake::{FakeRunner, Reply};

    fn manager(runner: Arc<FakeRunner>) -> ContainerManager {
        ContainerManager::new(runner, ContainerSettings::default())
    }

    fn request(kind: ConfigKind, file: &str, ports: &[(&str, u16)]) -> BuildRequest {
        BuildRequest {
            config: ContainerConfig {
                kind,
                file_path: Path::new("/work/app").join(file),
            },
            ports: ports.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            name: "forge-preview-7".into(),
        }
    }

    #[test]
    fn test_env_var_name() {
        assert_eq!(env_var_name("PORT_", "app"), "PORT_APP");
        assert_eq!(env_var_name("PORT_", "apiServer"), "PORT_API_SERVER");
        assert_eq!(env_var_name("PORT_", "admin-ui"), "PORT_ADMIN_UI");
    }

    #[tokio::test]
    async fn test_compose_up_uses_project_and_port_env() {
        let runner = Arc::new(
            FakeRunner::new().on("docker compose -p forge-preview-7 -f /work/app/compose.yaml ps", Reply::ok("aaa\nbbb\n")),
        );
        let mgr = manager(runner.clone());

        let handle = mgr
            .build_and_run(&request(
                ConfigKind::Compose,
                "compose.yaml",
                &[("app", 5000), ("apiServer", 5001)],
            ))
            .await
            .unwrap();
        assert_eq!(handle.compose_project.as_deref(), Some("forge-preview-7"));
        assert_eq!(handle.container_ids, vec!["aaa".to_string(), "bbb".to_string()]);

        let specs = runner.specs();
        let up = &specs[0];
        assert_eq!(
            up.to_string(),
            "docker compose -p forge-preview-7 -f /work/app/compose.yaml up -d --build"
        );
        assert_eq!(up.cwd, Path::new("/work/app"));
        assert!(up.env.contains(&("PORT_APP".to_string(), "5000".to_string())));
        assert!(up.env.contains(&("PORT_API_SERVER".to_string(), "5001".to_string())));
    }

    #[tokio::test]
    async fn test_single_service_limits_apply_at_run_time() {
        let runner = Arc::new(FakeRunner::new().on("docker run", Reply::ok("deadbeef\n")));
        let settings = ContainerSettings {
            memory: Some("512m".into()),
            cpus: Some(1.5),
            ..ContainerSettings::default()
        };
        let mgr = ContainerManager::new(runner.clone(), settings);

        let handle = mgr
            .build_and_run(&request(ConfigKind::Dockerfile, "Dockerfile", &[("app", 5003)]))
            .await
            .unwrap();
        assert_eq!(handle.container_ids, vec!["deadbeef".to_string()]);
        assert!(handle.compose_project.is_none());

        let calls = runner.calls();
        assert_eq!(
            calls[0],
            "docker build -t forge-preview-7 -f /work/app/Dockerfile ."
        );
        assert!(!calls[0].contains("--memory"));
        assert_eq!(
            calls[1],
            "docker run -d --name forge-preview-7 -p 5003:5003 -e PORT_APP=5003 --memory 512m --cpus 1.5 forge-preview-7"
        );
    }

    #[tokio::test]
    async fn test_failed_build_does_not_run() {
        let runner = Arc::new(FakeRunner::new().on("docker build", Reply::fail(1, "syntax error\n")));
        let mgr = manager(runner.clone());
        let err = mgr
            .build_and_run(&request(ConfigKind::Dockerfile, "Dockerfile", &[("app", 5000)]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExternalProcessFailure);
        assert!(!runner.calls().iter().any(|c| c.starts_with("docker run")));
    }

    #[tokio::test]
    async fn test_failed_compose_up_spawns_down() {
        let runner = Arc::new(
            FakeRunner::new().on("docker compose -p forge-preview-7 -f", Reply::fail(1, "port is already allocated\n")),
        );
        let mgr = manager(runner.clone());
        let err = mgr
            .build_and_run(&request(ConfigKind::Compose, "compose.yaml", &[("app", 5000)]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("port is already allocated"));

        settle_background_tasks().await;
        assert!(
            runner
                .calls()
                .contains(&"docker compose -p forge-preview-7 down --remove-orphans".to_string())
        );
    }

    async fn settle_background_tasks() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_failure_after_compose_up_tears_stack_down() {
        let runner = Arc::new(
            FakeRunner::new().on(
                "docker compose -p forge-preview-7 -f /work/app/compose.yaml ps",
                Reply::fail(1, "daemon hiccup\n"),
            ),
        );
        let mgr = manager(runner.clone());
        let err = mgr
            .build_and_run(&request(ConfigKind::Compose, "compose.yaml", &[("app", 5000)]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("daemon hiccup"));

        settle_background_tasks().await;
        assert!(
            runner
                .calls()
                .contains(&"docker compose -p forge-preview-7 down --remove-orphans".to_string())
        );
    }

    #[tokio::test]
    async fn test_failed_run_removes_container_by_name() {
        let runner = Arc::new(FakeRunner::new().on("docker run", Reply::fail(125, "port is already allocated\n")));
        let mgr = manager(runner.clone());
        mgr.build_and_run(&request(ConfigKind::Dockerfile, "Dockerfile", &[("app", 5000)]))
            .await
            .unwrap_err();

        settle_background_tasks().await;
        assert_eq!(runner.calls().last().map(String::as_str), Some("docker rm -f forge-preview-7"));
    }

    #[test]
    fn test_handle_by_name() {
        let compose = ContainerHandle::by_name(&request(ConfigKind::Compose, "compose.yaml", &[]));
        assert_eq!(compose.compose_project.as_deref(), Some("forge-preview-7"));
        assert!(compose.container_ids.is_empty());

        let single = ContainerHandle::by_name(&request(ConfigKind::Dockerfile, "Dockerfile", &[]));
        assert_eq!(single.container_ids, vec!["forge-preview-7".to_string()]);
        assert!(single.compose_project.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_deadline_is_longer_than_command_deadline() {
        let runner = Arc::new(FakeRunner::new().on("docker build", Reply::Hang));
        let mgr = manager(runner);
        let started = tokio::time::Instant::now();
        let err = mgr
            .build_and_run(&request(ConfigKind::Dockerfile, "Dockerfile", &[]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(started.elapsed() >= std::time::Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let runner = Arc::new(
            FakeRunner::new().on("docker rm -f", Reply::fail(1, "Error: No such container: deadbeef\n")),
        );
        let mgr = manager(runner.clone());
        let handle = ContainerHandle {
            container_ids: vec!["deadbeef".into()],
            compose_project: None,
        };
        let gone = Path::new("/nonexistent/forge-project");
        mgr.stop(gone, &handle).await.unwrap();
        mgr.stop(gone, &handle).await.unwrap();
        assert_eq!(runner.calls().len(), 2);
        assert_eq!(runner.specs()[0].cwd, std::env::temp_dir());

        // Never started: nothing to run.
        mgr.stop(gone, &ContainerHandle::default()).await.unwrap();
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_stop_compose_project_as_unit() {
        let runner = Arc::new(FakeRunner::new());
        let mgr = manager(runner.clone());
        let handle = ContainerHandle {
            container_ids: vec!["a".into(), "b".into()],
            compose_project: Some("forge-preview-3".into()),
        };
        let work = tempfile::tempdir().unwrap();
        mgr.stop(work.path(), &handle).await.unwrap();
        assert_eq!(
            runner.calls(),
            vec!["docker compose -p forge-preview-3 down --remove-orphans".to_string()]
        );
        assert_eq!(runner.specs()[0].cwd, work.path());
    }

    #[tokio::test]
    async fn test_stop_surfaces_real_failures() {
        let runner = Arc::new(FakeRunner::new().on(
            "docker rm -f",
            Reply::fail(1, "Cannot connect to the Docker daemon\n"),
        ));
        let mgr = manager(runner);
        let handle = ContainerHandle {
            container_ids: vec!["x".into()],
            compose_project: None,
        };
        assert!(mgr.stop(Path::new("/tmp"), &handle).await.is_err());
    }

    #[tokio::test]
    async fn test_get_logs_embeds_per_container_errors() {
        let runner = Arc::new(
            FakeRunner::new()
                .on("docker logs --tail 200 good", Reply::ok("listening on 5000\n"))
                .on("docker logs --tail 200 gone", Reply::fail(1, "No such container: gone\n")),
        );
        let mgr = manager(runner);
        let logs = mgr
            .get_logs(Path::new("/tmp"), &["good".to_string(), "gone".to_string()])
            .await;
        assert!(logs.starts_with("=== good ===\nlistening on 5000\n"));
        assert!(logs.contains("=== gone ===\n[error fetching logs]"));
        assert!(logs.contains("No such container: gone"));
    }
}
