use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;

/// Requested slots: slot name → optional preferred port.
pub type SlotRequest = BTreeMap<String, Option<u16>>;

/// Assigned ports: slot name → port.
pub type PortMap = BTreeMap<String, u16>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// One execution of a workflow. `current_step` is only set while the run is
/// `Running`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: i64,
    pub project_id: i64,
    pub workflow: String,
    pub args: serde_json::Value,
    pub status: RunStatus,
    pub current_phase: Option<String>,
    pub current_step: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
    /// Set when a cancel arrives while another driver executes the run.
    #[serde(default)]
    pub cancel_requested: bool,
}

/// Outcome of one step invocation. Successful results are memoized per
/// `(run_id, step_id)`; failed ones are kept for audit only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepResult {
    pub run_id: i64,
    pub step_id: String,
    pub success: bool,
    pub payload: serde_json::Value,
    pub duration_ms: u64,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// True when this result was served from the store instead of executing.
    #[serde(default)]
    pub replayed: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum GitOperationKind {
    Commit,
    Branch,
    Pr,
    CommitAndBranch,
}

impl GitOperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Branch => "branch",
            Self::Pr => "pr",
            Self::CommitAndBranch => "commit-and-branch",
        }
    }
}

/// What a git reconciliation did. `commands` lists only the state-changing
/// commands that actually ran, in order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitOperationOutcome {
    pub kind: GitOperationKind,
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
    pub pr_url: Option<String>,
    pub commands: Vec<String>,
    pub success: bool,
}

impl GitOperationOutcome {
    pub fn new(kind: GitOperationKind) -> Self {
        Self {
            kind,
            branch: None,
            commit_sha: None,
            pr_url: None,
            commands: Vec::new(),
            success: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Running,
    Stopped,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

impl FromStr for ContainerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            _ => Err(format!("Invalid container status: {}", s)),
        }
    }
}

/// A preview container (or compose project) and the ports it holds. A
/// `Running` record is the reservation of its ports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerRecord {
    pub id: i64,
    pub project_id: i64,
    pub status: ContainerStatus,
    pub ports: PortMap,
    pub work_dir: String,
    pub container_ids: Vec<String>,
    pub compose_project: Option<String>,
    pub created_at: String,
    pub stopped_at: Option<String>,
}

/// A named value produced by an artifact step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub run_id: i64,
    pub name: String,
    pub value: serde_json::Value,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_terminal_states() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
    }

    #[test]
    fn test_run_status_parse() {
        assert_eq!("paused".parse::<RunStatus>().unwrap(), RunStatus::Paused);
        assert!("sleeping".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_git_operation_kind_serializes_kebab_case() {
        let json = serde_json::to_string(&GitOperationKind::CommitAndBranch).unwrap();
        assert_eq!(json, "\"commit-and-branch\"");
        assert_eq!(GitOperationKind::CommitAndBranch.as_str(), "commit-and-branch");
    }

    #[test]
    fn test_container_status_parse() {
        assert_eq!(
            "stopped".parse::<ContainerStatus>().unwrap(),
            ContainerStatus::Stopped
        );
        assert!("paused".parse::<ContainerStatus>().is_err());
    }
}
