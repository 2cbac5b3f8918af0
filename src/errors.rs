//! Typed error hierarchy for the step engine.
//!
//! One enum per subsystem:
//! - `ProcessError`: spawning and waiting on external commands
//! - `GitError`: git reconciliation
//! - `PortError`: port allocation
//! - `ContainerError`: preview container lifecycle
//! - `StepError`: step runtime and dispatch
//!
//! Every enum maps onto the shared `ErrorKind` taxonomy so callers (the
//! workflow driver's retry policy, the CLI, persisted step results) can
//! branch on the class of failure without matching every variant.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification shared by all engine errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Rejected before any side effect.
    InvalidInput,
    /// An external process exited non-zero or could not be spawned.
    ExternalProcessFailure,
    /// A deadline elapsed. Distinct from process failure so callers can retry.
    Timeout,
    /// A shared pool (the port range) has nothing left.
    ResourceExhausted,
    NotFound,
    Store,
    Cancelled,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::ExternalProcessFailure => "external_process_failure",
            Self::Timeout => "timeout",
            Self::ResourceExhausted => "resource_exhausted",
            Self::NotFound => "not_found",
            Self::Store => "store",
            Self::Cancelled => "cancelled",
            Self::Other => "other",
        }
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "invalid_input" => Ok(Self::InvalidInput),
            "external_process_failure" => Ok(Self::ExternalProcessFailure),
            "timeout" => Ok(Self::Timeout),
            "resource_exhausted" => Ok(Self::ResourceExhausted),
            "not_found" => Ok(Self::NotFound),
            "store" => Ok(Self::Store),
            "cancelled" => Ok(Self::Cancelled),
            "other" => Ok(Self::Other),
            _ => Err(format!("Invalid error kind: {}", s)),
        }
    }
}

/// Errors from running an external command.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with code {code:?}: {stderr}")]
    NonZeroExit {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("`{command}` timed out after {}s", after.as_secs())]
    Timeout { command: String, after: Duration },
}

impl ProcessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Spawn { .. } | Self::NonZeroExit { .. } => ErrorKind::ExternalProcessFailure,
            Self::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Captured stderr, when the process got far enough to produce any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::NonZeroExit { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Errors from the git reconciler.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("Invalid branch name '{0}': only letters, digits and _ . / - are allowed")]
    InvalidBranchName(String),

    #[error("Commit message must not be empty")]
    EmptyCommitMessage,

    #[error("Pull request title must not be empty")]
    EmptyPrTitle,

    #[error("Nothing to commit in {}: working tree is clean", path.display())]
    NothingToCommit { path: PathBuf },

    #[error("git {operation} timed out after {}s", after.as_secs())]
    GitOperationTimeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Unexpected output from `{command}`: {message}")]
    UnexpectedOutput { command: String, message: String },

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl GitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidBranchName(_)
            | Self::EmptyCommitMessage
            | Self::EmptyPrTitle
            | Self::NothingToCommit { .. } => ErrorKind::InvalidInput,
            Self::GitOperationTimeout { .. } => ErrorKind::Timeout,
            Self::UnexpectedOutput { .. } => ErrorKind::ExternalProcessFailure,
            Self::Process(e) => e.kind(),
        }
    }
}

/// Errors from the port allocator.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("Slot names must not be empty")]
    EmptySlotName,

    #[error("Invalid port range {start}-{end}")]
    InvalidRange { start: u16, end: u16 },

    #[error(
        "Port range {start}-{end} exhausted: {requested} ports requested, only {available} free"
    )]
    PortRangeExhausted {
        requested: usize,
        available: usize,
        start: u16,
        end: u16,
    },

    #[error("Port allocation store error: {0:#}")]
    Store(#[source] anyhow::Error),
}

impl PortError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptySlotName | Self::InvalidRange { .. } => ErrorKind::InvalidInput,
            Self::PortRangeExhausted { .. } => ErrorKind::ResourceExhausted,
            Self::Store(_) => ErrorKind::Store,
        }
    }
}

/// Errors from the preview container lifecycle manager.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("No container configuration found in {}", dir.display())]
    NoContainerConfigFound { dir: PathBuf },

    #[error("Container configuration {} does not exist", path.display())]
    CustomConfigMissing { path: PathBuf },

    #[error("Container record {id} not found")]
    RecordNotFound { id: i64 },

    #[error(transparent)]
    Ports(#[from] PortError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Container store error: {0:#}")]
    Store(#[source] anyhow::Error),
}

impl ContainerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoContainerConfigFound { .. } | Self::CustomConfigMissing { .. } => {
                ErrorKind::InvalidInput
            }
            Self::RecordNotFound { .. } => ErrorKind::NotFound,
            Self::Ports(e) => e.kind(),
            Self::Process(e) => e.kind(),
            Self::Store(_) => ErrorKind::Store,
        }
    }
}

/// Errors surfaced by the step runtime and step handlers.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("Invalid step label '{0}': it must contain at least one letter or digit")]
    InvalidStepId(String),

    #[error("Invalid step configuration: {0}")]
    InvalidConfig(String),

    #[error("Step {step_id} timed out after {}s", after.as_secs())]
    Timeout { step_id: String, after: Duration },

    #[error("Step {step_id} cancelled")]
    Cancelled { step_id: String },

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Ports(#[from] PortError),

    #[error("Step store error: {0:#}")]
    Store(#[source] anyhow::Error),

    #[error("{0:#}")]
    Handler(#[source] anyhow::Error),
}

impl StepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidStepId(_) | Self::InvalidConfig(_) => ErrorKind::InvalidInput,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Git(e) => e.kind(),
            Self::Container(e) => e.kind(),
            Self::Ports(e) => e.kind(),
            Self::Store(_) => ErrorKind::Store,
            Self::Handler(_) => ErrorKind::Other,
        }
    }
}
