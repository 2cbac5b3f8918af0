use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::StepError;
use crate::git::validate_branch_name;
use crate::models::SlotRequest;

/// Artifact under which `container start` records its preview unless told
/// otherwise.
pub const DEFAULT_PREVIEW_ARTIFACT: &str = "preview";

fn default_preview_artifact() -> String {
    DEFAULT_PREVIEW_ARTIFACT.to_string()
}

fn default_base() -> String {
    "main".to_string()
}

/// Step configuration, tagged by `type`.
///
/// ```yaml
/// type: git
/// operation: branch
/// branch: feature/login
/// from: main
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    Git(GitStep),
    Container(ContainerStep),
    Artifact(ArtifactStep),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "kebab-case")]
pub enum GitStep {
    Commit {
        message: String,
        #[serde(default)]
        files: Option<Vec<String>>,
    },
    Branch {
        branch: String,
        #[serde(default)]
        from: Option<String>,
    },
    Pr {
        title: String,
        #[serde(default)]
        description: String,
        #[serde(default = "default_base")]
        base: String,
    },
    CommitAndBranch {
        branch: String,
        #[serde(default)]
        from: Option<String>,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "kebab-case")]
pub enum ContainerStep {
    Start {
        /// Slot → preferred port. Empty means a single `app` slot.
        #[serde(default)]
        slots: SlotRequest,
        /// Explicit compose file or Dockerfile, relative to the project.
        #[serde(default)]
        config: Option<PathBuf>,
        /// Artifact the started record is written to.
        #[serde(default = "default_preview_artifact")]
        artifact: String,
    },
    Stop {
        #[serde(default = "default_preview_artifact")]
        artifact: String,
    },
    Logs {
        #[serde(default = "default_preview_artifact")]
        artifact: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactStep {
    /// Artifact name, unique per run.
    pub artifact: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

fn require(field: &str, value: &str) -> Result<(), StepError> {
    if value.trim().is_empty() {
        return Err(StepError::InvalidConfig(format!("`{}` must not be empty", field)));
    }
    Ok(())
}

impl StepConfig {
    /// Reject malformed configs before anything runs.
    pub fn validate(&self) -> Result<(), StepError> {
        match self {
            Self::Git(git) => git.validate(),
            Self::Container(container) => container.validate(),
            Self::Artifact(step) => require("artifact", &step.artifact),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Git(_) => "git",
            Self::Container(_) => "container",
            Self::Artifact(_) => "artifact",
        }
    }
}

impl GitStep {
    fn validate(&self) -> Result<(), StepError> {
        match self {
            Self::Commit { message, .. } => require("message", message),
            Self::Branch { branch, from } => {
                validate_branch_name(branch)?;
                if let Some(from) = from {
                    validate_branch_name(from)?;
                }
                Ok(())
            }
            Self::Pr { title, base, .. } => {
                require("title", title)?;
                validate_branch_name(base)?;
                Ok(())
            }
            Self::CommitAndBranch {
                branch,
                from,
                message,
            } => {
                validate_branch_name(branch)?;
                if let Some(from) = from {
                    validate_branch_name(from)?;
                }
                require("message", message)
            }
        }
    }
}

impl ContainerStep {
    fn validate(&self) -> Result<(), StepError> {
        match self {
            Self::Start { slots, artifact, .. } => {
                if slots.keys().any(|name| name.trim().is_empty()) {
                    return Err(StepError::InvalidConfig("slot names must not be empty".into()));
                }
                require("artifact", artifact)
            }
            Self::Stop { artifact } | Self::Logs { artifact } => require("artifact", artifact),
        }
    }
}
