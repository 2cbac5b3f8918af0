use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::steps::{StepConfig, StepOptions, qualified_step_id};

/// Phases run in order; steps within a phase run in order.
///
/// ```yaml
/// name: preview
/// phases:
///   - name: Prepare
///     steps:
///       - name: Create Branch
///         type: git
///         operation: branch
///         branch: preview/login
///   - name: Preview
///     steps:
///       - name: Start
///         type: container
///         operation: start
///         timeout_secs: 900
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub phases: Vec<PhaseDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDefinition {
    pub name: String,
    pub steps: Vec<StepDefinition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub interruptible: bool,
    #[serde(flatten)]
    pub config: StepConfig,
}

impl StepDefinition {
    /// Step options, falling back to `default_timeout` when the step sets none.
    pub fn options(&self, default_timeout: Option<Duration>) -> StepOptions {
        StepOptions {
            timeout: self
                .timeout_secs
                .map(Duration::from_secs)
                .or(default_timeout),
            interruptible: self.interruptible,
        }
    }
}

/// Where workflow files live inside a project.
pub fn workflows_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(".forge").join("workflows")
}

impl WorkflowDefinition {
    /// Parse from YAML, or JSON when the path ends in `.json`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow {}", path.display()))?;
        let definition: Self = if path.extension().is_some_and(|e| e == "json") {
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse workflow {}", path.display()))?
        } else {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse workflow {}", path.display()))?
        };
        definition.validate()?;
        Ok(definition)
    }

    /// Find `<name>.yaml`, `<name>.yml` or `<name>.json` under
    /// `.forge/workflows/`.
    pub fn resolve(project_dir: &Path, name: &str) -> Result<Self> {
        let dir = workflows_dir(project_dir);
        for ext in ["yaml", "yml", "json"] {
            let candidate = dir.join(format!("{}.{}", name, ext));
            if candidate.is_file() {
                return Self::load(&candidate);
            }
        }
        anyhow::bail!("Workflow '{}' not found in {}", name, dir.display())
    }

    /// Structural checks: at least one phase, no empty phase, step ids unique
    /// after normalization, every step config valid.
    pub fn validate(&self) -> Result<()> {
        if self.phases.is_empty() {
            anyhow::bail!("Workflow '{}' has no phases", self.name);
        }
        let mut seen = HashSet::new();
        for phase in &self.phases {
            if phase.steps.is_empty() {
                anyhow::bail!("Phase '{}' has no steps", phase.name);
            }
            for step in &phase.steps {
                let id = qualified_step_id(&phase.name, &step.name)
                    .with_context(|| format!("Invalid step in phase '{}'", phase.name))?;
                if !seen.insert(id.clone()) {
                    anyhow::bail!("Duplicate step '{}'", id);
                }
                step.config
                    .validate()
                    .with_context(|| format!("Invalid step '{}'", id))?;
            }
        }
        Ok(())
    }

    pub fn step_count(&self) -> usize {
        self.phases.iter().map(|p| p.steps.len()).sum()
    }
}
