use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::ContainerError;

/// Compose files, highest priority first.
pub const COMPOSE_FILES: [&str; 4] = [
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

pub const DOCKERFILE: &str = "Dockerfile";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKind {
    /// Multi-service; driven through `compose -p <project>`.
    Compose,
    /// Single service built from a Dockerfile.
    Dockerfile,
}

impl ConfigKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compose => "compose",
            Self::Dockerfile => "dockerfile",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub kind: ConfigKind,
    pub file_path: PathBuf,
}

impl ContainerConfig {
    /// Directory builds and compose commands run from.
    pub fn context_dir(&self) -> &Path {
        self.file_path.parent().unwrap_or_else(|| Path::new("."))
    }
}

fn kind_from_file_name(path: &Path) -> ConfigKind {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if name.contains("compose") && (name.ends_with(".yml") || name.ends_with(".yaml")) {
        ConfigKind::Compose
    } else {
        ConfigKind::Dockerfile
    }
}

/// Find the container configuration for `dir`.
///
/// An explicit `custom` path (relative paths resolve against `dir`) must
/// exist and wins. Otherwise the first compose file from [`COMPOSE_FILES`],
/// then a `Dockerfile`.
pub fn detect_config(dir: &Path, custom: Option<&Path>) -> Result<ContainerConfig, ContainerError> {
    if let Some(custom) = custom {
        let path = if custom.is_absolute() {
            custom.to_path_buf()
        } else {
            dir.join(custom)
        };
        if !path.is_file() {
            return Err(ContainerError::CustomConfigMissing { path });
        }
        return Ok(ContainerConfig {
            kind: kind_from_file_name(&path),
            file_path: path,
        });
    }

    if let Some(path) = COMPOSE_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
    {
        return Ok(ContainerConfig {
            kind: ConfigKind::Compose,
            file_path: path,
        });
    }

    let dockerfile = dir.join(DOCKERFILE);
    if dockerfile.is_file() {
        return Ok(ContainerConfig {
            kind: ConfigKind::Dockerfile,
            file_path: dockerfile,
        });
    }

    Err(ContainerError::NoContainerConfigFound {
        dir: dir.to_path_buf(),
    })
}
