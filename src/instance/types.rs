use std::{
    fmt::{self, Display},
    path::PathBuf,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ArtifactKind, Implementation, Variant};

/// One installed server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub implementation: Implementation,
    pub variant: Variant,
    pub version: String,
    pub directory: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl Instance {
    pub fn artifact_kind(&self) -> ArtifactKind {
        self.variant.artifact_kind(self.implementation)
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.directory.join(self.artifact_kind().file_name())
    }
}

/// Liveness as observed right now. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Stopped,
    Running,
    Unknown,
}

impl Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceStatus::Stopped => write!(f, "stopped"),
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Parameters for a new install.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub name: String,
    pub implementation: Implementation,
    pub variant: Variant,
    pub version: String,
    pub bootstrap: bool,
}

/// Identity of a launched server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
    pub launch_id: uuid::Uuid,
    pub log_path: PathBuf,
    pub started_at: DateTime<Utc>,
}
