use std::{
    io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt};
use uuid::Uuid;

pub const MARKER_FILE: &str = ".pid";

/// Identity of the last launch, kept inside the instance directory so that a later run of the
/// program can find and verify the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidMarker {
    pub pid: u32,
    pub launch_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Kernel start time of the process in clock ticks, where the platform exposes it.
    #[serde(default)]
    pub start_ticks: Option<u64>,
    pub program: String,
}

impl PidMarker {
    pub fn new<S: Into<String>>(pid: u32, program: S, start_ticks: Option<u64>) -> Self {
        Self {
            pid,
            launch_id: Uuid::new_v4(),
            started_at: Utc::now(),
            start_ticks,
            program: program.into(),
        }
    }

    pub fn path(dir: &Path) -> PathBuf {
        dir.join(MARKER_FILE)
    }

    pub async fn read(dir: &Path) -> io::Result<Option<Self>> {
        let raw = match fs::read(Self::path(dir)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub async fn write(&self, dir: &Path) -> io::Result<()> {
        let path = Self::path(dir);
        let tmp = dir.join(format!("{MARKER_FILE}.tmp"));
        let data = serde_json::to_vec(self).map_err(io::Error::other)?;

        let mut f = fs::File::create(&tmp).await?;
        f.write_all(&data).await?;
        f.sync_all().await?;
        drop(f);

        fs::rename(&tmp, &path).await
    }

    pub async fn remove(dir: &Path) -> io::Result<()> {
        match fs::remove_file(Self::path(dir)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
