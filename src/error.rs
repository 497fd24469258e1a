use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::config::{Implementation, Variant};

#[derive(Debug, Clone, Error)]
pub enum ParseError {
    #[error("Unknown implementation: {0}")]
    UnknownImplementation(String),

    #[error("Unknown variant: {0}")]
    UnknownVariant(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot determine home directory")]
    NoHomeDir,

    #[error("Failed to read config file {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("max_attempts must be at least 1")]
    InvalidAttempts,

    #[error("Destination directory does not exist: {0}")]
    MissingParent(PathBuf),

    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Unexpected HTTP status {status}")]
    Status { status: u16 },

    #[error("Truncated body: expected {expected} bytes, received {received}")]
    Truncated { expected: u64, received: u64 },

    #[error("Failed to write download to {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Download of {url} failed after {attempts} attempt(s)")]
    Exhausted {
        url: String,
        attempts: u32,
        #[source]
        last: Box<DownloadError>,
    },
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{implementation}/{variant} {version} is not available")]
    UnsupportedCombination {
        implementation: Implementation,
        variant: Variant,
        version: String,
    },

    #[error("Lookup against {url} failed: {reason}")]
    Lookup { url: String, reason: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O failed on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Store document {path} is corrupt")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Instance id already in store: {0}")]
    DuplicateId(String),

    #[error("Directory already owned by another instance: {0}")]
    DuplicateDirectory(PathBuf),

    #[error("Instance not in store: {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Server is already running as pid {pid}")]
    AlreadyRunning { pid: u32 },

    #[error("Server artifact missing: {0}")]
    ArtifactMissing(PathBuf),

    #[error("Failed to prepare launch: {reason}")]
    Prepare {
        reason: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to spawn {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Spawned process has no pid")]
    NoPid,
}

#[derive(Debug, Error)]
pub enum StopError {
    #[error("Process {pid} still alive after {waited:?}")]
    Timeout { pid: u32, waited: Duration },

    #[error("Stop of process {pid} cancelled")]
    Cancelled { pid: u32 },

    #[error("Failed to signal process {pid}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Invalid server name: {0:?}")]
    InvalidName(String),

    #[error("A server with id {id} already exists")]
    DuplicateName { id: String },

    #[error("No server with id {0}")]
    NotFound(String),

    #[error("{implementation}/{variant} {version} is not available")]
    UnsupportedCombination {
        implementation: Implementation,
        variant: Variant,
        version: String,
    },

    #[error("Failed to resolve download")]
    Resolve(#[source] ResolveError),

    #[error("Install of {id} failed")]
    InstallFailed {
        id: String,
        #[source]
        cause: DownloadError,
    },

    #[error("Failed to unpack the download for {id}")]
    Unpack {
        id: String,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("Server {0} is already running")]
    AlreadyRunning(String),

    #[error("Server {0} is still running")]
    StillRunning(String),

    #[error("Server {id} did not stop within {timeout:?}")]
    StopTimeout { id: String, timeout: Duration },

    #[error("Server {id} did not generate its files within {timeout:?}")]
    BootstrapTimeout { id: String, timeout: Duration },

    #[error("Bootstrap of {0} was cancelled")]
    BootstrapCancelled(String),

    #[error("Server {0} exited before generating its files")]
    BootstrapExited(String),

    #[error(
        "Delete of {id} only partially succeeded (store entry removed: {store_removed}, directory removed: {dir_removed}): {reason}"
    )]
    PartialDelete {
        id: String,
        store_removed: bool,
        dir_removed: bool,
        reason: String,
    },

    #[error("Failed to launch {id}")]
    Launch {
        id: String,
        #[source]
        source: LaunchError,
    },

    #[error("Failed to stop {id}")]
    Stop {
        id: String,
        #[source]
        source: StopError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O failed on {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl From<ResolveError> for LifecycleError {
    fn from(value: ResolveError) -> Self {
        match value {
            ResolveError::UnsupportedCombination {
                implementation,
                variant,
                version,
            } => LifecycleError::UnsupportedCombination {
                implementation,
                variant,
                version,
            },
            other => LifecycleError::Resolve(other),
        }
    }
}
