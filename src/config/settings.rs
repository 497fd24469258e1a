use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::error::ConfigError;

use super::launch::{LaunchCommand, LaunchSettings};

pub const DATA_DIR_NAME: &str = ".minecraft_server_manager";
pub const CONFIG_FILE_NAME: &str = "config.json";
pub const STORE_FILE_NAME: &str = "servers.json";

const DEFAULT_DOWNLOAD_ATTEMPTS: u32 = 3;
const DEFAULT_DOWNLOAD_BACKOFF: Duration = Duration::from_millis(200);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Runtime configuration for the lifecycle manager.
///
/// Built from defaults, then `<data_root>/config.json`, then `MCSM_*` environment variables.
/// Front-ends apply their own flags last.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Root for the store document, logs and (by default) server directories.
    pub data_root: PathBuf,
    /// Parent of all instance directories.
    pub servers_dir: PathBuf,
    pub download_attempts: u32,
    pub download_backoff: Duration,
    pub stop_timeout: Duration,
    pub bootstrap: BootstrapSettings,
    pub launch: LaunchSettings,
}

#[derive(Debug, Clone)]
pub struct BootstrapSettings {
    /// Whether `install` runs the first-start cycle unless told otherwise.
    pub enabled: bool,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: DEFAULT_BOOTSTRAP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// On-disk overlay. Every field is optional; missing fields keep their current value.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    servers_dir: Option<PathBuf>,
    download_attempts: Option<u32>,
    download_backoff_ms: Option<u64>,
    stop_timeout_secs: Option<u64>,
    bootstrap: Option<bool>,
    bootstrap_timeout_secs: Option<u64>,
    bootstrap_poll_ms: Option<u64>,
    java: Option<PathBuf>,
    php: Option<PathBuf>,
    memory: Option<String>,
    jvm_args: Option<Vec<String>>,
    command: Option<LaunchCommand>,
}

impl ManagerConfig {
    /// Defaults rooted at `data_root`.
    pub fn with_data_root<P: Into<PathBuf>>(data_root: P) -> Self {
        let data_root = data_root.into();
        Self {
            servers_dir: data_root.join("servers"),
            data_root,
            download_attempts: DEFAULT_DOWNLOAD_ATTEMPTS,
            download_backoff: DEFAULT_DOWNLOAD_BACKOFF,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            bootstrap: BootstrapSettings::default(),
            launch: LaunchSettings::default(),
        }
    }

    /// `~/.minecraft_server_manager`.
    pub fn default_data_root() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(home.join(DATA_DIR_NAME))
    }

    /// Full layering: defaults, config file, process environment.
    pub fn load(data_root: Option<PathBuf>) -> Result<Self, ConfigError> {
        let data_root = match data_root {
            Some(root) => root,
            None => Self::default_data_root()?,
        };
        let mut config = Self::with_data_root(data_root);
        config.apply_file()?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_root.join(STORE_FILE_NAME)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_root.join("logs")
    }

    pub fn config_path(&self) -> PathBuf {
        self.data_root.join(CONFIG_FILE_NAME)
    }

    pub fn instance_dir(&self, id: &str) -> PathBuf {
        self.servers_dir.join(id)
    }

    fn apply_file(&mut self) -> Result<(), ConfigError> {
        let path = self.config_path();
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        let file: ConfigFile =
            serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse { path, source })?;
        self.apply_overlay(file);
        Ok(())
    }

    fn apply_overlay(&mut self, file: ConfigFile) {
        if let Some(dir) = file.servers_dir {
            self.servers_dir = resolve_relative(&self.data_root, dir);
        }
        if let Some(v) = file.download_attempts {
            self.download_attempts = v.clamp(1, 20);
        }
        if let Some(v) = file.download_backoff_ms {
            self.download_backoff = Duration::from_millis(v.min(60_000));
        }
        if let Some(v) = file.stop_timeout_secs {
            self.stop_timeout = Duration::from_secs(v.clamp(1, 3600));
        }
        if let Some(v) = file.bootstrap {
            self.bootstrap.enabled = v;
        }
        if let Some(v) = file.bootstrap_timeout_secs {
            self.bootstrap.timeout = Duration::from_secs(v.clamp(1, 3600));
        }
        if let Some(v) = file.bootstrap_poll_ms {
            self.bootstrap.poll_interval = Duration::from_millis(v.clamp(50, 60_000));
        }
        if let Some(v) = file.java {
            self.launch.java = v;
        }
        if let Some(v) = file.php {
            self.launch.php = v;
        }
        if let Some(v) = file.memory {
            self.launch.memory = v;
        }
        if let Some(v) = file.jvm_args {
            self.launch.jvm_args = v;
        }
        if let Some(v) = file.command {
            self.launch.command_override = Some(v);
        }
    }

    /// Applies `MCSM_*` variables looked up through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let get_u64 = |key: &str| get(key).and_then(|v| v.parse::<u64>().ok());

        if let Some(dir) = get("MCSM_SERVERS_DIR") {
            self.servers_dir = resolve_relative(&self.data_root, PathBuf::from(dir));
        }
        if let Some(v) = get_u64("MCSM_DOWNLOAD_ATTEMPTS") {
            self.download_attempts = u32::try_from(v).unwrap_or(u32::MAX).clamp(1, 20);
        }
        if let Some(v) = get_u64("MCSM_STOP_TIMEOUT_SECS") {
            self.stop_timeout = Duration::from_secs(v.clamp(1, 3600));
        }
        if let Some(v) = get_u64("MCSM_BOOTSTRAP_TIMEOUT_SECS") {
            self.bootstrap.timeout = Duration::from_secs(v.clamp(1, 3600));
        }
        if let Some(v) = get("MCSM_JAVA") {
            self.launch.java = PathBuf::from(v);
        }
        if let Some(v) = get("MCSM_PHP") {
            self.launch.php = PathBuf::from(v);
        }
        if let Some(v) = get("MCSM_MEMORY") {
            self.launch.memory = v;
        }
    }
}

fn resolve_relative(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}
