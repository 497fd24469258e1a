use std::{
    collections::HashMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use tokio::{fs, sync::Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    archive,
    config::{ArtifactKind, ManagerConfig},
    download::Downloader,
    error::{LaunchError, LifecycleError, StopError, StoreError},
    instance::{InstallRequest, Instance, InstanceStatus, InstanceStore, ProcessHandle},
    resolver::Resolver,
    supervisor::Supervisor,
    utils::{PollOutcome, derive_id, poll_until},
};

const EULA_FILE: &str = "eula.txt";
const EULA_CONTENTS: &[u8] = b"#Generated by mcsm\neula=true\n";

/// Orchestrates installs and the start/stop/delete lifecycle of every instance.
///
/// Holds no liveness state of its own: "is it running" is always asked of the supervisor.
/// Operations on one id are serialized within this process; the store lock covers concurrent
/// processes.
pub struct LifecycleManager {
    config: ManagerConfig,
    store: InstanceStore,
    resolver: Arc<dyn Resolver>,
    downloader: Arc<dyn Downloader>,
    supervisor: Arc<dyn Supervisor>,
    locks: IdLocks,
}

/// Per-id async locks. Entries nobody holds are dropped on the next acquire.
#[derive(Default)]
struct IdLocks(std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>);

impl IdLocks {
    fn get(&self, id: &str) -> Arc<Mutex<()>> {
        let mut map = self.0.lock().unwrap_or_else(|e| e.into_inner());
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        map.entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl LifecycleManager {
    pub fn new(
        config: ManagerConfig,
        resolver: Arc<dyn Resolver>,
        downloader: Arc<dyn Downloader>,
        supervisor: Arc<dyn Supervisor>,
    ) -> Self {
        Self {
            store: InstanceStore::new(config.store_path()),
            config,
            resolver,
            downloader,
            supervisor,
            locks: IdLocks::default(),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn store(&self) -> &InstanceStore {
        &self.store
    }

    fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks.get(id)
    }

    async fn get(&self, id: &str) -> Result<Instance, LifecycleError> {
        self.store
            .find(id)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))
    }

    /// Downloads and registers a new instance, optionally running the first-start cycle.
    ///
    /// Any failure before the store entry is written removes the new directory again. A failed
    /// bootstrap leaves the instance installed and stopped.
    pub async fn install(
        &self,
        request: InstallRequest,
        cancel: &CancellationToken,
    ) -> Result<Instance, LifecycleError> {
        let name = request.name.trim();
        let id = derive_id(name).ok_or_else(|| LifecycleError::InvalidName(request.name.clone()))?;

        let lock = self.lock_for(&id);
        let _guard = lock.lock().await;

        if self.store.find(&id).await?.is_some() {
            return Err(LifecycleError::DuplicateName { id });
        }

        let directory = self.config.instance_dir(&id);
        fs::create_dir_all(&self.config.servers_dir)
            .await
            .map_err(|source| LifecycleError::Io {
                path: self.config.servers_dir.clone(),
                source,
            })?;
        fs::create_dir(&directory)
            .await
            .map_err(|source| LifecycleError::Io {
                path: directory.clone(),
                source,
            })?;
        info!(
            id = %id,
            implementation = %request.implementation,
            variant = %request.variant,
            version = %request.version,
            dir = %directory.display(),
            "installing server"
        );

        let instance = Instance {
            id: id.clone(),
            name: name.to_string(),
            implementation: request.implementation,
            variant: request.variant,
            version: request.version.clone(),
            directory: directory.clone(),
            created_at: Utc::now(),
        };

        if let Err(e) = self.populate(&instance).await {
            rollback(&directory).await;
            return Err(e);
        }

        if let Err(e) = self.store.add(instance.clone()).await {
            rollback(&directory).await;
            return Err(match e {
                StoreError::DuplicateId(_) | StoreError::DuplicateDirectory(_) => {
                    LifecycleError::DuplicateName { id }
                }
                other => LifecycleError::Store(other),
            });
        }
        info!(id = %id, "server installed");

        if request.bootstrap {
            self.run_bootstrap(&instance, cancel).await?;
        }
        Ok(instance)
    }

    /// Resolve, download (unpacking archives in place) and accept the EULA inside a freshly
    /// created directory.
    async fn populate(&self, instance: &Instance) -> Result<(), LifecycleError> {
        let url = self
            .resolver
            .resolve(instance.implementation, instance.variant, &instance.version)
            .await?;
        debug!(id = %instance.id, url = %url, "resolved download");

        let kind = instance.artifact_kind();
        let artifact = instance.artifact_path();
        let target = match kind.archive_name() {
            Some(name) => instance.directory.join(name),
            None => artifact.clone(),
        };
        self.downloader
            .fetch(&url, &target, self.config.download_attempts)
            .await
            .map_err(|cause| LifecycleError::InstallFailed {
                id: instance.id.clone(),
                cause,
            })?;

        if target != artifact {
            archive::unpack(&target, &instance.directory, kind.file_name())
                .await
                .map_err(|source| LifecycleError::Unpack {
                    id: instance.id.clone(),
                    source,
                })?;
        }
        if kind == ArtifactKind::Native {
            make_executable(&artifact)
                .await
                .map_err(|source| LifecycleError::Io {
                    path: artifact.clone(),
                    source,
                })?;
        }

        let eula = instance.directory.join(EULA_FILE);
        fs::write(&eula, EULA_CONTENTS)
            .await
            .map_err(|source| LifecycleError::Io { path: eula, source })
    }

    /// Runs the start, wait for generated files, stop cycle for an installed instance.
    pub async fn bootstrap(&self, id: &str, cancel: &CancellationToken) -> Result<(), LifecycleError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let instance = self.get(id).await?;
        if self.supervisor.is_running(&instance).await {
            return Err(LifecycleError::AlreadyRunning(instance.id));
        }
        self.run_bootstrap(&instance, cancel).await
    }

    async fn run_bootstrap(
        &self,
        instance: &Instance,
        cancel: &CancellationToken,
    ) -> Result<(), LifecycleError> {
        let id = instance.id.as_str();
        let settings = &self.config.bootstrap;
        let files = instance.variant.generated_files(instance.implementation);

        let handle = self.launch(instance).await?;
        info!(id, pid = handle.pid, timeout = ?settings.timeout, "bootstrapping server");

        let dir = instance.directory.as_path();
        let outcome = poll_until(settings.timeout, settings.poll_interval, cancel, || async move {
            generated(dir, files) || !self.supervisor.is_running(instance).await
        })
        .await;

        let failure = match outcome {
            PollOutcome::Ready if generated(dir, files) => None,
            PollOutcome::Ready => Some(LifecycleError::BootstrapExited(id.to_string())),
            PollOutcome::TimedOut => Some(LifecycleError::BootstrapTimeout {
                id: id.to_string(),
                timeout: settings.timeout,
            }),
            PollOutcome::Cancelled => Some(LifecycleError::BootstrapCancelled(id.to_string())),
        };

        // The caller's token may already be cancelled; shutting the server down is not optional.
        let stopped = self
            .halt(instance, self.config.stop_timeout, &CancellationToken::new())
            .await;

        match (failure, stopped) {
            (None, Ok(())) => {
                info!(id, "bootstrap complete");
                Ok(())
            }
            (None, Err(e)) => Err(e),
            (Some(failure), stopped) => {
                if let Err(e) = stopped {
                    warn!(id, error = %e, "failed to stop server after unsuccessful bootstrap");
                }
                warn!(id, error = %failure, "bootstrap failed");
                Err(failure)
            }
        }
    }

    pub async fn start(&self, id: &str) -> Result<ProcessHandle, LifecycleError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let instance = self.get(id).await?;
        if self.supervisor.is_running(&instance).await {
            return Err(LifecycleError::AlreadyRunning(instance.id));
        }
        self.launch(&instance).await
    }

    async fn launch(&self, instance: &Instance) -> Result<ProcessHandle, LifecycleError> {
        self.supervisor
            .start(instance)
            .await
            .map_err(|source| match source {
                LaunchError::AlreadyRunning { .. } => {
                    LifecycleError::AlreadyRunning(instance.id.clone())
                }
                source => LifecycleError::Launch {
                    id: instance.id.clone(),
                    source,
                },
            })
    }

    /// Stops the instance within the configured timeout. Stopping a stopped instance succeeds.
    pub async fn stop(&self, id: &str, cancel: &CancellationToken) -> Result<(), LifecycleError> {
        self.stop_with_timeout(id, self.config.stop_timeout, cancel)
            .await
    }

    pub async fn stop_with_timeout(
        &self,
        id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), LifecycleError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let instance = self.get(id).await?;
        self.halt(&instance, timeout, cancel).await
    }

    async fn halt(
        &self,
        instance: &Instance,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), LifecycleError> {
        self.supervisor
            .stop(instance, timeout, cancel)
            .await
            .map_err(|source| match source {
                StopError::Timeout { .. } | StopError::Cancelled { .. } => {
                    LifecycleError::StopTimeout {
                        id: instance.id.clone(),
                        timeout,
                    }
                }
                source => LifecycleError::Stop {
                    id: instance.id.clone(),
                    source,
                },
            })
    }

    /// Stop, wait until the supervisor no longer reports the process, start again.
    pub async fn restart(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<ProcessHandle, LifecycleError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let instance = self.get(id).await?;
        let timeout = self.config.stop_timeout;
        self.halt(&instance, timeout, cancel).await?;

        let instance_ref = &instance;
        let outcome = poll_until(timeout, self.config.bootstrap.poll_interval, cancel, || async move {
            !self.supervisor.is_running(instance_ref).await
        })
        .await;
        if outcome != PollOutcome::Ready {
            return Err(LifecycleError::StopTimeout {
                id: instance.id,
                timeout,
            });
        }

        info!(id, "restarting server");
        self.launch(&instance).await
    }

    /// Removes the directory tree, then the store entry. Refuses while the server runs.
    pub async fn delete(&self, id: &str) -> Result<(), LifecycleError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let instance = self.get(id).await?;
        if self.supervisor.is_running(&instance).await {
            return Err(LifecycleError::StillRunning(instance.id));
        }

        match fs::remove_dir_all(&instance.directory).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(id, dir = %instance.directory.display(), "directory already gone");
            }
            Err(source) => {
                return Err(LifecycleError::Io {
                    path: instance.directory,
                    source,
                });
            }
        }

        if let Err(e) = self.store.remove(id).await {
            return Err(LifecycleError::PartialDelete {
                id: id.to_string(),
                store_removed: false,
                dir_removed: true,
                reason: e.to_string(),
            });
        }

        let log = self.log_path(id);
        if let Err(e) = fs::remove_file(&log).await
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(id, log = %log.display(), error = %e, "failed to remove server log");
        }

        info!(id, "server deleted");
        Ok(())
    }

    pub async fn status(&self, id: &str) -> Result<InstanceStatus, LifecycleError> {
        let instance = self.get(id).await?;
        Ok(self.observe(&instance).await)
    }

    /// Every stored instance with its live status, in store order.
    pub async fn list(&self) -> Result<Vec<(Instance, InstanceStatus)>, LifecycleError> {
        let instances = self.store.load().await?;
        let mut out = Vec::with_capacity(instances.len());
        for instance in instances {
            let status = self.observe(&instance).await;
            out.push((instance, status));
        }
        Ok(out)
    }

    pub fn log_path(&self, id: &str) -> PathBuf {
        self.config.logs_dir().join(format!("{id}.log"))
    }

    async fn observe(&self, instance: &Instance) -> InstanceStatus {
        if !instance.directory.is_dir() {
            return InstanceStatus::Unknown;
        }
        if self.supervisor.is_running(instance).await {
            InstanceStatus::Running
        } else {
            InstanceStatus::Stopped
        }
    }
}

fn generated(dir: &Path, files: &[&str]) -> bool {
    files.iter().all(|f| dir.join(f).exists())
}

async fn rollback(directory: &Path) {
    match fs::remove_dir_all(directory).await {
        Ok(()) => info!(dir = %directory.display(), "rolled back install directory"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(dir = %directory.display(), error = %e, "failed to roll back install directory"),
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}
