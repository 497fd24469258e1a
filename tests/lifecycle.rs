use std::{
    collections::HashSet,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use mcsm::{
    Implementation, InstallRequest, Instance, InstanceStatus, LifecycleError, LifecycleManager,
    ManagerConfig, Supervisor, Variant,
    download::Downloader,
    error::{DownloadError, LaunchError, ResolveError, StopError},
    instance::ProcessHandle,
    resolver::Resolver,
};
use tempfile::TempDir;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const STUB_PID: u32 = 4242;

struct StubResolver;

#[async_trait]
impl Resolver for StubResolver {
    async fn resolve(
        &self,
        implementation: Implementation,
        variant: Variant,
        version: &str,
    ) -> Result<String, ResolveError> {
        if !variant.supports(implementation) {
            return Err(ResolveError::UnsupportedCombination {
                implementation,
                variant,
                version: version.to_string(),
            });
        }
        Ok(format!("http://127.0.0.1:9/{implementation}/{variant}/{version}"))
    }
}

/// Fails the first `fail_first` attempts of every fetch, then writes a small body. Zip
/// destinations get a minimal bedrock distribution unless `corrupt_archives` is set.
#[derive(Default)]
struct FlakyDownloader {
    fail_first: u32,
    corrupt_archives: bool,
    calls: AtomicU32,
}

impl FlakyDownloader {
    fn failing(fail_first: u32) -> Self {
        Self {
            fail_first,
            ..Default::default()
        }
    }
}

#[async_trait]
impl Downloader for FlakyDownloader {
    async fn fetch(
        &self,
        url: &str,
        destination: &Path,
        max_attempts: u32,
    ) -> Result<(), DownloadError> {
        if max_attempts == 0 {
            return Err(DownloadError::InvalidAttempts);
        }
        for attempt in 1..=max_attempts {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if attempt <= self.fail_first {
                continue;
            }
            let archive = destination.extension().is_some_and(|e| e == "zip");
            let body = if archive && !self.corrupt_archives {
                bedrock_zip()
            } else {
                b"artifact".to_vec()
            };
            return tokio::fs::write(destination, body)
                .await
                .map_err(|source| DownloadError::Io {
                    path: destination.to_path_buf(),
                    source,
                });
        }
        Err(DownloadError::Exhausted {
            url: url.to_string(),
            attempts: max_attempts,
            last: Box::new(DownloadError::Status { status: 503 }),
        })
    }
}

fn bedrock_zip() -> Vec<u8> {
    use std::io::Write;
    use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

    let mut w = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let opts = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    w.start_file("bedrock_server", opts).unwrap();
    w.write_all(b"\x7fELF").unwrap();
    w.start_file("libCrypto.so", opts).unwrap();
    w.write_all(b"lib").unwrap();
    w.finish().unwrap().into_inner()
}

/// In-memory process table.
#[derive(Default)]
struct StubSupervisor {
    running: Mutex<HashSet<String>>,
    stop_delay: Duration,
    generate_on_start: bool,
    exits_immediately: bool,
    starts: AtomicU32,
    stops: AtomicU32,
}

impl StubSupervisor {
    fn running(&self, id: &str) -> bool {
        self.running.lock().unwrap().contains(id)
    }
}

#[async_trait]
impl Supervisor for StubSupervisor {
    async fn start(&self, instance: &Instance) -> Result<ProcessHandle, LaunchError> {
        {
            let mut running = self.running.lock().unwrap();
            if running.contains(&instance.id) {
                return Err(LaunchError::AlreadyRunning { pid: STUB_PID });
            }
            if !self.exits_immediately {
                running.insert(instance.id.clone());
            }
        }
        self.starts.fetch_add(1, Ordering::SeqCst);

        if self.generate_on_start {
            std::fs::write(instance.directory.join("server.properties"), b"motd=stub\n").unwrap();
            std::fs::create_dir_all(instance.directory.join("world")).unwrap();
        }

        Ok(ProcessHandle {
            pid: STUB_PID,
            launch_id: Uuid::new_v4(),
            log_path: instance.directory.join("stub.log"),
            started_at: Utc::now(),
        })
    }

    async fn stop(
        &self,
        instance: &Instance,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), StopError> {
        if !self.running(&instance.id) {
            return Ok(());
        }
        self.stops.fetch_add(1, Ordering::SeqCst);

        if self.stop_delay > timeout {
            sleep(timeout).await;
            return Err(StopError::Timeout {
                pid: STUB_PID,
                waited: timeout,
            });
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(StopError::Cancelled { pid: STUB_PID }),
            _ = sleep(self.stop_delay) => {}
        }

        self.running.lock().unwrap().remove(&instance.id);
        Ok(())
    }

    async fn is_running(&self, instance: &Instance) -> bool {
        self.running(&instance.id)
    }
}

fn manager(
    root: &TempDir,
    downloader: FlakyDownloader,
    supervisor: &Arc<StubSupervisor>,
) -> LifecycleManager {
    let mut config = ManagerConfig::with_data_root(root.path());
    config.stop_timeout = Duration::from_secs(5);
    config.bootstrap.timeout = Duration::from_millis(300);
    config.bootstrap.poll_interval = Duration::from_millis(20);
    LifecycleManager::new(
        config,
        Arc::new(StubResolver),
        Arc::new(downloader),
        supervisor.clone(),
    )
}

fn request(name: &str, implementation: Implementation, variant: Variant, version: &str) -> InstallRequest {
    InstallRequest {
        name: name.to_string(),
        implementation,
        variant,
        version: version.to_string(),
        bootstrap: false,
    }
}

fn java(name: &str) -> InstallRequest {
    request(name, Implementation::Java, Variant::Vanilla, "1.20.1")
}

#[tokio::test]
async fn install_then_find_matches_inputs() {
    let root = TempDir::new().unwrap();
    let sup = Arc::new(StubSupervisor::default());
    let mgr = manager(&root, FlakyDownloader::default(), &sup);
    let cancel = CancellationToken::new();

    let cases = [
        ("Survival", Implementation::Java, Variant::Vanilla, "1.20.1"),
        ("paper smp", Implementation::Java, Variant::Paper, "1.19.4"),
        ("Modded", Implementation::Java, Variant::Fabric, "1.18.2"),
        ("Forge Pack", Implementation::Java, Variant::Forge, "1.16.5"),
        ("pe", Implementation::Bedrock, Variant::PocketMine, "5.0.0"),
        ("nk", Implementation::Bedrock, Variant::Nukkit, "1.0"),
        ("bds", Implementation::Bedrock, Variant::Vanilla, "1.20.0"),
    ];

    for (name, implementation, variant, version) in cases {
        let installed = mgr
            .install(request(name, implementation, variant, version), &cancel)
            .await
            .unwrap();
        let found = mgr.store().find(&installed.id).await.unwrap().unwrap();

        assert_eq!(found, installed);
        assert_eq!(found.name, name);
        assert_eq!(found.implementation, implementation);
        assert_eq!(found.variant, variant);
        assert_eq!(found.version, version);
        assert!(found.directory.starts_with(root.path()));
        assert!(found.artifact_path().is_file());

        let eula = std::fs::read_to_string(found.directory.join("eula.txt")).unwrap();
        assert!(eula.contains("eula=true"));
    }

    assert_eq!(mgr.store().load().await.unwrap().len(), cases.len());
}

#[cfg(unix)]
#[tokio::test]
async fn native_artifact_is_executable() {
    use std::os::unix::fs::PermissionsExt;

    let root = TempDir::new().unwrap();
    let sup = Arc::new(StubSupervisor::default());
    let mgr = manager(&root, FlakyDownloader::default(), &sup);

    let instance = mgr
        .install(
            request("bds", Implementation::Bedrock, Variant::Vanilla, "1.20.0"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    let mode = std::fs::metadata(instance.artifact_path())
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o755);
    assert!(instance.directory.join("libCrypto.so").is_file());
    assert!(!instance.directory.join("bedrock-server.zip").exists());
}

#[tokio::test]
async fn corrupt_archive_rolls_back() {
    let root = TempDir::new().unwrap();
    let sup = Arc::new(StubSupervisor::default());
    let downloader = FlakyDownloader {
        corrupt_archives: true,
        ..Default::default()
    };
    let mgr = manager(&root, downloader, &sup);

    let err = mgr
        .install(
            request("bds", Implementation::Bedrock, Variant::Vanilla, "1.20.0"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Unpack { ref id, .. } if id == "bds"));
    assert!(!mgr.config().instance_dir("bds").exists());
    assert!(mgr.store().load().await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_name_is_rejected_and_store_unchanged() {
    let root = TempDir::new().unwrap();
    let sup = Arc::new(StubSupervisor::default());
    let mgr = manager(&root, FlakyDownloader::default(), &sup);
    let cancel = CancellationToken::new();

    let first = mgr.install(java("alpha"), &cancel).await.unwrap();
    let before = mgr.store().load().await.unwrap();

    let err = mgr.install(java("Alpha"), &cancel).await.unwrap_err();
    assert!(matches!(err, LifecycleError::DuplicateName { ref id } if id == "alpha"));

    let after = mgr.store().load().await.unwrap();
    assert_eq!(before.len(), after.len());
    assert!(first.directory.is_dir());
}

#[tokio::test]
async fn exhausted_download_rolls_back() {
    let root = TempDir::new().unwrap();
    let sup = Arc::new(StubSupervisor::default());
    let mgr = manager(&root, FlakyDownloader::failing(3), &sup);

    let err = mgr
        .install(java("alpha"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::InstallFailed {
            cause: DownloadError::Exhausted { attempts: 3, .. },
            ..
        }
    ));

    assert!(!mgr.config().instance_dir("alpha").exists());
    assert!(mgr.store().load().await.unwrap().is_empty());
}

#[tokio::test]
async fn unsupported_combination_rolls_back() {
    let root = TempDir::new().unwrap();
    let sup = Arc::new(StubSupervisor::default());
    let mgr = manager(&root, FlakyDownloader::default(), &sup);

    let err = mgr
        .install(
            request("odd", Implementation::Java, Variant::Nukkit, "1.0"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::UnsupportedCombination { .. }));
    assert!(!mgr.config().instance_dir("odd").exists());
    assert!(mgr.store().load().await.unwrap().is_empty());
}

#[tokio::test]
async fn unusable_names_are_rejected() {
    let root = TempDir::new().unwrap();
    let sup = Arc::new(StubSupervisor::default());
    let mgr = manager(&root, FlakyDownloader::default(), &sup);

    for name in ["", "   ", "!!!"] {
        let err = mgr
            .install(java(name), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidName(_)), "{name:?}");
    }
}

#[tokio::test]
async fn pre_existing_directory_is_not_adopted() {
    let root = TempDir::new().unwrap();
    let sup = Arc::new(StubSupervisor::default());
    let mgr = manager(&root, FlakyDownloader::default(), &sup);

    let dir = mgr.config().instance_dir("alpha");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("keep.txt"), b"mine").unwrap();

    let err = mgr
        .install(java("alpha"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::Io { .. }));
    assert!(dir.join("keep.txt").is_file());
}

#[tokio::test]
async fn stop_never_started_is_ok() {
    let root = TempDir::new().unwrap();
    let sup = Arc::new(StubSupervisor::default());
    let mgr = manager(&root, FlakyDownloader::default(), &sup);
    let cancel = CancellationToken::new();

    mgr.install(java("alpha"), &cancel).await.unwrap();
    mgr.stop("alpha", &cancel).await.unwrap();
    mgr.stop("alpha", &cancel).await.unwrap();
    assert_eq!(sup.stops.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn delete_running_is_refused() {
    let root = TempDir::new().unwrap();
    let sup = Arc::new(StubSupervisor::default());
    let mgr = manager(&root, FlakyDownloader::default(), &sup);
    let cancel = CancellationToken::new();

    let instance = mgr.install(java("alpha"), &cancel).await.unwrap();
    mgr.start("alpha").await.unwrap();

    let err = mgr.delete("alpha").await.unwrap_err();
    assert!(matches!(err, LifecycleError::StillRunning(ref id) if id == "alpha"));
    assert!(instance.directory.is_dir());
    assert!(mgr.store().find("alpha").await.unwrap().is_some());
}

#[tokio::test]
async fn start_stop_start() {
    let root = TempDir::new().unwrap();
    let sup = Arc::new(StubSupervisor::default());
    let mgr = manager(&root, FlakyDownloader::default(), &sup);
    let cancel = CancellationToken::new();

    mgr.install(java("alpha"), &cancel).await.unwrap();
    mgr.start("alpha").await.unwrap();
    assert_eq!(mgr.status("alpha").await.unwrap(), InstanceStatus::Running);

    mgr.stop("alpha", &cancel).await.unwrap();
    assert_eq!(mgr.status("alpha").await.unwrap(), InstanceStatus::Stopped);

    mgr.start("alpha").await.unwrap();
    assert_eq!(sup.starts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn second_start_is_already_running() {
    let root = TempDir::new().unwrap();
    let sup = Arc::new(StubSupervisor::default());
    let mgr = manager(&root, FlakyDownloader::default(), &sup);

    mgr.install(java("alpha"), &CancellationToken::new())
        .await
        .unwrap();
    mgr.start("alpha").await.unwrap();

    let err = mgr.start("alpha").await.unwrap_err();
    assert!(matches!(err, LifecycleError::AlreadyRunning(ref id) if id == "alpha"));
    assert_eq!(sup.starts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn alpha_scenario() {
    let root = TempDir::new().unwrap();
    let sup = Arc::new(StubSupervisor {
        stop_delay: Duration::from_secs(1),
        ..Default::default()
    });
    let mgr = manager(&root, FlakyDownloader::failing(1), &sup);
    let cancel = CancellationToken::new();

    let instance = mgr.install(java("alpha"), &cancel).await.unwrap();
    let stored = mgr.store().load().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, "alpha");

    mgr.start("alpha").await.unwrap();
    assert!(sup.running("alpha"));

    mgr.stop_with_timeout("alpha", Duration::from_secs(5), &cancel)
        .await
        .unwrap();
    assert!(!sup.running("alpha"));

    mgr.delete("alpha").await.unwrap();
    assert!(mgr.store().load().await.unwrap().is_empty());
    assert!(!instance.directory.exists());
}

#[tokio::test]
async fn slow_stop_is_a_stop_timeout() {
    let root = TempDir::new().unwrap();
    let sup = Arc::new(StubSupervisor {
        stop_delay: Duration::from_secs(10),
        ..Default::default()
    });
    let mgr = manager(&root, FlakyDownloader::default(), &sup);
    let cancel = CancellationToken::new();

    mgr.install(java("alpha"), &cancel).await.unwrap();
    mgr.start("alpha").await.unwrap();

    let err = mgr
        .stop_with_timeout("alpha", Duration::from_millis(100), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, LifecycleError::StopTimeout { .. }));
    assert!(sup.running("alpha"));
}

#[tokio::test]
async fn bootstrap_waits_for_generated_files() {
    let root = TempDir::new().unwrap();
    let sup = Arc::new(StubSupervisor {
        generate_on_start: true,
        ..Default::default()
    });
    let mgr = manager(&root, FlakyDownloader::default(), &sup);

    let mut req = java("alpha");
    req.bootstrap = true;
    let instance = mgr.install(req, &CancellationToken::new()).await.unwrap();

    assert!(instance.directory.join("server.properties").is_file());
    assert_eq!(mgr.status("alpha").await.unwrap(), InstanceStatus::Stopped);
    assert_eq!(sup.starts.load(Ordering::SeqCst), 1);
    assert_eq!(sup.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn bootstrap_timeout_keeps_instance_installed() {
    let root = TempDir::new().unwrap();
    let sup = Arc::new(StubSupervisor::default());
    let mgr = manager(&root, FlakyDownloader::default(), &sup);

    let mut req = java("alpha");
    req.bootstrap = true;
    let err = mgr.install(req, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, LifecycleError::BootstrapTimeout { ref id, .. } if id == "alpha"));

    assert!(mgr.store().find("alpha").await.unwrap().is_some());
    assert!(mgr.config().instance_dir("alpha").is_dir());
    assert!(!sup.running("alpha"));
}

#[tokio::test]
async fn bootstrap_cancel_stops_server() {
    let root = TempDir::new().unwrap();
    let sup = Arc::new(StubSupervisor::default());
    let mgr = manager(&root, FlakyDownloader::default(), &sup);
    let cancel = CancellationToken::new();

    mgr.install(java("alpha"), &cancel).await.unwrap();
    cancel.cancel();

    let err = mgr.bootstrap("alpha", &cancel).await.unwrap_err();
    assert!(matches!(err, LifecycleError::BootstrapCancelled(_)));
    assert!(!sup.running("alpha"));
}

#[tokio::test]
async fn bootstrap_reports_early_exit() {
    let root = TempDir::new().unwrap();
    let sup = Arc::new(StubSupervisor {
        exits_immediately: true,
        ..Default::default()
    });
    let mgr = manager(&root, FlakyDownloader::default(), &sup);
    let cancel = CancellationToken::new();

    mgr.install(java("alpha"), &cancel).await.unwrap();
    let err = mgr.bootstrap("alpha", &cancel).await.unwrap_err();
    assert!(matches!(err, LifecycleError::BootstrapExited(_)));
    assert!(mgr.store().find("alpha").await.unwrap().is_some());
}

#[tokio::test]
async fn restart_cycles_the_process() {
    let root = TempDir::new().unwrap();
    let sup = Arc::new(StubSupervisor::default());
    let mgr = manager(&root, FlakyDownloader::default(), &sup);
    let cancel = CancellationToken::new();

    mgr.install(java("alpha"), &cancel).await.unwrap();
    mgr.start("alpha").await.unwrap();

    let handle = mgr.restart("alpha", &cancel).await.unwrap();
    assert_eq!(handle.pid, STUB_PID);
    assert!(sup.running("alpha"));
    assert_eq!(sup.starts.load(Ordering::SeqCst), 2);
    assert_eq!(sup.stops.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn restart_of_stopped_server_starts_it() {
    let root = TempDir::new().unwrap();
    let sup = Arc::new(StubSupervisor::default());
    let mgr = manager(&root, FlakyDownloader::default(), &sup);
    let cancel = CancellationToken::new();

    mgr.install(java("alpha"), &cancel).await.unwrap();
    mgr.restart("alpha", &cancel).await.unwrap();
    assert!(sup.running("alpha"));
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let root = TempDir::new().unwrap();
    let sup = Arc::new(StubSupervisor::default());
    let mgr = manager(&root, FlakyDownloader::default(), &sup);
    let cancel = CancellationToken::new();

    assert!(matches!(mgr.start("ghost").await, Err(LifecycleError::NotFound(_))));
    assert!(matches!(mgr.stop("ghost", &cancel).await, Err(LifecycleError::NotFound(_))));
    assert!(matches!(mgr.restart("ghost", &cancel).await, Err(LifecycleError::NotFound(_))));
    assert!(matches!(mgr.delete("ghost").await, Err(LifecycleError::NotFound(_))));
    assert!(matches!(mgr.status("ghost").await, Err(LifecycleError::NotFound(_))));
    assert!(matches!(mgr.bootstrap("ghost", &cancel).await, Err(LifecycleError::NotFound(_))));
}

#[tokio::test]
async fn missing_directory_is_unknown_status() {
    let root = TempDir::new().unwrap();
    let sup = Arc::new(StubSupervisor::default());
    let mgr = manager(&root, FlakyDownloader::default(), &sup);

    let instance = mgr
        .install(java("alpha"), &CancellationToken::new())
        .await
        .unwrap();
    std::fs::remove_dir_all(&instance.directory).unwrap();

    assert_eq!(mgr.status("alpha").await.unwrap(), InstanceStatus::Unknown);
    let listed = mgr.list().await.unwrap();
    assert_eq!(listed, vec![(instance, InstanceStatus::Unknown)]);
}

#[tokio::test]
async fn delete_removes_log_and_tolerates_missing_directory() {
    let root = TempDir::new().unwrap();
    let sup = Arc::new(StubSupervisor::default());
    let mgr = manager(&root, FlakyDownloader::default(), &sup);

    let instance = mgr
        .install(java("alpha"), &CancellationToken::new())
        .await
        .unwrap();
    let log = mgr.log_path("alpha");
    std::fs::create_dir_all(log.parent().unwrap()).unwrap();
    std::fs::write(&log, b"[mcsm] launching\n").unwrap();
    std::fs::remove_dir_all(&instance.directory).unwrap();

    mgr.delete("alpha").await.unwrap();
    assert!(!log.exists());
    assert!(mgr.store().find("alpha").await.unwrap().is_none());
}

#[tokio::test]
async fn store_failure_after_directory_removal_is_partial_delete() {
    let root = TempDir::new().unwrap();
    let sup = Arc::new(StubSupervisor::default());
    let mgr = manager(&root, FlakyDownloader::default(), &sup);

    let instance = mgr
        .install(java("alpha"), &CancellationToken::new())
        .await
        .unwrap();

    // A directory where the lock file belongs makes every store write fail.
    let lock = root.path().join("servers.json.lock");
    let _ = std::fs::remove_file(&lock);
    std::fs::create_dir(&lock).unwrap();

    let err = mgr.delete("alpha").await.unwrap_err();
    assert!(matches!(
        err,
        LifecycleError::PartialDelete {
            ref id,
            store_removed: false,
            dir_removed: true,
            ..
        } if id == "alpha"
    ));
    assert!(!instance.directory.exists());
    assert!(mgr.store().find("alpha").await.unwrap().is_some());

    std::fs::remove_dir(&lock).unwrap();
    mgr.delete("alpha").await.unwrap();
    assert!(mgr.store().find("alpha").await.unwrap().is_none());
}
