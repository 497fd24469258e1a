use std::{
    collections::HashMap,
    io::{self, Write},
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::{
    process::{Child, Command},
    sync::Mutex,
    time::{Instant, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::{LaunchCommand, LaunchSettings, ManagerConfig},
    error::{LaunchError, StopError},
    instance::{Instance, ProcessHandle},
    utils::{PollOutcome, poll_until},
};

mod console;
mod marker;
mod probe;

pub use console::CONSOLE_FILE;
pub use marker::{MARKER_FILE, PidMarker};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long a SIGKILL gets to be observed before the stop is reported as timed out.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Starts, stops and observes server processes.
///
/// Liveness is never cached: every answer comes from the OS (or from a child this supervisor
/// still holds).
#[async_trait]
pub trait Supervisor: Send + Sync {
    async fn start(&self, instance: &Instance) -> Result<ProcessHandle, LaunchError>;

    /// Not running is success. Cancelling leaves the process as it is.
    async fn stop(
        &self,
        instance: &Instance,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), StopError>;

    async fn is_running(&self, instance: &Instance) -> bool;
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[derive(Debug)]
struct Tracked {
    pid: u32,
    child: Child,
}

/// [`Supervisor`] backed by real OS processes.
///
/// Each server runs in its own process group with cwd set to the instance directory, stdout and
/// stderr appended to `<logs_dir>/<id>.log`, and stdin attached to the console pipe. The pid
/// marker written at launch lets a later run of the program find it again.
#[derive(Debug)]
pub struct ProcessSupervisor {
    launch: LaunchSettings,
    logs_dir: PathBuf,
    poll_interval: Duration,
    children: Mutex<HashMap<String, Tracked>>,
}

impl ProcessSupervisor {
    pub fn new<P: Into<PathBuf>>(launch: LaunchSettings, logs_dir: P) -> Self {
        Self {
            launch,
            logs_dir: logs_dir.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ManagerConfig) -> Self {
        Self::new(config.launch.clone(), config.logs_dir())
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn log_path(&self, id: &str) -> PathBuf {
        self.logs_dir.join(format!("{id}.log"))
    }

    /// Checks a child launched by this supervisor. `None` when we hold no child for `id`.
    async fn reap(&self, id: &str, pid: u32) -> Option<bool> {
        let mut children = self.children.lock().await;
        let tracked = children.get_mut(id)?;
        if tracked.pid != pid {
            children.remove(id);
            return None;
        }

        match tracked.child.try_wait() {
            Ok(None) => Some(true),
            Ok(Some(status)) => {
                info!(id, pid, %status, "server process exited");
                children.remove(id);
                Some(false)
            }
            Err(e) => {
                debug!(id, pid, error = %e, "try_wait failed, falling back to os probe");
                children.remove(id);
                None
            }
        }
    }

    async fn alive(&self, instance: &Instance, marker: &PidMarker) -> bool {
        match self.reap(&instance.id, marker.pid).await {
            Some(running) => running,
            None => probe::matches(marker, &instance.directory).await,
        }
    }

    /// The marker for a process that is verifiably ours and alive. Stale markers are removed.
    async fn live_marker(&self, instance: &Instance) -> Option<PidMarker> {
        let marker = match PidMarker::read(&instance.directory).await {
            Ok(Some(marker)) => marker,
            Ok(None) => {
                self.children.lock().await.remove(&instance.id);
                return None;
            }
            Err(e) => {
                warn!(id = %instance.id, error = %e, "unreadable pid marker, discarding");
                self.clear(instance).await;
                return None;
            }
        };

        if self.alive(instance, &marker).await {
            Some(marker)
        } else {
            debug!(id = %instance.id, pid = marker.pid, "pid marker is stale");
            self.clear(instance).await;
            None
        }
    }

    async fn clear(&self, instance: &Instance) {
        if let Err(e) = PidMarker::remove(&instance.directory).await {
            warn!(id = %instance.id, error = %e, "failed to remove pid marker");
        }
        if let Err(e) = console::remove(&instance.directory) {
            debug!(id = %instance.id, error = %e, "failed to remove console pipe");
        }
    }

    #[cfg(unix)]
    async fn signal(&self, _id: &str, pid: u32, signal: Signal) -> Result<(), StopError> {
        let signo = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        let pgid = libc::pid_t::try_from(pid).map_err(|_| StopError::Signal {
            pid,
            source: io::Error::from(io::ErrorKind::InvalidInput),
        })?;

        // The server leads its own process group; signal the whole group.
        let rc = unsafe { libc::kill(-pgid, signo) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(StopError::Signal { pid, source: err });
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn signal(&self, id: &str, pid: u32, _signal: Signal) -> Result<(), StopError> {
        let mut children = self.children.lock().await;
        match children.get_mut(id) {
            Some(tracked) => tracked
                .child
                .start_kill()
                .map_err(|source| StopError::Signal { pid, source }),
            None => Err(StopError::Signal {
                pid,
                source: io::Error::from(io::ErrorKind::Unsupported),
            }),
        }
    }

    fn open_log(&self, path: &Path) -> Result<std::fs::File, LaunchError> {
        std::fs::create_dir_all(&self.logs_dir).map_err(|source| LaunchError::Prepare {
            reason: format!("create log directory {}", self.logs_dir.display()),
            source,
        })?;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| LaunchError::Prepare {
                reason: format!("open log file {}", path.display()),
                source,
            })
    }
}

fn prepare(reason: &'static str) -> impl FnOnce(io::Error) -> LaunchError {
    move |source| LaunchError::Prepare {
        reason: reason.to_string(),
        source,
    }
}

/// Kills a child that could not be registered and removes its console pipe.
fn discard(child: &mut Child, directory: &Path) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "child already gone while discarding launch");
    }
    let _ = console::remove(directory);
}

#[async_trait]
impl Supervisor for ProcessSupervisor {
    async fn start(&self, instance: &Instance) -> Result<ProcessHandle, LaunchError> {
        if let Some(marker) = self.live_marker(instance).await {
            return Err(LaunchError::AlreadyRunning { pid: marker.pid });
        }

        let artifact = instance.artifact_path();
        if !artifact.is_file() {
            return Err(LaunchError::ArtifactMissing(artifact));
        }

        let command = LaunchCommand::for_instance(instance, &self.launch);
        let log_path = self.log_path(&instance.id);
        let mut log = self.open_log(&log_path)?;

        writeln!(
            log,
            "[mcsm] {} launching: {} {} (cwd {})",
            Utc::now().to_rfc3339(),
            command.program,
            command.args.join(" "),
            instance.directory.display()
        )
        .map_err(prepare("write log header"))?;
        let log_err = log.try_clone().map_err(prepare("clone log handle"))?;
        let stdin = console::open(&instance.directory).map_err(prepare("create console pipe"))?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .current_dir(&instance.directory)
            .stdin(stdin)
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                let _ = console::remove(&instance.directory);
                return Err(LaunchError::Spawn {
                    program: command.program.clone(),
                    source,
                });
            }
        };
        let Some(pid) = child.id() else {
            discard(&mut child, &instance.directory);
            return Err(LaunchError::NoPid);
        };

        let marker = PidMarker::new(pid, command.program.clone(), probe::start_ticks(pid).await);
        if let Err(source) = marker.write(&instance.directory).await {
            // Without a marker nothing could find this process again.
            discard(&mut child, &instance.directory);
            return Err(LaunchError::Prepare {
                reason: "write pid marker".to_string(),
                source,
            });
        }

        self.children
            .lock()
            .await
            .insert(instance.id.clone(), Tracked { pid, child });

        info!(id = %instance.id, pid, launch_id = %marker.launch_id, log = %log_path.display(), "server started");
        Ok(ProcessHandle {
            pid,
            launch_id: marker.launch_id,
            log_path,
            started_at: marker.started_at,
        })
    }

    async fn stop(
        &self,
        instance: &Instance,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), StopError> {
        let Some(marker) = self.live_marker(instance).await else {
            debug!(id = %instance.id, "stop requested but server is not running");
            return Ok(());
        };
        let pid = marker.pid;
        let id = instance.id.as_str();

        let started = Instant::now();
        let term_at = started + timeout / 2;
        let kill_at = started + timeout;

        let mut term_sent = match console::send(
            &instance.directory,
            instance.implementation.stop_command(),
        ) {
            Ok(()) => {
                info!(id, pid, "sent stop command");
                false
            }
            Err(e) => {
                debug!(id, pid, error = %e, "console unavailable, sending SIGTERM");
                self.signal(id, pid, Signal::Term).await?;
                true
            }
        };

        loop {
            if !self.alive(instance, &marker).await {
                self.clear(instance).await;
                info!(id, pid, elapsed = ?started.elapsed(), "server stopped");
                return Ok(());
            }
            if cancel.is_cancelled() {
                warn!(id, pid, "stop cancelled, server left running");
                return Err(StopError::Cancelled { pid });
            }

            let now = Instant::now();
            if now >= kill_at {
                break;
            }
            if !term_sent && now >= term_at {
                info!(id, pid, "server still up, sending SIGTERM");
                self.signal(id, pid, Signal::Term).await?;
                term_sent = true;
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep(self.poll_interval) => {}
            }
        }

        warn!(id, pid, ?timeout, "server did not stop in time, sending SIGKILL");
        self.signal(id, pid, Signal::Kill).await?;

        let marker = &marker;
        let outcome = poll_until(KILL_GRACE, self.poll_interval, cancel, || async move {
            !self.alive(instance, marker).await
        })
        .await;

        match outcome {
            PollOutcome::Ready => {
                self.clear(instance).await;
                info!(id, pid, "server killed");
                Ok(())
            }
            PollOutcome::Cancelled => Err(StopError::Cancelled { pid }),
            PollOutcome::TimedOut => Err(StopError::Timeout {
                pid,
                waited: started.elapsed(),
            }),
        }
    }

    async fn is_running(&self, instance: &Instance) -> bool {
        self.live_marker(instance).await.is_some()
    }
}
