use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;

use crate::error::DownloadError;

/// Called with `(downloaded_bytes, total_bytes)` as a transfer progresses.
pub type ProgressFn = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// Fetches a remote artifact to a local file with bounded retries.
///
/// On success `destination` holds the complete body. On failure neither `destination` nor any
/// partial file is left behind.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        destination: &Path,
        max_attempts: u32,
    ) -> Result<(), DownloadError>;
}

const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Delay before attempt `attempt + 1`. `attempt` is 1-based.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let pow = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << pow).min(BACKOFF_CAP)
}

/// Checks the caller-side preconditions shared by every downloader.
pub(crate) fn check_request(destination: &Path, max_attempts: u32) -> Result<(), DownloadError> {
    if max_attempts == 0 {
        return Err(DownloadError::InvalidAttempts);
    }
    let parent = destination
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    if !parent.is_dir() {
        return Err(DownloadError::MissingParent(parent.to_path_buf()));
    }
    Ok(())
}

/// Temp file next to `destination` so the final rename never crosses filesystems.
pub(crate) fn part_path(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "download".to_string());
    destination.with_file_name(format!(".{name}.{}.part", uuid::Uuid::new_v4().simple()))
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(feature = "http")]
pub use http::HttpDownloader;

#[cfg(feature = "http")]
mod http {
    use std::{path::Path, time::Duration};

    use async_trait::async_trait;
    use tokio::{fs, io::AsyncWriteExt};
    use tokio_stream::StreamExt;
    use tracing::{debug, info, warn};

    use super::{
        Downloader, ProgressFn, backoff_delay, check_request, part_path, remove_if_exists,
    };
    use crate::error::DownloadError;

    const DEFAULT_BACKOFF: Duration = Duration::from_millis(200);

    /// [`Downloader`] over HTTP(S) using reqwest.
    #[derive(Clone)]
    pub struct HttpDownloader {
        client: reqwest::Client,
        backoff: Duration,
        progress: Option<ProgressFn>,
    }

    impl HttpDownloader {
        pub fn new() -> Result<Self, DownloadError> {
            let client = reqwest::Client::builder()
                .user_agent(concat!("mcsm/", env!("CARGO_PKG_VERSION")))
                .connect_timeout(Duration::from_secs(30))
                .timeout(Duration::from_secs(15 * 60))
                .build()
                .map_err(|e| DownloadError::Transport(e.to_string()))?;
            Ok(Self::with_client(client))
        }

        pub fn with_client(client: reqwest::Client) -> Self {
            Self {
                client,
                backoff: DEFAULT_BACKOFF,
                progress: None,
            }
        }

        pub fn with_backoff(mut self, backoff: Duration) -> Self {
            self.backoff = backoff;
            self
        }

        pub fn with_progress(mut self, progress: ProgressFn) -> Self {
            self.progress = Some(progress);
            self
        }

        async fn attempt(&self, url: &str, part: &Path) -> Result<u64, DownloadError> {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|e| DownloadError::Transport(e.to_string()))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(DownloadError::Status {
                    status: status.as_u16(),
                });
            }

            let total = resp.content_length();
            let io_err = |source| DownloadError::Io {
                path: part.to_path_buf(),
                source,
            };

            let mut out = fs::File::create(part).await.map_err(io_err)?;
            let mut received = 0u64;
            let stream = resp.bytes_stream();
            tokio::pin!(stream);
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| DownloadError::Transport(e.to_string()))?;
                out.write_all(&chunk).await.map_err(io_err)?;
                received += chunk.len() as u64;
                if let Some(progress) = &self.progress {
                    progress(received, total);
                }
            }

            if let Some(expected) = total
                && received != expected
            {
                return Err(DownloadError::Truncated { expected, received });
            }

            out.flush().await.map_err(io_err)?;
            out.sync_all().await.map_err(io_err)?;
            Ok(received)
        }
    }

    #[async_trait]
    impl Downloader for HttpDownloader {
        async fn fetch(
            &self,
            url: &str,
            destination: &Path,
            max_attempts: u32,
        ) -> Result<(), DownloadError> {
            check_request(destination, max_attempts)?;

            let mut last: Option<DownloadError> = None;
            for attempt in 1..=max_attempts {
                let part = part_path(destination);
                match self.attempt(url, &part).await {
                    Ok(bytes) => {
                        if let Err(source) = fs::rename(&part, destination).await {
                            let _ = remove_if_exists(&part).await;
                            return Err(DownloadError::Io {
                                path: destination.to_path_buf(),
                                source,
                            });
                        }
                        info!(url, attempt, bytes, dest = %destination.display(), "download complete");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(url, attempt, max_attempts, error = %e, "download attempt failed");
                        if let Err(rm) = remove_if_exists(&part).await {
                            debug!(path = %part.display(), error = %rm, "failed to discard partial download");
                        }
                        last = Some(e);
                        if attempt < max_attempts {
                            tokio::time::sleep(backoff_delay(self.backoff, attempt)).await;
                        }
                    }
                }
            }

            // A stale artifact from an earlier run must not pass for this download.
            if let Err(e) = remove_if_exists(destination).await {
                warn!(dest = %destination.display(), error = %e, "failed to remove stale destination");
            }

            Err(DownloadError::Exhausted {
                url: url.to_string(),
                attempts: max_attempts,
                last: Box::new(last.unwrap_or(DownloadError::InvalidAttempts)),
            })
        }
    }
}
