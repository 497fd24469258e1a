use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tokio::{fs, io::AsyncWriteExt};
use tracing::debug;

use crate::error::StoreError;

use super::Instance;

#[derive(Debug, Default, Deserialize)]
struct StoreDocument {
    #[serde(default)]
    servers: Vec<Instance>,
}

#[derive(Serialize)]
struct StoreDocumentRef<'a> {
    servers: &'a [Instance],
}

/// The persisted list of installed servers.
///
/// Every call reads or writes the whole document. `add` and `remove` hold an exclusive lock on
/// `<document>.lock` for their load-modify-save section so that two processes sharing a data root
/// cannot lose each other's writes.
#[derive(Debug, Clone)]
pub struct InstanceStore {
    path: PathBuf,
}

impl InstanceStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing document is an empty store.
    pub async fn load(&self) -> Result<Vec<Instance>, StoreError> {
        let raw = match fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(self.io_error(source)),
        };
        let doc: StoreDocument =
            serde_json::from_slice(&raw).map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        Ok(doc.servers)
    }

    /// Replaces the document atomically (temp file, fsync, rename).
    pub async fn save(&self, instances: &[Instance]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let data = serde_json::to_vec_pretty(&StoreDocumentRef { servers: instances }).map_err(
            |source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            },
        )?;

        let tmp = self.path.with_extension("json.tmp");
        let written: io::Result<()> = async {
            let mut f = fs::File::create(&tmp).await?;
            f.write_all(&data).await?;
            f.sync_all().await?;
            Ok(())
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(self.io_error(e));
        }

        if let Err(e) = fs::rename(&tmp, &self.path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(self.io_error(e));
        }

        debug!(path = %self.path.display(), count = instances.len(), "store saved");
        Ok(())
    }

    pub async fn find(&self, id: &str) -> Result<Option<Instance>, StoreError> {
        Ok(self.load().await?.into_iter().find(|i| i.id == id))
    }

    pub async fn add(&self, instance: Instance) -> Result<(), StoreError> {
        let _lock = self.lock().await?;
        let mut instances = self.load().await?;

        if instances.iter().any(|i| i.id == instance.id) {
            return Err(StoreError::DuplicateId(instance.id));
        }
        if instances.iter().any(|i| i.directory == instance.directory) {
            return Err(StoreError::DuplicateDirectory(instance.directory));
        }

        instances.push(instance);
        self.save(&instances).await
    }

    /// Removes and returns the record for `id`.
    pub async fn remove(&self, id: &str) -> Result<Instance, StoreError> {
        let _lock = self.lock().await?;
        let mut instances = self.load().await?;

        let pos = instances
            .iter()
            .position(|i| i.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let removed = instances.remove(pos);

        self.save(&instances).await?;
        Ok(removed)
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| OsString::from("store"));
        name.push(".lock");
        self.path.with_file_name(name)
    }

    async fn lock(&self) -> Result<StoreLock, StoreError> {
        let path = self.lock_path();
        let acquired = tokio::task::spawn_blocking(move || StoreLock::acquire(&path))
            .await
            .map_err(io::Error::other)
            .and_then(|res| res);
        acquired.map_err(|e| StoreError::Io {
            path: self.lock_path(),
            source: e,
        })
    }

    fn io_error(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Exclusive advisory lock, released when dropped.
struct StoreLock {
    _file: std::fs::File,
}

impl StoreLock {
    fn acquire(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;

            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::TempDir;

    use super::*;
    use crate::config::{Implementation, Variant};

    fn instance(id: &str, dir: &TempDir) -> Instance {
        Instance {
            id: id.to_string(),
            name: id.to_uppercase(),
            implementation: Implementation::Java,
            variant: Variant::Vanilla,
            version: "1.20.1".to_string(),
            directory: dir.path().join("servers").join(id),
            created_at: Utc::now(),
        }
    }

    fn store(dir: &TempDir) -> InstanceStore {
        InstanceStore::new(dir.path().join("servers.json"))
    }

    #[tokio::test]
    async fn load_returns_empty_when_no_document() {
        let dir = TempDir::new().unwrap();
        assert!(store(&dir).load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_find_remove() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        let alpha = instance("alpha", &dir);

        s.add(alpha.clone()).await.unwrap();
        s.add(instance("beta", &dir)).await.unwrap();

        assert_eq!(s.find("alpha").await.unwrap(), Some(alpha.clone()));
        assert_eq!(s.remove("alpha").await.unwrap(), alpha);
        assert_eq!(s.find("alpha").await.unwrap(), None);

        let ids: Vec<String> = s.load().await.unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["beta".to_string()]);
    }

    #[tokio::test]
    async fn add_rejects_duplicate_id_and_directory() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.add(instance("alpha", &dir)).await.unwrap();

        let err = s.add(instance("alpha", &dir)).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId(id) if id == "alpha"));

        let mut clash = instance("gamma", &dir);
        clash.directory = dir.path().join("servers").join("alpha");
        let err = s.add(clash).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateDirectory(_)));

        assert_eq!(s.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = store(&dir).remove("ghost").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn corrupt_document_is_an_error() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        std::fs::write(s.path(), b"{not json").unwrap();
        assert!(matches!(
            s.load().await.unwrap_err(),
            StoreError::Corrupt { .. }
        ));
    }

    #[tokio::test]
    async fn save_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let s = store(&dir);
        s.save(&[instance("alpha", &dir)]).await.unwrap();

        assert!(s.path().exists());
        assert!(!dir.path().join("servers.json.tmp").exists());
        let raw = std::fs::read_to_string(s.path()).unwrap();
        assert!(raw.contains("\"servers\""));
    }
}
