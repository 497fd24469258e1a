//! Unpacking of zipped server distributions into their instance directory.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use tracing::{debug, warn};
use zip::{ZipArchive, result::ZipError};

/// Extracts `archive` into `into` and removes it once `required` is present.
///
/// Entries whose paths would land outside `into` are skipped. Unix modes stored in the archive
/// are applied to the extracted files.
pub async fn unpack(archive: &Path, into: &Path, required: &str) -> Result<(), ZipError> {
    let archive = archive.to_path_buf();
    let into = into.to_path_buf();
    let required = PathBuf::from(required);
    tokio::task::spawn_blocking(move || unpack_blocking(&archive, &into, &required))
        .await
        .map_err(|e| ZipError::Io(io::Error::other(e)))?
}

fn unpack_blocking(archive: &Path, into: &Path, required: &Path) -> Result<(), ZipError> {
    let mut zip = ZipArchive::new(fs::File::open(archive)?)?;
    debug!(archive = %archive.display(), entries = zip.len(), "unpacking");

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(rel) = entry.enclosed_name() else {
            warn!(entry = entry.name(), "skipping archive entry outside the target directory");
            continue;
        };
        let out = into.join(rel);

        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&out)?;
        io::copy(&mut entry, &mut file)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&out, fs::Permissions::from_mode(mode & 0o777))?;
            }
        }
    }

    if !into.join(required).is_file() {
        return Err(ZipError::FileNotFound);
    }
    fs::remove_file(archive)?;
    Ok(())
}
