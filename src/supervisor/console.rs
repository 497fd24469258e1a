//! Named pipe wired to the server's stdin so console commands can be sent by any later run of
//! the program, not only the one that launched it.

use std::{io, path::Path, process::Stdio};

pub const CONSOLE_FILE: &str = ".console";

/// Creates a fresh pipe in `dir` and opens it as the child's stdin.
///
/// The pipe is opened read-write so the child never sees EOF when no writer is attached.
#[cfg(unix)]
pub(crate) fn open(dir: &Path) -> io::Result<Stdio> {
    use std::{ffi::CString, os::unix::ffi::OsStrExt};

    let path = dir.join(CONSOLE_FILE);
    remove(dir)?;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    if unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)?;
    Ok(Stdio::from(file))
}

#[cfg(not(unix))]
pub(crate) fn open(_dir: &Path) -> io::Result<Stdio> {
    Ok(Stdio::null())
}

/// Writes one command line. Fails with `ENXIO` when no process holds the pipe.
#[cfg(unix)]
pub(crate) fn send(dir: &Path, command: &str) -> io::Result<()> {
    use std::{
        io::Write,
        os::unix::fs::{FileTypeExt, OpenOptionsExt},
    };

    let mut f = std::fs::OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(dir.join(CONSOLE_FILE))?;
    if !f.metadata()?.file_type().is_fifo() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "console is not a pipe",
        ));
    }

    let mut line = command.to_string();
    if !line.ends_with('\n') {
        line.push('\n');
    }
    f.write_all(line.as_bytes())
}

#[cfg(not(unix))]
pub(crate) fn send(_dir: &Path, _command: &str) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "console pipes need a unix host",
    ))
}

pub(crate) fn remove(dir: &Path) -> io::Result<()> {
    match std::fs::remove_file(dir.join(CONSOLE_FILE)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{io::Read, os::unix::fs::OpenOptionsExt};

    use super::*;

    #[test]
    fn send_without_reader_fails() {
        let dir = tempfile::tempdir().unwrap();
        let stdin = open(dir.path()).unwrap();
        drop(stdin);
        assert!(send(dir.path(), "stop").is_err());
    }

    #[test]
    fn send_reaches_holder() {
        let dir = tempfile::tempdir().unwrap();
        let _stdin = open(dir.path()).unwrap();

        let mut reader = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(dir.path().join(CONSOLE_FILE))
            .unwrap();
        send(dir.path(), "stop").unwrap();

        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"stop\n");
    }

    #[test]
    fn send_refuses_regular_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONSOLE_FILE), b"").unwrap();
        let err = send(dir.path(), "stop").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
