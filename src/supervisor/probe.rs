//! OS process queries used to decide whether a pid marker still describes our server.

use std::path::Path;

use super::marker::PidMarker;

#[cfg(unix)]
fn valid_pid(pid: u32) -> Option<libc::pid_t> {
    // 0 and negative values address process groups in kill(2).
    libc::pid_t::try_from(pid).ok().filter(|p| *p > 0)
}

#[cfg(unix)]
pub(crate) fn pid_exists(pid: u32) -> bool {
    let Some(pid) = valid_pid(pid) else {
        return false;
    };
    // EPERM means the pid belongs to another user, which is never one of ours.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
pub(crate) fn pid_exists(_pid: u32) -> bool {
    false
}

/// `(state, starttime)` from `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
async fn proc_stat(pid: u32) -> Option<(char, u64)> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/stat")).await.ok()?;
    let end = s.rfind(')')?;
    let rest = s.get((end + 2)..)?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let state = parts.first()?.chars().next()?;
    let start: u64 = parts.get(19)?.parse().ok()?;
    Some((state, start))
}

#[cfg(target_os = "linux")]
pub(crate) async fn start_ticks(pid: u32) -> Option<u64> {
    proc_stat(pid).await.map(|(_, start)| start)
}

#[cfg(not(target_os = "linux"))]
pub(crate) async fn start_ticks(_pid: u32) -> Option<u64> {
    None
}

/// True only when the marker's pid is alive and still looks like the process we launched in
/// `dir`. A reused pid fails the start-time or cwd comparison.
#[cfg(target_os = "linux")]
pub(crate) async fn matches(marker: &PidMarker, dir: &Path) -> bool {
    let pid = marker.pid;
    if !pid_exists(pid) {
        return false;
    }

    let Some((state, start)) = proc_stat(pid).await else {
        return false;
    };
    if matches!(state, 'Z' | 'X') {
        return false;
    }
    if let Some(expected) = marker.start_ticks
        && expected != start
    {
        return false;
    }

    if let (Ok(cwd), Ok(dir)) = (
        tokio::fs::read_link(format!("/proc/{pid}/cwd")).await,
        tokio::fs::canonicalize(dir).await,
    ) && cwd != dir
    {
        return false;
    }

    true
}

#[cfg(not(target_os = "linux"))]
pub(crate) async fn matches(marker: &PidMarker, _dir: &Path) -> bool {
    pid_exists(marker.pid)
}
