//! Temp file naming and lifecycle.
//!
//! Intermediate writes go to `{role}-{pid}-{task_id}-{nanos}.tmp` next
//! to their target; in-flight scan indices are `scan-{pid}-{task_id}.idx`.
//! Successful operations clean up their own temp files, failed ones
//! remove them on the error path. Leftovers from dead processes are
//! reported on startup but never deleted automatically.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{format_err, Error};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique id for one workflow run.
pub fn next_task_id() -> u64 {
    NEXT_TASK_ID.fetch_add(1, Ordering::SeqCst)
}

fn timestamp_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

/// Name for the scan index of the given task.
pub fn scan_index_name(task_id: u64) -> String {
    format!("scan-{}-{}.idx", std::process::id(), task_id)
}

/// Unique name for an intermediate index write.
pub fn temp_index_name(role: &str) -> String {
    format!(
        "{}-{}-{}-{}.tmp",
        role,
        std::process::id(),
        next_task_id(),
        timestamp_nanos()
    )
}

/// Removes the named file on drop unless disarmed first.
pub struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Call after the file was renamed away or is meant to survive.
    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(err) = std::fs::remove_file(&self.path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("unable to remove temp file {:?} - {}", self.path, err);
                }
            }
        }
    }
}

/// A scan or temp file whose creating process is gone.
pub struct OrphanFile {
    pub path: PathBuf,
    pub pid: i32,
}

/// Parse the pid out of a `scan-{pid}-{tid}.idx` or
/// `{role}-{pid}-{tid}-{nanos}.tmp` file name.
fn parse_file_pid(name: &str) -> Option<i32> {
    let stem = name.strip_suffix(".idx").or_else(|| name.strip_suffix(".tmp"))?;
    let fields: Vec<&str> = stem.split('-').collect();
    match fields.as_slice() {
        ["scan", pid, tid] => {
            tid.parse::<u64>().ok()?;
            pid.parse().ok()
        }
        [_role, pid, tid, nanos] => {
            tid.parse::<u64>().ok()?;
            nanos.parse::<u128>().ok()?;
            pid.parse().ok()
        }
        _ => None,
    }
}

/// Scan a metadata directory for scan/temp files left behind by
/// processes that no longer run.
pub fn find_orphans(dir: &Path) -> Result<Vec<OrphanFile>, Error> {
    let mut orphans = Vec::new();
    let own_pid = std::process::id() as i32;

    let iter = std::fs::read_dir(dir)
        .map_err(|err| format_err!("unable to read directory {:?} - {}", dir, err))?;

    for item in iter {
        let item = item?;
        let name = match item.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        if let Some(pid) = parse_file_pid(&name) {
            if pid != own_pid && !dcfh_tools::fs::process_is_alive(pid) {
                orphans.push(OrphanFile {
                    path: item.path(),
                    pid,
                });
            }
        }
    }

    Ok(orphans)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn file_name_parsing() {
        assert_eq!(parse_file_pid("scan-1234-7.idx"), Some(1234));
        assert_eq!(parse_file_pid("main-99-1-170000000.tmp"), Some(99));
        assert_eq!(parse_file_pid("cache-7-2-1.tmp"), Some(7));
        assert_eq!(parse_file_pid("main.idx"), None);
        assert_eq!(parse_file_pid("cache.idx"), None);
        assert_eq!(parse_file_pid("scan-x-1.idx"), None);
        assert_eq!(parse_file_pid("ignore"), None);
    }

    #[test]
    fn task_ids_are_unique() {
        let a = next_task_id();
        let b = next_task_id();
        assert!(b > a);
    }

    #[test]
    fn guard_removes_file() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("dcfh-guard-test-{}", std::process::id()));
        std::fs::write(&path, b"x").unwrap();
        drop(TempFileGuard::new(path.clone()));
        assert!(!path.exists());

        std::fs::write(&path, b"x").unwrap();
        let mut guard = TempFileGuard::new(path.clone());
        guard.disarm();
        drop(guard);
        assert!(path.exists());
        std::fs::remove_file(&path).unwrap();
    }
}
