// src/lock.rs
//
// Advisory, filesystem-backed task locks. A lock is a small JSON record
// (task, holder pid, start time) at `<dir>/<task>.lock`. Records whose holder
// process is gone are treated as stale and removed on the next check. Where the
// kernel exposes it, the holder's process start time is recorded too, so a
// recycled pid does not keep a dead holder's lock alive.
//
use crate::error::LockError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const LOCK_EXTENSION: &str = "lock";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub task: String,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    /// Holder's start time in clock ticks after boot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_start: Option<u64>,
}

impl LockRecord {
    /// The holder pid is alive and is still the process that took the lock
    pub fn holder_alive(&self) -> bool {
        if !process_alive(self.pid) {
            return false;
        }
        match (self.process_start, process_start_ticks(self.pid)) {
            (Some(recorded), Some(current)) => recorded == current,
            _ => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    pid: u32,
    process_start: Option<u64>,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, LockError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let pid = std::process::id();
        Ok(Self {
            dir,
            pid,
            process_start: process_start_ticks(pid),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, LOCK_EXTENSION))
    }

    /// Try to take the lock. Returns false when a live holder exists.
    pub fn acquire(&self, name: &str) -> Result<bool, LockError> {
        if self.is_held(name)? {
            return Ok(false);
        }

        let record = LockRecord {
            task: name.to_string(),
            pid: self.pid,
            started_at: Utc::now(),
            process_start: self.process_start,
        };

        // Write the full record first, then publish it with a hard link so
        // readers never observe a half-written file.
        let staging = self.dir.join(format!(
            ".{}.{}.{}.tmp",
            name,
            self.pid,
            uuid::Uuid::new_v4().simple()
        ));
        {
            let mut file = fs::File::create(&staging)?;
            let body = serde_json::to_vec(&record).map_err(|_| LockError::Corrupt(name.to_string()))?;
            file.write_all(&body)?;
            file.sync_all()?;
        }

        let published = fs::hard_link(&staging, self.path(name));
        let _ = fs::remove_file(&staging);

        match published {
            Ok(()) => {
                debug!("Acquired lock '{}' (pid {})", name, self.pid);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Release a lock held by this process. Records owned by other processes are left alone.
    pub fn release(&self, name: &str) -> Result<bool, LockError> {
        match self.read_record(name)? {
            Some(record) if record.pid == self.pid => {
                remove_if_present(&self.path(name))?;
                debug!("Released lock '{}'", name);
                Ok(true)
            }
            Some(record) => {
                warn!(
                    "Refusing to release lock '{}' owned by pid {}",
                    name, record.pid
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Whether a live process holds the lock. Stale records are cleared.
    pub fn is_held(&self, name: &str) -> Result<bool, LockError> {
        Ok(self.holder(name)?.is_some())
    }

    /// Record of the live holder, if any
    pub fn holder(&self, name: &str) -> Result<Option<LockRecord>, LockError> {
        let path = self.path(name);
        let record = match self.read_record(name) {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(None),
            Err(LockError::Corrupt(_)) => {
                warn!("Removing unreadable lock record {}", path.display());
                remove_if_present(&path)?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if record.holder_alive() {
            return Ok(Some(record));
        }

        // Only remove the record we judged stale; a fresh holder may have replaced it.
        if self.read_record(name).ok().flatten().as_ref() == Some(&record) {
            info!(
                "Clearing stale lock '{}' left by dead pid {} (started {})",
                name, record.pid, record.started_at
            );
            remove_if_present(&path)?;
        }
        Ok(None)
    }

    /// Take the lock and release it when the guard drops
    pub fn guard(&self, name: &str) -> Result<Option<LockGuard>, LockError> {
        if self.acquire(name)? {
            Ok(Some(LockGuard {
                manager: self.clone(),
                name: name.to_string(),
            }))
        } else {
            Ok(None)
        }
    }

    /// All current lock records with the liveness of their holders
    pub fn list(&self) -> Result<Vec<(LockRecord, bool)>, LockError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOCK_EXTENSION) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(Some(record)) = self.read_record(name) {
                let alive = record.holder_alive();
                records.push((record, alive));
            }
        }
        records.sort_by(|a, b| a.0.task.cmp(&b.0.task));
        Ok(records)
    }

    /// Release every lock this process still owns
    pub fn release_owned(&self) -> Result<usize, LockError> {
        let mut released = 0;
        for (record, _) in self.list()? {
            if record.pid == self.pid && self.release(&record.task)? {
                released += 1;
            }
        }
        Ok(released)
    }

    fn read_record(&self, name: &str) -> Result<Option<LockRecord>, LockError> {
        let body = match fs::read(self.path(name)) {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|_| LockError::Corrupt(name.to_string()))
    }
}

/// Releases its lock on drop
#[derive(Debug)]
pub struct LockGuard {
    manager: LockManager,
    name: String,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.manager.release(&self.name) {
            warn!("Failed to release lock '{}': {}", self.name, e);
        }
    }
}

fn remove_if_present(path: &Path) -> Result<(), LockError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Signal 0 checks for existence without delivering anything
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(pid: u32) -> bool {
    // No cheap liveness check here; assume alive so a lock is never stolen
    pid != 0
}

/// Start time of `pid` in clock ticks after boot (field 22 of /proc/<pid>/stat)
#[cfg(target_os = "linux")]
pub fn process_start_ticks(pid: u32) -> Option<u64> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // The command name may itself contain spaces and parentheses
    let (_, fields) = stat.rsplit_once(')')?;
    fields.split_whitespace().nth(19)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
pub fn process_start_ticks(_pid: u32) -> Option<u64> {
    None
}
