//! Cross-process mutual exclusion for update sessions.
//!
//! The lock is a small JSON record naming the owning pid. Staleness is decided
//! by probing that pid, never by file age, so a lock left behind by a crashed
//! orchestrator is reclaimed by the next invocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, UpkeepError};
use crate::{io, paths, process};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    #[serde(default = "default_version")]
    pub version: u32,
    pub owner_pid: u32,
    pub acquired_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub record: LockRecord,
    pub alive: bool,
}

#[derive(Debug, Clone)]
pub struct LockManager {
    path: PathBuf,
    guard_path: PathBuf,
    pid: u32,
}

#[cfg(unix)]
type Guard = nix::fcntl::Flock<std::fs::File>;
#[cfg(not(unix))]
type Guard = ();

impl LockManager {
    pub fn new(root: &Path) -> Self {
        Self::with_pid(root, std::process::id())
    }

    /// A manager acting on behalf of `pid` instead of the current process.
    pub fn with_pid(root: &Path, pid: u32) -> Self {
        Self {
            path: paths::lock_path(root),
            guard_path: paths::lock_guard_path(root),
            pid,
        }
    }

    /// Exclusive `flock` on the sidecar file. Every read-then-modify of the
    /// record happens under it, so a stale record is removed by one reclaimer
    /// only. Released on drop.
    #[cfg(unix)]
    fn guard(&self) -> Result<Guard> {
        use nix::fcntl::{Flock, FlockArg};

        if let Some(parent) = self.guard_path.parent() {
            io::ensure_dir(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.guard_path)?;
        Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| UpkeepError::Io(std::io::Error::from(errno)))
    }

    #[cfg(not(unix))]
    fn guard(&self) -> Result<Guard> {
        Ok(())
    }

    pub fn acquire(&self) -> Result<LockRecord> {
        let record = LockRecord {
            version: 1,
            owner_pid: self.pid,
            acquired_at: Utc::now(),
        };
        let data = serde_json::to_vec_pretty(&record)?;
        let _guard = self.guard()?;

        match io::atomic_create(&self.path, &data) {
            Ok(()) => {
                tracing::debug!(pid = self.pid, "lock acquired");
                return Ok(record);
            }
            Err(UpkeepError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }

        match self.read()? {
            Some(existing) if process::pid_alive(existing.owner_pid) => {
                return Err(UpkeepError::ConcurrencyConflict {
                    pid: existing.owner_pid,
                });
            }
            Some(existing) => {
                tracing::warn!(
                    stale_pid = existing.owner_pid,
                    acquired_at = %existing.acquired_at,
                    "reclaiming stale update lock"
                );
                io::remove_if_exists(&self.path)?;
            }
            None => {}
        }

        match io::atomic_create(&self.path, &data) {
            Ok(()) => {
                tracing::debug!(pid = self.pid, "lock acquired");
                Ok(record)
            }
            // Only a writer bypassing the guard gets here.
            Err(UpkeepError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(UpkeepError::ConcurrencyConflict {
                    pid: self.read()?.map_or(0, |r| r.owner_pid),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Delete the record if this manager owns it. Returns whether it was removed.
    pub fn release(&self) -> Result<bool> {
        let _guard = self.guard()?;
        match self.read()? {
            Some(record) if record.owner_pid == self.pid => {
                io::remove_if_exists(&self.path)?;
                tracing::debug!(pid = self.pid, "lock released");
                Ok(true)
            }
            Some(record) => {
                tracing::warn!(
                    owner = record.owner_pid,
                    caller = self.pid,
                    "refusing to release a lock owned by another process"
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    pub fn status(&self) -> Result<Option<LockStatus>> {
        Ok(self.read()?.map(|record| LockStatus {
            alive: process::pid_alive(record.owner_pid),
            record,
        }))
    }

    /// Remove the record only if its owner is dead.
    pub fn reclaim_stale(&self) -> Result<bool> {
        let _guard = self.guard()?;
        match self.status()? {
            Some(status) if !status.alive => io::remove_if_exists(&self.path),
            _ => Ok(false),
        }
    }

    /// An unparseable record is treated as stale (owner pid 0).
    fn read(&self) -> Result<Option<LockRecord>> {
        match io::read_json::<LockRecord>(&self.path) {
            Ok(record) => Ok(record),
            Err(UpkeepError::Json(e)) => {
                tracing::warn!(error = %e, "unreadable lock record");
                Ok(Some(LockRecord {
                    version: 1,
                    owner_pid: 0,
                    acquired_at: Utc::now(),
                }))
            }
            Err(e) => Err(e),
        }
    }
}
