//! Cross-process node locks backed by marker files.
//!
//! A lock is a file containing one line `"<pid> <hostname>"`. Acquisition
//! creates the file exclusively, waits a guard time and then re-reads it to
//! confirm ownership, which also covers shared filesystems where exclusive
//! creation is not reliable. Locks are never broken automatically.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("I/O error for lock '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Lock '{path}' is not owned by this process (holder: {holder})")]
    NotOwner { path: String, holder: String },
    #[error("Malformed lock signature '{0}'")]
    MalformedSignature(String),
    #[error("Liveness check for holder on '{host}' failed: {source}")]
    Liveness {
        host: String,
        #[source]
        source: std::io::Error,
    },
}

/// Identity of a lock holder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockSignature {
    pub pid: u32,
    pub host: String,
}

impl LockSignature {
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            host: hostname(),
        }
    }
}

impl fmt::Display for LockSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.pid, self.host)
    }
}

impl FromStr for LockSignature {
    type Err = LockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(pid), Some(host), None) => Ok(Self {
                pid: pid
                    .parse()
                    .map_err(|_| LockError::MalformedSignature(s.to_string()))?,
                host: host.to_string(),
            }),
            _ => Err(LockError::MalformedSignature(s.to_string())),
        }
    }
}

/// Name of the local machine as recorded in lock signatures.
pub fn hostname() -> String {
    fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Decides whether the process behind a lock signature still exists.
pub trait LivenessCheck {
    fn is_alive(&self, holder: &LockSignature) -> Result<bool, LockError>;
}

/// Looks the holder up in `/proc`, locally or through `ssh` for a foreign host.
#[derive(Debug, Clone)]
pub struct ProcessTableLiveness {
    local_host: String,
}

impl Default for ProcessTableLiveness {
    fn default() -> Self {
        Self {
            local_host: hostname(),
        }
    }
}

impl LivenessCheck for ProcessTableLiveness {
    fn is_alive(&self, holder: &LockSignature) -> Result<bool, LockError> {
        let proc_entry = format!("/proc/{}", holder.pid);
        if holder.host == self.local_host {
            return Ok(Path::new(&proc_entry).exists());
        }
        debug!(host = %holder.host, pid = holder.pid, "Checking remote lock holder");
        let status = Command::new("ssh")
            .args([
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "StrictHostKeyChecking=no",
                &holder.host,
                "test",
                "-e",
                &proc_entry,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|source| LockError::Liveness {
                host: holder.host.clone(),
                source,
            })?;
        Ok(status.success())
    }
}

/// Mutual exclusion between worker processes.
pub trait DistributedLock {
    /// Tries to take the lock. Contention is `Ok(false)`, not an error.
    fn try_acquire(&self, guard: Duration) -> Result<bool, LockError>;
    /// Releases a lock held by this process.
    fn release(&self) -> Result<(), LockError>;
    fn is_locked(&self) -> bool;
    fn holder(&self) -> Result<Option<LockSignature>, LockError>;
    fn owns(&self) -> Result<bool, LockError>;
    /// `None` when nobody holds the lock.
    fn is_holder_alive(&self, check: &dyn LivenessCheck) -> Result<Option<bool>, LockError>;
}

#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    signature: LockSignature,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_signature(path, LockSignature::current())
    }

    pub fn with_signature(path: impl Into<PathBuf>, signature: LockSignature) -> Self {
        Self {
            path: path.into(),
            signature,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn signature(&self) -> &LockSignature {
        &self.signature
    }

    fn io_error(&self, source: std::io::Error) -> LockError {
        LockError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    /// Removes the marker if, and only if, its holder is no longer alive.
    /// Returns whether the marker was removed.
    pub fn remove_if_stale(&self, check: &dyn LivenessCheck) -> Result<bool, LockError> {
        let Some(holder) = self.holder()? else {
            return Ok(false);
        };
        if check.is_alive(&holder)? {
            debug!(lock = %self.path.display(), %holder, "Lock holder is alive");
            return Ok(false);
        }
        warn!(lock = %self.path.display(), %holder, "Removing stale lock");
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error(e)),
        }
    }
}

impl DistributedLock for FileLock {
    fn try_acquire(&self, guard: Duration) -> Result<bool, LockError> {
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(self.io_error(e)),
        };
        writeln!(file, "{}", self.signature).map_err(|e| self.io_error(e))?;
        file.sync_all().map_err(|e| self.io_error(e))?;
        drop(file);

        if !guard.is_zero() {
            debug!(lock = %self.path.display(), ?guard, "Waiting for lock guard time");
            thread::sleep(guard);
        }
        self.owns()
    }

    fn release(&self) -> Result<(), LockError> {
        if !self.owns()? {
            let holder = self
                .holder()?
                .map_or_else(|| "nobody".to_string(), |h| h.to_string());
            return Err(LockError::NotOwner {
                path: self.path.display().to_string(),
                holder,
            });
        }
        fs::remove_file(&self.path).map_err(|e| self.io_error(e))
    }

    fn is_locked(&self) -> bool {
        self.path.exists()
    }

    fn holder(&self) -> Result<Option<LockSignature>, LockError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => text.trim().parse().map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn owns(&self) -> Result<bool, LockError> {
        Ok(self.holder()?.as_ref() == Some(&self.signature))
    }

    fn is_holder_alive(&self, check: &dyn LivenessCheck) -> Result<Option<bool>, LockError> {
        self.holder()?.map(|h| check.is_alive(&h)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use tempfile::tempdir;

    struct Fixed(bool);

    impl LivenessCheck for Fixed {
        fn is_alive(&self, _: &LockSignature) -> Result<bool, LockError> {
            Ok(self.0)
        }
    }

    fn actor(path: &Path, pid: u32) -> FileLock {
        FileLock::with_signature(
            path,
            LockSignature {
                pid,
                host: "worker".to_string(),
            },
        )
    }

    #[test]
    fn signature_round_trips_through_text() {
        let sig = LockSignature {
            pid: 4242,
            host: "node17.cluster".to_string(),
        };
        assert_eq!(sig.to_string(), "4242 node17.cluster");
        assert_eq!("4242 node17.cluster\n".trim().parse::<LockSignature>().unwrap(), sig);
        assert!("4242".parse::<LockSignature>().is_err());
        assert!("abc host".parse::<LockSignature>().is_err());
    }

    #[test]
    fn second_actor_cannot_take_held_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");
        let a = actor(&path, 1);
        let b = actor(&path, 2);
        assert!(a.try_acquire(Duration::ZERO).unwrap());
        assert!(!b.try_acquire(Duration::ZERO).unwrap());
        assert!(a.owns().unwrap());
        assert!(!b.owns().unwrap());
    }

    #[test]
    fn racing_actors_have_at_most_one_winner() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (1..=2)
            .map(|pid| {
                let lock = actor(&path, pid);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    lock.try_acquire(Duration::from_millis(10)).unwrap()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert!(winners <= 1);
    }

    #[test]
    fn lock_can_be_retaken_after_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");
        let a = actor(&path, 1);
        let b = actor(&path, 2);
        assert!(a.try_acquire(Duration::ZERO).unwrap());
        a.release().unwrap();
        assert!(!a.is_locked());
        assert!(b.try_acquire(Duration::ZERO).unwrap());
    }

    #[test]
    fn release_by_non_owner_is_refused() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");
        let a = actor(&path, 1);
        let b = actor(&path, 2);
        assert!(a.try_acquire(Duration::ZERO).unwrap());
        assert!(matches!(b.release(), Err(LockError::NotOwner { .. })));
        assert!(a.is_locked());
    }

    #[test]
    fn stale_lock_is_only_removed_when_holder_is_dead() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("lock");
        let a = actor(&path, 1);
        assert!(a.try_acquire(Duration::ZERO).unwrap());
        let recovery = actor(&path, 99);
        assert!(!recovery.remove_if_stale(&Fixed(true)).unwrap());
        assert!(a.is_locked());
        assert!(recovery.remove_if_stale(&Fixed(false)).unwrap());
        assert!(!a.is_locked());
    }

    #[test]
    fn holder_liveness_is_none_for_free_lock() {
        let dir = tempdir().unwrap();
        let lock = actor(&dir.path().join("lock"), 1);
        assert_eq!(lock.is_holder_alive(&Fixed(true)).unwrap(), None);
    }

    #[test]
    fn current_process_is_alive_in_local_process_table() {
        let check = ProcessTableLiveness::default();
        assert!(check.is_alive(&LockSignature::current()).unwrap());
    }
}
