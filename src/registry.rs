//! Port registry (C1)
//!
//! A small JSON file shared by every broker instance on the host, listing
//! which ports in the configured range are currently claimed. Mutual
//! exclusion uses an adjacent lock file created with `O_EXCL` semantics
//! (`OpenOptions::create_new`), the same "exclusive create as a mutex"
//! idiom used for short-lived marker files elsewhere.

use crate::error::{BrokerError, BrokerResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub port: u16,
    pub instance_id: String,
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

pub struct PortRegistry {
    path: PathBuf,
    lock_path: PathBuf,
    range: RangeInclusive<u16>,
    stale_after: Duration,
}

impl PortRegistry {
    pub fn new(path: impl AsRef<Path>, range: RangeInclusive<u16>, stale_after: Duration) -> Self {
        let path = path.as_ref().to_path_buf();
        let lock_path = path.with_extension("lock");
        Self { path, lock_path, range, stale_after }
    }

    /// Claims the first free port in range for `instance_id`/`pid`,
    /// reclaiming any stale entries first.
    /// Blocks briefly on the file lock; callers run this at startup so a
    /// short synchronous critical section is acceptable without
    /// spawn_blocking for small, fast file operations.
    pub fn claim_port(&self, instance_id: &str, pid: u32) -> BrokerResult<u16> {
        let _guard = self.acquire_file_lock()?;
        let mut entries = self.read_entries()?;
        self.evict_stale(&mut entries);

        let taken: std::collections::HashSet<u16> = entries.iter().map(|e| e.port).collect();
        let port = self.range.clone().find(|p| !taken.contains(p)).ok_or(BrokerError::NoPortsAvailable)?;

        let now = Utc::now();
        entries.push(RegistryEntry {
            port,
            instance_id: instance_id.to_string(),
            pid,
            created_at: now,
            last_heartbeat_at: now,
        });
        self.write_entries(&entries)?;
        Ok(port)
    }

    /// Refreshes `last_heartbeat_at` for `instance_id`'s entry so other
    /// instances don't reclaim it as stale.
    pub fn heartbeat(&self, instance_id: &str) -> BrokerResult<()> {
        let _guard = self.acquire_file_lock()?;
        let mut entries = self.read_entries()?;
        if let Some(entry) = entries.iter_mut().find(|e| e.instance_id == instance_id) {
            entry.last_heartbeat_at = Utc::now();
        }
        self.write_entries(&entries)?;
        Ok(())
    }

    /// Removes `instance_id`'s entry on graceful shutdown, freeing its
    /// port for immediate reuse rather than waiting out the stale timeout.
    pub fn release_port(&self, instance_id: &str) -> BrokerResult<()> {
        let _guard = self.acquire_file_lock()?;
        let mut entries = self.read_entries()?;
        entries.retain(|e| e.instance_id != instance_id);
        self.write_entries(&entries)?;
        Ok(())
    }

    /// Returns every currently-live entry, after evicting stale ones, for
    /// extension discovery (C10) and the debug snapshot (C11).
    pub fn list_active(&self) -> BrokerResult<Vec<RegistryEntry>> {
        let _guard = self.acquire_file_lock()?;
        let mut entries = self.read_entries()?;
        let changed = self.evict_stale(&mut entries);
        if changed {
            self.write_entries(&entries)?;
        }
        Ok(entries)
    }

    fn evict_stale(&self, entries: &mut Vec<RegistryEntry>) -> bool {
        let before = entries.len();
        let stale_after = self.stale_after;
        entries.retain(|e| {
            let heartbeat_age = (Utc::now() - e.last_heartbeat_at).to_std().unwrap_or(Duration::ZERO);
            let heartbeat_fresh = heartbeat_age <= stale_after;
            let pid_alive = pid_is_alive(e.pid);
            let keep = heartbeat_fresh && pid_alive;
            if !keep {
                tracing::info!(port = e.port, instance_id = %e.instance_id, pid = e.pid, "evicting stale registry entry");
            }
            keep
        });
        entries.len() != before
    }

    fn read_entries(&self) -> BrokerResult<Vec<RegistryEntry>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(Vec::new()),
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| BrokerError::SendError(format!("corrupt registry file: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(BrokerError::SendError(format!("reading registry file: {e}"))),
        }
    }

    fn write_entries(&self, entries: &[RegistryEntry]) -> BrokerResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| BrokerError::SendError(format!("creating registry dir: {e}")))?;
        }
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| BrokerError::SendError(format!("serializing registry: {e}")))?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json).map_err(|e| BrokerError::SendError(format!("writing registry file: {e}")))?;
        fs::rename(&tmp_path, &self.path).map_err(|e| BrokerError::SendError(format!("renaming registry file: {e}")))?;
        Ok(())
    }

    /// Acquires the adjacent lock file, reclaiming it if its mtime is
    /// older than `stale_after` (a previous holder crashed mid-critical-
    /// section). Retries briefly rather than failing on first contention.
    fn acquire_file_lock(&self) -> BrokerResult<FileLockGuard<'_>> {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            match fs::OpenOptions::new().write(true).create_new(true).open(&self.lock_path) {
                Ok(_) => return Ok(FileLockGuard { path: &self.lock_path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Ok(meta) = fs::metadata(&self.lock_path) {
                        if let Ok(modified) = meta.modified() {
                            if modified.elapsed().unwrap_or(Duration::ZERO) > self.stale_after {
                                tracing::warn!(path = %self.lock_path.display(), "reclaiming stale registry lock file");
                                let _ = fs::remove_file(&self.lock_path);
                                continue;
                            }
                        }
                    }
                    if std::time::Instant::now() >= deadline {
                        return Err(BrokerError::SendError("timed out acquiring registry lock file".into()));
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => return Err(BrokerError::SendError(format!("creating registry lock file: {e}"))),
            }
        }
    }
}

struct FileLockGuard<'a> {
    path: &'a Path,
}

impl<'a> Drop for FileLockGuard<'a> {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.path);
    }
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    true
}
