//! Durable Keyed Store - crash-safe persistence for small JSON records
//!
//! Every write serializes the value to a temp file in the target directory,
//! fsyncs it, then atomically renames it over the target path, so readers
//! never observe a half-written file. Cross-process mutual exclusion uses an
//! advisory lock file (`<path>.lock`) carrying the owning pid and a
//! timestamp; stale locks (older than a threshold, or owned by a dead
//! process) are reclaimed. Per-path locks are the sole mutual-exclusion
//! primitive in the pipeline: writes to the same path are serialized, writes
//! to different paths are not ordered relative to each other.

use crate::error::{Result, WardenError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default lock acquisition timeout
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
/// Default age after which a lock file is considered stale
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(30);
/// Poll interval while waiting for a lock
const LOCK_POLL: Duration = Duration::from_millis(50);

/// Atomic, lock-guarded store for JSON-serializable records keyed by path.
///
/// The store itself is a cheap configuration handle and can be cloned freely;
/// all state lives on disk.
#[derive(Debug, Clone)]
pub struct KeyedStore {
    lock_timeout: Duration,
    stale_after: Duration,
}

impl Default for KeyedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyedStore {
    /// Create a store with the default lock timeout (5s) and staleness
    /// threshold (30s).
    pub fn new() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    /// Create a store with explicit lock timing parameters
    pub fn with_timing(lock_timeout: Duration, stale_after: Duration) -> Self {
        Self {
            lock_timeout,
            stale_after,
        }
    }

    /// Serialize `value` and atomically replace the file at `path`.
    ///
    /// Acquires the path-scoped lock first and releases it on every exit
    /// path. Fails with [`WardenError::LockTimeout`] when the lock cannot be
    /// acquired in time; callers must treat that as retryable.
    pub fn write<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let _guard = self.acquire_lock(path)?;

        let payload = serde_json::to_vec_pretty(value)?;
        let tmp = tmp_path_for(path);
        let result = (|| -> Result<()> {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&payload)?;
            file.sync_all()?;
            std::fs::rename(&tmp, path)?;
            Ok(())
        })();

        if result.is_err() {
            // Leftover temp file must not shadow future writes
            let _ = std::fs::remove_file(&tmp);
        }
        result
    }

    /// Read and deserialize the record at `path`.
    ///
    /// A missing file reads as `None`. A corrupt file also reads as `None`
    /// (logged) so that corruption never propagates as a crash; callers fall
    /// back to defaults.
    pub fn read<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&text) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt record treated as absent");
                Ok(None)
            }
        }
    }

    /// Acquire the advisory lock for `path`, reclaiming stale locks.
    fn acquire_lock(&self, path: &Path) -> Result<LockGuard> {
        let lock_path = lock_path_for(path);
        let start = Instant::now();

        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    let payload =
                        format!("{}\n{}\n", std::process::id(), chrono::Utc::now().timestamp_millis());
                    // Lock content is advisory metadata; a failed write still
                    // leaves a valid (if unreclaimable-by-pid) lock.
                    if let Err(e) = file.write_all(payload.as_bytes()) {
                        warn!(lock = %lock_path.display(), error = %e, "failed to write lock metadata");
                    }
                    return Ok(LockGuard { path: lock_path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.try_reclaim_stale(&lock_path) {
                        continue;
                    }
                    if start.elapsed() >= self.lock_timeout {
                        return Err(WardenError::LockTimeout {
                            path: path.to_path_buf(),
                            waited_ms: start.elapsed().as_millis() as u64,
                        });
                    }
                    std::thread::sleep(LOCK_POLL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Remove the lock file if it is stale or its owner is gone.
    /// Returns true when the caller should immediately retry acquisition.
    fn try_reclaim_stale(&self, lock_path: &Path) -> bool {
        let snapshot = match std::fs::read_to_string(lock_path) {
            Ok(text) => text,
            // Gone already: another contender reclaimed it
            Err(e) => return e.kind() == std::io::ErrorKind::NotFound,
        };

        let Some((pid, ts_ms)) = parse_lock_metadata(&snapshot) else {
            // Unreadable lock metadata: fall back to file age
            return match std::fs::metadata(lock_path).and_then(|m| m.modified()) {
                Ok(modified) => {
                    let age = modified.elapsed().unwrap_or_default();
                    age > self.stale_after && remove_lock_if_unchanged(lock_path, &snapshot)
                }
                Err(_) => false,
            };
        };

        let age_ms = chrono::Utc::now().timestamp_millis().saturating_sub(ts_ms);
        let stale = age_ms > self.stale_after.as_millis() as i64;
        if stale || !process_alive(pid) {
            if remove_lock_if_unchanged(lock_path, &snapshot) {
                warn!(lock = %lock_path.display(), pid, age_ms, "reclaimed stale lock");
                return true;
            }
        }
        false
    }
}

/// Delete the lock only while its content still matches `snapshot`. A lock
/// that a faster contender already reclaimed and re-created carries fresh
/// metadata and must be left alone. Returns true when the lock is gone,
/// whether this call removed it or it had already vanished.
fn remove_lock_if_unchanged(lock_path: &Path, snapshot: &str) -> bool {
    match std::fs::read_to_string(lock_path) {
        Ok(current) if current == snapshot => match std::fs::remove_file(lock_path) {
            Ok(()) => true,
            Err(e) => {
                debug!(lock = %lock_path.display(), error = %e, "stale lock removal raced");
                e.kind() == std::io::ErrorKind::NotFound
            }
        },
        Ok(_) => {
            debug!(lock = %lock_path.display(), "lock refreshed under reclaim, leaving it");
            false
        }
        Err(e) => e.kind() == std::io::ErrorKind::NotFound,
    }
}

/// Guard releasing the lock file when dropped, on all exit paths.
#[derive(Debug)]
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(lock = %self.path.display(), error = %e, "failed to release lock");
            }
        }
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let name = format!(
        ".tmp-{}-{}-{}",
        std::process::id(),
        nanos,
        path.file_name().and_then(|n| n.to_str()).unwrap_or("record")
    );
    path.with_file_name(name)
}

fn parse_lock_metadata(text: &str) -> Option<(u32, i64)> {
    let mut lines = text.lines();
    let pid = lines.next()?.trim().parse().ok()?;
    let ts = lines.next()?.trim().parse().ok()?;
    Some((pid, ts))
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

/// Without a portable liveness probe, assume the owner is alive and rely on
/// the timestamp-based staleness threshold alone.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn store() -> KeyedStore {
        KeyedStore::new()
    }

    #[test]
    fn test_write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let mut value = BTreeMap::new();
        value.insert("topic".to_string(), "docs".to_string());

        store().write(&path, &value).unwrap();
        let loaded: Option<BTreeMap<String, String>> = store().read(&path).unwrap();
        assert_eq!(loaded, Some(value));
        // lock released after write
        assert!(!lock_path_for(&path).exists());
    }

    #[test]
    fn test_missing_file_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Option<Vec<String>> = store().read(&dir.path().join("nope.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_corrupt_file_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json ][").unwrap();
        let loaded: Option<Vec<String>> = store().read(&path).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_held_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        // Fresh lock owned by this (alive) process
        std::fs::write(
            lock_path_for(&path),
            format!("{}\n{}\n", std::process::id(), chrono::Utc::now().timestamp_millis()),
        )
        .unwrap();

        let store = KeyedStore::with_timing(Duration::from_millis(150), Duration::from_secs(30));
        let err = store.write(&path, &vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, WardenError::LockTimeout { .. }));
        assert_eq!(err.reason(), "lock_timeout");
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        // Lock written 10 minutes ago
        let old_ts = chrono::Utc::now().timestamp_millis() - 600_000;
        std::fs::write(
            lock_path_for(&path),
            format!("{}\n{}\n", std::process::id(), old_ts),
        )
        .unwrap();

        store().write(&path, &"reclaimed").unwrap();
        let loaded: Option<String> = store().read(&path).unwrap();
        assert_eq!(loaded.as_deref(), Some("reclaimed"));
    }

    #[test]
    fn test_reclaim_leaves_lock_refreshed_by_contender() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("state.json.lock");
        let stale = format!("{}\n{}\n", std::process::id(), 0);
        let fresh = format!(
            "{}\n{}\n",
            std::process::id(),
            chrono::Utc::now().timestamp_millis()
        );
        std::fs::write(&lock, &fresh).unwrap();

        // The snapshot this reclaimer saw is outdated: a contender already
        // removed the stale lock and wrote its own
        assert!(!remove_lock_if_unchanged(&lock, &stale));
        assert_eq!(std::fs::read_to_string(&lock).unwrap(), fresh);

        // An unchanged stale lock is still removable
        std::fs::write(&lock, &stale).unwrap();
        assert!(remove_lock_if_unchanged(&lock, &stale));
        assert!(!lock.exists());

        // A lock that vanished entirely counts as reclaimed
        assert!(remove_lock_if_unchanged(&lock, &stale));
    }

    #[test]
    fn test_concurrent_writers_leave_one_consistent_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = KeyedStore::with_timing(Duration::from_secs(10), Duration::from_secs(30));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                let path = path.clone();
                std::thread::spawn(move || {
                    store.write(&path, &format!("writer-{i}")).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let loaded: Option<String> = store.read(&path).unwrap();
        let value = loaded.expect("target must be deserializable after contention");
        assert!(value.starts_with("writer-"), "final state must equal one writer's payload");
        assert!(!lock_path_for(&path).exists(), "no lock residue");
    }

    proptest! {
        #[test]
        fn prop_any_record_survives_persistence(
            entries in proptest::collection::btree_map("[a-z_]{1,12}", ".{0,64}", 0..8)
        ) {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("record.json");
            store().write(&path, &entries).unwrap();
            let loaded: Option<BTreeMap<String, String>> = store().read(&path).unwrap();
            prop_assert_eq!(loaded, Some(entries));
        }
    }
}
