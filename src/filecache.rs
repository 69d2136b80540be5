//! Process-local bounded cache over the object store.
//!
//! Three read-only artifact families pass through here: scan binaries,
//! diffraction-peak binaries and quantification binaries. Entries are
//! keyed `<family>-<id>`. The map is guarded by a mutex; file and store
//! I/O happen without holding it. An invalidation racing a read that
//! already passed the age check is harmless: that reader gets stale
//! bytes once, subsequent readers refetch.

use crate::lock_or_recover;
use crate::objstore::{ObjectStore, StoreError};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub trait Clock: Send + Sync {
    fn now_unix(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        crate::now_unix()
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    local_path: PathBuf,
    size: u64,
    timestamp_unix: i64,
}

pub struct FileCache {
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    cache_dir: PathBuf,
    max_bytes: u64,
    max_age_sec: i64,
    data_bucket: String,
    users_bucket: String,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl FileCache {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
        cache_dir: PathBuf,
        max_bytes: u64,
        max_age_sec: i64,
        data_bucket: String,
        users_bucket: String,
    ) -> Self {
        FileCache {
            store,
            clock,
            cache_dir,
            max_bytes,
            max_age_sec,
            data_bucket,
            users_bucket,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn read_scan(&self, scan_id: &str) -> Result<Vec<u8>, StoreError> {
        let bucket = self.data_bucket.clone();
        self.read_through(
            &format!("scan-{}", scan_id),
            &bucket,
            &crate::filepaths::scan_dataset(scan_id),
        )
    }

    pub fn read_diffraction(&self, scan_id: &str) -> Result<Vec<u8>, StoreError> {
        let bucket = self.data_bucket.clone();
        self.read_through(
            &format!("diff-{}", scan_id),
            &bucket,
            &crate::filepaths::scan_diffraction(scan_id),
        )
    }

    /// Read a quantification binary by its users-bucket path.
    pub fn read_quant(&self, quant_id: &str, path: &str) -> Result<Vec<u8>, StoreError> {
        let bucket = self.users_bucket.clone();
        self.read_through(&format!("quant-{}", quant_id), &bucket, path)
    }

    /// Mark the scan and diffraction entries stale so the next access
    /// refetches. Never deletes the local file inline; concurrent
    /// readers may still be using it.
    pub fn invalidate_scan(&self, scan_id: &str) {
        let mut entries = lock_or_recover(&self.entries);
        for key in [format!("scan-{}", scan_id), format!("diff-{}", scan_id)] {
            if let Some(entry) = entries.get_mut(&key) {
                entry.timestamp_unix = 0;
            }
        }
    }

    pub fn resident_bytes(&self) -> u64 {
        lock_or_recover(&self.entries).values().map(|e| e.size).sum()
    }

    fn read_through(&self, key: &str, bucket: &str, path: &str) -> Result<Vec<u8>, StoreError> {
        let now = self.clock.now_unix();
        let existing = lock_or_recover(&self.entries).get(key).cloned();

        if let Some(entry) = existing {
            if now - entry.timestamp_unix <= self.max_age_sec {
                match fs::read(&entry.local_path) {
                    Ok(data) => return Ok(data),
                    Err(e) => {
                        warn!(key, error = %e, "cached file unreadable, refetching");
                        lock_or_recover(&self.entries).remove(key);
                    }
                }
            } else {
                debug!(key, "cache entry stale, refetching");
                let _ = fs::remove_file(&entry.local_path);
            }
        }

        let data = self.store.read(bucket, path)?;
        let local_path = self.cache_dir.join(key.replace('/', "_"));
        if let Some(parent) = local_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&local_path, &data)?;
        {
            let mut entries = lock_or_recover(&self.entries);
            entries.insert(
                key.to_string(),
                CacheEntry {
                    local_path,
                    size: data.len() as u64,
                    timestamp_unix: now,
                },
            );
        }
        self.enforce_capacity();
        Ok(data)
    }

    /// Delete oldest entries until total resident size fits the cap.
    fn enforce_capacity(&self) {
        let victims: Vec<(String, PathBuf)> = {
            let entries = lock_or_recover(&self.entries);
            let mut total: u64 = entries.values().map(|e| e.size).sum();
            if total <= self.max_bytes {
                return;
            }
            let mut by_age: Vec<(&String, &CacheEntry)> = entries.iter().collect();
            by_age.sort_by_key(|(_, e)| e.timestamp_unix);
            let mut out = Vec::new();
            for (key, entry) in by_age {
                if total <= self.max_bytes {
                    break;
                }
                total -= entry.size;
                out.push((key.clone(), entry.local_path.clone()));
            }
            out
        };
        if victims.is_empty() {
            return;
        }
        let mut entries = lock_or_recover(&self.entries);
        for (key, path) in victims {
            debug!(key, "evicting cached file");
            entries.remove(&key);
            let _ = fs::remove_file(path);
        }
    }
}
