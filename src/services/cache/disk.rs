use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::keys::md5_hex;
use super::CacheError;

#[derive(Debug, Serialize, Deserialize)]
struct DiskRecord {
    key: String,
    value: String,
    expires_at_ms: i64,
}

/// L3: one JSON file per key under `dir`, named `{md5(key)}.json`.
/// Writes go through a temp file and a rename; a missing file is a miss.
pub struct DiskCache {
    dir: PathBuf,
    enabled: AtomicBool,
}

impl DiskCache {
    /// Create the cache, disabling it when the filesystem is read-only or the
    /// directory cannot be written.
    pub fn new(dir: impl Into<PathBuf>, read_only_fs: bool) -> Self {
        let dir = dir.into();
        let enabled = !read_only_fs && probe_writable(&dir);
        if !enabled {
            tracing::warn!("L3 disk cache disabled (dir: {})", dir.display());
        }
        Self {
            dir,
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", md5_hex(key)))
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let path = self.path_for(key);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let record: DiskRecord = match serde_json::from_slice(&raw) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("Discarding corrupt L3 entry {}: {}", path.display(), e);
                remove_quietly(&path).await;
                return Ok(None);
            }
        };

        if record.key != key {
            return Ok(None);
        }
        if record.expires_at_ms <= Utc::now().timestamp_millis() {
            remove_quietly(&path).await;
            return Ok(None);
        }
        Ok(Some(record.value))
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        if !self.is_enabled() {
            return Ok(());
        }
        let record = DiskRecord {
            key: key.to_string(),
            value: value.to_string(),
            expires_at_ms: Utc::now().timestamp_millis() + ttl.as_millis() as i64,
        };
        let bytes = serde_json::to_vec(&record)?;

        let path = self.path_for(key);
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
            if e.kind() == std::io::ErrorKind::ReadOnlyFilesystem
                || e.kind() == std::io::ErrorKind::PermissionDenied
            {
                tracing::warn!("L3 cache became unwritable, disabling: {}", e);
                self.enabled.store(false, Ordering::Relaxed);
                return Ok(());
            }
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            remove_quietly(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        if !self.is_enabled() {
            return Ok(());
        }
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove expired and unreadable entries. Returns the number removed.
    pub async fn purge_expired(&self) -> Result<usize, CacheError> {
        if !self.is_enabled() {
            return Ok(0);
        }
        let now = Utc::now().timestamp_millis();
        let mut removed = 0;
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let expired = match tokio::fs::read(&path).await {
                Ok(raw) => serde_json::from_slice::<DiskRecord>(&raw)
                    .map(|r| r.expires_at_ms <= now)
                    .unwrap_or(true),
                Err(_) => continue,
            };
            if expired {
                remove_quietly(&path).await;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn probe_writable(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }
    let probe = dir.join(format!(".probe-{}", Uuid::new_v4().simple()));
    match std::fs::write(&probe, b"ok") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_and_names_files_by_md5() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path(), false);
        assert!(cache.is_enabled());

        cache.set("k1", "v1", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k1").await.unwrap().as_deref(), Some("v1"));
        assert!(dir.path().join(format!("{}.json", md5_hex("k1"))).exists());

        cache.delete("k1").await.unwrap();
        assert_eq!(cache.get("k1").await.unwrap(), None);
        // deleting twice is fine
        cache.delete("k1").await.unwrap();
    }

    #[tokio::test]
    async fn expired_entries_are_misses_and_purged() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path(), false);
        cache.set("old", "v", Duration::ZERO).await.unwrap();
        cache.set("new", "v", Duration::from_secs(600)).await.unwrap();
        std::fs::write(dir.path().join("garbage.json"), b"not json").unwrap();

        assert_eq!(cache.purge_expired().await.unwrap(), 2);
        assert_eq!(cache.get("old").await.unwrap(), None);
        assert_eq!(cache.get("new").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn read_only_flag_disables_tier() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path(), true);
        assert!(!cache.is_enabled());
        cache.set("k", "v", Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
