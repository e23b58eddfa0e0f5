//! Read-through file cache with per-type TTLs and per-key single-flight.
//!
//! Every value lives in its own JSON file under `<root>/<cache_type>/`,
//! wrapped in an envelope recording when it was written and how long it
//! stays fresh. Files without the envelope (written by older runs) are
//! returned as-is.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    timestamp: i64,
    ttl_seconds: u64,
    cache_type: String,
    data: serde_json::Value,
}

/// File-backed key-value cache shared by the registration, publication,
/// and classification stores as well as the strategy memo caches.
pub struct FileCache {
    root: PathBuf,
    ttls: HashMap<String, u64>,
    default_ttl: u64,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FileCache {
    pub fn new(root: PathBuf, ttls: HashMap<String, u64>, default_ttl: u64) -> Self {
        Self {
            root,
            ttls,
            default_ttl,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    fn ttl_for(&self, cache_type: &str) -> u64 {
        self.ttls.get(cache_type).copied().unwrap_or(self.default_ttl)
    }

    fn path_for(&self, cache_type: &str, key: &str) -> PathBuf {
        // Keys are trial ids, PMIDs, or "{trial}__{pmid}" pairs; keep the
        // path flat and filesystem-safe.
        let safe: String = key
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        self.root.join(cache_type).join(format!("{safe}.json"))
    }

    /// Read a fresh value, or `None` on miss/expiry/unreadable file.
    pub fn get<T: DeserializeOwned>(&self, cache_type: &str, key: &str) -> Option<T> {
        let path = self.path_for(cache_type, key);
        let raw = std::fs::read_to_string(&path).ok()?;
        let value: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(?path, error = %e, "Unreadable cache file, treating as miss");
                return None;
            }
        };

        if let Ok(env) = serde_json::from_value::<Envelope>(value.clone()) {
            let age = Utc::now().timestamp() - env.timestamp;
            if age >= 0 && (age as u64) < env.ttl_seconds {
                return serde_json::from_value(env.data).ok();
            }
            debug!(cache_type, key, age, "Cache entry expired");
            return None;
        }

        // Legacy file written before the envelope existed.
        serde_json::from_value(value).ok()
    }

    /// Write a value wrapped in a fresh envelope.
    pub fn put<T: Serialize>(&self, cache_type: &str, key: &str, value: &T) -> Result<()> {
        let path = self.path_for(cache_type, key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let env = Envelope {
            timestamp: Utc::now().timestamp(),
            ttl_seconds: self.ttl_for(cache_type),
            cache_type: cache_type.to_string(),
            data: serde_json::to_value(value)?,
        };
        std::fs::write(&path, serde_json::to_vec_pretty(&env)?)?;
        Ok(())
    }

    /// Read-through: return the cached value or run `producer` exactly once
    /// per key across concurrent callers, store its result, and return it.
    pub async fn get_or_fetch<T, F, Fut>(
        &self,
        cache_type: &str,
        key: &str,
        producer: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(hit) = self.get::<T>(cache_type, key) {
            return Ok(hit);
        }

        let flight_key = format!("{cache_type}/{key}");
        let gate = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(flight_key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let _guard = gate.lock().await;

        // A concurrent caller may have produced the value while we waited.
        if let Some(hit) = self.get::<T>(cache_type, key) {
            return Ok(hit);
        }

        let outcome = match producer().await {
            Ok(value) => self.put(cache_type, key, &value).map(|_| value),
            Err(e) => Err(e),
        };

        let mut inflight = self.inflight.lock().await;
        inflight.remove(&flight_key);
        drop(inflight);

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_cache(dir: &std::path::Path) -> FileCache {
        FileCache::new(dir.to_path_buf(), HashMap::new(), 3600)
    }

    #[test]
    fn test_put_then_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        cache.put("registrations", "NCT00000001", &"hello".to_string()).unwrap();
        let got: Option<String> = cache.get("registrations", "NCT00000001");
        assert_eq!(got.as_deref(), Some("hello"));
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        let path = cache.path_for("queries", "NCT00000001");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let stale = serde_json::json!({
            "timestamp": Utc::now().timestamp() - 10_000,
            "ttl_seconds": 60,
            "cache_type": "queries",
            "data": "old"
        });
        std::fs::write(&path, stale.to_string()).unwrap();
        assert_eq!(cache.get::<String>("queries", "NCT00000001"), None);
    }

    #[test]
    fn test_legacy_file_without_envelope_is_returned() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        let path = cache.path_for("registrations", "NCT00000002");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "\"bare value\"").unwrap();
        let got: Option<String> = cache.get("registrations", "NCT00000002");
        assert_eq!(got.as_deref(), Some("bare value"));
    }

    #[tokio::test]
    async fn test_single_flight_runs_producer_once() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(test_cache(dir.path()));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("registrations", "NCT00000003", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok("produced".to_string())
                    })
                    .await
                    .unwrap()
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap(), "produced");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_keys_with_path_characters_are_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let cache = test_cache(dir.path());
        cache.put("classifications", "NCT1__123/../x", &1u32).unwrap();
        assert_eq!(cache.get::<u32>("classifications", "NCT1__123/../x"), Some(1));
    }
}
