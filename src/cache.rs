//! Two-tier TTS cache for fixed-text roles: greeting and filler (C7).
//!
//! Grounded on the teacher's `tts/mod.rs` `TTSRegistry` single-owner
//! pattern, generalized from "one active engine" to a per-key
//! memory→object-store→synthesize-now lookup with per-key single-flight
//! (spec §4.7, §9 "Single-flight caches").

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex as SyncMutex, RwLock};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

use crate::clients::{ObjectStore, ObjectStoreError, TranscoderError, TtsError};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),
    #[error(transparent)]
    Tts(#[from] TtsError),
    #[error(transparent)]
    Transcoder(#[from] TranscoderError),
}

/// Large `max-age` cache-control header for cache artifacts (spec §4.7 "(b)
/// object-store backing with a large max-age cache control header").
pub const CACHE_CONTROL_LONG: &str = "public, max-age=31536000, immutable";

/// File-name grammar for the greeting cache key (spec §6 "Persisted wire objects").
pub fn greeting_key(engine: &str, voice: &str, speed: &str) -> String {
    format!("initial-greeting-{engine}-{voice}-{speed}.ulaw")
}

/// File-name grammar for the filler cache key; `tag` names the filler text
/// variant (there is currently one, "thinking") and `version` is
/// `FILLER_VERSION`, bumped whenever the filler text changes.
pub fn filler_key(tag: &str, version: &str, engine: &str, voice: &str, speed: &str) -> String {
    format!("filler-{tag}-{version}-{engine}-{voice}-{speed}.ulaw")
}

pub struct TtsCache {
    memory: RwLock<HashMap<String, Arc<Vec<u8>>>>,
    locks: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl TtsCache {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: String) -> Self {
        Self {
            memory: RwLock::new(HashMap::new()),
            locks: SyncMutex::new(HashMap::new()),
            store,
            bucket,
        }
    }

    fn key_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Looks up `key` in memory, then the object store, then calls `synth`
    /// on a true miss. Concurrent misses for the same key block on a
    /// per-key lock rather than launching redundant synthesis jobs.
    pub async fn get_or_synthesize<F, Fut>(
        &self,
        key: &str,
        synth: F,
    ) -> Result<Arc<Vec<u8>>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<u8>, CacheError>>,
    {
        if let Some(hit) = self.memory.read().get(key).cloned() {
            return Ok(hit);
        }

        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        // Re-check: another task may have populated this key while we
        // waited for the lock.
        if let Some(hit) = self.memory.read().get(key).cloned() {
            return Ok(hit);
        }

        if let Some(bytes) = self.store.get(&self.bucket, key).await? {
            let arc = Arc::new(bytes);
            self.memory.write().insert(key.to_string(), arc.clone());
            return Ok(arc);
        }

        let bytes = synth().await?;
        let arc = Arc::new(bytes);
        self.memory.write().insert(key.to_string(), arc.clone());

        let store = self.store.clone();
        let bucket = self.bucket.clone();
        let key_owned = key.to_string();
        let write_bytes = (*arc).clone();
        tokio::spawn(async move {
            if let Err(e) = store
                .put(&bucket, &key_owned, write_bytes, CACHE_CONTROL_LONG)
                .await
            {
                tracing::warn!(error = %e, key = %key_owned, "cache object-store write-back failed");
            }
        });

        Ok(arc)
    }

    /// Populates the memory tier directly, used for cold-start priming
    /// when a prior object-store entry is already known.
    pub fn prime(&self, key: String, bytes: Vec<u8>) {
        self.memory.write().insert(key, Arc::new(bytes));
    }

    pub fn memory_hit(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        self.memory.read().get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::objectstore::FsObjectStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn miss_then_object_store_hit_avoids_resynthesis() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsObjectStore::new(dir.path().to_path_buf()));
        let cache = TtsCache::new(store.clone(), "bucket".to_string());

        let key = greeting_key("elevenlabs", "rachel", "1.0");
        let calls = Arc::new(AtomicU32::new(0));

        let calls1 = calls.clone();
        let bytes1 = cache
            .get_or_synthesize(&key, || async move {
                calls1.fetch_add(1, Ordering::SeqCst);
                Ok(vec![1, 2, 3])
            })
            .await
            .unwrap();
        assert_eq!(*bytes1, vec![1, 2, 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // New cache instance (simulating a process restart) still finds the
        // object-store-backed entry and does not resynthesize.
        let cache2 = TtsCache::new(store, "bucket".to_string());
        let calls2 = calls.clone();
        let bytes2 = cache2
            .get_or_synthesize(&key, || async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(vec![9, 9, 9])
            })
            .await
            .unwrap();
        assert_eq!(*bytes2, vec![1, 2, 3]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_miss_synthesizes_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsObjectStore::new(dir.path().to_path_buf()));
        let cache = Arc::new(TtsCache::new(store, "bucket".to_string()));
        let key = filler_key("thinking", "v1", "elevenlabs", "rachel", "1.0");
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let key = key.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_synthesize(&key, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        Ok(vec![7])
                    })
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
