//! Idempotency guard for client-issued requests
//!
//! A request is identified by its caller-supplied key and fingerprinted by
//! the SHA-256 of its canonical JSON. The first successful execution is
//! stored; later calls with the same key and fingerprint get the stored
//! result back without running the operation again. The same key with a
//! different fingerprint is a caller bug and fails with
//! [`Error::IdempotencyKeyConflict`].
//!
//! Failed operations are not stored: nothing was committed, so the caller may
//! retry with the same key.

use crate::{
    locks::{LockKey, LockManager},
    metrics::Metrics,
    storage::Storage,
    Error, Result,
};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;

/// SHA-256 hex of a request's canonical JSON
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestFingerprint(String);

impl RequestFingerprint {
    /// Fingerprint any serializable request body
    pub fn of<T: Serialize + ?Sized>(request: &T) -> Result<Self> {
        let canonical = serde_json::to_vec(request)?;
        Ok(Self(hex::encode(Sha256::digest(&canonical))))
    }

    /// Hex digest
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Stored outcome of a committed request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Caller-supplied key
    pub key: String,
    /// Fingerprint of the first request seen with this key
    pub fingerprint: String,
    /// Committed response as JSON
    pub response: String,
    /// When the response was stored
    pub created_at: DateTime<Utc>,
}

/// Deduplicates client requests by idempotency key
#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    storage: Arc<Storage>,
    locks: Arc<LockManager>,
    metrics: Metrics,
}

impl IdempotencyGuard {
    /// Create a guard over the given store
    pub fn new(storage: Arc<Storage>, locks: Arc<LockManager>, metrics: Metrics) -> Self {
        Self {
            storage,
            locks,
            metrics,
        }
    }

    /// Run `operation` at most once per key
    pub async fn execute<T, F, Fut>(
        &self,
        key: &str,
        fingerprint: &RequestFingerprint,
        operation: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::MissingIdempotencyKey);
        }

        if let Some(stored) = self.replay(key, fingerprint)? {
            return Ok(stored);
        }

        let _guard = self.locks.acquire([LockKey::Request(key.to_string())]).await;

        // Someone may have finished while we waited for the lock
        if let Some(stored) = self.replay(key, fingerprint)? {
            return Ok(stored);
        }

        let response = operation().await?;

        let record = IdempotencyRecord {
            key: key.to_string(),
            fingerprint: fingerprint.as_str().to_string(),
            response: serde_json::to_string(&response)?,
            created_at: Utc::now(),
        };
        self.storage.put_request(&record)?;

        tracing::debug!(idempotency_key = %key, "Request result stored");
        Ok(response)
    }

    fn replay<T: DeserializeOwned>(&self, key: &str, fingerprint: &RequestFingerprint) -> Result<Option<T>> {
        let Some(record) = self.storage.get_request(key)? else {
            return Ok(None);
        };

        if record.fingerprint != fingerprint.as_str() {
            tracing::warn!(idempotency_key = %key, "Idempotency key reused with a different request");
            return Err(Error::IdempotencyKeyConflict(format!(
                "key '{}' was already used for a different request",
                key
            )));
        }

        self.metrics.record_request_replay();
        tracing::debug!(idempotency_key = %key, "Request replayed from stored result");
        Ok(Some(serde_json::from_str(&record.response)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn create_guard() -> (IdempotencyGuard, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        let storage = Arc::new(Storage::open(&config).unwrap());
        let guard = IdempotencyGuard::new(storage, Arc::new(LockManager::new()), Metrics::new().unwrap());
        (guard, temp_dir)
    }

    #[derive(Debug, Serialize)]
    struct Purchase<'a> {
        sku: &'a str,
        quantity: u32,
    }

    #[test]
    fn test_fingerprint_is_stable_and_content_sensitive() {
        let a = RequestFingerprint::of(&Purchase { sku: "x", quantity: 1 }).unwrap();
        let b = RequestFingerprint::of(&Purchase { sku: "x", quantity: 1 }).unwrap();
        let c = RequestFingerprint::of(&Purchase { sku: "x", quantity: 2 }).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
    }

    #[tokio::test]
    async fn test_second_call_replays_without_running() {
        let (guard, _temp) = create_guard();
        let runs = AtomicUsize::new(0);
        let fp = RequestFingerprint::of(&Purchase { sku: "x", quantity: 1 }).unwrap();

        for _ in 0..3 {
            let value: u64 = guard
                .execute("k1", &fp, || async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(7)
                })
                .await
                .unwrap();
            assert_eq!(value, 7);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_conflicting_fingerprint_rejected() {
        let (guard, _temp) = create_guard();
        let first = RequestFingerprint::of(&Purchase { sku: "x", quantity: 1 }).unwrap();
        let other = RequestFingerprint::of(&Purchase { sku: "y", quantity: 1 }).unwrap();

        let _: u64 = guard.execute("k", &first, || async { Ok(1) }).await.unwrap();
        let err = guard
            .execute::<u64, _, _>("k", &other, || async { Ok(2) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IdempotencyKeyConflict(_)));
    }

    #[tokio::test]
    async fn test_failed_operation_not_stored() {
        let (guard, _temp) = create_guard();
        let fp = RequestFingerprint::of("body").unwrap();

        let err = guard
            .execute::<u64, _, _>("k", &fp, || async { Err(Error::Transient("store down".into())) })
            .await
            .unwrap_err();
        assert!(err.is_transient());

        let value: u64 = guard.execute("k", &fp, || async { Ok(3) }).await.unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_missing_key() {
        let (guard, _temp) = create_guard();
        let fp = RequestFingerprint::of("body").unwrap();
        let err = guard
            .execute::<u64, _, _>(" ", &fp, || async { Ok(1) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingIdempotencyKey));
    }

    #[tokio::test]
    async fn test_concurrent_callers_run_once() {
        let (guard, _temp) = create_guard();
        let runs = Arc::new(AtomicUsize::new(0));
        let fp = RequestFingerprint::of("same").unwrap();

        let mut handles = Vec::new();
        for _ in 0..10 {
            let guard = guard.clone();
            let runs = Arc::clone(&runs);
            let fp = fp.clone();
            handles.push(tokio::spawn(async move {
                guard
                    .execute("shared", &fp, || async {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        Ok(String::from("done"))
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "done");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
