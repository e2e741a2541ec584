//! Key-value persistence seam for checkpoints, locks, and cached responses.
//!
//! The orchestrator talks to [`KvStore`] only; [`MemoryKv`] is the bundled
//! in-process backend. A networked backend implements the same five calls.
//! Expiry is checked lazily on read, so an expired entry is indistinguishable
//! from an absent one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;

/// Backend-level failure, opaque to callers beyond the message.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
#[error("kv store: {message}")]
#[diagnostic(code(turnloom::kv::backend))]
pub struct KvError {
    pub message: String,
}

impl KvError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Minimal contract a persistence backend must satisfy.
///
/// `set_nx_ex` and `delete_if_eq` are the two primitives session locking
/// needs: acquire-if-absent with expiry, and owner-checked release.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Unconditional write with a time-to-live.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;

    /// Write only if the key is absent (or expired). Returns whether the
    /// write happened.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Delete only if the stored value equals `expected`, atomically.
    /// Returns whether the key was deleted.
    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, KvError>;
}

#[derive(Clone, Debug)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process [`KvStore`] backed by a mutex-guarded map.
///
/// Suitable for tests and single-process deployments. Entries past their
/// TTL are dropped on the next touch of their key.
#[derive(Clone, Default)]
pub struct MemoryKv {
    entries: Arc<Mutex<FxHashMap<String, Entry>>>,
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Utc::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        let occupied = entries.get(key).is_some_and(|e| !e.is_expired(now));
        if occupied {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                Ok(false)
            }
            Some(entry) if entry.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_respects_existing_keys() {
        let kv = MemoryKv::new();
        assert!(kv
            .set_nx_ex("k", "a", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!kv
            .set_nx_ex("k", "b", Duration::from_secs(60))
            .await
            .unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let kv = MemoryKv::new();
        kv.set_ex("k", "v", Duration::from_millis(0)).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
        // and the slot is reusable under set_nx
        assert!(kv
            .set_nx_ex("k", "w", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn delete_if_eq_only_removes_matching_value() {
        let kv = MemoryKv::new();
        kv.set_ex("k", "owner-1", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!kv.delete_if_eq("k", "owner-2").await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("owner-1"));
        assert!(kv.delete_if_eq("k", "owner-1").await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), None);
    }
}
