//! Session concurrency control and idempotent replay.
//!
//! One session runs at most one turn at a time. The lock is a KV entry
//! `lock:{session_id}` holding the owning request id, acquired atomically
//! with a TTL so a crashed owner cannot wedge the session. Release checks
//! ownership, the KV analogue of a compare-and-delete script.
//!
//! The idempotency cache maps `response:{request_id}` to the composed
//! response plus a hash of the request payload, so an exact replay returns
//! the cached response and a payload mismatch is rejected.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::compose::TurnResponse;
use crate::errors::TurnError;
use crate::kv::KvStore;

pub const LOCK_KEY_PREFIX: &str = "lock:";
pub const RESPONSE_KEY_PREFIX: &str = "response:";

/// Acquires and releases per-session turn locks.
#[derive(Clone)]
pub struct SessionLockManager {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
    max_wait: Duration,
}

impl SessionLockManager {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration, max_wait: Duration) -> Self {
        Self { kv, ttl, max_wait }
    }

    fn key(session_id: &str) -> String {
        format!("{LOCK_KEY_PREFIX}{session_id}")
    }

    /// Acquire the session lock for `request_id`, retrying with jittered
    /// backoff up to the configured wait bound.
    #[instrument(skip(self))]
    pub async fn acquire(
        &self,
        session_id: &str,
        request_id: &str,
    ) -> Result<SessionLockGuard, TurnError> {
        let key = Self::key(session_id);
        let deadline = Instant::now() + self.max_wait;
        loop {
            let acquired = self
                .kv
                .set_nx_ex(&key, request_id, self.ttl)
                .await
                .map_err(|e| TurnError::Validation(format!("lock backend: {}", e.message)))?;
            if acquired {
                debug!(session_id, request_id, "session lock acquired");
                return Ok(SessionLockGuard {
                    kv: Arc::clone(&self.kv),
                    key,
                    owner: request_id.to_string(),
                    released: false,
                });
            }
            if Instant::now() >= deadline {
                return Err(TurnError::LockContention {
                    session_id: session_id.to_string(),
                });
            }
            let jitter = rand::rng().random_range(0..50);
            tokio::time::sleep(Duration::from_millis(50 + jitter)).await;
        }
    }
}

/// Holds the session lock for the duration of a turn.
///
/// Prefer the explicit [`release`](Self::release) on normal paths; `Drop`
/// covers the rest by spawning an owner-checked delete, and the TTL covers
/// a process that dies before either runs.
pub struct SessionLockGuard {
    kv: Arc<dyn KvStore>,
    key: String,
    owner: String,
    released: bool,
}

impl SessionLockGuard {
    /// Release the lock if this guard still owns it.
    pub async fn release(mut self) {
        self.released = true;
        match self.kv.delete_if_eq(&self.key, &self.owner).await {
            Ok(true) => debug!(key = %self.key, "session lock released"),
            Ok(false) => warn!(key = %self.key, "lock already expired or taken over"),
            Err(e) => warn!(key = %self.key, error = %e.message, "lock release failed"),
        }
    }
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let kv = Arc::clone(&self.kv);
        let key = std::mem::take(&mut self.key);
        let owner = std::mem::take(&mut self.owner);
        // Best-effort when dropped outside a runtime; TTL expiry is the
        // backstop either way.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = kv.delete_if_eq(&key, &owner).await {
                    warn!(key = %key, error = %e.message, "lock release on drop failed");
                }
            });
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedTurn {
    payload_hash: String,
    response: TurnResponse,
}

/// Hash of the request payload fields that must match for a replay to count
/// as the same request.
#[must_use]
pub fn payload_hash(session_id: &str, user_id: &str, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(user_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(message.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Stores composed responses keyed by request id for idempotent replay.
#[derive(Clone)]
pub struct IdempotencyCache {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl IdempotencyCache {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    fn key(request_id: &str) -> String {
        format!("{RESPONSE_KEY_PREFIX}{request_id}")
    }

    /// Look up a prior response for this request id.
    ///
    /// Returns the cached response when the payload hash matches, `None`
    /// when the request is new, and [`TurnError::IdempotencyConflict`] when
    /// the id was seen with a different payload.
    #[instrument(skip(self, payload_hash))]
    pub async fn check(
        &self,
        request_id: &str,
        payload_hash: &str,
    ) -> Result<Option<TurnResponse>, TurnError> {
        let body = self
            .kv
            .get(&Self::key(request_id))
            .await
            .map_err(|e| TurnError::Validation(format!("idempotency backend: {}", e.message)))?;
        let Some(body) = body else {
            return Ok(None);
        };
        let cached: CachedTurn = match serde_json::from_str(&body) {
            Ok(cached) => cached,
            Err(e) => {
                warn!(request_id, error = %e, "malformed cached response, ignoring");
                return Ok(None);
            }
        };
        if cached.payload_hash != payload_hash {
            return Err(TurnError::IdempotencyConflict {
                request_id: request_id.to_string(),
            });
        }
        debug!(request_id, "idempotent replay served from cache");
        Ok(Some(cached.response))
    }

    /// Record the composed response for future replays. Failures are logged
    /// and swallowed; caching is advisory.
    pub async fn store(&self, request_id: &str, payload_hash: &str, response: &TurnResponse) {
        let cached = CachedTurn {
            payload_hash: payload_hash.to_string(),
            response: response.clone(),
        };
        let body = match serde_json::to_string(&cached) {
            Ok(body) => body,
            Err(e) => {
                warn!(request_id, error = %e, "failed to encode cached response");
                return;
            }
        };
        if let Err(e) = self.kv.set_ex(&Self::key(request_id), &body, self.ttl).await {
            warn!(request_id, error = %e.message, "failed to cache response");
        }
    }
}
