//! Redis-backed cursor store.
//!
//! Cursors are plain integer strings written with `SET` (no expiry); sequence
//! counters use `INCRBY`, which Redis executes atomically.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};

use crate::record::MonotonicSeq;
use crate::storage::traits::{CursorKey, CursorStore, StorageError};

fn redis_err(err: RedisError) -> StorageError {
    if err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() || err.is_io_error() {
        StorageError::Connection(err.to_string())
    } else {
        StorageError::Backend(err.to_string())
    }
}

/// Cursor store backed by a Redis connection manager.
#[derive(Clone)]
pub struct RedisCursorStore {
    conn: ConnectionManager,
}

impl RedisCursorStore {
    /// Connect to the Redis server at `url` (e.g., `redis://127.0.0.1/`).
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let client = Client::open(url).map_err(redis_err)?;
        let conn = ConnectionManager::new(client).await.map_err(redis_err)?;
        Ok(Self { conn })
    }

    /// Wrap an existing connection manager.
    #[must_use]
    pub fn from_manager(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

impl std::fmt::Debug for RedisCursorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCursorStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl CursorStore for RedisCursorStore {
    async fn get(&self, key: &CursorKey) -> Result<Option<MonotonicSeq>, StorageError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key.as_str()).await.map_err(redis_err)?;
        raw.map(|s| {
            s.trim()
                .parse::<u64>()
                .map(MonotonicSeq::new)
                .map_err(|e| StorageError::Serialization(format!("cursor '{key}' holds '{s}': {e}")))
        })
        .transpose()
    }

    async fn set(&self, key: &CursorKey, value: MonotonicSeq) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key.as_str(), value.get()).await.map_err(redis_err)?;
        Ok(())
    }

    async fn increment(&self, key: &CursorKey) -> Result<MonotonicSeq, StorageError> {
        let mut conn = self.conn.clone();
        let next: u64 = conn.incr(key.as_str(), 1u64).await.map_err(redis_err)?;
        Ok(MonotonicSeq::new(next))
    }
}
