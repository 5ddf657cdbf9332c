//! State-store abstraction over Redis.
//!
//! Every piece of cross-process state in the system lives in Redis, but the
//! pipeline only touches a narrow operation set: list push/pop, blocking
//! moves, TTL'd strings, the `SET NX PX` lock primitive, and a guarded
//! delete. `StateStore` captures exactly that surface so the producer,
//! consumer, and tests stay decoupled from the concrete client.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::ScanError;

/// Shared handle to a state store.
pub type SharedStore = Arc<dyn StateStore>;

/// The Redis operation surface used by the pipeline.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// `GET key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ScanError>;

    /// `SET key value` without expiry.
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), ScanError>;

    /// `SET key value EX ttl`.
    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), ScanError>;

    /// `SET key value NX PX ttl_ms`; returns whether the key was set.
    async fn set_nx_px(&self, key: &str, value: &[u8], ttl: Duration)
        -> Result<bool, ScanError>;

    /// `PEXPIRE key ttl_ms`; returns whether the key existed.
    async fn pexpire(&self, key: &str, ttl: Duration) -> Result<bool, ScanError>;

    /// `DEL key...`.
    async fn del(&self, keys: &[&str]) -> Result<(), ScanError>;

    /// Deletes `key` only while it still holds `expected` (Lua CAS).
    /// Returns whether the delete happened.
    async fn del_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, ScanError>;

    /// `LPUSH key value`.
    async fn lpush(&self, key: &str, value: &[u8]) -> Result<(), ScanError>;

    /// `RPUSH key value`.
    async fn rpush(&self, key: &str, value: &[u8]) -> Result<(), ScanError>;

    /// `LLEN key`.
    async fn llen(&self, key: &str) -> Result<i64, ScanError>;

    /// `LRANGE key 0 -1`.
    async fn lrange_all(&self, key: &str) -> Result<Vec<Vec<u8>>, ScanError>;

    /// `BRPOP key... timeout`; returns `(list, element)` or `None` on
    /// timeout. Keys are polled in order, so priority lists go first.
    async fn brpop(
        &self,
        keys: &[&str],
        timeout: Duration,
    ) -> Result<Option<(String, Vec<u8>)>, ScanError>;

    /// `BLMOVE src dst LEFT RIGHT timeout`; `None` on timeout.
    async fn blmove_left_right(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, ScanError>;

    /// `SCAN ... MATCH pattern` over the whole keyspace.
    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, ScanError>;

    /// `PING`; errors when the store is unreachable.
    async fn ping(&self) -> Result<(), ScanError>;
}
