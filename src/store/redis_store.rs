//! Redis-backed `StateStore`.
//!
//! Built on the multiplexed `ConnectionManager`, which reconnects on its
//! own and clones cheaply, so one store handle serves every task in the
//! process. Blocking commands (BRPOP, BLMOVE) always carry a finite
//! timeout so shutdown stays responsive.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use crate::core::ScanError;
use crate::store::StateStore;

const DEL_IF_EQUALS_LUA: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// `StateStore` implementation over a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connects to Redis at `url` (e.g. `redis://host:6379`).
    pub async fn connect(url: &str) -> Result<Self, ScanError> {
        let client = redis::Client::open(url)
            .map_err(|e| ScanError::configuration(format!("invalid redis url '{url}': {e}")))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| ScanError::store("CONNECT", e.to_string()))?;
        Ok(Self { manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn store_err(op: &'static str) -> impl FnOnce(redis::RedisError) -> ScanError {
    move |e| ScanError::store(op, e.to_string())
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ScanError> {
        let mut conn = self.conn();
        let value: Option<Vec<u8>> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_err("GET"))?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), ScanError> {
        let mut conn = self.conn();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(store_err("SET"))?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), ScanError> {
        let mut conn = self.conn();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(store_err("SET EX"))?;
        Ok(())
    }

    async fn set_nx_px(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, ScanError> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(store_err("SET NX PX"))?;
        Ok(reply.is_some())
    }

    async fn pexpire(&self, key: &str, ttl: Duration) -> Result<bool, ScanError> {
        let mut conn = self.conn();
        let set: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(store_err("PEXPIRE"))?;
        Ok(set == 1)
    }

    async fn del(&self, keys: &[&str]) -> Result<(), ScanError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        let _: i64 = redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(store_err("DEL"))?;
        Ok(())
    }

    async fn del_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, ScanError> {
        let mut conn = self.conn();
        let script = redis::Script::new(DEL_IF_EQUALS_LUA);
        let deleted: i64 = script
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(store_err("EVAL DEL-IF-EQUALS"))?;
        Ok(deleted == 1)
    }

    async fn lpush(&self, key: &str, value: &[u8]) -> Result<(), ScanError> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(store_err("LPUSH"))?;
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &[u8]) -> Result<(), ScanError> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(store_err("RPUSH"))?;
        Ok(())
    }

    async fn llen(&self, key: &str) -> Result<i64, ScanError> {
        let mut conn = self.conn();
        let len: i64 = redis::cmd("LLEN")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(store_err("LLEN"))?;
        Ok(len)
    }

    async fn lrange_all(&self, key: &str) -> Result<Vec<Vec<u8>>, ScanError> {
        let mut conn = self.conn();
        let items: Vec<Vec<u8>> = redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(store_err("LRANGE"))?;
        Ok(items)
    }

    async fn brpop(
        &self,
        keys: &[&str],
        timeout: Duration,
    ) -> Result<Option<(String, Vec<u8>)>, ScanError> {
        let mut conn = self.conn();
        let reply: Option<(String, Vec<u8>)> = redis::cmd("BRPOP")
            .arg(keys)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await
            .map_err(store_err("BRPOP"))?;
        Ok(reply)
    }

    async fn blmove_left_right(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, ScanError> {
        let mut conn = self.conn();
        let reply: Option<Vec<u8>> = redis::cmd("BLMOVE")
            .arg(src)
            .arg(dst)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await
            .map_err(store_err("BLMOVE"))?;
        Ok(reply)
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, ScanError> {
        let mut conn = self.conn();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(store_err("SCAN"))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn ping(&self) -> Result<(), ScanError> {
        let mut conn = self.conn();
        let reply: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_err("PING"))?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(ScanError::store("PING", format!("unexpected reply '{reply}'")))
        }
    }
}
