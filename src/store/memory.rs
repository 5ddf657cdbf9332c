//! In-memory `StateStore` for tests and single-process development.
//!
//! Semantics mirror the Redis commands the pipeline uses: lazy TTL expiry,
//! FIFO lists, and blocking pops implemented as short polls so test code
//! exercises the same timeout paths as production.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::core::ScanError;
use crate::store::StateStore;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
enum Value {
    Str(Vec<u8>),
    List(VecDeque<Vec<u8>>),
}

#[derive(Default)]
struct Inner {
    data: HashMap<String, Value>,
    deadlines: HashMap<String, Instant>,
}

impl Inner {
    fn purge(&mut self, key: &str) {
        if let Some(deadline) = self.deadlines.get(key) {
            if Instant::now() >= *deadline {
                self.deadlines.remove(key);
                self.data.remove(key);
            }
        }
    }

    fn purge_all(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| now >= **deadline)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.deadlines.remove(&key);
            self.data.remove(&key);
        }
    }

    fn list_mut(&mut self, key: &str) -> &mut VecDeque<Vec<u8>> {
        let entry = self
            .data
            .entry(key.to_string())
            .or_insert_with(|| Value::List(VecDeque::new()));
        if !matches!(entry, Value::List(_)) {
            *entry = Value::List(VecDeque::new());
        }
        match entry {
            Value::List(list) => list,
            Value::Str(_) => unreachable!(),
        }
    }
}

/// In-memory store, cheap to clone and share.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining TTL of a key, if one is set. Test helper.
    pub async fn ttl_of(&self, key: &str) -> Option<Duration> {
        let inner = self.inner.lock().await;
        inner
            .deadlines
            .get(key)
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Whether a key currently exists. Test helper.
    pub async fn exists(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        inner.data.contains_key(key)
    }
}

/// Matches a Redis glob pattern supporting `*` wildcards.
fn glob_match(pattern: &str, key: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == key;
    }

    let mut rest = key;
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(segment) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == segments.len() - 1 {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(pos) => rest = &rest[pos + segment.len()..],
                None => return false,
            }
        }
    }
    true
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ScanError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        Ok(match inner.data.get(key) {
            Some(Value::Str(bytes)) => Some(bytes.clone()),
            _ => None,
        })
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), ScanError> {
        let mut inner = self.inner.lock().await;
        inner.data.insert(key.to_string(), Value::Str(value.to_vec()));
        inner.deadlines.remove(key);
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), ScanError> {
        let mut inner = self.inner.lock().await;
        inner.data.insert(key.to_string(), Value::Str(value.to_vec()));
        inner
            .deadlines
            .insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn set_nx_px(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool, ScanError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        if inner.data.contains_key(key) {
            return Ok(false);
        }
        inner.data.insert(key.to_string(), Value::Str(value.to_vec()));
        inner
            .deadlines
            .insert(key.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn pexpire(&self, key: &str, ttl: Duration) -> Result<bool, ScanError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        if !inner.data.contains_key(key) {
            return Ok(false);
        }
        inner
            .deadlines
            .insert(key.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn del(&self, keys: &[&str]) -> Result<(), ScanError> {
        let mut inner = self.inner.lock().await;
        for key in keys {
            inner.data.remove(*key);
            inner.deadlines.remove(*key);
        }
        Ok(())
    }

    async fn del_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool, ScanError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        let matches = matches!(inner.data.get(key), Some(Value::Str(v)) if v == expected);
        if matches {
            inner.data.remove(key);
            inner.deadlines.remove(key);
        }
        Ok(matches)
    }

    async fn lpush(&self, key: &str, value: &[u8]) -> Result<(), ScanError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        inner.list_mut(key).push_front(value.to_vec());
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &[u8]) -> Result<(), ScanError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        inner.list_mut(key).push_back(value.to_vec());
        Ok(())
    }

    async fn llen(&self, key: &str) -> Result<i64, ScanError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        Ok(match inner.data.get(key) {
            Some(Value::List(list)) => list.len() as i64,
            _ => 0,
        })
    }

    async fn lrange_all(&self, key: &str) -> Result<Vec<Vec<u8>>, ScanError> {
        let mut inner = self.inner.lock().await;
        inner.purge(key);
        Ok(match inner.data.get(key) {
            Some(Value::List(list)) => list.iter().cloned().collect(),
            _ => Vec::new(),
        })
    }

    async fn brpop(
        &self,
        keys: &[&str],
        timeout: Duration,
    ) -> Result<Option<(String, Vec<u8>)>, ScanError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock().await;
                for key in keys {
                    inner.purge(key);
                    if let Some(Value::List(list)) = inner.data.get_mut(*key) {
                        if let Some(element) = list.pop_back() {
                            if list.is_empty() {
                                inner.data.remove(*key);
                            }
                            return Ok(Some((key.to_string(), element)));
                        }
                    }
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn blmove_left_right(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, ScanError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock().await;
                inner.purge(src);
                let popped = match inner.data.get_mut(src) {
                    Some(Value::List(list)) => list.pop_front(),
                    _ => None,
                };
                if let Some(element) = popped {
                    inner.list_mut(dst).push_back(element.clone());
                    return Ok(Some(element));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, ScanError> {
        let mut inner = self.inner.lock().await;
        inner.purge_all();
        Ok(inner
            .data
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), ScanError> {
        Ok(())
    }
}
