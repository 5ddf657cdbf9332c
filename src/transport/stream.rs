//! STREAM transport: chunked relay through a Redis list.
//!
//! The producer RPUSHes chunks into `chunks:<task_id>` and sets a `:done`
//! sentinel at end of body. The consumer drains with `BLMOVE ... LEFT
//! RIGHT` into `chunks:<task_id>:verified`, so every chunk handed to the
//! engine is atomically preserved for downstream reuse. On an infected or
//! failed scan the verified list is dropped; on a clean scan it is kept
//! for an hour under the `data_key` advertised in the result.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::core::{ScanError, TaskMode};
use crate::store::SharedStore;
use crate::transport::DataProvider;

/// TTL applied to producer-side keys so abandoned tasks cannot leak.
const STREAM_TTL: Duration = Duration::from_secs(3600);

/// Largest element pushed onto the chunk list.
const STREAM_CHUNK_MAX: usize = 1024 * 1024;

/// Provider for follower-style chunk scanning.
pub struct StreamProvider {
    store: SharedStore,
    chunks_key: String,
    verified_key: String,
    done_key: String,
    chunk_timeout: Duration,
    idle_limit: Duration,
    consuming: bool,
}

impl StreamProvider {
    /// Creates a provider over `chunks_key` and its derived keys.
    pub fn new(
        store: SharedStore,
        chunks_key: String,
        chunk_timeout: Duration,
        idle_limit: Duration,
    ) -> Self {
        let verified_key = format!("{chunks_key}:verified");
        let done_key = format!("{chunks_key}:done");
        Self {
            store,
            chunks_key,
            verified_key,
            done_key,
            chunk_timeout,
            idle_limit,
            consuming: false,
        }
    }

    /// Key of the verified-chunk mirror list.
    pub fn verified_key(&self) -> &str {
        &self.verified_key
    }
}

#[async_trait]
impl DataProvider for StreamProvider {
    fn mode(&self) -> TaskMode {
        TaskMode::Stream
    }

    fn content_ref(&self) -> String {
        self.chunks_key.clone()
    }

    async fn push_chunk(&mut self, chunk: &[u8]) -> Result<(), ScanError> {
        for piece in chunk.chunks(STREAM_CHUNK_MAX) {
            self.store.rpush(&self.chunks_key, piece).await?;
        }
        self.store.pexpire(&self.chunks_key, STREAM_TTL).await?;
        Ok(())
    }

    async fn finalize_push(&mut self) -> Result<(), ScanError> {
        self.store.set_ex(&self.done_key, b"1", STREAM_TTL).await
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ScanError> {
        if !self.consuming {
            // A stale verified list from an earlier attempt must not leak
            // into this scan's mirror.
            self.store.del(&[&self.verified_key]).await?;
            self.consuming = true;
        }

        let idle_since = Instant::now();
        loop {
            let moved = self
                .store
                .blmove_left_right(&self.chunks_key, &self.verified_key, self.chunk_timeout)
                .await?;
            if let Some(chunk) = moved {
                return Ok(Some(chunk));
            }

            // Emptiness is terminal only once the producer signalled EOF.
            if self.store.get(&self.done_key).await?.is_some() {
                return Ok(None);
            }
            if idle_since.elapsed() >= self.idle_limit {
                return Err(ScanError::timeout("chunk stream", idle_since.elapsed()));
            }
        }
    }

    async fn finalize(&mut self, success: bool, is_virus: bool) -> Result<(), ScanError> {
        if !success || is_virus {
            self.store.del(&[&self.verified_key]).await?;
        } else {
            self.store.pexpire(&self.verified_key, STREAM_TTL).await?;
        }
        self.store.del(&[&self.done_key]).await
    }

    fn data_key(&self) -> Option<String> {
        Some(self.verified_key.clone())
    }
}
