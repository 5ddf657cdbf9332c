//! INLINE transport: the whole body under one TTL'd Redis key.

use std::time::Duration;

use async_trait::async_trait;

use crate::core::{ScanError, TaskMode};
use crate::store::SharedStore;
use crate::transport::DataProvider;

/// Chunk size used when feeding an inline body to the engine.
const READ_CHUNK: usize = 4096;

/// TTL on the inline key; the verdict arrives well within it.
const INLINE_TTL: Duration = Duration::from_secs(60);

/// Provider for bodies small enough to store whole.
pub struct InlineProvider {
    store: SharedStore,
    key: String,
    buffer: Vec<u8>,
    read_cursor: Option<usize>,
    loaded: Option<Vec<u8>>,
}

impl InlineProvider {
    /// Creates a provider over `inline:<task_id>`.
    pub fn new(store: SharedStore, key: String) -> Self {
        Self {
            store,
            key,
            buffer: Vec::new(),
            read_cursor: None,
            loaded: None,
        }
    }
}

#[async_trait]
impl DataProvider for InlineProvider {
    fn mode(&self) -> TaskMode {
        TaskMode::Inline
    }

    fn content_ref(&self) -> String {
        self.key.clone()
    }

    async fn push_chunk(&mut self, chunk: &[u8]) -> Result<(), ScanError> {
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    async fn finalize_push(&mut self) -> Result<(), ScanError> {
        self.store.set_ex(&self.key, &self.buffer, INLINE_TTL).await
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ScanError> {
        if self.loaded.is_none() {
            // An empty body is stored as an empty value; a missing key means
            // the TTL fired and the task is unrecoverable.
            let body = self.store.get(&self.key).await?.ok_or_else(|| {
                ScanError::store("GET", format!("inline body '{}' expired", self.key))
            })?;
            self.loaded = Some(body);
            self.read_cursor = Some(0);
        }

        let cursor = self.read_cursor.unwrap_or(0);
        match &self.loaded {
            Some(body) if cursor < body.len() => {
                let end = (cursor + READ_CHUNK).min(body.len());
                self.read_cursor = Some(end);
                Ok(Some(body[cursor..end].to_vec()))
            }
            _ => Ok(None),
        }
    }

    async fn finalize(&mut self, _success: bool, _is_virus: bool) -> Result<(), ScanError> {
        self.store.del(&[&self.key]).await
    }
}
