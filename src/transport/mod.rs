//! Data transport between producer and consumer.
//!
//! A `DataProvider` carries one task's body across the process boundary.
//! Three variants exist: `INLINE` for bodies that fit a single Redis value,
//! `STREAM` for chunk-by-chunk relay through a Redis list (the follower
//! pattern), and `SHARED_DISK` for large bodies on a shared RWX volume.
//! The producer pushes and finalizes; the consumer drains chunks in order
//! and finalizes with the scan outcome so each variant can release or
//! retain its backing data.

mod inline;
mod shared_disk;
mod stream;

pub use inline::InlineProvider;
pub use shared_disk::SharedDiskProvider;
pub use stream::StreamProvider;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::{KeySpace, ScanError, TaskHeader, TaskMode};
use crate::store::SharedStore;

/// Default inline cutoff: bodies at or under this use a single Redis value.
pub const DEFAULT_INLINE_MAX: u64 = 64 * 1024;

/// Default per-chunk BLMOVE timeout for STREAM consumers.
pub const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default limit on how long a STREAM consumer waits with no chunk and no
/// completion sentinel before declaring the producer gone.
pub const DEFAULT_IDLE_LIMIT: Duration = Duration::from_secs(60);

/// Uniform push/pull interface over the three transport modes.
///
/// Chunk iteration is finite and not restartable; `next_chunk` returning
/// `Ok(None)` means end of body.
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// The transport mode this provider implements.
    fn mode(&self) -> TaskMode;

    /// Value recorded as `content_ref` in the task header.
    fn content_ref(&self) -> String;

    /// Producer side: append one chunk of body data.
    async fn push_chunk(&mut self, chunk: &[u8]) -> Result<(), ScanError>;

    /// Producer side: mark end of body.
    async fn finalize_push(&mut self) -> Result<(), ScanError>;

    /// Consumer side: next chunk in push order, `None` at end of body.
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, ScanError>;

    /// Consumer side: release or retain backing data once the scan ended.
    async fn finalize(&mut self, success: bool, is_virus: bool) -> Result<(), ScanError>;

    /// Key under which verified data stays available downstream, if any.
    fn data_key(&self) -> Option<String> {
        None
    }
}

/// Configuration for provider selection and construction.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Bodies at or under this many bytes ride INLINE.
    pub inline_max: u64,
    /// Bodies at or over this many bytes spill to the shared volume.
    pub spill_threshold: u64,
    /// Shared RWX mount; `None` disables SHARED_DISK.
    pub shared_dir: Option<PathBuf>,
    /// Per-chunk BLMOVE timeout.
    pub chunk_timeout: Duration,
    /// Give-up limit while neither chunks nor the done sentinel arrive.
    pub idle_limit: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            inline_max: DEFAULT_INLINE_MAX,
            spill_threshold: 10 * 1024 * 1024,
            shared_dir: Some(PathBuf::from("/tmp/virusscan")),
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
            idle_limit: DEFAULT_IDLE_LIMIT,
        }
    }
}

impl TransportConfig {
    /// Picks a transport mode for a body of known or unknown size.
    ///
    /// STREAM is the preferred default; small bodies collapse to INLINE and
    /// bodies past the spill threshold go to the shared volume when one is
    /// mounted. A body of exactly the threshold still fits in memory.
    pub fn select_mode(&self, body_len: Option<u64>) -> TaskMode {
        match body_len {
            Some(len) if len <= self.inline_max => TaskMode::Inline,
            Some(len) if len > self.spill_threshold && self.shared_dir.is_some() => {
                TaskMode::Path
            }
            _ => TaskMode::Stream,
        }
    }

    /// Builds the producer-side provider for a freshly assigned task.
    pub fn provider_for_task(
        &self,
        mode: TaskMode,
        store: SharedStore,
        keys: &KeySpace,
        task_id: &str,
    ) -> Result<Box<dyn DataProvider>, ScanError> {
        match mode {
            TaskMode::Inline => Ok(Box::new(InlineProvider::new(
                store,
                keys.inline(task_id),
            ))),
            TaskMode::Stream => Ok(Box::new(StreamProvider::new(
                store,
                keys.chunks(task_id),
                self.chunk_timeout,
                self.idle_limit,
            ))),
            TaskMode::Path => {
                let dir = self.shared_dir.clone().ok_or_else(|| {
                    ScanError::configuration("SHARED_DISK selected without a shared mount")
                })?;
                Ok(Box::new(SharedDiskProvider::new(dir, task_id.to_string())))
            }
        }
    }

    /// Builds the consumer-side provider from a popped task header.
    pub fn provider_for_header(
        &self,
        header: &TaskHeader,
        store: SharedStore,
    ) -> Result<Box<dyn DataProvider>, ScanError> {
        match header.mode {
            TaskMode::Inline => Ok(Box::new(InlineProvider::new(
                store,
                header.content_ref.clone(),
            ))),
            TaskMode::Stream => Ok(Box::new(StreamProvider::new(
                store,
                header.content_ref.clone(),
                self.chunk_timeout,
                self.idle_limit,
            ))),
            TaskMode::Path => {
                let dir = self.shared_dir.clone().ok_or_else(|| {
                    ScanError::configuration("PATH task received without a shared mount")
                })?;
                Ok(Box::new(SharedDiskProvider::new(
                    dir,
                    header.content_ref.clone(),
                )))
            }
        }
    }
}
