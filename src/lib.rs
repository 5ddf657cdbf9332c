//! # scangate
//!
//! An in-line content-inspection gateway that sits between an HTTP egress
//! proxy and its upstreams, siphons request and response bodies to a
//! ClamAV worker pool through a Redis task queue, and admits or blocks
//! traffic on the verdict.
//!
//! ## Overview
//!
//! Two cooperating services share this library:
//!
//! - The **producer** speaks the proxy's inspection protocol (Envoy
//!   external processing over gRPC, or ICAP) and runs one [`ScanSession`]
//!   per transaction: decide bypass, buffer or stream the body, enqueue a
//!   task, wait for the verdict, answer admit or block.
//! - The **consumer** pops tasks, reconstructs the body through a
//!   [`DataProvider`], streams it to clamd over INSTREAM, and publishes
//!   the verdict. A background coordinator serializes virus-database
//!   reloads across the cluster.
//!
//! Redis is the only shared state: two task lists, per-task result keys,
//! a chunk list per streaming body, the verdict cache, and the HA control
//! keys. The whole surface is captured by the [`StateStore`] trait, with
//! an in-memory implementation for tests.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use scangate::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ScanError> {
//!     let store: SharedStore = Arc::new(RedisStore::connect("redis://localhost:6379").await?);
//!     let keys = KeySpace::new("");
//!     let queue = TaskQueue::new(store.clone(), keys.clone());
//!
//!     let header = TaskHeader::new(TaskMode::Stream, "chunks:demo");
//!     queue.enqueue(&header, Priority::Normal).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod cache;
pub mod config;
pub mod consumer;
pub mod core;
pub mod http;
pub mod metrics;
pub mod producer;
pub mod queue;
pub mod retry;
pub mod store;
pub mod transport;

pub use crate::cache::IntelligentCache;
pub use crate::core::{
    KeySpace, Priority, ScanError, TaskHeader, TaskMode, Verdict, VerdictRecord,
};
pub use crate::producer::{ProducerContext, ScanSession, SessionOutcome};
pub use crate::queue::TaskQueue;
pub use crate::store::{MemoryStore, RedisStore, SharedStore, StateStore};
pub use crate::transport::{DataProvider, TransportConfig};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cache::IntelligentCache;
    pub use crate::consumer::{ClamdClient, Coordinator, WorkerContext, WorkerPool};
    pub use crate::core::{
        KeySpace, Priority, ScanError, TaskHeader, TaskMode, Verdict, VerdictRecord,
    };
    pub use crate::producer::{ProducerContext, ScanSession, SessionOutcome};
    pub use crate::queue::TaskQueue;
    pub use crate::store::{MemoryStore, RedisStore, SharedStore, StateStore};
    pub use crate::transport::{DataProvider, TransportConfig};
}
