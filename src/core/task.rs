//! Task identity and the queue wire format.
//!
//! A queue element is the pipe-delimited header
//! `task_id|MODE|push_time_ns|content_ref`. Binary data never appears in
//! the header; the payload lives behind `content_ref` (an inline key, a
//! chunk-list key, or a filename under the shared scan directory).

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::core::error::ScanError;

/// Transport mode recorded in the task header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskMode {
    /// Body stored whole under a single `inline:<task_id>` key.
    Inline,
    /// Body streamed chunk-by-chunk through `chunks:<task_id>`.
    Stream,
    /// Body written to a file on the shared RWX volume.
    Path,
}

impl TaskMode {
    /// Wire name used in the queue header.
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::Inline => "INLINE",
            Self::Stream => "STREAM",
            Self::Path => "PATH",
        }
    }
}

impl fmt::Display for TaskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

impl FromStr for TaskMode {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INLINE" => Ok(Self::Inline),
            "STREAM" => Ok(Self::Stream),
            "PATH" => Ok(Self::Path),
            other => Err(ScanError::protocol(format!("unknown mode '{other}'"))),
        }
    }
}

/// Scan priority. Priority tasks strictly preempt normal ones; starvation
/// of the normal queue under sustained priority load is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Priority {
    /// Preempting queue, selected via `X-Priority: high`.
    High,
    /// Default queue.
    #[default]
    Normal,
}

impl Priority {
    /// Queue list name for this priority, under the configured key prefix.
    pub fn queue_name(&self) -> &'static str {
        match self {
            Self::High => "scan_priority",
            Self::Normal => "scan_normal",
        }
    }

    /// Metric label value.
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
        }
    }
}

/// A parsed queue element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHeader {
    /// Globally-unique task identifier (UUIDv4).
    pub task_id: String,
    /// Transport mode of the body.
    pub mode: TaskMode,
    /// Producer-side enqueue timestamp, nanoseconds since the epoch.
    pub push_time_ns: u128,
    /// Inline key, chunk-list key, or shared-disk filename.
    pub content_ref: String,
}

impl TaskHeader {
    /// Creates a header for a fresh task, stamping `push_time_ns` now.
    pub fn new(mode: TaskMode, content_ref: impl Into<String>) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            mode,
            push_time_ns: now_ns(),
            content_ref: content_ref.into(),
        }
    }

    /// Encodes the header into its wire form.
    pub fn encode(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.task_id, self.mode, self.push_time_ns, self.content_ref
        )
    }

    /// Parses a wire header.
    ///
    /// The split is bounded at four fields so a `content_ref` containing a
    /// pipe (a filesystem path could) survives intact.
    pub fn parse(wire: &str) -> Result<Self, ScanError> {
        let mut parts = wire.splitn(4, '|');
        let task_id = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ScanError::protocol("empty task header"))?;
        let mode = parts
            .next()
            .ok_or_else(|| ScanError::protocol(format!("missing mode in '{wire}'")))?
            .parse::<TaskMode>()?;
        let push_time_ns = parts
            .next()
            .ok_or_else(|| ScanError::protocol(format!("missing timestamp in '{wire}'")))?
            .parse::<u128>()
            .map_err(|e| ScanError::protocol(format!("bad timestamp in '{wire}': {e}")))?;
        let content_ref = parts
            .next()
            .ok_or_else(|| ScanError::protocol(format!("missing content ref in '{wire}'")))?;

        Ok(Self {
            task_id: task_id.to_string(),
            mode,
            push_time_ns,
            content_ref: content_ref.to_string(),
        })
    }

    /// Milliseconds elapsed since the task was pushed.
    pub fn age_ms(&self) -> u64 {
        let now = now_ns();
        (now.saturating_sub(self.push_time_ns) / 1_000_000) as u64
    }
}

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_ns() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}
