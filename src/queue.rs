//! Typed framing over the two task lists and the per-task result key.
//!
//! Producers LPUSH encoded headers; consumers BRPOP across both lists with
//! the priority list first, so a non-empty priority queue strictly preempts
//! the normal queue. Starvation of `scan_normal` under sustained priority
//! load is a deliberate property, not a bug. Results are single-delivery:
//! only the producer that minted the task id knows the result key.

use std::time::Duration;

use crate::core::{KeySpace, Priority, ScanError, TaskHeader, VerdictRecord};
use crate::store::SharedStore;

/// TTL on published results; the producer reads within its verdict timeout.
pub const RESULT_TTL: Duration = Duration::from_secs(60);

/// An element popped from one of the task queues, not yet parsed.
#[derive(Debug, Clone)]
pub struct PoppedTask {
    /// Which queue the element came from.
    pub priority: Priority,
    /// Raw wire header.
    pub raw: Vec<u8>,
}

impl PoppedTask {
    /// Parses the wire header.
    pub fn header(&self) -> Result<TaskHeader, ScanError> {
        let text = std::str::from_utf8(&self.raw)
            .map_err(|e| ScanError::protocol(format!("non-utf8 task header: {e}")))?;
        TaskHeader::parse(text)
    }

    /// Best-effort task id extraction for error reporting on headers that
    /// fail full parsing.
    pub fn task_id_hint(&self) -> Option<String> {
        let text = std::str::from_utf8(&self.raw).ok()?;
        let id = text.split('|').next()?;
        (!id.is_empty()).then(|| id.to_string())
    }
}

/// The Redis-backed task and result queues.
#[derive(Clone)]
pub struct TaskQueue {
    store: SharedStore,
    keys: KeySpace,
    result_ttl: Duration,
}

impl TaskQueue {
    /// Creates a queue over the given store and key space.
    pub fn new(store: SharedStore, keys: KeySpace) -> Self {
        Self {
            store,
            keys,
            result_ttl: RESULT_TTL,
        }
    }

    /// Overrides the result TTL (tests).
    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    /// Enqueues a task header onto its priority list.
    pub async fn enqueue(
        &self,
        header: &TaskHeader,
        priority: Priority,
    ) -> Result<(), ScanError> {
        self.store
            .lpush(&self.keys.queue(priority), header.encode().as_bytes())
            .await
    }

    /// Pops the next task, priority list first. `None` on timeout.
    pub async fn pop(&self, timeout: Duration) -> Result<Option<PoppedTask>, ScanError> {
        let priority_queue = self.keys.queue(Priority::High);
        let normal_queue = self.keys.queue(Priority::Normal);
        let popped = self
            .store
            .brpop(&[&priority_queue, &normal_queue], timeout)
            .await?;

        Ok(popped.map(|(list, raw)| {
            let priority = if list == priority_queue {
                Priority::High
            } else {
                Priority::Normal
            };
            PoppedTask { priority, raw }
        }))
    }

    /// Publishes the verdict for a task and arms its TTL.
    pub async fn publish_result(
        &self,
        task_id: &str,
        record: &VerdictRecord,
    ) -> Result<(), ScanError> {
        let key = self.keys.result(task_id);
        self.store
            .lpush(&key, record.to_json().as_bytes())
            .await?;
        self.store.pexpire(&key, self.result_ttl).await?;
        Ok(())
    }

    /// Blocks for the verdict of a task. `None` on timeout.
    pub async fn await_result(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<Option<VerdictRecord>, ScanError> {
        let key = self.keys.result(task_id);
        match self.store.brpop(&[&key], timeout).await? {
            Some((_, raw)) => {
                let record = VerdictRecord::from_json(&raw)
                    .map_err(|e| ScanError::protocol(format!("bad result payload: {e}")))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Drops a pending result, used when the proxy side disconnects.
    pub async fn discard_result(&self, task_id: &str) -> Result<(), ScanError> {
        self.store.del(&[&self.keys.result(task_id)]).await
    }

    /// Current depth of a queue, for the sampled gauge.
    pub async fn depth(&self, priority: Priority) -> Result<i64, ScanError> {
        self.store.llen(&self.keys.queue(priority)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ScanMetrics, TaskMode, Verdict, VerdictStatus};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn queue() -> (TaskQueue, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let queue = TaskQueue::new(store.clone(), KeySpace::new(""));
        (queue, store)
    }

    #[tokio::test]
    async fn test_priority_preempts_normal() {
        let (queue, _) = queue();
        let normal = TaskHeader::new(TaskMode::Stream, "n");
        let high = TaskHeader::new(TaskMode::Stream, "h");

        // Normal enqueued first, priority second; priority must pop first.
        queue.enqueue(&normal, Priority::Normal).await.unwrap();
        queue.enqueue(&high, Priority::High).await.unwrap();

        let first = queue
            .pop(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.priority, Priority::High);
        assert_eq!(first.header().unwrap().task_id, high.task_id);

        let second = queue
            .pop(Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.priority, Priority::Normal);
    }

    #[tokio::test]
    async fn test_fifo_within_one_list() {
        let (queue, _) = queue();
        let a = TaskHeader::new(TaskMode::Inline, "a");
        let b = TaskHeader::new(TaskMode::Inline, "b");
        queue.enqueue(&a, Priority::Normal).await.unwrap();
        queue.enqueue(&b, Priority::Normal).await.unwrap();

        let first = queue
            .pop(Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.header().unwrap().task_id, a.task_id);
    }

    #[tokio::test]
    async fn test_result_round_trip_single_delivery() {
        let (queue, _) = queue();
        let record = VerdictRecord::new(&Verdict::Clean, None, ScanMetrics::default());

        queue.publish_result("t1", &record).await.unwrap();
        let received = queue
            .await_result("t1", Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.status, VerdictStatus::Clean);

        // The pop consumed it; a second read times out.
        let again = queue
            .await_result("t1", Duration::from_millis(30))
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_result_carries_ttl() {
        let (queue, store) = queue();
        let record = VerdictRecord::new(&Verdict::Clean, None, ScanMetrics::default());
        queue.publish_result("t2", &record).await.unwrap();
        assert!(store.ttl_of("result:t2").await.is_some());
    }

    #[tokio::test]
    async fn test_pop_timeout_on_empty_queues() {
        let (queue, _) = queue();
        assert!(queue
            .pop(Duration::from_millis(20))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_task_id_hint_survives_bad_header() {
        let task = PoppedTask {
            priority: Priority::Normal,
            raw: b"some-id|BOGUS".to_vec(),
        };
        assert!(task.header().is_err());
        assert_eq!(task.task_id_hint().as_deref(), Some("some-id"));
    }

    #[tokio::test]
    async fn test_depth_tracks_queue_length() {
        let (queue, _) = queue();
        assert_eq!(queue.depth(Priority::Normal).await.unwrap(), 0);
        let header = TaskHeader::new(TaskMode::Stream, "x");
        queue.enqueue(&header, Priority::Normal).await.unwrap();
        assert_eq!(queue.depth(Priority::Normal).await.unwrap(), 1);
    }
}
