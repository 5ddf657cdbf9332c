//! Central naming for every Redis key the system touches.
//!
//! All keys live under one configurable prefix so several deployments can
//! share a Redis instance.

use crate::core::task::Priority;

/// Builder for the full Redis key surface.
#[derive(Debug, Clone, Default)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Creates a key space. An empty prefix produces bare key names.
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let prefix = if prefix.is_empty() || prefix.ends_with(':') {
            prefix
        } else {
            format!("{prefix}:")
        };
        Self { prefix }
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Task queue list for a priority class.
    pub fn queue(&self, priority: Priority) -> String {
        self.key(priority.queue_name())
    }

    /// Verdict key, `result:<task_id>`.
    pub fn result(&self, task_id: &str) -> String {
        self.key(&format!("result:{task_id}"))
    }

    /// Inline body key, `inline:<task_id>`.
    pub fn inline(&self, task_id: &str) -> String {
        self.key(&format!("inline:{task_id}"))
    }

    /// Chunk list for a STREAM task.
    pub fn chunks(&self, task_id: &str) -> String {
        self.key(&format!("chunks:{task_id}"))
    }

    /// Cached clean-verdict key for a fingerprint.
    pub fn cache_verdict(&self, fingerprint: &str) -> String {
        self.key(&format!("cache:verdict:{fingerprint}"))
    }

    /// Heartbeat key for a consumer node.
    pub fn heartbeat(&self, node_id: &str) -> String {
        self.key(&format!("clamav:heartbeat:{node_id}"))
    }

    /// Scan pattern matching every live heartbeat.
    pub fn heartbeat_pattern(&self) -> String {
        self.key("clamav:heartbeat:*")
    }

    /// Per-node status key for reporting update failures.
    pub fn node_status(&self, node_id: &str) -> String {
        self.key(&format!("clamav:status:{node_id}"))
    }

    /// Cluster-wide target database epoch.
    pub fn target_epoch(&self) -> String {
        self.key("clamav:target_epoch")
    }

    /// Distributed reload lock.
    pub fn update_lock(&self) -> String {
        self.key("clamav:update_lock")
    }

    /// Surge-scaling request observed by the autoscaler.
    pub fn scaling_request(&self) -> String {
        self.key("clamav:scaling_request")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_keys_without_prefix() {
        let keys = KeySpace::new("");
        assert_eq!(keys.queue(Priority::High), "scan_priority");
        assert_eq!(keys.result("t1"), "result:t1");
        assert_eq!(keys.chunks("t1"), "chunks:t1");
        assert_eq!(keys.heartbeat("node-a"), "clamav:heartbeat:node-a");
    }

    #[test]
    fn test_prefix_applied_once() {
        let keys = KeySpace::new("prod");
        assert_eq!(keys.queue(Priority::Normal), "prod:scan_normal");
        assert_eq!(keys.inline("t"), "prod:inline:t");

        let keys = KeySpace::new("prod:");
        assert_eq!(keys.target_epoch(), "prod:clamav:target_epoch");
    }
}
