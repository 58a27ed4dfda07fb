//! Key naming for the key-value store
//!
//! Every key starts with the configured prefix so several deployments can
//! share one backend.

use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    /// Hash: job name → job
    pub fn jobs(&self) -> String {
        format!("{}:jobs", self.prefix)
    }

    /// Sorted set: idle job names of one queue and priority, scored by
    /// `next_run_at` millis
    pub fn due(&self, queue: &str, priority: i32) -> String {
        format!("{}:due:{queue}:{priority}", self.prefix)
    }

    /// Sorted set: priorities that have a due index in `queue`
    pub fn due_bands(&self, queue: &str) -> String {
        format!("{}:due_bands:{queue}", self.prefix)
    }

    /// Hash: queue name → "" for every queue a job was scheduled on
    pub fn queues(&self) -> String {
        format!("{}:queues", self.prefix)
    }

    pub fn lock(&self, key: &str) -> String {
        format!("{}:lock:{key}", self.prefix)
    }

    /// Hash: execution id → execution
    pub fn executions(&self) -> String {
        format!("{}:executions", self.prefix)
    }

    /// List: execution ids of one job, newest first
    pub fn history(&self, job: &str) -> String {
        format!("{}:history:{job}", self.prefix)
    }

    /// Hash: running execution id → node, per job
    pub fn running(&self, job: &str) -> String {
        format!("{}:running:{job}", self.prefix)
    }

    /// Sorted set: running execution ids scored by last heartbeat millis
    pub fn heartbeats(&self) -> String {
        format!("{}:heartbeats", self.prefix)
    }

    pub fn workflows(&self) -> String {
        format!("{}:workflows", self.prefix)
    }

    /// Hash: run id → run checkpoint
    pub fn runs(&self) -> String {
        format!("{}:runs", self.prefix)
    }

    pub fn dead_letters(&self) -> String {
        format!("{}:dead_letters", self.prefix)
    }

    /// Pub/sub channel carrying [`JobEvent`](cadence_domain::JobEvent) JSON
    pub fn events(&self) -> String {
        format!("{}:events", self.prefix)
    }

    pub fn execution_field(id: Uuid) -> String {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_share_prefix() {
        let keys = KeyLayout::new("prod");
        assert_eq!(keys.due("reports", -5), "prod:due:reports:-5");
        assert_eq!(keys.due_bands("reports"), "prod:due_bands:reports");
        assert_eq!(keys.lock("unique:sync"), "prod:lock:unique:sync");
        assert_eq!(keys.history("sync"), "prod:history:sync");
    }
}
