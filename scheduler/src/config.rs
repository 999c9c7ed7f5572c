use std::num::NonZeroUsize;
use std::time::Duration;

/// Tunables of the scheduling core. Deserializable so a service wrapper
/// can splice this into its own configuration tree.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SchedulerConfig {
    /// Instance name prefixed onto operation names and blob resources.
    pub instance_name: String,

    /// Concurrency tokens for the transform pipeline. The queuer never
    /// runs more concurrent transforms than this.
    pub transform_tokens: usize,

    /// Deadline covering one distributed blob fetch, failover included.
    pub blob_fetch_timeout_secs: u64,

    /// Entry capacity of each per-kind resolver cache (directories,
    /// commands, actions).
    pub resolver_cache_capacity: NonZeroUsize,

    /// Entry capacity of the in-process action-result tier.
    pub action_result_cache_capacity: NonZeroUsize,

    /// Entry capacity of the recently-cache-served dedup cache.
    pub recent_executions_capacity: NonZeroUsize,

    /// Upper bound accepted for an action's declared timeout.
    pub max_action_timeout_secs: i64,

    /// Largest blob accepted on the write path. Zero means unlimited.
    pub max_blob_size: i64,

    /// Poll period while waiting for the queue gate to open.
    pub can_queue_poll_millis: u64,

    /// Lease-renewal heartbeat period for a claimed prequeue entry.
    pub queueing_poll_secs: u64,

    /// Hard deadline on one queueing attempt, heartbeats included.
    pub queueing_deadline_secs: u64,

    /// Largest value accepted for the min-cores/max-cores platform
    /// properties. Zero disables the check.
    pub max_cores: i32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            instance_name: "main".into(),
            transform_tokens: 256,
            blob_fetch_timeout_secs: 60,
            resolver_cache_capacity: NonZeroUsize::new(64 * 1024).unwrap(),
            action_result_cache_capacity: NonZeroUsize::new(1024).unwrap(),
            recent_executions_capacity: NonZeroUsize::new(1024).unwrap(),
            max_action_timeout_secs: 3600,
            max_blob_size: 4 * 1024 * 1024 * 1024,
            can_queue_poll_millis: 100,
            queueing_poll_secs: 5,
            queueing_deadline_secs: 300,
            max_cores: 0,
        }
    }
}

impl SchedulerConfig {
    pub fn blob_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.blob_fetch_timeout_secs)
    }

    pub fn can_queue_poll(&self) -> Duration {
        Duration::from_millis(self.can_queue_poll_millis)
    }

    pub fn queueing_poll(&self) -> Duration {
        Duration::from_secs(self.queueing_poll_secs)
    }

    pub fn queueing_deadline(&self) -> Duration {
        Duration::from_secs(self.queueing_deadline_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_partial_config() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"instance_name":"shard-a","transform_tokens":8}"#).unwrap();
        assert_eq!(config.instance_name, "shard-a");
        assert_eq!(config.transform_tokens, 8);
        assert_eq!(config.blob_fetch_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<SchedulerConfig>(r#"{"queue_depth":3}"#).is_err());
    }
}
