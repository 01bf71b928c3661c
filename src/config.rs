use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{CascadeError, Result};

/// Tuning for one agent instance.
///
/// All knobs are plain values so a config file can override any subset;
/// unspecified fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Bound on concurrently executing event handlers.
    pub max_number_workers: usize,
    /// Delay between discovery polls of the entity store.
    pub poll_period: Duration,
    /// Rows claimed per discovery poll.
    pub retrieve_bulk_size: usize,
    /// Messages pulled per conductor delivery cycle.
    pub message_bulk_size: usize,
    /// Retry budget for `handle_new_*` failures; 0 = unbounded.
    pub max_new_retries: u32,
    /// Retry budget for `handle_update_*` failures; 0 = unbounded.
    pub max_update_retries: u32,
    /// Health heartbeat interval.
    pub heartbeat_delay: Duration,
    /// Interval of the crashed-worker lock sweep.
    pub clean_locks_period: Duration,
    /// Growth factor applied to an entity's poll period after a failure.
    pub poll_period_increase_rate: f64,
    /// Cap for the grown poll period.
    pub max_poll_period: Duration,
    /// Delay between event-dispatch iterations.
    pub event_interval_delay: Duration,
    /// A handler running longer than this is cut off and its worker freed.
    pub max_worker_exec_time: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_number_workers: 8,
            poll_period: Duration::from_secs(10),
            retrieve_bulk_size: 10,
            message_bulk_size: 20,
            max_new_retries: 3,
            max_update_retries: 0,
            heartbeat_delay: Duration::from_secs(600),
            clean_locks_period: Duration::from_secs(1800),
            poll_period_increase_rate: 2.0,
            max_poll_period: Duration::from_secs(3600),
            event_interval_delay: Duration::from_millis(100),
            max_worker_exec_time: Duration::from_secs(3600),
        }
    }
}

impl AgentConfig {
    /// Grow an entity's poll period after a failed handling round.
    pub fn grow_poll_period(&self, current: Duration) -> Duration {
        let grown = current.mul_f64(self.poll_period_increase_rate.max(1.0));
        grown.min(self.max_poll_period)
    }
}

/// Tuning for the coordinator's event scheduling policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Heartbeat/election interval; the lease ttl is twice this.
    pub coordination_interval_delay: Duration,
    /// Base delay unit of the scheduling formula.
    pub interval_delay: Duration,
    /// Queues shorter than this run events near-immediately.
    pub min_queued_events: usize,
    /// Queues deeper than this get exponentially boosted delay.
    pub max_queued_events: usize,
    /// Cap on the depth-based boost multiplier.
    pub max_boost_interval_delay: u32,
    /// A task with more total files than this counts as big.
    pub max_total_files_for_small_task: u64,
    /// Fixed delay for big tasks that are not close to completion.
    pub interval_delay_for_big_task: Duration,
    /// How often queue depths are logged.
    pub show_queued_events_interval: Duration,
    /// Report entries older than this are pruned.
    pub report_retention: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            coordination_interval_delay: Duration::from_secs(300),
            interval_delay: Duration::from_secs(5),
            min_queued_events: 10,
            max_queued_events: 20,
            max_boost_interval_delay: 3,
            max_total_files_for_small_task: 1000,
            interval_delay_for_big_task: Duration::from_secs(60),
            show_queued_events_interval: Duration::from_secs(300),
            report_retention: Duration::from_secs(86400 * 10),
        }
    }
}

/// Top-level server configuration: one section per agent plus shared paths.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Path of the sled database; in-memory store when absent.
    pub db_path: Option<std::path::PathBuf>,
    pub coordinator: CoordinatorConfig,
    pub clerk: AgentConfig,
    pub transformer: AgentConfig,
    pub carrier: AgentConfig,
    pub conductor: AgentConfig,
}

impl ServerConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| CascadeError::InvalidConfiguration(format!("{}: {e}", path.as_ref().display())))?;
        serde_yaml::from_str(&text)
            .map_err(|e| CascadeError::InvalidConfiguration(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_period_growth_is_capped() {
        let config = AgentConfig {
            poll_period_increase_rate: 2.0,
            max_poll_period: Duration::from_secs(60),
            ..Default::default()
        };
        let mut period = Duration::from_secs(10);
        for _ in 0..10 {
            period = config.grow_poll_period(period);
        }
        assert_eq!(period, Duration::from_secs(60));
    }

    #[test]
    fn yaml_roundtrip_with_partial_overrides() {
        let yaml = r#"
clerk:
  max_number_workers: 2
  max_new_retries: 5
coordinator:
  min_queued_events: 3
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.clerk.max_number_workers, 2);
        assert_eq!(config.clerk.max_new_retries, 5);
        // untouched fields keep their defaults
        assert_eq!(config.clerk.retrieve_bulk_size, 10);
        assert_eq!(config.coordinator.min_queued_events, 3);
        assert_eq!(config.carrier.max_number_workers, 8);
    }
}
