//! Replica configuration.

use std::time::Duration;

/// Tunables for one replica.
///
/// The defaults match a small LAN cluster; `suspicion_timeout` is the
/// knob deployments actually need to adjust.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Checkpoint period K: a CHECKPOINT is emitted every K executions.
    pub checkpoint_period: u64,

    /// High-watermark window H: pre-prepares are admitted for sequences
    /// in `(stable, stable + H]`. Should be at least 2K.
    pub high_watermark: u64,

    /// How long a request may sit unexecuted before the primary is
    /// suspected and a view change starts.
    pub suspicion_timeout: Duration,

    /// Bound on concurrent outbound sends.
    pub max_outbound: usize,

    /// Error reports tolerated before the error logger cools down.
    pub cooling_threshold: u32,

    /// How long the error logger sleeps when the threshold is hit.
    pub cooling_interval: Duration,

    /// Workers resolving routed messages in parallel.
    pub resolver_workers: usize,

    /// Re-delivery attempts for messages that arrive ahead of their
    /// instance before they are dropped.
    pub retry_budget: u32,

    /// Pause between re-delivery attempts.
    pub retry_backoff: Duration,

    /// Channel capacity per cluster member: capacities are `n` times
    /// this factor.
    pub channel_depth_factor: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            checkpoint_period: 5,
            high_watermark: 20,
            suspicion_timeout: Duration::from_secs(2),
            max_outbound: 1000,
            cooling_threshold: 100,
            cooling_interval: Duration::from_millis(20),
            resolver_workers: 5,
            retry_budget: 20,
            retry_backoff: Duration::from_millis(5),
            channel_depth_factor: 3,
        }
    }
}

impl ReplicaConfig {
    /// Channel capacity for a cluster of `n` replicas.
    pub fn channel_capacity(&self, n: usize) -> usize {
        (n * self.channel_depth_factor).max(1)
    }
}
