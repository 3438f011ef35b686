//! Tunables: timeouts, batch limits, channel capacities.

use rand::Rng;
use std::time::Duration;

/// Raft tuning parameters.
///
/// The heartbeat timeout doubles as the base of the election timeout:
/// followers campaign after a randomized `[hb, 2*hb)` silence, and leaders
/// heartbeat roughly ten times per window so a healthy follower never fires.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Base cadence of leader heartbeats and follower election timeouts.
    ///
    /// Default: 1 s.
    pub heartbeat_timeout: Duration,

    /// A leader that cannot contact a quorum of voters within this window
    /// steps down. Bounds how long a partitioned leader keeps serving.
    ///
    /// Default: 1 s.
    pub leader_lease_timeout: Duration,

    /// A nonvoter flagged for promotion is made a voter once it finishes a
    /// catch-up round faster than this with nothing left to send.
    ///
    /// Default: 1 s.
    pub promote_threshold: Duration,

    /// Maximum entries per AppendEntries request.
    ///
    /// Default: 64.
    pub max_append_entries: usize,

    /// Maximum idle connections retained per peer.
    ///
    /// Default: 3.
    pub max_connections_per_peer: usize,

    /// Dial timeout when opening a new peer connection.
    ///
    /// Default: 10 s.
    pub dial_timeout: Duration,

    /// Capacity of the channel feeding the state machine.
    ///
    /// Default: 128.
    pub fsm_channel_capacity: usize,

    /// Capacity of the client submission channel.
    ///
    /// Default: 100.
    pub entry_channel_capacity: usize,

    /// Capacity of the admin task channel.
    ///
    /// Default: 100.
    pub task_channel_capacity: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_millis(1000),
            leader_lease_timeout: Duration::from_millis(1000),
            promote_threshold: Duration::from_millis(1000),
            max_append_entries: 64,
            max_connections_per_peer: 3,
            dial_timeout: Duration::from_secs(10),
            fsm_channel_capacity: 128,
            entry_channel_capacity: 100,
            task_channel_capacity: 100,
        }
    }
}

impl RaftConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_timeout.is_zero() {
            return Err("heartbeat_timeout must be > 0".to_string());
        }
        if self.leader_lease_timeout.is_zero() {
            return Err("leader_lease_timeout must be > 0".to_string());
        }
        if self.max_append_entries == 0 {
            return Err("max_append_entries must be > 0".to_string());
        }
        if self.max_connections_per_peer == 0 {
            return Err("max_connections_per_peer must be > 0".to_string());
        }
        if self.fsm_channel_capacity == 0 || self.entry_channel_capacity == 0 {
            return Err("channel capacities must be > 0".to_string());
        }
        Ok(())
    }

    /// Randomized election timeout in `[hb, 2*hb)`.
    ///
    /// Each draw differs so concurrent candidates rarely split the vote.
    pub fn random_election_timeout(&self) -> Duration {
        random_timeout(self.heartbeat_timeout)
    }
}

/// `min + rand(0..min)`, the jitter shape used for all randomized waits.
pub(crate) fn random_timeout(min: Duration) -> Duration {
    let min_ms = min.as_millis().max(1) as u64;
    min + Duration::from_millis(rand::thread_rng().gen_range(0..min_ms))
}
