use std::time::Duration;

/// Timing parameters for elections, heartbeats, and outbound RPCs.
///
/// The heartbeat interval must stay well below `election_timeout_min`,
/// otherwise healthy followers will keep starting elections against a
/// live leader.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Election timeout range (min). Each arm of the timer draws a fresh
    /// value from `[min, max)`.
    pub election_timeout_min: Duration,
    /// Election timeout range (max).
    pub election_timeout_max: Duration,
    /// Stable interval between leader heartbeats.
    pub heartbeat_interval: Duration,
    /// How long an outbound RPC may stay in flight before the caller
    /// abandons it. Lost replies are retried by the heartbeat timer and
    /// the per-peer replicators.
    pub rpc_timeout: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(250),
            election_timeout_max: Duration::from_millis(400),
            heartbeat_interval: Duration::from_millis(100),
            rpc_timeout: Duration::from_millis(200),
        }
    }
}

impl RaftConfig {
    /// A compressed timescale for tests that wait on real elections.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(80),
            election_timeout_max: Duration::from_millis(160),
            heartbeat_interval: Duration::from_millis(30),
            rpc_timeout: Duration::from_millis(60),
        }
    }
}
