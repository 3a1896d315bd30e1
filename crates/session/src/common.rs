//! Session management constants

use std::time::Duration;

/// Connection attempts before giving up on an audit session's provider.
pub const MAX_CONSECUTIVE_CONNECTION_ATTEMPTS: usize = 10;

/// Timeout for establishing a single endpoint connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Consecutive refusals after which an endpoint is disabled.
pub const MAX_ENDPOINT_CONNECTION_REFUSALS: u32 = 5;

/// Maximum concurrently tracked sessions per provider.
pub const MAX_SESSIONS_PER_PROVIDER: usize = 1000;

/// Block-listed sessions tolerated before the provider itself is blocked.
pub const MAX_BLOCK_LISTED_SESSIONS_PER_PROVIDER: usize = 3;

/// Consecutive failures after which a session slot is block-listed.
pub const MAX_CONSECUTIVE_FAILURES: u64 = 3;

/// `relay_num` advances by exactly this much per relay.
pub const RELAY_NUMBER_INCREMENT: u64 = 1;

/// Reserved session id for audit (data-reliability) relays.
pub const AUDIT_SESSION_ID: u64 = 0;

/// An audit session carries at most this relay number per epoch.
pub const AUDIT_RELAY_NUMBER: u64 = 1;

/// Audit relays never charge compute units.
pub const AUDIT_CU_SUM: u64 = 0;

/// Assumed one-way world latency, used for probe and relay deadlines.
pub const AVERAGE_WORLD_LATENCY: Duration = Duration::from_millis(300);

/// Sleep before releasing a session that failed on a deadline, so the
/// provider is not immediately re-dialed.
pub const BACKOFF_TIME_ON_FAILURE: Duration = Duration::from_secs(3);

/// Upper bound of the random jitter before a post-pairing probe pass, to
/// desynchronize many chains sharing one process.
pub const PROBE_JITTER_MAX: Duration = Duration::from_millis(500);

/// Tolerated downtime fraction before availability scores drop.
pub const AVAILABILITY_TOLERANCE: f64 = 0.05;

/// Percentile of recent latency scores reported in QoS.
pub const LATENCY_PERCENTILE: f64 = 0.9;

/// Minimum fraction of providers reporting before sync scores apply.
pub const MIN_PROVIDERS_FOR_SYNC: f64 = 0.6;

/// Static floor of the expected latency for one relay.
pub const LATENCY_THRESHOLD_STATIC: Duration = Duration::from_secs(1);

/// Per-compute-unit slope of the expected latency for one relay.
pub const LATENCY_THRESHOLD_SLOPE: Duration = Duration::from_millis(1);

/// Expected processing latency for a relay costing `cu` compute units.
pub fn expected_relay_latency(cu: u64) -> Duration {
    LATENCY_THRESHOLD_STATIC + LATENCY_THRESHOLD_SLOPE * (cu as u32)
}
