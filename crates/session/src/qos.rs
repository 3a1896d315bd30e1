//! Per-session quality-of-service scoring
//!
//! Every successful relay refreshes a three-component score that rides along
//! on the next outgoing session for on-chain accounting:
//! - availability: answered vs. total relays, scaled by the tolerated
//!   downtime fraction
//! - latency: observed latency against the expected latency for the relay's
//!   compute cost, reported at the 90th percentile of recent samples
//! - sync: how often the provider served at or above the expected block
//!   height, only counted once enough providers report heights

use std::time::Duration;

use relaymesh_core::QualityOfServiceReport;

use crate::common::{AVAILABILITY_TOLERANCE, LATENCY_PERCENTILE, MIN_PROVIDERS_FOR_SYNC};

/// Expected latency granted to a relay given the deadline it was sent with.
pub fn calculate_expected_latency(timeout_given_to_relay: Duration) -> Duration {
    timeout_given_to_relay / 2
}

/// Running QoS state for one session slot.
#[derive(Debug, Default)]
pub struct QoSInfo {
    pub total_relays: u64,
    pub answered_relays: u64,
    /// Latency scores sorted ascending; the report takes the percentile cut.
    latency_scores: Vec<f64>,
    sync_score_sum: i64,
    total_sync_score: i64,
    pub last_report: Option<QualityOfServiceReport>,
}

impl QoSInfo {
    /// A relay failed: it counts against availability, nothing else moves.
    pub fn register_failure(&mut self) {
        self.total_relays += 1;
    }

    /// A relay succeeded; refresh the composite report.
    ///
    /// `block_height_diff` is `expected_height - latest_block` as served by
    /// this provider: zero or negative means the provider is at (or past) the
    /// expected height.
    pub fn calculate(
        &mut self,
        latency: Duration,
        expected_latency: Duration,
        block_height_diff: i64,
        num_of_providers: usize,
        providers_count: u64,
    ) {
        self.total_relays += 1;
        self.answered_relays += 1;

        let availability = availability_score(self.total_relays, self.answered_relays);

        let latency_score =
            (expected_latency.as_secs_f64() / latency.as_secs_f64().max(f64::EPSILON)).min(1.0);
        let pos = self
            .latency_scores
            .partition_point(|score| *score < latency_score);
        self.latency_scores.insert(pos, latency_score);
        let percentile_index = ((self.latency_scores.len() as f64) * LATENCY_PERCENTILE) as usize;
        let latency_report =
            self.latency_scores[percentile_index.min(self.latency_scores.len() - 1)];

        if block_height_diff <= 0 {
            self.sync_score_sum += 1;
        }
        self.total_sync_score += 1;
        let enough_reporters =
            num_of_providers as f64 > (providers_count as f64 * MIN_PROVIDERS_FOR_SYNC).ceil();
        let sync = if enough_reporters && self.total_sync_score > 0 {
            self.sync_score_sum as f64 / self.total_sync_score as f64
        } else {
            1.0
        };

        self.last_report = Some(QualityOfServiceReport::from_scores(
            availability,
            latency_report,
            sync,
        ));
    }
}

fn availability_score(total_relays: u64, answered_relays: u64) -> f64 {
    if total_relays == 0 {
        return 1.0;
    }
    let downtime = (total_relays - answered_relays) as f64 / total_relays as f64;
    (1.0 - downtime / AVAILABILITY_TOLERANCE).max(0.0)
}
