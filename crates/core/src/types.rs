//! Wire-level relay types
//!
//! These mirror what actually travels between consumer and provider. The
//! consumer signs the session descriptor, the provider signs its reply, and
//! conflict records bundle both sides so a dispute can be replayed by a third
//! party.

use serde::{Deserialize, Serialize};

/// 32-byte ed25519 public key
pub type PublicKey = [u8; 32];

/// Sentinel meaning "no concrete block applies".
pub const NOT_APPLICABLE: i64 = -1;
/// Magic requested block: the provider's latest block.
pub const LATEST_BLOCK: i64 = -2;
/// Magic requested block: the chain's earliest available block.
pub const EARLIEST_BLOCK: i64 = -3;
/// Magic requested block: a block still in the pending state.
pub const PENDING_BLOCK: i64 = -4;
/// Magic requested block: the latest block considered safe from reorgs.
pub const SAFE_BLOCK: i64 = -5;
/// Magic requested block: the latest finalized block.
pub const FINALIZED_BLOCK: i64 = -6;

/// A block is finalized once it sits at least `finalization_distance` blocks
/// below the provider's reported tip. Magic (negative) blocks are never
/// finalized.
pub fn is_finalized_block(
    requested_block: i64,
    latest_block: i64,
    finalization_distance: i64,
) -> bool {
    requested_block >= 0 && requested_block <= latest_block - finalization_distance
}

/// The request payload a provider executes against its chain node.
///
/// `salt` carries the request GUID as 8 little-endian bytes so identical
/// queries from different requests hash to different content hashes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayPrivateData {
    pub connection_type: String,
    pub api_url: String,
    pub data: Vec<u8>,
    pub request_block: i64,
    pub api_interface: String,
    pub salt: [u8; 8],
}

impl RelayPrivateData {
    pub fn salt_value(&self) -> u64 {
        u64::from_le_bytes(self.salt)
    }

    pub fn set_salt(&mut self, value: u64) {
        self.salt = value.to_le_bytes();
    }
}

/// QoS triple attached to outgoing sessions for on-chain accounting.
///
/// Scores are fixed-point decimals rendered with 18 fractional digits, the
/// precision the settlement chain expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityOfServiceReport {
    pub availability: String,
    pub latency: String,
    pub sync: String,
}

impl QualityOfServiceReport {
    pub fn from_scores(availability: f64, latency: f64, sync: f64) -> Self {
        Self {
            availability: format_fixed(availability),
            latency: format_fixed(latency),
            sync: format_fixed(sync),
        }
    }
}

fn format_fixed(value: f64) -> String {
    format!("{:.18}", value.clamp(0.0, 1.0))
}

/// The signed session descriptor accompanying every relay.
///
/// `cu_sum` already includes the in-flight relay's compute units; `relay_num`
/// is strictly monotonic per session so providers can detect replays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySession {
    pub spec_id: String,
    pub content_hash: [u8; 32],
    pub session_id: u64,
    pub cu_sum: u64,
    pub provider: String,
    pub relay_num: u64,
    pub qos_report: Option<QualityOfServiceReport>,
    pub epoch: u64,
    /// JSON array of provider addresses reported unresponsive this epoch.
    pub unresponsive_providers: Vec<u8>,
    pub relay_chain_id: String,
    /// Consumer signature over the descriptor, empty until signed.
    pub sig: Vec<u8>,
}

/// Audit metadata proving why a second provider was queried.
///
/// The VRF value and proof pin the audit decision to the original request and
/// reply; `provider_sig` binds the original provider to the answer under
/// audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VrfData {
    pub chain_id: String,
    pub epoch: u64,
    pub differentiator: bool,
    pub vrf_value: Vec<u8>,
    pub vrf_proof: Vec<u8>,
    pub provider_sig: Vec<u8>,
    pub all_data_hash: Vec<u8>,
    pub query_hash: Vec<u8>,
    /// Consumer signature over the audit metadata, empty until signed.
    pub sig: Vec<u8>,
}

/// A complete relay request: payload, signed session, optional audit proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRequest {
    pub relay_data: RelayPrivateData,
    pub relay_session: RelaySession,
    pub vrf_data: Option<VrfData>,
}

/// A provider's reply to a relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayReply {
    pub data: Vec<u8>,
    /// Provider signature over `data ‖ latest_block ‖ finalized_blocks_hashes`.
    pub sig: Vec<u8>,
    pub latest_block: i64,
    /// JSON map of finalized block number → block hash (hex).
    pub finalized_blocks_hashes: Vec<u8>,
}

/// Outcome of one relay attempt, as tracked by the orchestrator.
#[derive(Debug, Clone)]
pub struct RelayResult {
    pub request: RelayRequest,
    pub reply: Option<RelayReply>,
    pub provider_address: String,
    pub finalized: bool,
}

/// One side of a response conflict: the request and the reply it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRelayData {
    pub request: RelayRequest,
    pub reply: RelayReply,
}

/// Two providers answered the same audited query with different data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseConflict {
    pub relay_data0: ConflictRelayData,
    pub relay_data1: ConflictRelayData,
}

/// Finalization data that breaches accountability rules.
///
/// Either two replies disagree on the hash of a finalized block
/// (`provider0 == provider1` when a single provider contradicted its own
/// earlier report), or a single reply claims finalization it cannot
/// (`reply1` absent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizationConflict {
    pub provider0: String,
    pub reply0: RelayReply,
    pub provider1: String,
    pub reply1: Option<RelayReply>,
}
