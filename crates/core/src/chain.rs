//! Chain parser interface
//!
//! The consumer never understands chain payloads itself. A chain-specific
//! parser (external to this workspace) classifies each incoming request and
//! supplies the spec parameters the orchestrator needs: compute units,
//! requested block, API category and the chain's block cadence.

use std::time::Duration;

use crate::error::ChainParseError;

/// How an API behaves, as declared by the chain spec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApiCategory {
    /// Same query at the same height always yields the same answer.
    /// Only deterministic APIs are eligible for cross-provider auditing.
    pub deterministic: bool,
    /// Calls that legitimately take longer than a block (e.g. tx broadcast).
    pub hanging_api: bool,
    /// Server-streaming subscriptions.
    pub subscription: bool,
}

/// Block cadence parameters for the serviced chain.
#[derive(Debug, Clone, Copy)]
pub struct ChainBlockStats {
    /// Average time between blocks.
    pub average_block_time: Duration,
    /// Extra allowance for hanging APIs, derived from finalization time.
    pub finalization_time: Duration,
    /// Blocks below the tip at which data is considered finalized.
    pub blocks_distance_for_finalized: i64,
    /// How many blocks a provider may lag before its sync score suffers.
    pub allowed_block_lag_for_qos_sync: i64,
}

/// A parsed client request.
pub trait ChainMessage: Send + Sync {
    /// The block the request targets; may be a magic sentinel such as
    /// [`crate::LATEST_BLOCK`].
    fn requested_block(&self) -> i64;

    fn api_category(&self) -> ApiCategory;

    fn api_interface(&self) -> &str;

    /// Compute units this API costs per the chain spec.
    fn compute_units(&self) -> u64;
}

/// Chain-specific request parser, supplied per serviced chain.
pub trait ChainParser: Send + Sync {
    fn parse_msg(
        &self,
        url: &str,
        data: &[u8],
        connection_type: &str,
    ) -> Result<Box<dyn ChainMessage>, ChainParseError>;

    fn chain_block_stats(&self) -> ChainBlockStats;

    /// Whether auditing is enabled for this chain, and the VRF threshold
    /// gating it (larger threshold → more audits).
    fn data_reliability_params(&self) -> (bool, u32);
}
