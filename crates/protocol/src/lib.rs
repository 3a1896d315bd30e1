//! RelayMesh relay protocol
//!
//! Builds and signs the messages of a relay exchange, verifies what comes
//! back, and keeps the cross-provider finalization consensus:
//! - request construction for regular and audit relays
//! - reply signature and finalization-data verification
//! - VRF threshold → pairing index mapping and audit result comparison
//! - per-provider finalized-hash memory with conflict detection

mod finalization;
mod reliability;
mod request;
mod verify;

use thiserror::Error;

pub use finalization::{FinalizationConsensus, FinalizationError};
pub use reliability::{
    calculate_vrf_on_relay, compare_relays_find_conflict, prove_vrf_on_relay, threshold_to_session,
    verify_reliability_results, vrf_value_to_index, SUPPORTED_VRFS,
};
pub use request::{
    construct_audit_relay_request, construct_relay_request, construct_relay_session,
    new_relay_data, new_vrf_data, relay_timeout, replace_requested_block, update_requested_block,
};
pub use verify::{verify_finalization_data, verify_relay_reply, VerifyError};

/// Errors raised while constructing protocol messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("audit relay needs a concrete request block, got {0}")]
    AuditRequestBlockNotSpecific(i64),
}
