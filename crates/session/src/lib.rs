//! RelayMesh consumer session management
//!
//! Owns the epoch-versioned pairing table and every per-provider session
//! slot, and hands out locked session handles to the relay orchestrator.
//!
//! ## Overview
//!
//! - [`PairingTable`] tracks which providers the consumer is paired with for
//!   the current epoch, which of them are still valid, and which were
//!   reported as unresponsive. Entries of the outgoing epoch are kept in a
//!   purge set so in-flight relays finish cleanly.
//! - [`ProviderEntry`] holds a provider's endpoints, its compute-unit budget
//!   and its session slots.
//! - [`SessionHandle`] is a locked slot: holding one is the exclusive right
//!   to run a single relay on that session. Handles are released back through
//!   the [`ConsumerSessionManager`], which applies CU, QoS and block-list
//!   bookkeeping.
//! - Audit sessions (used for cross-provider response auditing) live in a
//!   reserved slot per provider and never charge compute units.

mod common;
mod manager;
mod pairing;
mod provider;
mod qos;

use thiserror::Error;

pub use common::*;
pub use manager::{ConsumerSessionManager, SessionHandle};
pub use pairing::{PairingListEntry, PairingTable};
pub use provider::{Endpoint, ProviderEntry, SlotState};
pub use qos::{calculate_expected_latency, QoSInfo};

/// Errors produced by session acquisition and release.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("pairing list is empty, no provider to choose from")]
    PairingListEmpty,

    #[error("provider {0} does not have enough compute units left for this session")]
    MaxComputeUnitsExceeded(String),

    #[error("all endpoints of provider {0} are disabled")]
    AllEndpointsDisabled(String),

    #[error("provider {0} reached the maximum number of sessions")]
    MaxSessionsExceeded(String),

    #[error("provider {0} has too many block-listed sessions")]
    TooManyBlockListedSessions(String),

    #[error("pairing update for epoch {epoch} is stale, current epoch is {current}")]
    StaleEpoch { epoch: u64, current: u64 },

    #[error("session epoch does not match the current epoch")]
    EpochMismatch,

    #[error("audit index {index} is out of range for a pairing of {pairing_len}")]
    IndexOutOfRange { index: u64, pairing_len: u64 },

    #[error("audit index resolves to the original provider {0}")]
    IndexEqualsOriginal(String),

    #[error("an audit session was already sent to provider {0} this epoch")]
    AlreadySentThisEpoch(String),

    #[error("could not establish a connection to provider {0}")]
    NotConnected(String),

    #[error("session {0} is block-listed")]
    BlockListed(u64),

    #[error("session api misuse: {0}")]
    Misuse(&'static str),
}

pub type Result<T> = std::result::Result<T, SessionError>;
