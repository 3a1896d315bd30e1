//! RelayMesh core types
//!
//! Shared vocabulary for the consumer side of the relay protocol:
//! - Wire-level relay types (`RelayPrivateData`, `RelaySession`, `RelayReply`,
//!   `VrfData`) and the conflict records derived from them
//! - Requested-block sentinels and finalization helpers
//! - Interfaces of the external collaborators the consumer drives: the chain
//!   parser, the provider transport, the response cache and the conflict
//!   sender
//! - The relay failure taxonomy shared by the session manager and the
//!   orchestrator

pub mod chain;
mod error;
mod traits;
mod types;

pub use chain::{ApiCategory, ChainBlockStats, ChainMessage, ChainParser};
pub use error::{CacheError, ChainParseError, RelayError, TransportError};
pub use traits::{
    ConflictSender, ProviderClient, ProviderOptimizer, RelayCache, RelayStream, RelayTransport,
};
pub use types::{
    is_finalized_block, ConflictRelayData, FinalizationConflict, PublicKey,
    QualityOfServiceReport, RelayPrivateData, RelayReply, RelayRequest, RelayResult, RelaySession,
    ResponseConflict, VrfData, EARLIEST_BLOCK, FINALIZED_BLOCK, LATEST_BLOCK, NOT_APPLICABLE,
    PENDING_BLOCK, SAFE_BLOCK,
};

/// Monotonically advancing pairing-version counter.
pub type Epoch = u64;
