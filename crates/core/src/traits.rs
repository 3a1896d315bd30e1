//! Collaborator interfaces
//!
//! The transport to providers, the response cache and the conflict-submission
//! sender are external subsystems; the consumer core drives them through
//! these traits.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

use crate::error::{CacheError, TransportError};
use crate::types::{FinalizationConflict, RelayReply, RelayRequest, ResponseConflict};

/// Server-streaming reply channel for subscription relays.
pub type RelayStream = Pin<Box<dyn Stream<Item = Result<RelayReply, TransportError>> + Send>>;

/// Dials provider endpoints.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn connect(
        &self,
        provider: &str,
        url: &str,
    ) -> Result<Arc<dyn ProviderClient>, TransportError>;
}

/// An established connection to a single provider endpoint.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn relay(&self, request: &RelayRequest) -> Result<RelayReply, TransportError>;

    async fn relay_subscribe(&self, request: &RelayRequest) -> Result<RelayStream, TransportError>;

    /// Liveness probe: the provider must echo `guid` back.
    async fn probe(&self, guid: u64) -> Result<u64, TransportError>;
}

/// Key-value response cache keyed by request fingerprint.
#[async_trait]
pub trait RelayCache: Send + Sync {
    async fn get_entry(
        &self,
        request: &RelayRequest,
        api_interface: &str,
        spec_id: &str,
    ) -> Result<Option<RelayReply>, CacheError>;

    async fn set_entry(
        &self,
        request: &RelayRequest,
        api_interface: &str,
        spec_id: &str,
        reply: &RelayReply,
        finalized: bool,
    ) -> Result<(), CacheError>;
}

/// Submits detected conflicts for on-chain dispute resolution.
#[async_trait]
pub trait ConflictSender: Send + Sync {
    async fn tx_conflict_detection(
        &self,
        finalization_conflict: Option<FinalizationConflict>,
        response_conflict: Option<ResponseConflict>,
        same_provider_conflict: Option<FinalizationConflict>,
    ) -> Result<(), TransportError>;
}

/// Consumes (provider, latency, failure) samples and feeds future selection
/// weighting. Opaque to the session manager.
pub trait ProviderOptimizer: Send + Sync {
    fn append_relay_data(&self, provider: &str, latency: Duration, failure: bool);
}
