//! Relay failure taxonomy
//!
//! A failed relay is classified so the session manager knows whether to
//! retry elsewhere, block-list the slot, or block (and possibly report) the
//! provider for the rest of the epoch.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the wire transport.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(String),
}

/// Errors from the chain parser.
#[derive(Error, Debug, Clone)]
pub enum ChainParseError {
    #[error("unrecognized api: {0}")]
    UnknownApi(String),

    #[error("malformed request: {0}")]
    Malformed(String),
}

/// Errors from the response cache. Cache failures never fail a relay.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("cache not connected")]
    NotConnected,

    #[error("cache miss")]
    Miss,

    #[error("cache internal error: {0}")]
    Internal(String),
}

/// Classified relay failure, fed back into session release.
#[derive(Error, Debug, Clone)]
pub enum RelayError {
    /// Transient transport failure; retry with another provider.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The relay did not complete within its deadline.
    #[error("relay deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// The caller went away mid-relay.
    #[error("relay cancelled by caller")]
    Cancelled,

    /// The provider reported blocks contradicting its own recent history.
    #[error("provider out of sync: {0}")]
    OutOfSync(String),

    /// The reply signature does not match the provider's key.
    #[error("invalid reply signature from {0}")]
    InvalidReplySignature(String),

    /// The provider's finalization data breaches accountability rules.
    #[error("finalization accountability breach: {0}")]
    FinalizationAccountability(String),
}

impl RelayError {
    /// Sync-loss failures block-list the session slot; the first occurrence
    /// per relay loop gets a free retry without blocking the provider.
    pub fn is_sync_loss(&self) -> bool {
        matches!(self, RelayError::OutOfSync(_))
    }

    /// Whether the provider should be removed from the valid set for the
    /// rest of the epoch.
    pub fn blocks_provider(&self) -> bool {
        matches!(
            self,
            RelayError::InvalidReplySignature(_) | RelayError::FinalizationAccountability(_)
        )
    }

    /// Whether the provider should also be reported on-chain as unresponsive
    /// or misbehaving.
    pub fn reports_provider(&self) -> bool {
        self.blocks_provider()
    }

    /// Deadline failures get a backoff before the slot is released, so a
    /// hammered provider is not immediately re-dialed.
    pub fn needs_backoff(&self) -> bool {
        matches!(self, RelayError::DeadlineExceeded(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_loss_classification() {
        let err = RelayError::OutOfSync("latest block went backwards".into());
        assert!(err.is_sync_loss());
        assert!(!err.blocks_provider());
    }

    #[test]
    fn test_misbehavior_blocks_and_reports() {
        let err = RelayError::InvalidReplySignature("provider1".into());
        assert!(err.blocks_provider());
        assert!(err.reports_provider());

        let err = RelayError::FinalizationAccountability("hash mismatch".into());
        assert!(err.blocks_provider());
    }

    #[test]
    fn test_transient_errors_do_not_block() {
        let err = RelayError::Transport(TransportError::ConnectionRefused("p1".into()));
        assert!(!err.blocks_provider());
        assert!(!err.needs_backoff());

        let err = RelayError::DeadlineExceeded(Duration::from_millis(400));
        assert!(!err.blocks_provider());
        assert!(err.needs_backoff());
    }
}
