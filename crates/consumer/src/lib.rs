//! RelayMesh consumer
//!
//! The orchestration layer serving client RPC requests over the relay
//! network: per request it acquires a session, signs and dispatches the
//! relay, verifies the reply, retries with exclusion on failure, and spawns
//! the asynchronous auditor that cross-checks finalized deterministic
//! replies against a second provider.

mod audit;
mod config;
mod orchestrator;

use std::time::Duration;

use thiserror::Error;

pub use config::ConsumerConfig;
pub use orchestrator::{RelayOrchestrator, RelayOutput};

use relaymesh_core::{ChainParseError, RelayError};
use relaymesh_protocol::ProtocolError;
use relaymesh_session::SessionError;

/// Attempts per client request before giving up.
pub const MAX_RELAY_RETRIES: usize = 4;

/// Extra deadline slack granted to audit relays.
pub const AUDIT_TIMEOUT_EXTRA: Duration = Duration::from_secs(5);

/// Errors surfaced to the client of the orchestrator.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("failed to parse request: {0}")]
    Parse(#[from] ChainParseError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("all relay retries failed: {}", .0.join("; "))]
    AllRetriesFailed(Vec<String>),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ConsumerError>;
