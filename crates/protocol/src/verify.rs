//! Reply verification
//!
//! Every reply is checked against the provider's key before it counts; for
//! chains with data reliability enabled, the finalization data it carries is
//! additionally validated for internal consistency.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use relaymesh_core::{
    is_finalized_block, ChainBlockStats, FinalizationConflict, PublicKey, RelayError, RelayReply,
};
use relaymesh_crypto::verify_reply_signature;

/// Outcome of finalization-data validation.
#[derive(Error, Debug)]
pub enum VerifyError {
    /// A classified relay failure (bad signature, sync loss).
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// The provider's finalization claims breach accountability rules; the
    /// conflict record is ready for a dispute transaction.
    #[error("finalization accountability breach: {reason}")]
    Accountability {
        reason: String,
        conflict: FinalizationConflict,
    },
}

impl VerifyError {
    /// Collapse into the relay failure taxonomy for session release.
    pub fn into_relay_error(self) -> RelayError {
        match self {
            VerifyError::Relay(err) => err,
            VerifyError::Accountability { reason, .. } => {
                RelayError::FinalizationAccountability(reason)
            }
        }
    }
}

/// Verify the provider's signature over the reply.
pub fn verify_relay_reply(
    reply: &RelayReply,
    provider_address: &str,
    provider_key: &PublicKey,
) -> Result<(), RelayError> {
    if !verify_reply_signature(provider_key, reply) {
        return Err(RelayError::InvalidReplySignature(
            provider_address.to_string(),
        ));
    }
    Ok(())
}

/// Validate the finalization data carried in a reply.
///
/// Returns the parsed block → hash map. Fails with an accountability error
/// (carrying a conflict record) when the provider claims finalization for
/// blocks that cannot be finalized, and with a sync-loss error when the
/// provider's tip went backwards relative to this session's history.
pub fn verify_finalization_data(
    reply: &RelayReply,
    provider_address: &str,
    existing_session_latest_block: i64,
    stats: &ChainBlockStats,
) -> Result<BTreeMap<i64, String>, VerifyError> {
    let accountability = |reason: String| VerifyError::Accountability {
        reason,
        conflict: FinalizationConflict {
            provider0: provider_address.to_string(),
            reply0: reply.clone(),
            provider1: provider_address.to_string(),
            reply1: None,
        },
    };

    let parsed: BTreeMap<String, String> =
        serde_json::from_slice(&reply.finalized_blocks_hashes).map_err(|err| {
            accountability(format!(
                "provider {provider_address} sent unparsable finalization data: {err}"
            ))
        })?;

    let mut finalized_blocks = BTreeMap::new();
    for (block, hash) in parsed {
        let block: i64 = block.parse().map_err(|_| {
            accountability(format!(
                "provider {provider_address} sent a non-numeric finalized block {block}"
            ))
        })?;
        if !is_finalized_block(block, reply.latest_block, stats.blocks_distance_for_finalized) {
            debug!(
                provider = %provider_address,
                block,
                latest = reply.latest_block,
                "provider claims finalization for a non-finalized block"
            );
            return Err(accountability(format!(
                "provider {provider_address} claims block {block} finalized at tip {}",
                reply.latest_block,
            )));
        }
        finalized_blocks.insert(block, hash);
    }

    if existing_session_latest_block > 0 && reply.latest_block < existing_session_latest_block {
        return Err(VerifyError::Relay(RelayError::OutOfSync(format!(
            "provider {provider_address} latest block {} is behind this session's {}",
            reply.latest_block, existing_session_latest_block,
        ))));
    }

    Ok(finalized_blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaymesh_crypto::{reply_signable_data, sign_data, SigningKeypair};

    fn stats() -> ChainBlockStats {
        ChainBlockStats {
            average_block_time: std::time::Duration::from_secs(6),
            finalization_time: std::time::Duration::from_secs(30),
            blocks_distance_for_finalized: 5,
            allowed_block_lag_for_qos_sync: 2,
        }
    }

    fn signed_reply(keypair: &SigningKeypair, latest_block: i64, hashes: &[u8]) -> RelayReply {
        let mut reply = RelayReply {
            data: b"result".to_vec(),
            sig: vec![],
            latest_block,
            finalized_blocks_hashes: hashes.to_vec(),
        };
        reply.sig = sign_data(keypair, &reply_signable_data(&reply)).to_vec();
        reply
    }

    #[test]
    fn test_reply_signature_verification() {
        let provider = SigningKeypair::generate();
        let reply = signed_reply(&provider, 100, b"{}");

        assert!(verify_relay_reply(&reply, "p1", &provider.public_key_bytes()).is_ok());

        let stranger = SigningKeypair::generate();
        assert!(matches!(
            verify_relay_reply(&reply, "p1", &stranger.public_key_bytes()),
            Err(RelayError::InvalidReplySignature(_))
        ));
    }

    #[test]
    fn test_finalization_data_parsed() {
        let provider = SigningKeypair::generate();
        let reply = signed_reply(&provider, 100, br#"{"94":"0xaa","95":"0xbb"}"#);

        let finalized = verify_finalization_data(&reply, "p1", 0, &stats()).unwrap();
        assert_eq!(finalized.len(), 2);
        assert_eq!(finalized[&94], "0xaa");
    }

    #[test]
    fn test_unfinalized_claim_is_accountability_breach() {
        let provider = SigningKeypair::generate();
        // tip 100, distance 5: block 96 cannot be finalized
        let reply = signed_reply(&provider, 100, br#"{"96":"0xaa"}"#);

        match verify_finalization_data(&reply, "p1", 0, &stats()) {
            Err(VerifyError::Accountability { conflict, .. }) => {
                assert_eq!(conflict.provider0, "p1");
                assert_eq!(conflict.provider1, "p1");
                assert!(conflict.reply1.is_none());
            }
            other => panic!("expected accountability breach, got {other:?}"),
        }
    }

    #[test]
    fn test_unparsable_finalization_data() {
        let provider = SigningKeypair::generate();
        let reply = signed_reply(&provider, 100, b"not json");
        assert!(matches!(
            verify_finalization_data(&reply, "p1", 0, &stats()),
            Err(VerifyError::Accountability { .. })
        ));
    }

    #[test]
    fn test_tip_going_backwards_is_sync_loss() {
        let provider = SigningKeypair::generate();
        let reply = signed_reply(&provider, 90, br#"{"80":"0xaa"}"#);

        match verify_finalization_data(&reply, "p1", 95, &stats()) {
            Err(VerifyError::Relay(err)) => assert!(err.is_sync_loss()),
            other => panic!("expected sync loss, got {other:?}"),
        }
    }
}
