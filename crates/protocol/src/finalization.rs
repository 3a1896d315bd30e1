//! Cross-provider finalization consensus
//!
//! Remembers, per provider, the finalized block hashes reported over the
//! current and previous epoch. A provider contradicting its own history, or
//! two providers disagreeing on the same finalized block, yields a conflict
//! record ready for a dispute transaction. Also estimates the expected block
//! height fed into QoS sync scoring.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use relaymesh_core::{ChainBlockStats, FinalizationConflict, RelayReply};

/// Conflicting finalization data detected while recording a reply.
#[derive(Error, Debug)]
pub enum FinalizationError {
    #[error("provider {provider} contradicted its own hash for finalized block {block}")]
    SameProviderConflict {
        provider: String,
        block: i64,
        conflict: FinalizationConflict,
    },

    #[error("providers {provider0} and {provider1} disagree on finalized block {block}")]
    CrossProviderConflict {
        provider0: String,
        provider1: String,
        block: i64,
        conflict: FinalizationConflict,
    },
}

impl FinalizationError {
    pub fn conflict(&self) -> &FinalizationConflict {
        match self {
            FinalizationError::SameProviderConflict { conflict, .. } => conflict,
            FinalizationError::CrossProviderConflict { conflict, .. } => conflict,
        }
    }

    /// Whether the conflict is a provider contradicting itself.
    pub fn is_same_provider(&self) -> bool {
        matches!(self, FinalizationError::SameProviderConflict { .. })
    }
}

#[derive(Default)]
struct ProviderHashes {
    latest_block: i64,
    finalized_hashes: BTreeMap<i64, String>,
    last_reply: Option<RelayReply>,
}

#[derive(Default)]
struct ConsensusState {
    epoch: u64,
    current: HashMap<String, ProviderHashes>,
    previous: HashMap<String, ProviderHashes>,
}

/// Per-chain finalization memory across providers.
#[derive(Default)]
pub struct FinalizationConsensus {
    state: Mutex<ConsensusState>,
}

impl FinalizationConsensus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rotate the consensus memory at an epoch boundary: the current
    /// generation becomes the previous one.
    pub fn new_epoch(&self, epoch: u64) {
        let mut state = self.state.lock();
        if epoch > state.epoch {
            state.previous = std::mem::take(&mut state.current);
            state.epoch = epoch;
            debug!(epoch, "finalization consensus rotated");
        }
    }

    /// Record a provider's finalized hashes from a verified reply.
    ///
    /// Fails (without recording) when the provider contradicts its own
    /// history, or when it disagrees with another provider on a finalized
    /// block.
    pub fn update_finalized_hashes(
        &self,
        provider: &str,
        reply: &RelayReply,
        finalized_blocks: &BTreeMap<i64, String>,
    ) -> Result<(), FinalizationError> {
        let mut state = self.state.lock();

        // the provider against itself, across both generations
        for generation in [&state.current, &state.previous] {
            if let Some(existing) = generation.get(provider) {
                for (block, hash) in finalized_blocks {
                    if let Some(previous_hash) = existing.finalized_hashes.get(block) {
                        if previous_hash != hash {
                            warn!(provider, block, "provider contradicted its own finalized hash");
                            return Err(FinalizationError::SameProviderConflict {
                                provider: provider.to_string(),
                                block: *block,
                                conflict: FinalizationConflict {
                                    provider0: provider.to_string(),
                                    reply0: reply.clone(),
                                    provider1: provider.to_string(),
                                    reply1: existing.last_reply.clone(),
                                },
                            });
                        }
                    }
                }
            }
        }

        // the provider against everyone else
        for generation in [&state.current, &state.previous] {
            for (other_provider, other_hashes) in generation {
                if other_provider == provider {
                    continue;
                }
                for (block, hash) in finalized_blocks {
                    if let Some(other_hash) = other_hashes.finalized_hashes.get(block) {
                        if other_hash != hash {
                            warn!(
                                provider0 = provider,
                                provider1 = %other_provider,
                                block,
                                "providers disagree on a finalized block"
                            );
                            return Err(FinalizationError::CrossProviderConflict {
                                provider0: provider.to_string(),
                                provider1: other_provider.clone(),
                                block: *block,
                                conflict: FinalizationConflict {
                                    provider0: provider.to_string(),
                                    reply0: reply.clone(),
                                    provider1: other_provider.clone(),
                                    reply1: other_hashes.last_reply.clone(),
                                },
                            });
                        }
                    }
                }
            }
        }

        let entry = state.current.entry(provider.to_string()).or_default();
        entry.latest_block = entry.latest_block.max(reply.latest_block);
        entry
            .finalized_hashes
            .extend(finalized_blocks.iter().map(|(k, v)| (*k, v.clone())));
        entry.last_reply = Some(reply.clone());
        Ok(())
    }

    /// Expected finalized block height and the number of providers whose
    /// reports contribute to it.
    pub fn expected_block_height(&self, stats: &ChainBlockStats) -> (i64, usize) {
        let state = self.state.lock();
        let mut latest_by_provider: HashMap<&str, i64> = HashMap::new();
        for generation in [&state.current, &state.previous] {
            for (provider, hashes) in generation {
                let latest = latest_by_provider.entry(provider.as_str()).or_insert(i64::MIN);
                *latest = (*latest).max(hashes.latest_block);
            }
        }
        let num_providers = latest_by_provider.len();
        let max_latest = latest_by_provider.values().copied().max().unwrap_or(0);
        (
            max_latest - stats.blocks_distance_for_finalized,
            num_providers,
        )
    }
}
