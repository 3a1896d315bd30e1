//! Epoch-versioned pairing table
//!
//! Tracks the providers this consumer may relay through for the current
//! epoch. Updates rotate the whole table atomically; outgoing entries are
//! retained in a purge set so in-flight sessions complete against them, and
//! their connections are torn down one rotation later.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, info, warn};

use relaymesh_core::PublicKey;

use crate::provider::ProviderEntry;
use crate::{Result, SessionError};

/// One provider as supplied by the on-chain pairing for an epoch. The
/// position inside the pairing list is the provider's VRF index.
#[derive(Debug, Clone)]
pub struct PairingListEntry {
    pub address: String,
    pub public_key: PublicKey,
    pub endpoints: Vec<String>,
    pub max_compute_units: u64,
}

#[derive(Default)]
struct TableState {
    pairing: HashMap<String, Arc<ProviderEntry>>,
    /// Index → address; the contiguous index space is the VRF domain.
    addresses_by_index: Vec<String>,
    valid_addresses: Vec<String>,
    reported: BTreeSet<String>,
    /// Previous epoch's entries, kept for in-flight sessions.
    purge: HashMap<String, Arc<ProviderEntry>>,
    number_of_resets: u64,
}

/// Pairing membership for the current epoch.
pub struct PairingTable {
    state: RwLock<TableState>,
    current_epoch: AtomicU64,
    pairing_len: AtomicU64,
}

impl Default for PairingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PairingTable {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(TableState::default()),
            current_epoch: AtomicU64::new(0),
            pairing_len: AtomicU64::new(0),
        }
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch.load(Ordering::Acquire)
    }

    /// Size of the current pairing; the VRF index domain is `0..len`.
    pub fn pairing_len(&self) -> u64 {
        self.pairing_len.load(Ordering::Acquire)
    }

    pub fn number_of_resets(&self) -> u64 {
        self.state.read().number_of_resets
    }

    /// Atomically rotate the pairing to `epoch`.
    ///
    /// The outgoing entries move to the purge set; the previous purge
    /// generation has its connections closed. Returns the newly installed
    /// entries so the caller can schedule a probe pass.
    pub fn update(
        &self,
        epoch: u64,
        pairing_list: Vec<PairingListEntry>,
    ) -> Result<Vec<Arc<ProviderEntry>>> {
        let mut state = self.state.write();
        let current = self.current_epoch();
        if epoch <= current {
            warn!(epoch, current, "rejecting pairing update for older epoch");
            return Err(SessionError::StaleEpoch { epoch, current });
        }
        self.current_epoch.store(epoch, Ordering::Release);
        self.pairing_len
            .store(pairing_list.len() as u64, Ordering::Release);

        // Two-epoch grace: sessions still running against the previous purge
        // generation finished long ago, their connections can go now.
        for entry in state.purge.values() {
            entry.close_connections();
        }

        let mut pairing = HashMap::with_capacity(pairing_list.len());
        let mut addresses_by_index = Vec::with_capacity(pairing_list.len());
        for provider in pairing_list {
            addresses_by_index.push(provider.address.clone());
            pairing.insert(
                provider.address.clone(),
                Arc::new(ProviderEntry::new(
                    provider.address,
                    provider.public_key,
                    provider.endpoints,
                    provider.max_compute_units,
                    epoch,
                )),
            );
        }

        state.purge = std::mem::replace(&mut state.pairing, pairing);
        state.valid_addresses = addresses_by_index.clone();
        state.addresses_by_index = addresses_by_index;
        state.reported.clear();
        state.number_of_resets = 0;

        debug!(epoch, providers = state.pairing.len(), "updated provider pairing");
        Ok(state.pairing.values().cloned().collect())
    }

    /// Uniform random choice among valid addresses not in `exclude`.
    pub fn select_random_valid(
        &self,
        exclude: &HashSet<String>,
    ) -> Result<(String, Arc<ProviderEntry>, u64)> {
        let state = self.state.read();
        let epoch = self.current_epoch();
        let eligible = state
            .valid_addresses
            .iter()
            .filter(|address| !exclude.contains(*address))
            .count();
        if eligible == 0 {
            debug!(
                valid = state.valid_addresses.len(),
                excluded = exclude.len(),
                "pairing list empty"
            );
            return Err(SessionError::PairingListEmpty);
        }
        let pick = rand::thread_rng().gen_range(0..eligible);
        let address = state
            .valid_addresses
            .iter()
            .filter(|address| !exclude.contains(*address))
            .nth(pick)
            .cloned()
            .ok_or(SessionError::PairingListEmpty)?;
        let entry = state
            .pairing
            .get(&address)
            .cloned()
            .ok_or(SessionError::PairingListEmpty)?;
        Ok((address, entry, epoch))
    }

    /// Resolve a VRF index into the current pairing, rejecting the original
    /// provider an audit is checking against.
    pub fn lookup_by_index(
        &self,
        index: u64,
        exclude_original: &str,
    ) -> Result<(String, Arc<ProviderEntry>, u64)> {
        let state = self.state.read();
        let epoch = self.current_epoch();
        let pairing_len = state.addresses_by_index.len() as u64;
        if index >= pairing_len {
            info!(index, pairing_len, "audit index out of range");
            return Err(SessionError::IndexOutOfRange { index, pairing_len });
        }
        let address = state.addresses_by_index[index as usize].clone();
        if address == exclude_original {
            return Err(SessionError::IndexEqualsOriginal(address));
        }
        let entry = state
            .pairing
            .get(&address)
            .cloned()
            .ok_or(SessionError::IndexOutOfRange { index, pairing_len })?;
        Ok((address, entry, epoch))
    }

    /// Remove a provider from the valid set for the rest of the epoch, and
    /// optionally mark it for reporting. A no-op if the session's epoch has
    /// already rotated away.
    pub fn block_provider(&self, address: &str, report: bool, session_epoch: u64) -> Result<()> {
        if session_epoch != self.current_epoch() {
            return Err(SessionError::EpochMismatch);
        }
        let mut state = self.state.write();
        // the epoch may have rotated while we waited for the write lock
        if session_epoch != self.current_epoch() {
            return Err(SessionError::EpochMismatch);
        }

        match state.valid_addresses.iter().position(|a| a == address) {
            Some(position) => {
                state.valid_addresses.remove(position);
            }
            None => {
                warn!(provider = %address, "address was not found in valid addresses");
            }
        }

        if report && state.reported.insert(address.to_string()) {
            info!(provider = %address, "reporting provider for unresponsiveness");
        }
        Ok(())
    }

    /// When every provider has been blocked, reinstall the full pairing and
    /// count the reset. Returns the reset generation.
    pub fn reset_valid_if_empty(&self) -> u64 {
        let mut state = self.state.write();
        if state.valid_addresses.is_empty() {
            warn!("provider pairing list is empty, resetting state");
            state.valid_addresses = state.addresses_by_index.clone();
            state.number_of_resets += 1;
        }
        state.number_of_resets
    }

    /// Reset generation check done before every acquire.
    pub fn validate_not_empty(&self) -> u64 {
        let needs_reset = {
            let state = self.state.read();
            state.valid_addresses.is_empty()
        };
        if needs_reset {
            self.reset_valid_if_empty()
        } else {
            self.state.read().number_of_resets
        }
    }

    /// Entry lookup; checks the current pairing, then the purge set.
    pub fn get_entry(&self, address: &str) -> Option<Arc<ProviderEntry>> {
        let state = self.state.read();
        state
            .pairing
            .get(address)
            .cloned()
            .or_else(|| state.purge.get(address).cloned())
    }

    /// JSON array of providers reported this epoch; `[]` after rotation.
    pub fn reported_providers_json(&self, epoch: u64) -> Vec<u8> {
        let state = self.state.read();
        if epoch != self.current_epoch() {
            return b"[]".to_vec();
        }
        let reported: Vec<&String> = state.reported.iter().collect();
        serde_json::to_vec(&reported).unwrap_or_else(|_| b"[]".to_vec())
    }

    #[cfg(test)]
    pub(crate) fn valid_addresses(&self) -> Vec<String> {
        self.state.read().valid_addresses.clone()
    }
}
