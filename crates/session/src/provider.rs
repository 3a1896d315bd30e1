//! Provider entries and session slots
//!
//! A [`ProviderEntry`] is installed per paired provider per epoch. It owns
//! the provider's endpoints, its compute-unit budget and its session slots.
//! Slot state is guarded by a per-slot async mutex; holding the owned guard
//! is the exclusive right to run one relay on that session.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use relaymesh_core::{ProviderClient, PublicKey, RelayTransport};

use crate::common::{
    AUDIT_RELAY_NUMBER, AUDIT_SESSION_ID, CONNECT_TIMEOUT, MAX_BLOCK_LISTED_SESSIONS_PER_PROVIDER,
    MAX_ENDPOINT_CONNECTION_REFUSALS, MAX_SESSIONS_PER_PROVIDER,
};
use crate::qos::QoSInfo;
use crate::{Result, SessionError};

/// One dialable address of a provider.
pub struct Endpoint {
    pub url: String,
    pub client: Option<Arc<dyn ProviderClient>>,
    pub enabled: bool,
    pub connection_refusals: u32,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("url", &self.url)
            .field("client", &self.client.is_some())
            .field("enabled", &self.enabled)
            .field("connection_refusals", &self.connection_refusals)
            .finish()
    }
}

impl Endpoint {
    fn new(url: String) -> Self {
        Self {
            url,
            client: None,
            enabled: true,
            connection_refusals: 0,
        }
    }
}

/// Mutable per-session state. Every field is guarded by the slot's mutex;
/// readers and writers must hold the owned guard.
#[derive(Debug)]
pub struct SlotState {
    pub session_id: u64,
    pub relay_num: u64,
    pub cu_sum: u64,
    pub latest_relay_cu: u64,
    pub qos: QoSInfo,
    pub latest_block: i64,
    pub consecutive_failures: u64,
    pub block_listed: bool,
}

impl SlotState {
    fn new(session_id: u64) -> Self {
        Self {
            session_id,
            relay_num: 0,
            cu_sum: 0,
            latest_relay_cu: 0,
            qos: QoSInfo::default(),
            latest_block: 0,
            consecutive_failures: 0,
            block_listed: false,
        }
    }
}

/// Owned lock over a slot's state.
pub(crate) type SlotGuard = OwnedMutexGuard<SlotState>;

type SharedSlot = Arc<AsyncMutex<SlotState>>;

/// A paired provider: endpoints, CU budget and session slots.
#[derive(Debug)]
pub struct ProviderEntry {
    address: String,
    public_key: PublicKey,
    max_compute_units: u64,
    pairing_epoch: u64,
    used_compute_units: AtomicU64,
    endpoints: Mutex<Vec<Endpoint>>,
    sessions: Mutex<HashMap<u64, SharedSlot>>,
}

impl ProviderEntry {
    pub(crate) fn new(
        address: String,
        public_key: PublicKey,
        endpoint_urls: Vec<String>,
        max_compute_units: u64,
        pairing_epoch: u64,
    ) -> Self {
        Self {
            address,
            public_key,
            max_compute_units,
            pairing_epoch,
            used_compute_units: AtomicU64::new(0),
            endpoints: Mutex::new(endpoint_urls.into_iter().map(Endpoint::new).collect()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn pairing_epoch(&self) -> u64 {
        self.pairing_epoch
    }

    pub fn max_compute_units(&self) -> u64 {
        self.max_compute_units
    }

    pub fn used_compute_units(&self) -> u64 {
        self.used_compute_units.load(Ordering::Acquire)
    }

    /// CU ceiling for the current reset generation. Each pairing reset grants
    /// another full budget so an emptied pairing cannot deadlock on CU.
    fn compute_unit_ceiling(&self, resets: u64) -> u64 {
        self.max_compute_units.saturating_mul(resets + 1)
    }

    /// Cheap pre-check before dialing the provider.
    pub(crate) fn validate_compute_units(&self, cu_needed: u64, resets: u64) -> Result<()> {
        if self.used_compute_units() + cu_needed > self.compute_unit_ceiling(resets) {
            return Err(SessionError::MaxComputeUnitsExceeded(self.address.clone()));
        }
        Ok(())
    }

    /// Reserve `cu_needed` against the budget, atomically.
    pub(crate) fn add_used_compute_units(&self, cu_needed: u64, resets: u64) -> Result<()> {
        let ceiling = self.compute_unit_ceiling(resets);
        let mut current = self.used_compute_units.load(Ordering::Acquire);
        loop {
            if current + cu_needed > ceiling {
                return Err(SessionError::MaxComputeUnitsExceeded(self.address.clone()));
            }
            match self.used_compute_units.compare_exchange(
                current,
                current + cu_needed,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Return compute units that were reserved but not served.
    pub(crate) fn decrease_used_compute_units(&self, cu: u64) {
        let mut current = self.used_compute_units.load(Ordering::Acquire);
        loop {
            let next = match current.checked_sub(cu) {
                Some(next) => next,
                None => {
                    warn!(
                        provider = %self.address,
                        used = current,
                        decrease = cu,
                        "used compute units would underflow, clamping to zero"
                    );
                    0
                }
            };
            match self.used_compute_units.compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Fetch a live connection to this provider.
    ///
    /// `Ok(Some(client))` on success, `Ok(None)` on a transient failure worth
    /// retrying elsewhere, `Err(AllEndpointsDisabled)` once every endpoint
    /// has been disabled by repeated refusals.
    pub(crate) async fn fetch_endpoint_connection(
        &self,
        transport: &dyn RelayTransport,
    ) -> Result<Option<Arc<dyn ProviderClient>>> {
        let dial_url = {
            let endpoints = self.endpoints.lock();
            let candidate = endpoints.iter().find(|endpoint| endpoint.enabled);
            match candidate {
                None => return Err(SessionError::AllEndpointsDisabled(self.address.clone())),
                Some(endpoint) => match &endpoint.client {
                    Some(client) => return Ok(Some(client.clone())),
                    None => endpoint.url.clone(),
                },
            }
        };

        let connect = transport.connect(&self.address, &dial_url);
        let connected = tokio::time::timeout(CONNECT_TIMEOUT, connect).await;

        let mut endpoints = self.endpoints.lock();
        let endpoint = match endpoints.iter_mut().find(|endpoint| endpoint.url == dial_url) {
            Some(endpoint) => endpoint,
            None => return Ok(None),
        };
        match connected {
            Ok(Ok(client)) => {
                endpoint.client = Some(client.clone());
                endpoint.connection_refusals = 0;
                Ok(Some(client))
            }
            Ok(Err(err)) => {
                debug!(provider = %self.address, url = %dial_url, %err, "endpoint connection failed");
                self.register_refusal(endpoint);
                if endpoints.iter().all(|endpoint| !endpoint.enabled) {
                    return Err(SessionError::AllEndpointsDisabled(self.address.clone()));
                }
                Ok(None)
            }
            Err(_elapsed) => {
                debug!(provider = %self.address, url = %dial_url, "endpoint connection timed out");
                self.register_refusal(endpoint);
                if endpoints.iter().all(|endpoint| !endpoint.enabled) {
                    return Err(SessionError::AllEndpointsDisabled(self.address.clone()));
                }
                Ok(None)
            }
        }
    }

    fn register_refusal(&self, endpoint: &mut Endpoint) {
        endpoint.connection_refusals += 1;
        if endpoint.connection_refusals >= MAX_ENDPOINT_CONNECTION_REFUSALS {
            warn!(provider = %self.address, url = %endpoint.url, "disabling endpoint after repeated refusals");
            endpoint.enabled = false;
        }
    }

    /// Drop all open connections. Called when this entry leaves the purge
    /// set, two epochs after it stopped being current.
    pub(crate) fn close_connections(&self) {
        let mut endpoints = self.endpoints.lock();
        for endpoint in endpoints.iter_mut() {
            endpoint.client = None;
        }
    }

    /// Lock an idle regular slot, or open a new one.
    pub(crate) fn acquire_slot(&self) -> Result<SlotGuard> {
        let mut sessions = self.sessions.lock();
        let mut block_listed_count = 0usize;
        for (session_id, slot) in sessions.iter() {
            if *session_id == AUDIT_SESSION_ID {
                continue;
            }
            if let Ok(guard) = slot.clone().try_lock_owned() {
                if guard.block_listed {
                    block_listed_count += 1;
                    continue;
                }
                return Ok(guard);
            }
        }
        if block_listed_count > MAX_BLOCK_LISTED_SESSIONS_PER_PROVIDER {
            return Err(SessionError::TooManyBlockListedSessions(self.address.clone()));
        }
        if sessions.len() >= MAX_SESSIONS_PER_PROVIDER {
            return Err(SessionError::MaxSessionsExceeded(self.address.clone()));
        }

        let mut session_id: u64 = rand::random();
        while session_id == AUDIT_SESSION_ID || sessions.contains_key(&session_id) {
            session_id = rand::random();
        }
        let slot = Arc::new(AsyncMutex::new(SlotState::new(session_id)));
        sessions.insert(session_id, slot.clone());
        slot.try_lock_owned()
            .map_err(|_| SessionError::Misuse("freshly created slot is already locked"))
    }

    /// Lock the provider's reserved audit slot.
    ///
    /// At most one audit relay per provider per epoch: a slot that already
    /// carried its audit relay, or is currently locked, is spent. A slot
    /// whose failed relay was rolled back is handed out again.
    pub(crate) fn acquire_audit_slot(&self) -> Result<SlotGuard> {
        let mut sessions = self.sessions.lock();
        if let Some(slot) = sessions.get(&AUDIT_SESSION_ID) {
            let guard = slot
                .clone()
                .try_lock_owned()
                .map_err(|_| SessionError::AlreadySentThisEpoch(self.address.clone()))?;
            if guard.relay_num >= AUDIT_RELAY_NUMBER {
                return Err(SessionError::AlreadySentThisEpoch(self.address.clone()));
            }
            return Ok(guard);
        }
        let slot = Arc::new(AsyncMutex::new(SlotState::new(AUDIT_SESSION_ID)));
        sessions.insert(AUDIT_SESSION_ID, slot.clone());
        slot.try_lock_owned()
            .map_err(|_| SessionError::Misuse("freshly created audit slot is already locked"))
    }

    #[cfg(test)]
    pub(crate) fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> ProviderEntry {
        ProviderEntry::new(
            "provider1".to_string(),
            [1u8; 32],
            vec!["mesh://provider1:4500".to_string()],
            100,
            7,
        )
    }

    #[test]
    fn test_compute_unit_budget() {
        let entry = entry();
        assert!(entry.validate_compute_units(100, 0).is_ok());
        assert!(entry.validate_compute_units(101, 0).is_err());

        entry.add_used_compute_units(60, 0).unwrap();
        assert_eq!(entry.used_compute_units(), 60);
        assert!(entry.add_used_compute_units(50, 0).is_err());

        entry.decrease_used_compute_units(60);
        assert_eq!(entry.used_compute_units(), 0);
    }

    #[test]
    fn test_budget_scales_with_resets() {
        let entry = entry();
        entry.add_used_compute_units(100, 0).unwrap();
        assert!(entry.validate_compute_units(1, 0).is_err());
        // one pairing reset grants another full budget
        assert!(entry.validate_compute_units(100, 1).is_ok());
    }

    #[test]
    fn test_decrease_clamps_at_zero() {
        let entry = entry();
        entry.decrease_used_compute_units(10);
        assert_eq!(entry.used_compute_units(), 0);
    }

    #[test]
    fn test_acquire_slot_excludes_held_slots() {
        let entry = entry();
        let first = entry.acquire_slot().unwrap();
        let second = entry.acquire_slot().unwrap();
        assert_ne!(first.session_id, second.session_id);
        assert_eq!(entry.session_count(), 2);

        // releasing one slot makes it eligible for reuse
        let released_id = first.session_id;
        drop(first);
        let third = entry.acquire_slot().unwrap();
        assert_eq!(third.session_id, released_id);
        assert_eq!(entry.session_count(), 2);
        drop(second);
        drop(third);
    }

    #[test]
    fn test_block_listed_slots_are_never_reused() {
        let entry = entry();
        let mut guard = entry.acquire_slot().unwrap();
        let listed_id = guard.session_id;
        guard.block_listed = true;
        drop(guard);

        let next = entry.acquire_slot().unwrap();
        assert_ne!(next.session_id, listed_id);
    }

    #[test]
    fn test_too_many_block_listed_slots() {
        let entry = entry();
        for _ in 0..=MAX_BLOCK_LISTED_SESSIONS_PER_PROVIDER {
            let mut guard = entry.acquire_slot().unwrap();
            guard.block_listed = true;
        }
        assert_eq!(
            entry.acquire_slot().unwrap_err(),
            SessionError::TooManyBlockListedSessions("provider1".to_string())
        );
    }

    #[test]
    fn test_audit_slot_once_per_epoch() {
        let entry = entry();
        let mut guard = entry.acquire_audit_slot().unwrap();
        guard.relay_num += 1;
        drop(guard);

        assert_eq!(
            entry.acquire_audit_slot().unwrap_err(),
            SessionError::AlreadySentThisEpoch("provider1".to_string())
        );
    }

    #[test]
    fn test_audit_slot_reusable_after_rollback() {
        let entry = entry();
        let mut guard = entry.acquire_audit_slot().unwrap();
        guard.relay_num += 1;
        // a failed audit relay rolls the counter back
        guard.relay_num -= 1;
        drop(guard);

        assert!(entry.acquire_audit_slot().is_ok());
    }

    #[test]
    fn test_audit_slot_locked_while_in_flight() {
        let entry = entry();
        let _held = entry.acquire_audit_slot().unwrap();
        assert_eq!(
            entry.acquire_audit_slot().unwrap_err(),
            SessionError::AlreadySentThisEpoch("provider1".to_string())
        );
    }
}
