//! Consumer session manager
//!
//! Front door for the relay orchestrator: hands out locked session handles,
//! takes them back with success/failure verdicts, and applies all CU, QoS
//! and block-list bookkeeping. Owns the pairing table and schedules the
//! post-pairing probe pass.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use relaymesh_core::{
    ProviderClient, ProviderOptimizer, PublicKey, QualityOfServiceReport, RelayError,
    RelayTransport,
};

use crate::common::{
    AVERAGE_WORLD_LATENCY, MAX_CONSECUTIVE_CONNECTION_ATTEMPTS, MAX_CONSECUTIVE_FAILURES,
    PROBE_JITTER_MAX, RELAY_NUMBER_INCREMENT,
};
use crate::pairing::{PairingListEntry, PairingTable};
use crate::provider::{ProviderEntry, SlotGuard};
use crate::{Result, SessionError};

/// A locked session slot, the exclusive right to run one relay.
///
/// The slot stays locked for as long as the handle lives; every handle must
/// be returned through exactly one of the manager's release methods (audit
/// handles through the audit releases, regular handles through the regular
/// ones). A handle dropped without a release — a cancelled client call —
/// books itself as a transient failure and refunds its compute units.
pub struct SessionHandle {
    guard: SlotGuard,
    entry: Arc<ProviderEntry>,
    connection: Arc<dyn ProviderClient>,
    epoch: u64,
    audit: bool,
    released: bool,
}

impl SessionHandle {
    pub fn provider(&self) -> &str {
        self.entry.address()
    }

    pub fn provider_key(&self) -> PublicKey {
        self.entry.public_key()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn connection(&self) -> Arc<dyn ProviderClient> {
        self.connection.clone()
    }

    pub fn session_id(&self) -> u64 {
        self.guard.session_id
    }

    pub fn relay_num(&self) -> u64 {
        self.guard.relay_num
    }

    pub fn cu_sum(&self) -> u64 {
        self.guard.cu_sum
    }

    pub fn latest_relay_cu(&self) -> u64 {
        self.guard.latest_relay_cu
    }

    pub fn latest_block(&self) -> i64 {
        self.guard.latest_block
    }

    pub fn qos_report(&self) -> Option<QualityOfServiceReport> {
        self.guard.qos.last_report.clone()
    }

    pub fn is_audit(&self) -> bool {
        self.audit
    }

    fn check_family(&self, audit_release: bool, misuse: &'static str) -> Result<()> {
        if self.audit != audit_release {
            return Err(SessionError::Misuse(misuse));
        }
        Ok(())
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // cancelled mid-relay: book a transient failure so the counters stay
        // truthful, refund the reserved compute units
        warn!(
            provider = %self.entry.address(),
            session_id = self.guard.session_id,
            "session handle dropped without release, recording a transient failure"
        );
        self.guard.qos.register_failure();
        self.guard.consecutive_failures += 1;
        if self.guard.consecutive_failures > MAX_CONSECUTIVE_FAILURES {
            self.guard.block_listed = true;
        }
        if self.audit {
            self.guard.relay_num -= RELAY_NUMBER_INCREMENT;
        } else {
            let cu_to_decrease = self.guard.latest_relay_cu;
            self.guard.latest_relay_cu = 0;
            self.entry.decrease_used_compute_units(cu_to_decrease);
        }
    }
}

/// Owns pairing state and session slots; every acquire/release goes through
/// here.
pub struct ConsumerSessionManager {
    table: PairingTable,
    transport: Arc<dyn RelayTransport>,
    optimizer: Arc<dyn ProviderOptimizer>,
}

impl ConsumerSessionManager {
    pub fn new(transport: Arc<dyn RelayTransport>, optimizer: Arc<dyn ProviderOptimizer>) -> Self {
        Self {
            table: PairingTable::new(),
            transport,
            optimizer,
        }
    }

    pub fn current_epoch(&self) -> u64 {
        self.table.current_epoch()
    }

    /// Size of the current pairing, the VRF index domain for audits.
    pub fn pairing_len(&self) -> u64 {
        self.table.pairing_len()
    }

    /// JSON blob of providers reported this epoch, carried on outgoing
    /// sessions.
    pub fn reported_providers(&self, epoch: u64) -> Vec<u8> {
        self.table.reported_providers_json(epoch)
    }

    /// Entry lookup for inspection; checks current pairing, then purge.
    pub fn get_provider_entry(&self, address: &str) -> Option<Arc<ProviderEntry>> {
        self.table.get_entry(address)
    }

    /// Install the pairing for `epoch` and schedule a probe pass over the new
    /// providers after a random jitter.
    pub fn update_pairing(&self, epoch: u64, pairing_list: Vec<PairingListEntry>) -> Result<()> {
        let entries = self.table.update(epoch, pairing_list)?;
        self.spawn_probe_pass(entries, epoch);
        Ok(())
    }

    fn spawn_probe_pass(&self, entries: Vec<Arc<ProviderEntry>>, epoch: u64) {
        let transport = self.transport.clone();
        let optimizer = self.optimizer.clone();
        tokio::spawn(async move {
            // scatter probe passes of many chains sharing this process
            let jitter_ms = rand::thread_rng().gen_range(0..PROBE_JITTER_MAX.as_millis() as u64);
            tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
            let guid: u64 = rand::random();
            info!(epoch, guid, providers = entries.len(), "provider probe pass initiated");
            for entry in entries {
                let (latency, failure) =
                    probe_provider(transport.as_ref(), entry.as_ref(), guid).await;
                optimizer.append_relay_data(entry.address(), latency, failure);
            }
        });
    }

    /// Acquire a locked session slot on some eligible provider.
    ///
    /// Returns the handle together with the reported-providers blob for the
    /// session's epoch. Providers in `exclude` are skipped; exclusions
    /// gathered before an epoch rotation are ignored wholesale, the pairing
    /// they grudged against no longer exists.
    pub async fn acquire_session(
        &self,
        cu_needed: u64,
        exclude: &HashSet<String>,
    ) -> Result<(SessionHandle, Vec<u8>)> {
        let resets = self.table.validate_not_empty();

        let mut ignored: HashSet<String> = exclude.clone();
        let mut ignored_epoch = self.table.current_epoch();

        loop {
            let current = self.table.current_epoch();
            if ignored_epoch < current {
                debug!(
                    ignored_epoch,
                    current, "epoch rotated mid-acquire, resetting ignored providers"
                );
                ignored.clear();
                ignored_epoch = current;
            }

            let (address, entry, session_epoch) = self.table.select_random_valid(&ignored)?;

            if let Err(err) = entry.validate_compute_units(cu_needed, resets) {
                debug!(provider = %address, %err, "provider exhausted for this session");
                ignored.insert(address);
                continue;
            }

            let connection = match entry
                .fetch_endpoint_connection(self.transport.as_ref())
                .await
            {
                Ok(Some(connection)) => connection,
                Ok(None) => {
                    // transient connect failure, skip for this acquire only
                    ignored.insert(address);
                    continue;
                }
                Err(SessionError::AllEndpointsDisabled(_)) => {
                    match self.table.block_provider(&address, true, session_epoch) {
                        Ok(()) | Err(SessionError::EpochMismatch) => {}
                        Err(other) => return Err(other),
                    }
                    ignored.insert(address);
                    continue;
                }
                Err(other) => return Err(other),
            };

            // fetched after connecting, so an unresponsive provider from this
            // very acquire is already included
            let reported = self.table.reported_providers_json(session_epoch);

            let mut guard = match entry.acquire_slot() {
                Ok(guard) => guard,
                Err(SessionError::MaxSessionsExceeded(_)) => {
                    ignored.insert(address);
                    continue;
                }
                Err(SessionError::TooManyBlockListedSessions(_)) => {
                    match self.table.block_provider(&address, false, session_epoch) {
                        Ok(()) | Err(SessionError::EpochMismatch) => {}
                        Err(other) => return Err(other),
                    }
                    ignored.insert(address);
                    continue;
                }
                Err(other) => return Err(other),
            };

            if entry.add_used_compute_units(cu_needed, resets).is_err() {
                drop(guard);
                ignored.insert(address);
                continue;
            }

            guard.latest_relay_cu = cu_needed;
            guard.relay_num += RELAY_NUMBER_INCREMENT;
            return Ok((
                SessionHandle {
                    guard,
                    entry,
                    connection,
                    epoch: session_epoch,
                    audit: false,
                    released: false,
                },
                reported,
            ));
        }
    }

    /// A relay completed: charge the slot, refresh QoS, release.
    #[allow(clippy::too_many_arguments)]
    pub fn on_session_done(
        &self,
        mut handle: SessionHandle,
        latest_block: i64,
        latency: Duration,
        expected_latency: Duration,
        expected_block_height: i64,
        num_of_providers: usize,
        providers_count: u64,
    ) -> Result<()> {
        handle.check_family(false, "audit session released through on_session_done")?;
        let guard = &mut handle.guard;
        guard.cu_sum += guard.latest_relay_cu;
        guard.latest_relay_cu = 0;
        guard.consecutive_failures = 0;
        guard.latest_block = latest_block;
        guard.qos.calculate(
            latency,
            expected_latency,
            expected_block_height - latest_block,
            num_of_providers,
            providers_count,
        );
        handle.released = true;
        Ok(())
    }

    /// The relay was answered from cache: refund the reserved compute units.
    pub fn on_session_unused(&self, mut handle: SessionHandle) -> Result<()> {
        handle.check_family(false, "audit session released through on_session_unused")?;
        let cu_to_decrease = handle.guard.latest_relay_cu;
        handle.guard.latest_relay_cu = 0;
        handle.entry.decrease_used_compute_units(cu_to_decrease);
        handle.released = true;
        Ok(())
    }

    /// A subscription opened successfully: charge the slot, skip QoS.
    pub fn on_session_done_cu_only(&self, mut handle: SessionHandle) -> Result<()> {
        handle.check_family(false, "audit session released through on_session_done_cu_only")?;
        let guard = &mut handle.guard;
        guard.cu_sum += guard.latest_relay_cu;
        guard.latest_relay_cu = 0;
        guard.consecutive_failures = 0;
        handle.released = true;
        Ok(())
    }

    /// A relay failed: refund CU, track failures, block-list the slot (and
    /// possibly the provider) when warranted.
    pub fn on_session_failure(&self, mut handle: SessionHandle, err: &RelayError) -> Result<()> {
        handle.check_family(false, "audit session released through on_session_failure")?;
        if handle.guard.block_listed {
            return Err(SessionError::BlockListed(handle.guard.session_id));
        }

        let guard = &mut handle.guard;
        guard.qos.register_failure();
        guard.consecutive_failures += 1;
        let slot_block_listed =
            guard.consecutive_failures > MAX_CONSECUTIVE_FAILURES || err.is_sync_loss();
        if slot_block_listed {
            debug!(session_id = guard.session_id, "block listing consumer session");
            guard.block_listed = true;
        }
        let cu_to_decrease = guard.latest_relay_cu;
        guard.latest_relay_cu = 0;

        let entry = handle.entry.clone();
        handle.released = true;
        drop(handle);
        entry.decrease_used_compute_units(cu_to_decrease);

        let mut block = err.blocks_provider();
        let mut report = err.reports_provider();
        if slot_block_listed && entry.used_compute_units() == 0 {
            // the provider never served a single relay before its slot died
            block = true;
            report = true;
        }
        if block {
            match self
                .table
                .block_provider(entry.address(), report, entry.pairing_epoch())
            {
                Ok(()) | Err(SessionError::EpochMismatch) => {}
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }

    /// Acquire the audit session for the pairing index a VRF selected.
    ///
    /// Audit sessions never charge compute units and exist at most once per
    /// (provider, epoch).
    pub async fn acquire_audit_session(
        &self,
        original_provider: &str,
        index: u64,
        session_epoch: u64,
    ) -> Result<SessionHandle> {
        let (address, entry, current_epoch) =
            self.table.lookup_by_index(index, original_provider)?;
        if session_epoch != current_epoch {
            return Err(SessionError::EpochMismatch);
        }

        let mut guard = entry.acquire_audit_slot()?;
        let connection = match self.fetch_audit_connection(&entry, current_epoch).await {
            Ok(connection) => connection,
            Err(err) => {
                drop(guard);
                return Err(err);
            }
        };
        guard.relay_num += RELAY_NUMBER_INCREMENT;
        debug!(provider = %address, index, "acquired audit session");
        Ok(SessionHandle {
            guard,
            entry,
            connection,
            epoch: current_epoch,
            audit: true,
            released: false,
        })
    }

    async fn fetch_audit_connection(
        &self,
        entry: &Arc<ProviderEntry>,
        session_epoch: u64,
    ) -> Result<Arc<dyn ProviderClient>> {
        for _ in 0..MAX_CONSECUTIVE_CONNECTION_ATTEMPTS {
            match entry
                .fetch_endpoint_connection(self.transport.as_ref())
                .await
            {
                Ok(Some(connection)) => return Ok(connection),
                Ok(None) => continue,
                Err(SessionError::AllEndpointsDisabled(_)) => {
                    match self
                        .table
                        .block_provider(entry.address(), true, session_epoch)
                    {
                        Ok(()) | Err(SessionError::EpochMismatch) => {}
                        Err(other) => return Err(other),
                    }
                    break;
                }
                Err(other) => return Err(other),
            }
        }
        Err(SessionError::NotConnected(entry.address().to_string()))
    }

    /// A successful audit relay: refresh QoS, never touch `cu_sum`.
    #[allow(clippy::too_many_arguments)]
    pub fn on_audit_session_done(
        &self,
        mut handle: SessionHandle,
        latest_block: i64,
        latency: Duration,
        expected_latency: Duration,
        expected_block_height: i64,
        num_of_providers: usize,
        providers_count: u64,
    ) -> Result<()> {
        handle.check_family(true, "regular session released through on_audit_session_done")?;
        let guard = &mut handle.guard;
        guard.consecutive_failures = 0;
        guard.latest_block = latest_block;
        guard.qos.calculate(
            latency,
            expected_latency,
            expected_block_height - latest_block,
            num_of_providers,
            providers_count,
        );
        handle.released = true;
        Ok(())
    }

    /// A failed audit relay: roll the relay counter back so a retry replays
    /// the same number; never touch compute units.
    pub fn on_audit_session_failure(
        &self,
        mut handle: SessionHandle,
        err: &RelayError,
    ) -> Result<()> {
        handle.check_family(true, "regular session released through on_audit_session_failure")?;
        if handle.guard.block_listed {
            return Err(SessionError::BlockListed(handle.guard.session_id));
        }

        let guard = &mut handle.guard;
        guard.qos.register_failure();
        guard.consecutive_failures += 1;
        guard.relay_num -= RELAY_NUMBER_INCREMENT;
        if guard.consecutive_failures > MAX_CONSECUTIVE_FAILURES || err.is_sync_loss() {
            guard.block_listed = true;
        }

        let entry = handle.entry.clone();
        handle.released = true;
        drop(handle);

        if err.blocks_provider() {
            match self.table.block_provider(
                entry.address(),
                err.reports_provider(),
                entry.pairing_epoch(),
            ) {
                Ok(()) | Err(SessionError::EpochMismatch) => {}
                Err(other) => return Err(other),
            }
        }
        Ok(())
    }
}

async fn probe_provider(
    transport: &dyn RelayTransport,
    entry: &ProviderEntry,
    guid: u64,
) -> (Duration, bool) {
    let connection = match entry.fetch_endpoint_connection(transport).await {
        Ok(Some(connection)) => connection,
        Ok(None) | Err(_) => return (Duration::ZERO, true),
    };
    let started = Instant::now();
    match tokio::time::timeout(AVERAGE_WORLD_LATENCY, connection.probe(guid)).await {
        Ok(Ok(echo)) if echo == guid => {
            let latency = started.elapsed();
            debug!(provider = %entry.address(), ?latency, "probed provider successfully");
            (latency, false)
        }
        Ok(Ok(_)) => {
            warn!(provider = %entry.address(), "mismatched probe response");
            (Duration::ZERO, true)
        }
        Ok(Err(err)) => {
            debug!(provider = %entry.address(), %err, "probe call error");
            (Duration::ZERO, true)
        }
        Err(_elapsed) => (AVERAGE_WORLD_LATENCY, true),
    }
}
