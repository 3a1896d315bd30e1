//! Relay orchestration
//!
//! Per client request: parse, acquire a session, sign and send, verify, and
//! release — retrying with provider exclusion until enough responses are
//! gathered or the pairing runs dry. Successful finalized replies spawn the
//! auditor asynchronously; its lifetime is independent of the client call.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info_span, warn, Instrument};

use relaymesh_core::{
    is_finalized_block, CacheError, ChainMessage, ChainParser, ConflictSender,
    FinalizationConflict, RelayCache, RelayError, RelayPrivateData, RelayReply, RelayRequest,
    RelayResult, RelayStream, ResponseConflict,
};
use relaymesh_crypto::SigningKeypair;
use relaymesh_protocol::{
    construct_relay_request, new_relay_data, relay_timeout, update_requested_block,
    verify_finalization_data, verify_relay_reply, FinalizationConsensus, VerifyError,
};
use relaymesh_session::{
    calculate_expected_latency, ConsumerSessionManager, SessionError, SessionHandle,
    BACKOFF_TIME_ON_FAILURE,
};

use crate::{ConsumerConfig, ConsumerError, Result, MAX_RELAY_RETRIES};

/// What a client request resolves to.
pub enum RelayOutput {
    Reply(RelayReply),
    Subscription(RelayStream),
}

impl std::fmt::Debug for RelayOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayOutput::Reply(reply) => f.debug_tuple("Reply").field(reply).finish(),
            RelayOutput::Subscription(_) => f.write_str("Subscription(..)"),
        }
    }
}

pub(crate) enum ProviderRelay {
    Reply(RelayResult),
    Subscription(RelayStream),
}

pub(crate) struct AttemptFailure {
    pub provider: Option<String>,
    pub error: ConsumerError,
}

impl AttemptFailure {
    fn is_sync_loss(&self) -> bool {
        matches!(&self.error, ConsumerError::Relay(err) if err.is_sync_loss())
    }

    fn is_pairing_empty(&self) -> bool {
        matches!(
            &self.error,
            ConsumerError::Session(SessionError::PairingListEmpty)
        )
    }
}

/// Serves client RPC requests over the relay network.
///
/// Cheap to clone; clones share all collaborator state, which is how
/// detached tasks (the auditor, backoff releases) keep working past the
/// client call.
#[derive(Clone)]
pub struct RelayOrchestrator {
    pub(crate) spec_id: String,
    pub(crate) relay_chain_id: String,
    pub(crate) api_interface: String,
    pub(crate) required_responses: usize,
    pub(crate) chain_parser: Arc<dyn ChainParser>,
    pub(crate) sessions: Arc<ConsumerSessionManager>,
    pub(crate) finalization: Arc<FinalizationConsensus>,
    pub(crate) cache: Option<Arc<dyn RelayCache>>,
    pub(crate) conflict_sender: Arc<dyn ConflictSender>,
    pub(crate) signing_key: SigningKeypair,
    pub(crate) vrf_key: SigningKeypair,
}

impl RelayOrchestrator {
    /// Both signing keys are injected here; there is no process-wide key
    /// state.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ConsumerConfig,
        chain_parser: Arc<dyn ChainParser>,
        sessions: Arc<ConsumerSessionManager>,
        finalization: Arc<FinalizationConsensus>,
        cache: Option<Arc<dyn RelayCache>>,
        conflict_sender: Arc<dyn ConflictSender>,
        signing_key: SigningKeypair,
        vrf_key: SigningKeypair,
    ) -> Self {
        Self {
            spec_id: config.spec_id,
            relay_chain_id: config.relay_chain_id,
            api_interface: config.api_interface,
            required_responses: config.required_responses.max(1),
            chain_parser,
            sessions,
            finalization,
            cache,
            conflict_sender,
            signing_key,
            vrf_key,
        }
    }

    /// Serve one client request.
    ///
    /// Retries with provider exclusion up to [`MAX_RELAY_RETRIES`] times; the
    /// first sync-loss offender gets one more chance before being excluded.
    /// Subscriptions short-circuit to a stream; regular relays return the
    /// selected reply after spawning the auditor for every gathered result.
    pub async fn send_relay(
        &self,
        url: &str,
        data: &[u8],
        connection_type: &str,
    ) -> Result<RelayOutput> {
        let chain_message = self.chain_parser.parse_msg(url, data, connection_type)?;
        let guid: u64 = rand::random();
        let span = info_span!("relay", guid);
        self.send_relay_with_guid(chain_message.as_ref(), url, data, connection_type, guid)
            .instrument(span)
            .await
    }

    async fn send_relay_with_guid(
        &self,
        chain_message: &dyn ChainMessage,
        url: &str,
        data: &[u8],
        connection_type: &str,
        guid: u64,
    ) -> Result<RelayOutput> {
        let mut relay_data = new_relay_data(
            connection_type,
            url,
            data,
            chain_message.requested_block(),
            &self.api_interface,
            guid,
        );
        let category = chain_message.api_category();

        let mut unwanted_providers: HashSet<String> = HashSet::new();
        let mut relay_results: Vec<RelayResult> = Vec::new();
        let mut relay_errors: Vec<String> = Vec::new();
        let mut block_on_sync_loss = true;

        for _retry in 0..MAX_RELAY_RETRIES {
            match self
                .send_relay_to_provider(chain_message, &relay_data, &unwanted_providers)
                .await
            {
                Ok(ProviderRelay::Subscription(stream)) => {
                    return Ok(RelayOutput::Subscription(stream));
                }
                Ok(ProviderRelay::Reply(result)) => {
                    unwanted_providers.insert(result.provider_address.clone());
                    // later attempts ask for the height the first reply
                    // resolved, so responses stay comparable
                    relay_data.request_block = result.request.relay_data.request_block;
                    relay_results.push(result);
                    if relay_results.len() >= self.required_responses {
                        break;
                    }
                }
                Err(failure) => {
                    if let Some(provider) = &failure.provider {
                        if block_on_sync_loss && failure.is_sync_loss() {
                            debug!(%provider, "sync loss identified, provider gets another attempt");
                            block_on_sync_loss = false;
                        } else {
                            unwanted_providers.insert(provider.clone());
                        }
                    }
                    let pairing_empty = failure.is_pairing_empty();
                    debug!(error = %failure.error, "could not send relay to provider");
                    relay_errors.push(failure.error.to_string());
                    if pairing_empty {
                        break;
                    }
                }
            }
        }

        let (reliability_enabled, reliability_threshold) =
            self.chain_parser.data_reliability_params();
        if reliability_enabled {
            for result in &relay_results {
                // detached scope: the auditor outlives the client call and
                // keeps the request's correlation identifier
                let orchestrator = self.clone();
                let result = result.clone();
                let span = info_span!("audit", guid);
                tokio::spawn(
                    async move {
                        orchestrator
                            .audit_relay_if_applicable(result, category, reliability_threshold)
                            .await;
                    }
                    .instrument(span),
                );
            }
        }

        let returned = match relay_results.pop() {
            Some(result) => result,
            None => return Err(ConsumerError::AllRetriesFailed(relay_errors)),
        };
        if !relay_errors.is_empty() {
            debug!(errors = ?relay_errors, "relay succeeded after some errors");
        }
        match returned.reply {
            Some(reply) => Ok(RelayOutput::Reply(reply)),
            None => Err(ConsumerError::AllRetriesFailed(relay_errors)),
        }
    }

    async fn send_relay_to_provider(
        &self,
        chain_message: &dyn ChainMessage,
        relay_data: &RelayPrivateData,
        unwanted_providers: &HashSet<String>,
    ) -> std::result::Result<ProviderRelay, AttemptFailure> {
        let category = chain_message.api_category();
        let cu_needed = chain_message.compute_units();

        let (handle, reported_providers) = self
            .sessions
            .acquire_session(cu_needed, unwanted_providers)
            .await
            .map_err(|err| AttemptFailure {
                provider: None,
                error: err.into(),
            })?;
        let provider = handle.provider().to_string();

        let request = construct_relay_request(
            &self.signing_key,
            &self.relay_chain_id,
            &self.spec_id,
            relay_data.clone(),
            &handle,
            &reported_providers,
        );

        if category.subscription {
            return self.relay_subscription_inner(handle, request).await;
        }

        if let Some(cached) = self.cache_lookup(chain_message, &request).await {
            if let Err(err) = self.sessions.on_session_unused(handle) {
                warn!(%err, "failed releasing unused session after cache hit");
            }
            return Ok(ProviderRelay::Reply(RelayResult {
                request,
                reply: Some(cached),
                provider_address: provider,
                finalized: false,
            }));
        }

        let stats = self.chain_parser.chain_block_stats();
        let extra_timeout = if category.hanging_api {
            stats.finalization_time
        } else {
            Duration::ZERO
        };
        let timeout = relay_timeout(handle.latest_relay_cu(), extra_timeout);

        match self.relay_inner(&handle, &request, timeout).await {
            Ok((result, latency)) => {
                let (expected_height, num_of_providers) =
                    self.finalization.expected_block_height(&stats);
                let providers_count = self.sessions.pairing_len();
                let latest_block = result
                    .reply
                    .as_ref()
                    .map(|reply| reply.latest_block)
                    .unwrap_or_default();
                if let Err(err) = self.sessions.on_session_done(
                    handle,
                    latest_block,
                    latency,
                    calculate_expected_latency(timeout),
                    expected_height,
                    num_of_providers,
                    providers_count,
                ) {
                    warn!(%err, "failed releasing successful session");
                }
                self.spawn_cache_write(chain_message, &result);
                Ok(ProviderRelay::Reply(result))
            }
            Err(relay_error) => {
                self.release_failed_session(handle, &relay_error);
                Err(AttemptFailure {
                    provider: Some(provider),
                    error: relay_error.into(),
                })
            }
        }
    }

    /// Send one relay on a locked session and verify what comes back.
    /// Shared by regular and audit relays.
    pub(crate) async fn relay_inner(
        &self,
        handle: &SessionHandle,
        request: &RelayRequest,
        timeout: Duration,
    ) -> std::result::Result<(RelayResult, Duration), RelayError> {
        let existing_latest_block = handle.latest_block();
        let provider = handle.provider().to_string();
        let connection = handle.connection();

        let sent_at = Instant::now();
        let reply = match tokio::time::timeout(timeout, connection.relay(request)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(transport_error)) => return Err(transport_error.into()),
            Err(_elapsed) => return Err(RelayError::DeadlineExceeded(timeout)),
        };
        let latency = sent_at.elapsed();

        let mut request = request.clone();
        // collapse magic blocks to what the provider actually served
        update_requested_block(&mut request.relay_data, &reply);
        let stats = self.chain_parser.chain_block_stats();
        let finalized = is_finalized_block(
            request.relay_data.request_block,
            reply.latest_block,
            stats.blocks_distance_for_finalized,
        );

        verify_relay_reply(&reply, &provider, &handle.provider_key())?;

        let (reliability_enabled, _) = self.chain_parser.data_reliability_params();
        if reliability_enabled {
            let finalized_blocks =
                match verify_finalization_data(&reply, &provider, existing_latest_block, &stats) {
                    Ok(finalized_blocks) => finalized_blocks,
                    Err(VerifyError::Accountability { reason, conflict }) => {
                        self.spawn_conflict(Some(conflict), None, None);
                        return Err(RelayError::FinalizationAccountability(reason));
                    }
                    Err(VerifyError::Relay(err)) => return Err(err),
                };
            if let Err(consensus_error) =
                self.finalization
                    .update_finalized_hashes(&provider, &reply, &finalized_blocks)
            {
                let conflict = consensus_error.conflict().clone();
                if consensus_error.is_same_provider() {
                    self.spawn_conflict(None, None, Some(conflict));
                } else {
                    self.spawn_conflict(Some(conflict), None, None);
                }
                return Err(RelayError::FinalizationAccountability(
                    consensus_error.to_string(),
                ));
            }
        }

        Ok((
            RelayResult {
                request,
                reply: Some(reply),
                provider_address: provider,
                finalized,
            },
            latency,
        ))
    }

    async fn relay_subscription_inner(
        &self,
        handle: SessionHandle,
        request: RelayRequest,
    ) -> std::result::Result<ProviderRelay, AttemptFailure> {
        let provider = handle.provider().to_string();
        let connection = handle.connection();
        match connection.relay_subscribe(&request).await {
            Ok(stream) => {
                if let Err(err) = self.sessions.on_session_done_cu_only(handle) {
                    warn!(%err, "failed releasing subscription session");
                }
                Ok(ProviderRelay::Subscription(stream))
            }
            Err(transport_error) => {
                let relay_error = RelayError::from(transport_error);
                if let Err(err) = self.sessions.on_session_failure(handle, &relay_error) {
                    warn!(%err, "failed releasing session after subscribe error");
                }
                Err(AttemptFailure {
                    provider: Some(provider),
                    error: relay_error.into(),
                })
            }
        }
    }

    async fn cache_lookup(
        &self,
        chain_message: &dyn ChainMessage,
        request: &RelayRequest,
    ) -> Option<RelayReply> {
        let cache = self.cache.as_ref()?;
        match cache
            .get_entry(request, chain_message.api_interface(), &self.spec_id)
            .await
        {
            Ok(found) => found,
            Err(CacheError::NotConnected) => {
                error!("cache not connected");
                None
            }
            Err(err) => {
                debug!(%err, "cache lookup failed");
                None
            }
        }
    }

    fn spawn_cache_write(&self, chain_message: &dyn ChainMessage, result: &RelayResult) {
        let Some(cache) = self.cache.clone() else {
            return;
        };
        let Some(reply) = result.reply.clone() else {
            return;
        };
        let request = result.request.clone();
        let api_interface = chain_message.api_interface().to_string();
        let spec_id = self.spec_id.clone();
        let finalized = result.finalized;
        tokio::spawn(async move {
            if let Err(err) = cache
                .set_entry(&request, &api_interface, &spec_id, &reply, finalized)
                .await
            {
                if !matches!(err, CacheError::NotConnected) {
                    warn!(%err, "error updating cache with new entry");
                }
            }
        });
    }

    /// Release a failed session off the request path, honoring the backoff
    /// for deadline failures.
    pub(crate) fn release_failed_session(&self, handle: SessionHandle, relay_error: &RelayError) {
        let sessions = self.sessions.clone();
        let relay_error = relay_error.clone();
        let audit = handle.is_audit();
        tokio::spawn(async move {
            if relay_error.needs_backoff() {
                tokio::time::sleep(BACKOFF_TIME_ON_FAILURE).await;
            }
            let released = if audit {
                sessions.on_audit_session_failure(handle, &relay_error)
            } else {
                sessions.on_session_failure(handle, &relay_error)
            };
            if let Err(err) = released {
                error!(%err, original = %relay_error, "failed releasing session after relay failure");
            }
        });
    }

    pub(crate) fn spawn_conflict(
        &self,
        finalization_conflict: Option<FinalizationConflict>,
        response_conflict: Option<ResponseConflict>,
        same_provider_conflict: Option<FinalizationConflict>,
    ) {
        let sender = self.conflict_sender.clone();
        tokio::spawn(async move {
            if let Err(err) = sender
                .tx_conflict_detection(
                    finalization_conflict,
                    response_conflict,
                    same_provider_conflict,
                )
                .await
            {
                error!(%err, "could not send conflict detection transaction");
            }
        });
    }
}
