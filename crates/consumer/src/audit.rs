//! Asynchronous response auditor
//!
//! After a finalized deterministic relay, two VRF evaluations over the
//! exchange decide whether to re-query up to two other providers and compare
//! answers. Runs detached from the client call; its failures never reach the
//! client reply path.

use tracing::{debug, error, info, warn};

use relaymesh_core::{ApiCategory, RelayReply, RelayResult};
use relaymesh_protocol::{
    calculate_vrf_on_relay, construct_audit_relay_request, new_vrf_data, prove_vrf_on_relay,
    relay_timeout, threshold_to_session, verify_reliability_results, SUPPORTED_VRFS,
};
use relaymesh_session::{calculate_expected_latency, SessionError, SessionHandle};

use crate::orchestrator::RelayOrchestrator;
use crate::{ConsumerError, AUDIT_TIMEOUT_EXTRA};

impl RelayOrchestrator {
    /// Audit a completed relay if the VRF selects any providers for it.
    ///
    /// Only finalized replies to deterministic APIs are audited: anything
    /// else can legitimately differ between providers.
    pub(crate) async fn audit_relay_if_applicable(
        &self,
        result: RelayResult,
        category: ApiCategory,
        reliability_threshold: u32,
    ) {
        if !category.deterministic || !result.finalized {
            return;
        }
        let reply = match &result.reply {
            Some(reply) => reply.clone(),
            None => return,
        };
        let session_epoch = result.request.relay_session.epoch;
        let original_provider = result.provider_address.clone();
        let providers_count = self.sessions.pairing_len() as u32;

        let (vrf_first, vrf_second) =
            calculate_vrf_on_relay(&result.request.relay_data, &reply, &self.vrf_key, session_epoch);
        let indexes = threshold_to_session(
            &[vrf_first, vrf_second],
            &[false, true],
            reliability_threshold,
            providers_count,
        );
        debug!(?indexes, providers_count, "audit vrf decision");

        let mut audit_sessions: Vec<(SessionHandle, bool)> = Vec::new();
        for (index, differentiator) in indexes {
            match self
                .sessions
                .acquire_audit_session(&original_provider, index, session_epoch)
                .await
            {
                Ok(handle) => audit_sessions.push((handle, differentiator)),
                Err(SessionError::IndexEqualsOriginal(provider)) => {
                    info!(%provider, index, "audit index matches the original provider");
                }
                Err(SessionError::AlreadySentThisEpoch(provider)) => {
                    info!(%provider, "audit already sent to this provider this epoch");
                }
                Err(SessionError::EpochMismatch) => {
                    info!(session_epoch, "epoch changed, cannot audit this relay");
                    break;
                }
                Err(err) => {
                    error!(%err, index, "failed acquiring audit session");
                }
            }
        }
        if audit_sessions.is_empty() {
            return;
        }
        if audit_sessions.len() > SUPPORTED_VRFS {
            error!(
                sessions = audit_sessions.len(),
                "more audit sessions than supported, dropping the audit"
            );
            return;
        }

        let mut audit_results: Vec<RelayResult> = Vec::new();
        for (handle, differentiator) in audit_sessions {
            match self.send_audit_relay(&result, &reply, handle, differentiator).await {
                Ok(audit_result) => audit_results.push(audit_result),
                Err(err) => warn!(%err, "failed audit relay"),
            }
        }
        if audit_results.is_empty() {
            return;
        }

        let conflicts = verify_reliability_results(&result, &audit_results);
        if conflicts.is_empty() {
            info!(
                original = %result.provider_address,
                audits = audit_results.len(),
                "audit verified the response successfully"
            );
            return;
        }
        for conflict in conflicts {
            if let Err(err) = self
                .conflict_sender
                .tx_conflict_detection(None, Some(conflict), None)
                .await
            {
                error!(%err, "could not send response conflict transaction");
            }
        }
    }

    async fn send_audit_relay(
        &self,
        original: &RelayResult,
        original_reply: &RelayReply,
        handle: SessionHandle,
        differentiator: bool,
    ) -> crate::Result<RelayResult> {
        let session_epoch = original.request.relay_session.epoch;
        let vrf_output = prove_vrf_on_relay(
            &original.request.relay_data,
            original_reply,
            &self.vrf_key,
            differentiator,
            session_epoch,
        );
        let vrf_data = new_vrf_data(differentiator, &vrf_output, &original.request, original_reply);

        let request = match construct_audit_relay_request(
            &self.signing_key,
            &self.relay_chain_id,
            &self.spec_id,
            original.request.relay_data.clone(),
            &handle,
            vrf_data,
        ) {
            Ok(request) => request,
            Err(err) => {
                // never sent: roll the audit counter back so the slot stays usable
                if let Err(release_err) = self
                    .sessions
                    .on_audit_session_failure(handle, &relaymesh_core::RelayError::Cancelled)
                {
                    warn!(%release_err, "failed releasing unsent audit session");
                }
                return Err(ConsumerError::Protocol(err));
            }
        };

        let stats = self.chain_parser.chain_block_stats();
        let timeout = relay_timeout(handle.latest_relay_cu(), AUDIT_TIMEOUT_EXTRA);
        match self.relay_inner(&handle, &request, timeout).await {
            Ok((audit_result, latency)) => {
                let (expected_height, num_of_providers) =
                    self.finalization.expected_block_height(&stats);
                let providers_count = self.sessions.pairing_len();
                let latest_block = audit_result
                    .reply
                    .as_ref()
                    .map(|reply| reply.latest_block)
                    .unwrap_or_default();
                if let Err(err) = self.sessions.on_audit_session_done(
                    handle,
                    latest_block,
                    latency,
                    calculate_expected_latency(timeout),
                    expected_height,
                    num_of_providers,
                    providers_count,
                ) {
                    warn!(%err, "failed releasing successful audit session");
                }
                Ok(audit_result)
            }
            Err(relay_error) => {
                self.release_failed_session(handle, &relay_error);
                Err(relay_error.into())
            }
        }
    }
}
