//! Relay request construction and signing
//!
//! A relay request pairs the payload (`RelayPrivateData`) with a signed
//! session descriptor. Audit relays ride the reserved audit session and
//! additionally carry signed VRF metadata proving the audit was earned.

use std::time::Duration;

use relaymesh_core::{
    RelayPrivateData, RelayReply, RelayRequest, RelaySession, VrfData, EARLIEST_BLOCK,
    FINALIZED_BLOCK, LATEST_BLOCK, NOT_APPLICABLE, SAFE_BLOCK,
};
use relaymesh_crypto::{
    all_data_hash, calculate_content_hash, query_hash, sign_relay_session, sign_vrf_data,
    SigningKeypair, VrfOutput,
};
use relaymesh_session::{
    expected_relay_latency, SessionHandle, AUDIT_CU_SUM, AUDIT_SESSION_ID, AVERAGE_WORLD_LATENCY,
};

use crate::ProtocolError;

/// Assemble the payload for a relay, salted with the request GUID.
pub fn new_relay_data(
    connection_type: &str,
    api_url: &str,
    data: &[u8],
    request_block: i64,
    api_interface: &str,
    guid: u64,
) -> RelayPrivateData {
    let mut relay_data = RelayPrivateData {
        connection_type: connection_type.to_string(),
        api_url: api_url.to_string(),
        data: data.to_vec(),
        request_block,
        api_interface: api_interface.to_string(),
        salt: [0u8; 8],
    };
    relay_data.set_salt(guid);
    relay_data
}

/// Build the unsigned session descriptor for a regular relay.
///
/// `cu_sum` includes the in-flight relay's compute units, which are only
/// committed to the slot when the session is released successfully.
pub fn construct_relay_session(
    relay_chain_id: &str,
    spec_id: &str,
    relay_data: &RelayPrivateData,
    handle: &SessionHandle,
    reported_providers: &[u8],
) -> RelaySession {
    RelaySession {
        spec_id: spec_id.to_string(),
        content_hash: calculate_content_hash(relay_data),
        session_id: handle.session_id(),
        cu_sum: handle.cu_sum() + handle.latest_relay_cu(),
        provider: handle.provider().to_string(),
        relay_num: handle.relay_num(),
        qos_report: handle.qos_report(),
        epoch: handle.epoch(),
        unresponsive_providers: reported_providers.to_vec(),
        relay_chain_id: relay_chain_id.to_string(),
        sig: vec![],
    }
}

/// Build and sign a regular relay request.
pub fn construct_relay_request(
    keypair: &SigningKeypair,
    relay_chain_id: &str,
    spec_id: &str,
    relay_data: RelayPrivateData,
    handle: &SessionHandle,
    reported_providers: &[u8],
) -> RelayRequest {
    let mut relay_session = construct_relay_session(
        relay_chain_id,
        spec_id,
        &relay_data,
        handle,
        reported_providers,
    );
    sign_relay_session(keypair, &mut relay_session);
    RelayRequest {
        relay_data,
        relay_session,
        vrf_data: None,
    }
}

/// Bundle the audit metadata for one VRF evaluation over the original
/// exchange.
pub fn new_vrf_data(
    differentiator: bool,
    vrf_output: &VrfOutput,
    request: &RelayRequest,
    reply: &RelayReply,
) -> VrfData {
    VrfData {
        chain_id: request.relay_session.spec_id.clone(),
        epoch: request.relay_session.epoch,
        differentiator,
        vrf_value: vrf_output.value.to_vec(),
        vrf_proof: vrf_output.proof.to_vec(),
        provider_sig: reply.sig.clone(),
        all_data_hash: all_data_hash(reply, &request.relay_session.content_hash),
        query_hash: query_hash(&request.relay_data),
        sig: vec![],
    }
}

/// Build and sign an audit relay request on the reserved audit session.
///
/// The requested block must be concrete by now: magic values were collapsed
/// when the original reply arrived, so both providers answer for the same
/// height.
pub fn construct_audit_relay_request(
    keypair: &SigningKeypair,
    relay_chain_id: &str,
    spec_id: &str,
    relay_data: RelayPrivateData,
    handle: &SessionHandle,
    mut vrf_data: VrfData,
) -> Result<RelayRequest, ProtocolError> {
    if relay_data.request_block < 0 {
        return Err(ProtocolError::AuditRequestBlockNotSpecific(
            relay_data.request_block,
        ));
    }
    let mut relay_session = RelaySession {
        spec_id: spec_id.to_string(),
        content_hash: calculate_content_hash(&relay_data),
        session_id: AUDIT_SESSION_ID,
        cu_sum: AUDIT_CU_SUM,
        provider: handle.provider().to_string(),
        relay_num: handle.relay_num(),
        qos_report: None,
        epoch: handle.epoch(),
        unresponsive_providers: vec![],
        relay_chain_id: relay_chain_id.to_string(),
        sig: vec![],
    };
    sign_relay_session(keypair, &mut relay_session);
    sign_vrf_data(keypair, &mut vrf_data);
    Ok(RelayRequest {
        relay_data,
        relay_session,
        vrf_data: Some(vrf_data),
    })
}

/// Deadline granted to a relay costing `cu`, on top of the assumed world
/// latency and any chain-specific extra (hanging APIs, audit slack).
pub fn relay_timeout(cu: u64, extra: Duration) -> Duration {
    expected_relay_latency(cu) + AVERAGE_WORLD_LATENCY + extra
}

/// Collapse a magic requested block to what the provider actually served, so
/// later attempts and audits ask for a concrete height.
pub fn replace_requested_block(requested_block: i64, latest_block: i64) -> i64 {
    match requested_block {
        LATEST_BLOCK | SAFE_BLOCK | FINALIZED_BLOCK => latest_block,
        EARLIEST_BLOCK => NOT_APPLICABLE,
        concrete => concrete,
    }
}

/// Pin the request's block to the reply that resolved it.
pub fn update_requested_block(relay_data: &mut RelayPrivateData, reply: &RelayReply) {
    relay_data.request_block = replace_requested_block(relay_data.request_block, reply.latest_block);
}
