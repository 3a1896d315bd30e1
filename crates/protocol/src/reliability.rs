//! VRF-gated audit sampling and result comparison
//!
//! Two VRF evaluations over every finalized deterministic reply decide
//! whether to re-query up to two other providers. The mapping from VRF value
//! to pairing index is deterministic on the inputs, so audit decisions can be
//! re-derived for disputes.

use std::collections::BTreeMap;

use tracing::warn;

use relaymesh_core::{
    ConflictRelayData, RelayPrivateData, RelayReply, RelayResult, ResponseConflict,
};
use relaymesh_crypto::{
    all_data_hash, calculate_content_hash, query_hash, vrf_message, vrf_prove, SigningKeypair,
    VrfOutput,
};

/// Upper bound of audit relays per original relay.
pub const SUPPORTED_VRFS: usize = 2;

/// Map a VRF value to a pairing index, or `None` when the value clears the
/// audit threshold.
pub fn vrf_value_to_index(output: &VrfOutput, providers_count: u32, threshold: u32) -> Option<u64> {
    if providers_count == 0 {
        return None;
    }
    let value = output.as_u32();
    if value > threshold {
        return None;
    }
    Some(u64::from(value % providers_count))
}

/// Both VRF evaluations for a completed relay, differentiators false and
/// true.
pub fn calculate_vrf_on_relay(
    relay_data: &RelayPrivateData,
    reply: &RelayReply,
    vrf_key: &SigningKeypair,
    epoch: u64,
) -> (VrfOutput, VrfOutput) {
    (
        prove_vrf_on_relay(relay_data, reply, vrf_key, false, epoch),
        prove_vrf_on_relay(relay_data, reply, vrf_key, true, epoch),
    )
}

/// One VRF evaluation over the (request, reply, epoch, differentiator)
/// tuple.
pub fn prove_vrf_on_relay(
    relay_data: &RelayPrivateData,
    reply: &RelayReply,
    vrf_key: &SigningKeypair,
    differentiator: bool,
    epoch: u64,
) -> VrfOutput {
    let content_hash = calculate_content_hash(relay_data);
    let message = vrf_message(
        &query_hash(relay_data),
        &all_data_hash(reply, &content_hash),
        epoch,
        differentiator,
    );
    vrf_prove(vrf_key, &message)
}

/// Collapse the VRF evaluations into the set of pairing indices to audit.
///
/// When both evaluations land on the same index the one with the `true`
/// differentiator wins, so the kept proof stays unambiguous.
pub fn threshold_to_session(
    outputs: &[VrfOutput],
    differentiators: &[bool],
    threshold: u32,
    providers_count: u32,
) -> BTreeMap<u64, bool> {
    let mut indexes = BTreeMap::new();
    for (output, differentiator) in outputs.iter().zip(differentiators.iter()) {
        if let Some(index) = vrf_value_to_index(output, providers_count, threshold) {
            indexes
                .entry(index)
                .and_modify(|kept: &mut bool| *kept = *kept || *differentiator)
                .or_insert(*differentiator);
        }
    }
    indexes
}

/// Compare two relay results; a data mismatch yields a conflict record with
/// both signed exchanges.
pub fn compare_relays_find_conflict(
    result0: &RelayResult,
    result1: &RelayResult,
) -> Option<ResponseConflict> {
    let (reply0, reply1) = match (&result0.reply, &result1.reply) {
        (Some(reply0), Some(reply1)) => (reply0, reply1),
        _ => return None,
    };
    if reply0.data == reply1.data {
        return None;
    }
    warn!(
        provider0 = %result0.provider_address,
        provider1 = %result1.provider_address,
        "audit detected mismatching results, reporting"
    );
    Some(ResponseConflict {
        relay_data0: ConflictRelayData {
            request: result0.request.clone(),
            reply: reply0.clone(),
        },
        relay_data1: ConflictRelayData {
            request: result1.request.clone(),
            reply: reply1.clone(),
        },
    })
}

/// Compare the original result against every audit result.
///
/// Any original↔audit mismatch also triggers the audit↔audit comparisons, so
/// a dispute shows whether the auditors agree among themselves.
pub fn verify_reliability_results(
    original: &RelayResult,
    audit_results: &[RelayResult],
) -> Vec<ResponseConflict> {
    let mut conflicts = Vec::new();
    for audit_result in audit_results {
        if let Some(conflict) = compare_relays_find_conflict(original, audit_result) {
            conflicts.push(conflict);
        }
    }
    if !conflicts.is_empty() {
        for first in 0..audit_results.len() {
            for second in (first + 1)..audit_results.len() {
                if let Some(conflict) =
                    compare_relays_find_conflict(&audit_results[first], &audit_results[second])
                {
                    conflicts.push(conflict);
                }
            }
        }
    }
    conflicts
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaymesh_core::{RelayRequest, RelaySession};

    fn relay_data() -> RelayPrivateData {
        RelayPrivateData {
            connection_type: "POST".to_string(),
            api_url: "/block".to_string(),
            data: b"{\"height\": 94}".to_vec(),
            request_block: 94,
            api_interface: "rest".to_string(),
            salt: 1u64.to_le_bytes(),
        }
    }

    fn reply(data: &[u8]) -> RelayReply {
        RelayReply {
            data: data.to_vec(),
            sig: vec![],
            latest_block: 100,
            finalized_blocks_hashes: b"{}".to_vec(),
        }
    }

    fn result(provider: &str, data: &[u8]) -> RelayResult {
        RelayResult {
            request: RelayRequest {
                relay_data: relay_data(),
                relay_session: RelaySession {
                    spec_id: "NEAR1".to_string(),
                    content_hash: [0u8; 32],
                    session_id: 1,
                    cu_sum: 10,
                    provider: provider.to_string(),
                    relay_num: 1,
                    qos_report: None,
                    epoch: 7,
                    unresponsive_providers: b"[]".to_vec(),
                    relay_chain_id: "relaymesh-1".to_string(),
                    sig: vec![],
                },
                vrf_data: None,
            },
            reply: Some(reply(data)),
            provider_address: provider.to_string(),
            finalized: true,
        }
    }

    #[test]
    fn test_vrf_index_respects_threshold() {
        let vrf_key = SigningKeypair::generate();
        let output = vrf_prove(&vrf_key, b"message");

        // threshold of u32::MAX admits everything
        let index = vrf_value_to_index(&output, 5, u32::MAX).unwrap();
        assert!(index < 5);
        assert_eq!(index, u64::from(output.as_u32() % 5));

        // threshold 0 admits (almost) nothing
        if output.as_u32() > 0 {
            assert_eq!(vrf_value_to_index(&output, 5, 0), None);
        }
    }

    #[test]
    fn test_vrf_index_empty_pairing() {
        let vrf_key = SigningKeypair::generate();
        let output = vrf_prove(&vrf_key, b"message");
        assert_eq!(vrf_value_to_index(&output, 0, u32::MAX), None);
    }

    #[test]
    fn test_threshold_to_session_deterministic() {
        let vrf_key = SigningKeypair::generate();
        let data = relay_data();
        let reply = reply(b"result");

        let (v0, v1) = calculate_vrf_on_relay(&data, &reply, &vrf_key, 7);
        let first = threshold_to_session(&[v0.clone(), v1.clone()], &[false, true], u32::MAX, 10);
        let second = threshold_to_session(&[v0, v1], &[false, true], u32::MAX, 10);
        assert_eq!(first, second);
        assert!(!first.is_empty());
        assert!(first.len() <= SUPPORTED_VRFS);
    }

    #[test]
    fn test_threshold_to_session_dedupes_keeping_true() {
        let vrf_key = SigningKeypair::generate();
        let output = vrf_prove(&vrf_key, b"message");
        // same output twice: one pairing slot, differentiator true wins
        let indexes =
            threshold_to_session(&[output.clone(), output], &[false, true], u32::MAX, 1);
        assert_eq!(indexes.len(), 1);
        assert_eq!(indexes[&0], true);
    }

    #[test]
    fn test_matching_replies_yield_no_conflict() {
        let original = result("b", b"\xaa");
        let audit = result("a", b"\xaa");
        assert!(compare_relays_find_conflict(&original, &audit).is_none());
        assert!(verify_reliability_results(&original, &[audit]).is_empty());
    }

    #[test]
    fn test_single_audit_mismatch() {
        let original = result("b", b"\xaa");
        let audit = result("a", b"\xbb");

        let conflicts = verify_reliability_results(&original, &[audit]);
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].relay_data0.reply.data, b"\xaa");
        assert_eq!(conflicts[0].relay_data1.reply.data, b"\xbb");
    }

    #[test]
    fn test_agreeing_audits_skip_cross_conflict() {
        let original = result("b", b"\xaa");
        let audits = [result("a", b"\xbb"), result("c", b"\xbb")];

        let conflicts = verify_reliability_results(&original, &audits);
        // original↔a and original↔c, but no a↔c conflict
        assert_eq!(conflicts.len(), 2);
        assert!(conflicts
            .iter()
            .all(|conflict| conflict.relay_data0.reply.data == b"\xaa"));
    }

    #[test]
    fn test_disagreeing_audits_add_cross_conflict() {
        let original = result("b", b"\xaa");
        let audits = [result("a", b"\xbb"), result("c", b"\xcc")];

        let conflicts = verify_reliability_results(&original, &audits);
        // original↔a, original↔c, a↔c
        assert_eq!(conflicts.len(), 3);
    }
}
