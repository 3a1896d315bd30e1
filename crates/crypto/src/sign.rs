//! Relay signing and content hashing
//!
//! The consumer signs the deterministic serialization of each relay session
//! (and, for audits, the VRF metadata); providers sign their replies over
//! `data ‖ latest_block ‖ finalized_blocks_hashes`. Serialization is
//! length-prefixed so no two field layouts collide.

use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use relaymesh_core::{RelayPrivateData, RelayReply, RelaySession, VrfData};

use crate::keys::SigningKeypair;

/// ed25519 signature length in bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// Sign data with a signing keypair
pub fn sign_data(keypair: &SigningKeypair, data: &[u8]) -> [u8; 64] {
    let signature: Signature = keypair.signing_key.sign(data);
    signature.to_bytes()
}

/// Verify a signature
pub fn verify_signature(pubkey: &[u8; 32], data: &[u8], signature: &[u8]) -> bool {
    let verifying_key = match VerifyingKey::from_bytes(pubkey) {
        Ok(vk) => vk,
        Err(_) => return false,
    };

    let signature_bytes: [u8; 64] = match signature.try_into() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    verifying_key
        .verify(data, &Signature::from_bytes(&signature_bytes))
        .is_ok()
}

fn push_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn push_str(buf: &mut Vec<u8>, s: &str) {
    push_bytes(buf, s.as_bytes());
}

/// Content hash binding a relay session to its exact payload, salt included.
pub fn calculate_content_hash(data: &RelayPrivateData) -> [u8; 32] {
    let mut buf = Vec::new();
    push_str(&mut buf, &data.connection_type);
    push_str(&mut buf, &data.api_url);
    push_bytes(&mut buf, &data.data);
    buf.extend_from_slice(&data.request_block.to_le_bytes());
    push_str(&mut buf, &data.api_interface);
    buf.extend_from_slice(&data.salt);
    Sha256::digest(&buf).into()
}

/// Hash of the query alone (salt excluded), carried in audit metadata so a
/// dispute can match the audited query without the per-request nonce.
pub fn query_hash(data: &RelayPrivateData) -> Vec<u8> {
    let mut buf = Vec::new();
    push_str(&mut buf, &data.connection_type);
    push_str(&mut buf, &data.api_url);
    push_bytes(&mut buf, &data.data);
    buf.extend_from_slice(&data.request_block.to_le_bytes());
    push_str(&mut buf, &data.api_interface);
    Sha256::digest(&buf).to_vec()
}

/// Hash binding the full (request, reply) exchange for audit metadata.
pub fn all_data_hash(reply: &RelayReply, content_hash: &[u8; 32]) -> Vec<u8> {
    let mut buf = Vec::new();
    push_bytes(&mut buf, &reply.data);
    buf.extend_from_slice(&reply.latest_block.to_le_bytes());
    push_bytes(&mut buf, &reply.finalized_blocks_hashes);
    buf.extend_from_slice(content_hash);
    Sha256::digest(&buf).to_vec()
}

fn session_signable_data(session: &RelaySession) -> Vec<u8> {
    let mut buf = Vec::new();
    push_str(&mut buf, &session.spec_id);
    buf.extend_from_slice(&session.content_hash);
    buf.extend_from_slice(&session.session_id.to_le_bytes());
    buf.extend_from_slice(&session.cu_sum.to_le_bytes());
    push_str(&mut buf, &session.provider);
    buf.extend_from_slice(&session.relay_num.to_le_bytes());
    match &session.qos_report {
        Some(report) => {
            buf.push(1);
            push_str(&mut buf, &report.availability);
            push_str(&mut buf, &report.latency);
            push_str(&mut buf, &report.sync);
        }
        None => buf.push(0),
    }
    buf.extend_from_slice(&session.epoch.to_le_bytes());
    push_bytes(&mut buf, &session.unresponsive_providers);
    push_str(&mut buf, &session.relay_chain_id);
    buf
}

/// Sign a relay session in place with the consumer key.
pub fn sign_relay_session(keypair: &SigningKeypair, session: &mut RelaySession) {
    session.sig.clear();
    let sig = sign_data(keypair, &session_signable_data(session));
    session.sig = sig.to_vec();
}

/// Verify a session signature against the consumer public key.
pub fn verify_session_signature(pubkey: &[u8; 32], session: &RelaySession) -> bool {
    let mut unsigned = session.clone();
    unsigned.sig.clear();
    verify_signature(pubkey, &session_signable_data(&unsigned), &session.sig)
}

/// What a provider signs when replying to a relay.
pub fn reply_signable_data(reply: &RelayReply) -> Vec<u8> {
    let mut buf = Vec::new();
    push_bytes(&mut buf, &reply.data);
    buf.extend_from_slice(&reply.latest_block.to_le_bytes());
    push_bytes(&mut buf, &reply.finalized_blocks_hashes);
    buf
}

/// Verify a provider's reply signature.
pub fn verify_reply_signature(provider_key: &[u8; 32], reply: &RelayReply) -> bool {
    verify_signature(provider_key, &reply_signable_data(reply), &reply.sig)
}

/// Deterministic serialization of audit metadata for the consumer signature.
pub fn vrf_data_signable(vrf_data: &VrfData) -> Vec<u8> {
    let mut buf = Vec::new();
    push_str(&mut buf, &vrf_data.chain_id);
    buf.extend_from_slice(&vrf_data.epoch.to_le_bytes());
    buf.push(vrf_data.differentiator as u8);
    push_bytes(&mut buf, &vrf_data.vrf_value);
    push_bytes(&mut buf, &vrf_data.vrf_proof);
    push_bytes(&mut buf, &vrf_data.provider_sig);
    push_bytes(&mut buf, &vrf_data.all_data_hash);
    push_bytes(&mut buf, &vrf_data.query_hash);
    buf
}

/// Sign audit metadata in place with the consumer key.
pub fn sign_vrf_data(keypair: &SigningKeypair, vrf_data: &mut VrfData) {
    vrf_data.sig.clear();
    let sig = sign_data(keypair, &vrf_data_signable(vrf_data));
    vrf_data.sig = sig.to_vec();
}
