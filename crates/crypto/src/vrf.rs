//! Signature-based VRF for audit sampling
//!
//! ed25519 signatures are deterministic, so `proof = sign(sk, message)` and
//! `value = SHA-256(proof)` form a verifiable random function: the output is
//! fixed by `(sk, message)`, unpredictable to anyone without `sk`, and anyone
//! holding the public key can re-check both the proof and the value. Disputes
//! can therefore re-derive exactly which pairing indices an audit was
//! entitled to query.

use sha2::{Digest, Sha256};

use crate::keys::SigningKeypair;
use crate::sign::{sign_data, verify_signature};

/// A VRF evaluation: the pseudorandom value and the proof it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrfOutput {
    pub value: [u8; 32],
    pub proof: [u8; 64],
}

impl VrfOutput {
    /// First 4 bytes of the value as a little-endian u32, the quantity
    /// compared against the audit threshold.
    pub fn as_u32(&self) -> u32 {
        u32::from_le_bytes([self.value[0], self.value[1], self.value[2], self.value[3]])
    }
}

/// The message a relay audit VRF is evaluated over.
///
/// Binds the query, the exact reply under audit, the pairing epoch and the
/// differentiator distinguishing the two audit slots.
pub fn vrf_message(
    query_hash: &[u8],
    all_data_hash: &[u8],
    epoch: u64,
    differentiator: bool,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(query_hash.len() + all_data_hash.len() + 9);
    buf.extend_from_slice(query_hash);
    buf.extend_from_slice(all_data_hash);
    buf.extend_from_slice(&epoch.to_le_bytes());
    buf.push(differentiator as u8);
    buf
}

/// Evaluate the VRF over `message` with the consumer VRF key.
pub fn vrf_prove(keypair: &SigningKeypair, message: &[u8]) -> VrfOutput {
    let proof = sign_data(keypair, message);
    let value: [u8; 32] = Sha256::digest(proof).into();
    VrfOutput { value, proof }
}

/// Publicly verify a VRF evaluation against the consumer's VRF public key.
pub fn vrf_verify(pubkey: &[u8; 32], message: &[u8], output: &VrfOutput) -> bool {
    if !verify_signature(pubkey, message, &output.proof) {
        return false;
    }
    let expected: [u8; 32] = Sha256::digest(output.proof).into();
    expected == output.value
}
