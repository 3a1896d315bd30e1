//! RelayMesh consumer cryptography
//!
//! Everything the consumer signs, hashes or proves:
//! - ed25519 signing keypairs (consumer relay key and VRF key)
//! - deterministic serialization and signing of relay sessions, replies and
//!   audit metadata
//! - the signature-based VRF gating cross-provider audits

mod keys;
mod sign;
mod vrf;

pub use keys::{load_or_generate_signing_keypair, KeystoreError, SigningKeypair};
pub use sign::{
    all_data_hash, calculate_content_hash, query_hash, reply_signable_data, sign_data,
    sign_relay_session, sign_vrf_data, verify_reply_signature, verify_session_signature,
    verify_signature, vrf_data_signable, SIGNATURE_LENGTH,
};
pub use vrf::{vrf_message, vrf_prove, vrf_verify, VrfOutput};
