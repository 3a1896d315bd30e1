//! Signing keypair management

use std::path::Path;

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;
use tracing::info;

use relaymesh_core::PublicKey;

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("failed to read keyfile: {0}")]
    Read(std::io::Error),

    #[error("failed to write keyfile: {0}")]
    Write(std::io::Error),

    #[error("invalid keyfile format: {0}")]
    InvalidFormat(String),

    #[error("failed to create directory: {0}")]
    CreateDir(std::io::Error),
}

/// An ed25519 signing keypair.
///
/// Used both as the consumer relay-signing key and as the VRF key; ed25519
/// signatures are deterministic (RFC 8032), which the VRF relies on.
#[derive(Clone)]
pub struct SigningKeypair {
    pub(crate) signing_key: SigningKey,
}

impl SigningKeypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild a keypair from its 32-byte secret.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> PublicKey {
        self.signing_key.verifying_key().to_bytes()
    }

    pub(crate) fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Hex rendering of the public key, used as the consumer's address.
    pub fn address(&self) -> String {
        hex::encode(self.public_key_bytes())
    }
}

impl std::fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeypair")
            .field("public_key", &self.address())
            .finish_non_exhaustive()
    }
}

/// Load a signing keypair from disk, or generate and persist a new one.
///
/// The keyfile holds the raw 32-byte secret key.
pub fn load_or_generate_signing_keypair(keyfile: &Path) -> Result<SigningKeypair, KeystoreError> {
    if let Some(parent) = keyfile.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(KeystoreError::CreateDir)?;
        }
    }

    if keyfile.exists() {
        let bytes = std::fs::read(keyfile).map_err(KeystoreError::Read)?;
        let key_bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeystoreError::InvalidFormat(format!("expected 32 bytes, got {}", bytes.len())))?;
        let keypair = SigningKeypair::from_secret_bytes(&key_bytes);
        info!("loaded signing keypair from {:?}", keyfile);
        return Ok(keypair);
    }

    let keypair = SigningKeypair::generate();
    std::fs::write(keyfile, keypair.secret_bytes()).map_err(KeystoreError::Write)?;
    info!("generated new signing keypair, saved to {:?}", keyfile);
    Ok(keypair)
}
