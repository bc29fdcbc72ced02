//! Live-source identity: Ed25519 keys that sign munro hashes (RFC 7574 §6.1).
//! For live swarms the swarm ID is the source's public key.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::bin::Bin;
use crate::protocol::SwarmId;

/// Source public key (32 bytes, Ed25519).
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SourceKey([u8; 32]);

impl SourceKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a swarm ID as a source key. `None` if it isn't 32 bytes or not a valid point.
    pub fn from_swarm_id(id: &SwarmId) -> Option<Self> {
        let bytes: [u8; 32] = id.as_bytes().try_into().ok()?;
        VerifyingKey::from_bytes(&bytes).ok()?;
        Some(SourceKey(bytes))
    }

    pub fn swarm_id(&self) -> SwarmId {
        SwarmId(self.0.to_vec())
    }

    /// Check a munro signature.
    pub fn verify(&self, bin: Bin, timestamp: u64, hash: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(&signed_bytes(bin, timestamp, hash), &sig).is_ok()
    }
}

/// Ed25519 signing key of a live source. Keep the secret private; expose only the public key.
pub struct SourceKeypair {
    secret: SigningKey,
    public: SourceKey,
}

impl SourceKeypair {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(secret))
    }

    fn from_signing_key(secret: SigningKey) -> Self {
        let public = SourceKey(secret.verifying_key().to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> &SourceKey {
        &self.public
    }

    pub fn swarm_id(&self) -> SwarmId {
        self.public.swarm_id()
    }

    pub fn sign(&self, bin: Bin, timestamp: u64, hash: &[u8]) -> Vec<u8> {
        self.secret
            .sign(&signed_bytes(bin, timestamp, hash))
            .to_bytes()
            .to_vec()
    }
}

/// Bytes covered by a munro signature: bin and timestamp as 64-bit big-endian, then the hash.
fn signed_bytes(bin: Bin, timestamp: u64, hash: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + hash.len());
    out.extend_from_slice(&bin.raw().to_be_bytes());
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.extend_from_slice(hash);
    out
}
