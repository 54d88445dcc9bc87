//! # Identity Primitives
//!
//! This module defines the identity types used throughout Meshweave:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`Address`]: the node's identifier on the mesh
//!
//! ## Identity Model
//!
//! A mesh can run in two modes:
//!
//! - **Signed**: the address is the hex-encoded 32-byte Ed25519 public key.
//!   Possession of the secret key proves ownership of the address, and every
//!   message carries a per-hop signature chain.
//! - **Unsigned**: the address is an arbitrary string chosen by the user.
//!   Uniqueness is then the user's responsibility and messages travel with
//!   empty signature slots that only count hops.
//!
//! Addresses are compared as plain byte strings in both modes.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Destination value addressing every node on the network.
pub const WILDCARD: &str = "*";

/// Returns current time as milliseconds since Unix epoch.
/// Used for timestamp generation in negotiation records.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// Address
// ============================================================================

/// An opaque node identifier: a hex public key under signing, an arbitrary
/// string otherwise. Equality and hashing are byte-string comparisons.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The broadcast destination matching every node.
    pub fn wildcard() -> Self {
        Self(WILDCARD.to_string())
    }

    pub fn is_wildcard(&self) -> bool {
        self.0 == WILDCARD
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode the address as a signing public key.
    ///
    /// Only meaningful on a signed network; on an unsigned network addresses
    /// are free-form strings and this returns an error.
    pub fn verifying_key(&self) -> Result<VerifyingKey, KeyError> {
        let bytes = hex::decode(&self.0).map_err(|_| KeyError::InvalidHex)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidLength)?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| KeyError::InvalidPoint)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Address {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ============================================================================
// Keypair
// ============================================================================

/// Error type for secret-key material that cannot be turned into a keypair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyError {
    /// The input is not valid hex.
    InvalidHex,
    /// The decoded input is not exactly 32 bytes.
    InvalidLength,
    /// The bytes do not describe a valid Ed25519 point.
    InvalidPoint,
}

impl std::fmt::Display for KeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyError::InvalidHex => write!(f, "key material is not valid hex"),
            KeyError::InvalidLength => write!(f, "key material must be exactly 32 bytes"),
            KeyError::InvalidPoint => write!(f, "bytes are not a valid Ed25519 key"),
        }
    }
}

impl std::error::Error for KeyError {}

/// Ed25519 signing keypair. The hex-encoded public key doubles as the
/// node's [`Address`] on a signed network.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore a keypair from a 64-character hex secret.
    ///
    /// This is the constructor used when a node is handed a `secret` at
    /// build time; a node restarted with the same secret reclaims the same
    /// address on the mesh.
    pub fn from_secret_hex(secret: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(secret).map_err(|_| KeyError::InvalidHex)?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| KeyError::InvalidLength)?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&bytes),
        })
    }

    /// Hex encoding of the secret seed, for persistence across restarts.
    pub fn to_secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// The node address derived from this keypair: the hex public key.
    pub fn address(&self) -> Address {
        Address::new(hex::encode(self.signing_key.verifying_key().to_bytes()))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub(crate) fn sign(&self, data: &[u8]) -> Signature {
        self.signing_key.sign(data)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// Verify `signature` over `data` against the Ed25519 key behind `signer`.
pub(crate) fn verify_raw(signer: &Address, data: &[u8], signature: &Signature) -> bool {
    match signer.verifying_key() {
        Ok(key) => key.verify(data, signature).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypair_round_trips_through_secret_hex() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_secret_hex(&keypair.to_secret_hex()).unwrap();
        assert_eq!(keypair.address(), restored.address());
    }

    #[test]
    fn address_is_64_hex_chars() {
        let address = Keypair::generate().address();
        assert_eq!(address.as_str().len(), 64);
        assert!(address.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn bad_secrets_are_rejected() {
        assert_eq!(
            Keypair::from_secret_hex("zz").unwrap_err(),
            KeyError::InvalidHex
        );
        assert_eq!(
            Keypair::from_secret_hex("abcd").unwrap_err(),
            KeyError::InvalidLength
        );
    }

    #[test]
    fn wildcard_matches_only_itself() {
        assert!(Address::wildcard().is_wildcard());
        assert!(!Address::new("node-a").is_wildcard());
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let keypair = Keypair::generate();
        let sig = keypair.sign(b"payload");
        assert!(verify_raw(&keypair.address(), b"payload", &sig));
        assert!(!verify_raw(&keypair.address(), b"other", &sig));
    }
}
