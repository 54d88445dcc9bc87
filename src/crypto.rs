//! # Cryptographic Infrastructure
//!
//! Two independent mechanisms live here:
//!
//! - **Message signature chains**: every hop signs the message exactly as it
//!   received it, then appends its own `(signer, signature)` pair. The chain
//!   is simultaneously a tamper-evident path record and the hop counter.
//!   Verification peels entries from the tail, re-canonicalizing after each
//!   pop; the originator's signature is verified last and must match the
//!   message's `address`.
//! - **Session-description sealing**: offers and answers are encrypted to
//!   the recipient when a signing key is configured. X25519 ECDH between an
//!   ephemeral sender key and the recipient's Ed25519 key (mapped to its
//!   Montgomery form) derives a ChaCha20-Poly1305 key via BLAKE3.
//!
//! ## Canonical Form
//!
//! Signatures are computed over a canonical serialization: compact JSON with
//! keys sorted lexicographically at every level, including the signature
//! chain in whatever state it is in. `serde_json` with its default BTreeMap
//! backing produces exactly this ordering.
//!
//! ## Domain Separation
//!
//! SECURITY: Each signed or derived artifact uses a unique domain prefix so
//! signatures and keys cannot be replayed across contexts.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::montgomery::MontgomeryPoint;
use ed25519_dalek::Signature;
use ed25519_dalek::hazmat::ExpandedSecretKey;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::identity::{Address, Keypair, verify_raw};
use crate::wire::Message;

/// Domain separation prefix for message chain signatures.
pub const MESSAGE_SIGNATURE_DOMAIN: &[u8] = b"meshweave-message-v1:";

/// BLAKE3 key-derivation context for session-description sealing.
const SDP_SEAL_CONTEXT: &str = "meshweave sdp seal v1";

/// ChaCha20-Poly1305 nonce size in bytes.
const NONCE_SIZE: usize = 12;

// ============================================================================
// Canonical form
// ============================================================================

/// Canonical serialization of a message: compact JSON, sorted keys.
///
/// Field order of the Rust struct is irrelevant because the value passes
/// through `serde_json::Value`, whose object representation is a BTreeMap.
pub fn canonical_form(message: &Message) -> Vec<u8> {
    // A Message we hold always serializes; a formatter failure would mean
    // a broken serde impl, in which case an empty form fails verification
    // rather than panicking mid-gossip.
    serde_json::to_value(message)
        .and_then(|value| serde_json::to_vec(&value))
        .unwrap_or_default()
}

fn signing_input(message: &Message) -> Vec<u8> {
    let mut input = Vec::with_capacity(MESSAGE_SIGNATURE_DOMAIN.len() + 256);
    input.extend_from_slice(MESSAGE_SIGNATURE_DOMAIN);
    input.extend_from_slice(&canonical_form(message));
    input
}

// ============================================================================
// Signature chains
// ============================================================================

/// Error type for signature chain verification failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// Signing is enabled but the message carries no signatures.
    Missing,
    /// An entry's signature is not 64 hex-decodable bytes.
    Malformed { signer: Address },
    /// An entry failed cryptographic verification.
    Forged { signer: Address },
    /// The innermost signature was not produced by the message originator.
    OriginMismatch { expected: Address, actual: Address },
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::Missing => write!(f, "message carries no signatures"),
            ChainError::Malformed { signer } => {
                write!(f, "malformed signature from {signer}")
            }
            ChainError::Forged { signer } => {
                write!(f, "signature verification failed for {signer}")
            }
            ChainError::OriginMismatch { expected, actual } => {
                write!(f, "origin signature by {actual}, expected {expected}")
            }
        }
    }
}

impl std::error::Error for ChainError {}

/// Sign `message` as this hop received it and append our pair to the chain.
///
/// Unsigned networks append `(address, "")` so chain length still counts
/// hops.
pub fn append_hop_signature(message: &mut Message, address: &Address, keypair: Option<&Keypair>) {
    let signature = match keypair {
        Some(keypair) => hex::encode(keypair.sign(&signing_input(message)).to_bytes()),
        None => String::new(),
    };
    message.signatures.push(crate::wire::SignatureEntry {
        signer: address.clone(),
        signature,
    });
}

/// Verify the full signature chain of `message`.
///
/// Entries are peeled from the tail: each signature must verify against the
/// canonical form of the message with that entry (and all later ones)
/// removed. The first entry is verified last and its signer must equal the
/// message's originator address. The message is left untouched; peeling
/// happens on a working copy.
pub fn verify_chain(message: &Message) -> Result<(), ChainError> {
    if message.signatures.is_empty() {
        return Err(ChainError::Missing);
    }

    let mut scratch = message.clone();
    while let Some(entry) = scratch.signatures.pop() {
        let bytes = hex::decode(&entry.signature).map_err(|_| ChainError::Malformed {
            signer: entry.signer.clone(),
        })?;
        let bytes: [u8; 64] = bytes.try_into().map_err(|_| ChainError::Malformed {
            signer: entry.signer.clone(),
        })?;
        let signature = Signature::from_bytes(&bytes);
        if !verify_raw(&entry.signer, &signing_input(&scratch), &signature) {
            return Err(ChainError::Forged {
                signer: entry.signer,
            });
        }
        if scratch.signatures.is_empty() && entry.signer != message.address {
            return Err(ChainError::OriginMismatch {
                expected: message.address.clone(),
                actual: entry.signer,
            });
        }
    }
    Ok(())
}

// ============================================================================
// Session-description sealing
// ============================================================================

/// Error type for sealing and opening session descriptions.
#[derive(Debug)]
pub enum SealError {
    /// The recipient address is not a valid public key.
    UnknownRecipient(Address),
    /// The payload is not a well-formed sealed envelope.
    Envelope,
    /// AEAD encryption or decryption failed.
    CipherFailure,
}

impl std::fmt::Display for SealError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SealError::UnknownRecipient(address) => {
                write!(f, "recipient {address} is not a valid public key")
            }
            SealError::Envelope => write!(f, "payload is not a sealed envelope"),
            SealError::CipherFailure => write!(f, "authenticated decryption failed"),
        }
    }
}

impl std::error::Error for SealError {}

#[derive(Serialize, Deserialize)]
struct SealedEnvelope {
    eph: String,
    nonce: String,
    ct: String,
}

/// Seals session descriptions to their recipient and opens foreign ones.
///
/// Without a configured keypair both directions are the identity function;
/// the mesh then exchanges descriptions in the clear.
#[derive(Clone, Debug)]
pub struct SdpCipher {
    keypair: Option<Keypair>,
}

impl SdpCipher {
    pub fn new(keypair: Option<Keypair>) -> Self {
        Self { keypair }
    }

    pub fn enabled(&self) -> bool {
        self.keypair.is_some()
    }

    /// Encrypt `sdp` so only the holder of `recipient`'s secret can read it.
    pub fn seal(&self, recipient: &Address, sdp: &str) -> Result<String, SealError> {
        if self.keypair.is_none() {
            return Ok(sdp.to_string());
        }

        let recipient_key = recipient
            .verifying_key()
            .map_err(|_| SealError::UnknownRecipient(recipient.clone()))?;
        // The recipient's only published key is their Ed25519 address;
        // map its Edwards point onto the Montgomery curve so it can serve
        // as an X25519 public key.
        let recipient_mont = CompressedEdwardsY(recipient_key.to_bytes())
            .decompress()
            .ok_or_else(|| SealError::UnknownRecipient(recipient.clone()))?
            .to_montgomery()
            .to_bytes();

        let mut eph = [0u8; 32];
        OsRng.fill_bytes(&mut eph);
        let eph_pub = x25519_dalek::x25519(eph, x25519_dalek::X25519_BASEPOINT_BYTES);
        let shared = x25519_dalek::x25519(eph, recipient_mont);
        let key = blake3::derive_key(SDP_SEAL_CONTEXT, &shared);

        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let ct = cipher
            .encrypt(Nonce::from_slice(&nonce), sdp.as_bytes())
            .map_err(|_| SealError::CipherFailure)?;

        let envelope = SealedEnvelope {
            eph: hex::encode(eph_pub),
            nonce: hex::encode(nonce),
            ct: hex::encode(ct),
        };
        serde_json::to_string(&envelope).map_err(|_| SealError::CipherFailure)
    }

    /// Decrypt a session description sealed to our key.
    pub fn open(&self, sealed: &str) -> Result<String, SealError> {
        let Some(keypair) = &self.keypair else {
            return Ok(sealed.to_string());
        };

        let envelope: SealedEnvelope =
            serde_json::from_str(sealed).map_err(|_| SealError::Envelope)?;
        let eph: [u8; 32] = hex::decode(&envelope.eph)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or(SealError::Envelope)?;
        let nonce: [u8; NONCE_SIZE] = hex::decode(&envelope.nonce)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or(SealError::Envelope)?;
        let ct = hex::decode(&envelope.ct).map_err(|_| SealError::Envelope)?;

        // Same point the sender reached from the other side: our expanded
        // Ed25519 scalar times the sender's ephemeral X25519 public key.
        let expanded = ExpandedSecretKey::from(&keypair.signing_key().to_bytes());
        let shared = (MontgomeryPoint(eph) * expanded.scalar).to_bytes();
        let key = blake3::derive_key(SDP_SEAL_CONTEXT, &shared);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ct.as_slice())
            .map_err(|_| SealError::CipherFailure)?;
        String::from_utf8(plaintext).map_err(|_| SealError::CipherFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::fresh_hex_id;

    fn unsigned_message(address: &Address) -> Message {
        Message {
            id: fresh_hex_id(),
            address: address.clone(),
            app_id: "app".to_string(),
            ttl: 6,
            kind: "text".to_string(),
            destination: Address::wildcard(),
            data: serde_json::json!({"n": 1}),
            signatures: Vec::new(),
        }
    }

    #[test]
    fn canonical_form_sorts_keys() {
        let keypair = Keypair::generate();
        let form = canonical_form(&unsigned_message(&keypair.address()));
        let text = String::from_utf8(form).unwrap();
        let app_id = text.find("\"appId\"").unwrap();
        let destination = text.find("\"destination\"").unwrap();
        let ttl = text.find("\"ttl\"").unwrap();
        assert!(app_id < destination && destination < ttl);
        assert!(!text.contains(": "), "canonical form must be compact");
    }

    #[test]
    fn chain_survives_multiple_hops() {
        let origin = Keypair::generate();
        let hop_b = Keypair::generate();
        let hop_c = Keypair::generate();

        let mut message = unsigned_message(&origin.address());
        append_hop_signature(&mut message, &origin.address(), Some(&origin));
        append_hop_signature(&mut message, &hop_b.address(), Some(&hop_b));
        append_hop_signature(&mut message, &hop_c.address(), Some(&hop_c));

        assert_eq!(message.signatures.len(), 3);
        verify_chain(&message).unwrap();
    }

    #[test]
    fn tampering_any_covered_field_breaks_the_chain() {
        let origin = Keypair::generate();
        let hop = Keypair::generate();
        let mut message = unsigned_message(&origin.address());
        append_hop_signature(&mut message, &origin.address(), Some(&origin));
        append_hop_signature(&mut message, &hop.address(), Some(&hop));

        let mut tampered = message.clone();
        tampered.data = serde_json::json!({"n": 2});
        assert!(matches!(
            verify_chain(&tampered),
            Err(ChainError::Forged { .. })
        ));

        let mut tampered = message.clone();
        tampered.ttl = 3;
        assert!(verify_chain(&tampered).is_err());

        let mut tampered = message;
        tampered.destination = Address::new("elsewhere");
        assert!(verify_chain(&tampered).is_err());
    }

    #[test]
    fn origin_must_sign_first() {
        let origin = Keypair::generate();
        let impostor = Keypair::generate();
        let mut message = unsigned_message(&origin.address());
        // First entry signed by someone other than message.address.
        append_hop_signature(&mut message, &impostor.address(), Some(&impostor));
        assert!(matches!(
            verify_chain(&message),
            Err(ChainError::OriginMismatch { .. })
        ));
    }

    #[test]
    fn empty_chain_is_missing() {
        let origin = Keypair::generate();
        let message = unsigned_message(&origin.address());
        assert_eq!(verify_chain(&message), Err(ChainError::Missing));
    }

    #[test]
    fn bogus_signature_entry_is_malformed_or_forged() {
        let origin = Keypair::generate();
        let mut message = unsigned_message(&origin.address());
        message.signatures.push(crate::wire::SignatureEntry {
            signer: Address::new("bogus"),
            signature: "123".to_string(),
        });
        assert!(verify_chain(&message).is_err());
    }

    #[test]
    fn sealed_sdp_round_trips() {
        let sender = Keypair::generate();
        let recipient = Keypair::generate();
        let sealing = SdpCipher::new(Some(sender));
        let opening = SdpCipher::new(Some(recipient.clone()));

        let sealed = sealing.seal(&recipient.address(), "v=0 candidate").unwrap();
        assert_ne!(sealed, "v=0 candidate");
        assert_eq!(opening.open(&sealed).unwrap(), "v=0 candidate");
    }

    #[test]
    fn wrong_recipient_cannot_open() {
        let sender = Keypair::generate();
        let recipient = Keypair::generate();
        let bystander = Keypair::generate();
        let sealed = SdpCipher::new(Some(sender))
            .seal(&recipient.address(), "secret sdp")
            .unwrap();
        assert!(SdpCipher::new(Some(bystander)).open(&sealed).is_err());
    }

    #[test]
    fn unsigned_cipher_is_identity() {
        let cipher = SdpCipher::new(None);
        assert_eq!(cipher.seal(&Address::new("x"), "plain").unwrap(), "plain");
        assert_eq!(cipher.open("plain").unwrap(), "plain");
    }
}
