//! # Wire Protocol Types
//!
//! This module defines every serializable shape that crosses a process
//! boundary. All of them travel as camelCase JSON:
//!
//! | Shape | Carried over | Purpose |
//! |-------|--------------|---------|
//! | [`Message`] | peer data channels | application + control gossip |
//! | [`Negotiation`] | switchboard and gossip | session-description exchange |
//! | [`SwitchboardRequest`] / [`SwitchboardResponse`] | HTTP rendezvous | bootstrap discovery |
//!
//! ## Size Limits
//!
//! Inbound frames are decoded through [`decode_message`], which enforces
//! [`MAX_WIRE_MESSAGE_SIZE`] before parsing. Implementations must accept
//! messages up to at least 64 KiB; anything larger is dropped.
//!
//! ## Control Namespace
//!
//! The reserved `appId` value [`NETWORK_APP_ID`] selects control messages.
//! Their `type` is one of `presence`, `offer`, `answer`, `log`; the control
//! payload rides in `data`.

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::identity::Address;

/// Maximum accepted size of one inbound data-channel frame (64 KiB).
pub const MAX_WIRE_MESSAGE_SIZE: usize = 64 * 1024;

/// Reserved application namespace for mesh control messages.
pub const NETWORK_APP_ID: &str = "network";

/// Control message types under [`NETWORK_APP_ID`].
pub const TYPE_PRESENCE: &str = "presence";
pub const TYPE_OFFER: &str = "offer";
pub const TYPE_ANSWER: &str = "answer";
pub const TYPE_LOG: &str = "log";

/// Maximum hop count a message may request.
pub const MESSAGE_TTL_MAX: u8 = 6;

/// Generate a fresh 128-bit hex identifier (message and connection ids).
pub fn fresh_hex_id() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ============================================================================
// Messages
// ============================================================================

/// One hop's signature over the message as that hop received it.
///
/// On an unsigned network the `signature` field is the empty string and the
/// entry exists purely to count hops.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEntry {
    pub signer: Address,
    pub signature: String,
}

/// An application or control message as it travels the mesh.
///
/// The hop counter is the *length of the signature chain*, not a mutable
/// field: `ttl` is covered by every signature in the chain, so decrementing
/// it mid-flight would invalidate them. A message keeps being rebroadcast
/// while `signatures.len() < ttl`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    /// Originator address.
    pub address: Address,
    pub app_id: String,
    /// Maximum hop count, in `[0, 6]`.
    pub ttl: u8,
    #[serde(rename = "type")]
    pub kind: String,
    /// A concrete [`Address`] or the wildcard `"*"`.
    pub destination: Address,
    /// Opaque payload; control shape for control types.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Ordered per-hop chain; the originator's entry is first.
    #[serde(default)]
    pub signatures: Vec<SignatureEntry>,
}

impl Message {
    /// Whether this message belongs to the reserved control namespace.
    pub fn is_control(&self) -> bool {
        self.app_id == NETWORK_APP_ID
    }

    /// Whether `local` should dispatch this message.
    pub fn addressed_to(&self, local: &Address) -> bool {
        self.destination.is_wildcard() || &self.destination == local
    }
}

/// Error type for inbound frames that cannot become a [`Message`].
#[derive(Debug)]
pub enum WireError {
    /// Frame exceeds [`MAX_WIRE_MESSAGE_SIZE`].
    Oversize { len: usize },
    /// Frame is not valid UTF-8 JSON of the message shape.
    Malformed(serde_json::Error),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::Oversize { len } => {
                write!(f, "frame of {len} bytes exceeds {MAX_WIRE_MESSAGE_SIZE} byte limit")
            }
            WireError::Malformed(e) => write!(f, "malformed message frame: {e}"),
        }
    }
}

impl std::error::Error for WireError {}

/// Decode one inbound data-channel frame, enforcing the size limit first.
pub fn decode_message(bytes: &[u8]) -> Result<Message, WireError> {
    if bytes.len() > MAX_WIRE_MESSAGE_SIZE {
        return Err(WireError::Oversize { len: bytes.len() });
    }
    serde_json::from_slice(bytes).map_err(WireError::Malformed)
}

/// Serialize a message for transmission. Serialization of a message we
/// built ourselves cannot fail; the caller treats an error as a dropped
/// frame rather than a panic.
pub fn encode_message(message: &Message) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

// ============================================================================
// Negotiations
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationKind {
    Offer,
    Answer,
}

impl std::fmt::Display for NegotiationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NegotiationKind::Offer => f.write_str("offer"),
            NegotiationKind::Answer => f.write_str("answer"),
        }
    }
}

/// A session-description payload exchanged to establish one connection.
///
/// `sdp` is `None` while the record is pending (the local transport has not
/// produced its description yet). `connection_id` is always the *initiator's*
/// connection id, so an answer can be routed back to the offer that caused it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Negotiation {
    #[serde(rename = "type")]
    pub kind: NegotiationKind,
    /// Originator of this record.
    pub address: Address,
    pub sdp: Option<String>,
    pub connection_id: String,
    pub network_id: String,
    /// Milliseconds since Unix epoch.
    pub timestamp: u64,
}

// ============================================================================
// Switchboard exchange
// ============================================================================

/// One routed negotiation: `negotiation` travels from `from` to `recipient`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationItem {
    #[serde(rename = "for")]
    pub recipient: Address,
    pub from: Address,
    pub negotiation: Negotiation,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchboardRequest {
    pub network_id: String,
    pub address: Address,
    #[serde(default)]
    pub negotiation_items: Vec<NegotiationItem>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchboardResponse {
    #[serde(default)]
    pub addresses: Vec<Address>,
    #[serde(default)]
    pub negotiation_items: Vec<NegotiationItem>,
}

// ============================================================================
// Control payloads
// ============================================================================

/// `data` shape of a `presence` control broadcast.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PresenceData {
    pub address: Address,
}

/// `data` shape of a `log` control message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogData {
    pub message: String,
}
