//! # Gossip Engine
//!
//! The broadcast domain: every message fans out to all currently-Connected
//! peers, every receiver deduplicates, verifies, dispatches and forwards.
//!
//! ## Ingest Pipeline
//!
//! Inbound frames run through a fixed pipeline:
//!
//! 1. decode (malformed frames are dropped, the sender is *not* punished)
//! 2. duplicate suppression by message id
//! 3. rate accounting; a rude sender is expelled instead of processed
//! 4. destination gate: a message for someone else is still forwarded,
//!    but not verified or dispatched here
//! 5. signature chain verification (signed networks only)
//! 6. control dispatch for the `network` namespace
//! 7. hop-limited rebroadcast
//! 8. delivery to the embedding application
//!
//! ## Hop Counting
//!
//! The signature chain doubles as the hop counter: each hop signs the
//! message exactly as received and appends its own entry, so
//! `signatures.len()` is the number of hops taken (the originator counts as
//! the first). A message keeps being forwarded while the chain is shorter
//! than its `ttl`; `ttl` itself is never mutated because every signature
//! covers it. A message originated with `ttl = 0` is therefore signed,
//! offered to current peers, and never forwarded by anyone; that shape is
//! deliberate.

use anyhow::bail;
use tracing::{debug, info, trace};

use crate::connection::{ConnEffect, ConnectionId, ConnectionManager, NegotiationPath};
use crate::crypto::{append_hop_signature, verify_chain};
use crate::identity::{Address, Keypair};
use crate::negotiate;
use crate::node::{EventSink, NodeEvent};
use crate::rude::RudeList;
use crate::seen::SeenMemory;
use crate::transport::Transport;
use crate::wire::{
    LogData, MESSAGE_TTL_MAX, Message, NETWORK_APP_ID, Negotiation, NegotiationKind, PresenceData,
    TYPE_ANSWER, TYPE_LOG, TYPE_OFFER, TYPE_PRESENCE, decode_message, encode_message,
    fresh_hex_id,
};

// ============================================================================
// Drafts
// ============================================================================

/// A partially specified outbound message. `app_id` and `kind` are the
/// caller's contract; everything else is defaulted at broadcast time
/// (fresh id, our address, `ttl = 6`, wildcard destination, empty chain).
#[derive(Clone, Debug, Default)]
pub struct Draft {
    pub app_id: Option<String>,
    pub kind: Option<String>,
    pub destination: Option<Address>,
    pub ttl: Option<u8>,
    pub data: serde_json::Value,
}

impl Draft {
    pub fn new(app_id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            app_id: Some(app_id.into()),
            kind: Some(kind.into()),
            ..Self::default()
        }
    }

    pub fn destination(mut self, destination: Address) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub(crate) fn presence(address: &Address) -> Self {
        Self::new(NETWORK_APP_ID, TYPE_PRESENCE).data(serde_json::json!({
            "address": address,
        }))
    }

    pub(crate) fn log(destination: Address, text: &str) -> Self {
        Self::new(NETWORK_APP_ID, TYPE_LOG)
            .destination(destination)
            .data(serde_json::json!({ "message": text }))
    }

    pub(crate) fn negotiation(kind: &str, destination: Address, record: &Negotiation) -> Self {
        let data = serde_json::to_value(record).unwrap_or(serde_json::Value::Null);
        Self::new(NETWORK_APP_ID, kind)
            .destination(destination)
            .data(data)
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct GossipEngine {
    address: Address,
    keypair: Option<Keypair>,
    seen: SeenMemory,
}

impl GossipEngine {
    pub fn new(address: Address, keypair: Option<Keypair>) -> Self {
        Self {
            address,
            keypair,
            seen: SeenMemory::new(),
        }
    }

    pub fn signing(&self) -> bool {
        self.keypair.is_some()
    }

    /// Evict expired entries from the duplicate-suppression memory.
    pub fn sweep_seen(&mut self) {
        self.seen.sweep();
    }

    #[cfg(test)]
    pub(crate) fn seen_len(&self) -> usize {
        self.seen.len()
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Stamp, sign, memoize and fan out a locally originated message.
    ///
    /// Missing `app_id` or `kind` is a contract violation reported to the
    /// caller; nothing else fails the call.
    pub fn broadcast(
        &mut self,
        draft: Draft,
        connections: &ConnectionManager,
        events: &EventSink,
    ) -> anyhow::Result<Message> {
        let Some(app_id) = draft.app_id else {
            bail!("broadcast requires app_id");
        };
        let Some(kind) = draft.kind else {
            bail!("broadcast requires type");
        };

        let mut message = Message {
            id: fresh_hex_id(),
            address: self.address.clone(),
            app_id,
            ttl: draft.ttl.unwrap_or(MESSAGE_TTL_MAX).min(MESSAGE_TTL_MAX),
            kind,
            destination: draft.destination.unwrap_or_else(Address::wildcard),
            data: draft.data,
            signatures: Vec::new(),
        };
        append_hop_signature(&mut message, &self.address, self.keypair.as_ref());

        // The id is memoized before any I/O, so our own message coming home
        // through the mesh is always recognized.
        self.seen.add(&message.id);
        self.transmit(&message, connections);
        events.emit(NodeEvent::BroadcastMessage(message.clone()));
        Ok(message)
    }

    /// Serialize once and send to every active peer; non-Connected peers
    /// are skipped silently.
    fn transmit(&self, message: &Message, connections: &ConnectionManager) {
        let bytes = match encode_message(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(id = %message.id, error = %e, "dropping unencodable message");
                return;
            }
        };
        for connection in connections.active() {
            if let Err(e) = connection.transport.send(&bytes) {
                trace!(connection = %connection.id(), error = %e, "send failed");
            }
        }
    }

    fn maybe_rebroadcast(
        &mut self,
        message: &Message,
        connections: &ConnectionManager,
        events: &EventSink,
    ) {
        // A foreign ttl above the protocol maximum buys no extra hops.
        let limit = message.ttl.min(MESSAGE_TTL_MAX) as usize;
        if message.signatures.len() >= limit {
            return;
        }
        let mut forwarded = message.clone();
        append_hop_signature(&mut forwarded, &self.address, self.keypair.as_ref());
        self.transmit(&forwarded, connections);
        events.emit(NodeEvent::BroadcastMessage(forwarded));
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Run one inbound frame through the ingest pipeline.
    ///
    /// Returned effects stem from connections created or destroyed by
    /// control dispatch; the owning actor routes them.
    pub fn ingest(
        &mut self,
        bytes: &[u8],
        connections: &mut ConnectionManager,
        rude: &mut RudeList,
        events: &EventSink,
    ) -> Vec<ConnEffect> {
        let message = match decode_message(bytes) {
            Ok(message) => message,
            Err(e) => {
                trace!(error = %e, "dropping undecodable frame");
                return Vec::new();
            }
        };

        if self.seen.has(&message.id) {
            return Vec::new();
        }
        self.seen.add(&message.id);

        // Rate accounting counts distinct messages, not mesh fan-in: a
        // popular originator must not look rude just because five peers
        // forwarded the same broadcast.
        rude.register(&message.address);
        if rude.is_rude(&message.address) {
            return self.expel(&message.address, connections, events);
        }

        // Not for us: forward without inspecting. Verification is the
        // destination's business.
        if !message.addressed_to(&self.address) {
            self.maybe_rebroadcast(&message, connections, events);
            return Vec::new();
        }

        if self.signing()
            && let Err(e) = verify_chain(&message)
        {
            events.emit(NodeEvent::BadMessage {
                address: message.address.clone(),
                reason: e.to_string(),
            });
            return Vec::new();
        }

        let effects = if message.is_control() {
            self.dispatch_control(&message, connections, rude)
        } else {
            Vec::new()
        };

        self.maybe_rebroadcast(&message, connections, events);
        events.emit(NodeEvent::Message(message));
        effects
    }

    fn dispatch_control(
        &mut self,
        message: &Message,
        connections: &mut ConnectionManager,
        rude: &mut RudeList,
    ) -> Vec<ConnEffect> {
        match message.kind.as_str() {
            TYPE_PRESENCE => {
                let Ok(data) = serde_json::from_value::<PresenceData>(message.data.clone()) else {
                    trace!("presence without an address, dropped");
                    return Vec::new();
                };
                if negotiate::presence_warrants_dial(&data.address, &self.address, connections, rude)
                {
                    let (_, effects) =
                        connections.ensure_initiator(&data.address, NegotiationPath::Gossip);
                    return effects;
                }
            }
            TYPE_OFFER => {
                let Ok(offer) = serde_json::from_value::<Negotiation>(message.data.clone()) else {
                    trace!("offer control without a negotiation record, dropped");
                    return Vec::new();
                };
                if offer.kind != NegotiationKind::Offer {
                    return Vec::new();
                }
                match negotiate::evaluate_offer(&offer, &self.address, connections, rude) {
                    Ok(()) => match connections.accept_offer(&offer, NegotiationPath::Gossip) {
                        Ok((_, effects)) => return effects,
                        Err(e) => debug!(from = %offer.address, error = %e, "offer not built"),
                    },
                    Err(reason) => trace!(from = %offer.address, %reason, "offer refused"),
                }
            }
            TYPE_ANSWER => {
                let Ok(answer) = serde_json::from_value::<Negotiation>(message.data.clone()) else {
                    trace!("answer control without a negotiation record, dropped");
                    return Vec::new();
                };
                if answer.kind != NegotiationKind::Answer {
                    return Vec::new();
                }
                negotiate::apply_answer(&answer, &self.address, connections);
            }
            TYPE_LOG => {
                let text = serde_json::from_value::<LogData>(message.data.clone())
                    .map(|d| d.message)
                    .unwrap_or_else(|_| message.data.to_string());
                info!(target: "meshweave::peer_log", from = %message.address, "{text}");
            }
            other => trace!(kind = other, "unknown control type, dropped"),
        }
        Vec::new()
    }

    /// Cut a rude sender off: one final `log` to them, then every
    /// connection to their address is destroyed.
    fn expel(
        &mut self,
        address: &Address,
        connections: &mut ConnectionManager,
        events: &EventSink,
    ) -> Vec<ConnEffect> {
        if !connections.any_to(address) {
            return Vec::new();
        }
        debug!(%address, "sender exceeded message rate, disconnecting");
        let farewell = Draft::log(address.clone(), "message rate exceeded, disconnecting");
        if let Err(e) = self.broadcast(farewell, connections, events) {
            trace!(error = %e, "farewell log not sent");
        }

        let victims: Vec<ConnectionId> = connections
            .connections()
            .filter(|c| c.peer_address() == Some(address))
            .map(|c| c.id().clone())
            .collect();
        victims
            .into_iter()
            .flat_map(|id| connections.destroy(&id, None))
            .collect()
    }
}
