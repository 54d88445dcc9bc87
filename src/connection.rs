//! # Connection Lifecycle
//!
//! A [`Connection`] wraps one peer transport session together with its
//! negotiation history and walks the one-way state machine
//!
//! ```text
//! Pending ──[signal produced a description]──▶ Open
//! Open    ──[transport connect]─────────────▶ Connected
//! *       ──[transport close|error|destroy]─▶ Dead
//! ```
//!
//! The [`ConnectionManager`] owns every connection, keyed by id. Transport
//! callbacks never hold references into the manager; they carry the
//! connection id over a channel and the owning actor feeds them back through
//! [`ConnectionManager::handle_transport_event`], which returns
//! [`ConnEffect`]s for the actor to route. That id-and-lookup discipline is
//! what breaks the otherwise cyclic ownership between connections and the
//! manager.
//!
//! ## Uniqueness
//!
//! Per remote address at most one Connected connection survives: when a
//! transport connects, every other connection to the same address is
//! destroyed, and the periodic GC additionally collects duplicates that
//! never got that far.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::crypto::SdpCipher;
use crate::identity::{Address, now_ms};
use crate::transport::{SignalKind, Transport, TransportEvent, TransportEvents, TransportFactory};
use crate::wire::{Negotiation, NegotiationKind, fresh_hex_id};

// ============================================================================
// Connection
// ============================================================================

/// Locally generated 128-bit connection identifier, hex-encoded.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(fresh_hex_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionRole {
    Initiator,
    Responder,
}

/// States are strictly ordered; transitions only ever move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Pending,
    Open,
    Connected,
    Dead,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Pending => f.write_str("pending"),
            ConnectionState::Open => f.write_str("open"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Dead => f.write_str("dead"),
        }
    }
}

/// Which channel this connection's negotiation travels on. A ready offer or
/// answer is delivered back the way the negotiation came.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NegotiationPath {
    Switchboard,
    Gossip,
}

pub struct Connection {
    pub(crate) id: ConnectionId,
    pub(crate) role: ConnectionRole,
    pub(crate) state: ConnectionState,
    /// Far-end address. An initiator learns it only from the answer.
    pub(crate) remote_address: Option<Address>,
    /// The address an initiator dialed; used for dedup and sealing until
    /// the answer binds `remote_address`.
    pub(crate) intended: Option<Address>,
    pub(crate) offer: Negotiation,
    pub(crate) answer: Option<Negotiation>,
    pub(crate) origin: NegotiationPath,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) connected_at: Option<Instant>,
}

impl Connection {
    /// Best known far-end address: the bound remote, or the dial target.
    pub fn peer_address(&self) -> Option<&Address> {
        self.remote_address.as_ref().or(self.intended.as_ref())
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn offer(&self) -> &Negotiation {
        &self.offer
    }

    pub fn answer(&self) -> Option<&Negotiation> {
        self.answer.as_ref()
    }

    pub fn origin(&self) -> NegotiationPath {
        self.origin
    }

    /// A Connected connection whose transport agrees it is up.
    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Connected && self.transport.connected()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            role: self.role,
            state: self.state,
            address: self.peer_address().cloned(),
            active: self.is_active(),
        }
    }
}

/// Immutable snapshot of one connection, as handed to library consumers.
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub role: ConnectionRole,
    pub state: ConnectionState,
    pub address: Option<Address>,
    pub active: bool,
}

// ============================================================================
// Effects
// ============================================================================

/// What a batch of connection work produced, for the owning actor to route.
#[derive(Debug)]
pub enum ConnEffect {
    /// An initiator reached Open; its offer now carries a description.
    OfferReady(ConnectionId),
    /// A responder reached Open; its answer now carries a description.
    AnswerReady(ConnectionId),
    /// The transport connected; the connection is Connected.
    Established(ConnectionId),
    /// One inbound data frame.
    Inbound { id: ConnectionId, bytes: Vec<u8> },
    /// The connection is gone.
    Died {
        id: ConnectionId,
        address: Option<Address>,
        error: Option<String>,
    },
}

/// Error type for connection creation and signaling.
#[derive(Debug)]
pub enum ConnectError {
    /// The hard connection cap is reached.
    AtCapacity,
    /// The negotiation record carries no description.
    MissingSdp,
    /// The description could not be sealed or opened.
    Seal(crate::crypto::SealError),
    /// No connection with the referenced id exists.
    UnknownConnection,
    /// The referenced connection is not in a state this record applies to.
    NotApplicable,
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::AtCapacity => write!(f, "connection limit reached"),
            ConnectError::MissingSdp => write!(f, "negotiation carries no session description"),
            ConnectError::Seal(e) => write!(f, "session description sealing failed: {e}"),
            ConnectError::UnknownConnection => write!(f, "no connection with that id"),
            ConnectError::NotApplicable => write!(f, "connection not in an applicable state"),
        }
    }
}

impl std::error::Error for ConnectError {}

// ============================================================================
// ConnectionManager
// ============================================================================

pub struct ConnectionManager {
    connections: HashMap<ConnectionId, Connection>,
    network_id: String,
    address: Address,
    cipher: SdpCipher,
    factory: Arc<dyn TransportFactory>,
    events: TransportEvents,
    max_connections: usize,
}

impl ConnectionManager {
    pub fn new(
        network_id: String,
        address: Address,
        cipher: SdpCipher,
        factory: Arc<dyn TransportFactory>,
        events: TransportEvents,
        max_connections: usize,
    ) -> Self {
        Self {
            connections: HashMap::new(),
            network_id,
            address,
            cipher,
            factory,
            events,
            max_connections,
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get(&self, id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    /// Connections that are Connected with a live transport.
    pub fn active(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values().filter(|c| c.is_active())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active().count()
    }

    pub fn at_capacity(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    pub fn any_to(&self, address: &Address) -> bool {
        self.connections
            .values()
            .any(|c| c.peer_address() == Some(address))
    }

    pub fn connected_to(&self, address: &Address) -> bool {
        self.connections
            .values()
            .any(|c| c.state == ConnectionState::Connected && c.peer_address() == Some(address))
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Make sure an initiator toward `target` exists.
    ///
    /// If a Connected connection to `target` already exists this is a no-op;
    /// otherwise any in-progress duplicates are destroyed first and a fresh
    /// initiator is created. The offer description arrives later as an
    /// [`ConnEffect::OfferReady`].
    pub fn ensure_initiator(
        &mut self,
        target: &Address,
        origin: NegotiationPath,
    ) -> (Option<ConnectionId>, Vec<ConnEffect>) {
        if self.connected_to(target) {
            return (None, Vec::new());
        }
        let mut effects = self.destroy_duplicates_to(target, None);

        if self.at_capacity() {
            debug!(%target, "not dialing: connection limit reached");
            return (None, effects);
        }

        let id = ConnectionId::generate();
        let transport = self.factory.create(id.clone(), true, self.events.clone());
        let connection = Connection {
            id: id.clone(),
            role: ConnectionRole::Initiator,
            state: ConnectionState::Pending,
            remote_address: None,
            intended: Some(target.clone()),
            offer: Negotiation {
                kind: NegotiationKind::Offer,
                address: self.address.clone(),
                sdp: None,
                connection_id: id.as_str().to_string(),
                network_id: self.network_id.clone(),
                timestamp: now_ms(),
            },
            answer: None,
            origin,
            transport,
            connected_at: None,
        };
        trace!(id = %id, %target, "created initiator connection");
        self.connections.insert(id.clone(), connection);
        (Some(id), effects)
    }

    /// Build a responder around a foreign offer.
    ///
    /// The caller has already applied the acceptance policy; this enforces
    /// only the hard requirements (capacity, a present and openable
    /// description). An in-progress initiator of our own toward the same
    /// address is deliberately left alone: when two nodes dial each other
    /// simultaneously, both handshakes race and the loser is collected as a
    /// duplicate at connect time or by GC. Tearing it down here instead
    /// would strand both sides with answers that reference destroyed
    /// connections.
    pub fn accept_offer(
        &mut self,
        offer: &Negotiation,
        origin: NegotiationPath,
    ) -> Result<(ConnectionId, Vec<ConnEffect>), ConnectError> {
        let sealed = offer.sdp.as_deref().ok_or(ConnectError::MissingSdp)?;
        let opened = self.cipher.open(sealed).map_err(ConnectError::Seal)?;

        let effects = Vec::new();
        if self.at_capacity() {
            return Err(ConnectError::AtCapacity);
        }

        let id = ConnectionId::generate();
        let transport = self.factory.create(id.clone(), false, self.events.clone());
        let connection = Connection {
            id: id.clone(),
            role: ConnectionRole::Responder,
            state: ConnectionState::Pending,
            remote_address: Some(offer.address.clone()),
            intended: None,
            offer: offer.clone(),
            answer: Some(Negotiation {
                kind: NegotiationKind::Answer,
                address: self.address.clone(),
                sdp: None,
                // The initiator's id, so the answer finds its way back to
                // the connection that offered.
                connection_id: offer.connection_id.clone(),
                network_id: self.network_id.clone(),
                timestamp: now_ms(),
            }),
            origin,
            transport: transport.clone(),
            connected_at: None,
        };
        trace!(id = %id, remote = %offer.address, "created responder connection");
        self.connections.insert(id.clone(), connection);
        transport.signal(&opened);
        Ok((id, effects))
    }

    /// Apply a foreign answer to the matching Open initiator.
    pub fn signal_answer(&mut self, answer: &Negotiation) -> Result<ConnectionId, ConnectError> {
        let sealed = answer.sdp.as_deref().ok_or(ConnectError::MissingSdp)?;
        let id = ConnectionId::from(answer.connection_id.as_str());
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(ConnectError::UnknownConnection)?;

        if connection.state != ConnectionState::Open
            || connection.role != ConnectionRole::Initiator
            || connection.remote_address.is_some()
        {
            return Err(ConnectError::NotApplicable);
        }

        let opened = self.cipher.open(sealed).map_err(ConnectError::Seal)?;
        connection.remote_address = Some(answer.address.clone());
        connection.answer = Some(answer.clone());
        connection.transport.signal(&opened);
        trace!(id = %id, remote = %answer.address, "answer applied");
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Transport events
    // ------------------------------------------------------------------

    /// Feed one transport event back into its connection's state machine.
    pub fn handle_transport_event(
        &mut self,
        id: &ConnectionId,
        event: TransportEvent,
    ) -> Vec<ConnEffect> {
        // Events for a connection that is already gone are stale; ignore.
        let Some(connection) = self.connections.get_mut(id) else {
            return Vec::new();
        };

        match event {
            TransportEvent::Signal { kind: SignalKind::Offer, sdp } => {
                if connection.role != ConnectionRole::Initiator
                    || connection.state != ConnectionState::Pending
                {
                    return Vec::new();
                }
                let Some(target) = connection.peer_address().cloned() else {
                    return self.destroy(id, Some("offer without a dial target".to_string()));
                };
                match self.cipher.seal(&target, &sdp) {
                    Ok(sealed) => {
                        let connection = self.connections.get_mut(id).expect("still present");
                        connection.offer.sdp = Some(sealed);
                        connection.state = ConnectionState::Open;
                        vec![ConnEffect::OfferReady(id.clone())]
                    }
                    Err(e) => self.destroy(id, Some(e.to_string())),
                }
            }
            TransportEvent::Signal { kind: SignalKind::Answer, sdp } => {
                if connection.role != ConnectionRole::Responder
                    || connection.state != ConnectionState::Pending
                {
                    return Vec::new();
                }
                let Some(remote) = connection.remote_address.clone() else {
                    return self.destroy(id, Some("responder without a remote".to_string()));
                };
                match self.cipher.seal(&remote, &sdp) {
                    Ok(sealed) => {
                        let connection = self.connections.get_mut(id).expect("still present");
                        if let Some(answer) = connection.answer.as_mut() {
                            answer.sdp = Some(sealed);
                        }
                        connection.state = ConnectionState::Open;
                        vec![ConnEffect::AnswerReady(id.clone())]
                    }
                    Err(e) => self.destroy(id, Some(e.to_string())),
                }
            }
            TransportEvent::Connect => {
                if connection.state >= ConnectionState::Connected {
                    return Vec::new();
                }
                connection.state = ConnectionState::Connected;
                connection.connected_at = Some(Instant::now());
                let survivor = id.clone();
                let address = connection.peer_address().cloned();
                let mut effects = vec![ConnEffect::Established(survivor.clone())];
                // Keep uniqueness: collect every other connection to the
                // same address now that this one carries the traffic.
                if let Some(address) = address {
                    effects.extend(self.destroy_duplicates_to(&address, Some(&survivor)));
                }
                effects
            }
            TransportEvent::Data(bytes) => vec![ConnEffect::Inbound {
                id: id.clone(),
                bytes,
            }],
            TransportEvent::Close => self.destroy(id, None),
            TransportEvent::Error(error) => self.destroy(id, Some(error)),
        }
    }

    // ------------------------------------------------------------------
    // Destruction and GC
    // ------------------------------------------------------------------

    /// Remove a connection and destroy its transport.
    pub fn destroy(&mut self, id: &ConnectionId, error: Option<String>) -> Vec<ConnEffect> {
        let Some(connection) = self.connections.remove(id) else {
            return Vec::new();
        };
        let address = connection.peer_address().cloned();
        connection.transport.destroy();
        debug!(id = %id, address = ?address.as_ref().map(|a| a.as_str()), "connection destroyed");
        vec![ConnEffect::Died {
            id: id.clone(),
            address,
            error,
        }]
    }

    pub fn destroy_all(&mut self) -> Vec<ConnEffect> {
        let ids: Vec<ConnectionId> = self.connections.keys().cloned().collect();
        ids.into_iter()
            .flat_map(|id| self.destroy(&id, None))
            .collect()
    }

    /// Destroy every non-Connected connection to `address`, sparing
    /// `keep` (and, when `keep` is None, sparing nothing but Connected ones).
    fn destroy_duplicates_to(
        &mut self,
        address: &Address,
        keep: Option<&ConnectionId>,
    ) -> Vec<ConnEffect> {
        let victims: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.peer_address() == Some(address))
            .filter(|c| Some(&c.id) != keep)
            .filter(|c| keep.is_some() || c.state != ConnectionState::Connected)
            .map(|c| c.id.clone())
            .collect();
        victims
            .into_iter()
            .flat_map(|id| self.destroy(&id, None))
            .collect()
    }

    /// Periodic garbage collection.
    ///
    /// Removes connections whose transport reports itself destroyed, then
    /// collects same-address duplicates: a duplicate whose transport lacks a
    /// data-channel name loses to one that has one; among named survivors
    /// the most recent successful connect wins.
    pub fn gc(&mut self) -> Vec<ConnEffect> {
        let mut effects = Vec::new();

        let defunct: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.transport.destroyed())
            .map(|c| c.id.clone())
            .collect();
        for id in defunct {
            effects.extend(self.destroy(&id, None));
        }

        let mut by_address: HashMap<Address, Vec<ConnectionId>> = HashMap::new();
        for connection in self.connections.values() {
            if let Some(address) = connection.peer_address() {
                by_address
                    .entry(address.clone())
                    .or_default()
                    .push(connection.id.clone());
            }
        }
        for (_, ids) in by_address {
            if ids.len() < 2 {
                continue;
            }
            let named: Vec<&ConnectionId> = ids
                .iter()
                .filter(|id| {
                    self.connections
                        .get(*id)
                        .is_some_and(|c| c.transport.channel_name().is_some())
                })
                .collect();
            if named.is_empty() {
                // Both still mid-handshake; connect-time dedup will pick.
                continue;
            }
            let keeper = named
                .iter()
                .copied()
                .max_by_key(|id| self.connections.get(*id).and_then(|c| c.connected_at))
                .cloned()
                .expect("named is non-empty");
            for id in ids {
                if id != keeper {
                    effects.extend(self.destroy(&id, None));
                }
            }
        }

        effects
    }
}
