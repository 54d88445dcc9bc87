//! # High-Level Node API
//!
//! A [`Node`] is one participant in a mesh: it polls the switchboard until
//! it has neighbors, announces itself over presence broadcasts, accepts and
//! initiates connections, and gossips application messages. This module
//! wires every component together.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::builder("my-network", "https://switch.example")
//!     .secret(secret_hex)
//!     .spawn()
//!     .await?;
//!
//! let mut events = node.events().await?;
//! node.broadcast(Draft::new("chat", "text").data(json!({"body": "hi"}))).await?;
//! while let Some(event) = events.recv().await {
//!     if let NodeEvent::Message(message) = event {
//!         println!("{}: {:?}", message.address, message.data);
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! The public [`Node`] is a cheap handle; a private [`NodeActor`] task owns
//! every piece of mutable state (connections, gossip memory, rate
//! accounting, the switchboard loop) and serializes all access to it. The
//! handle talks to the actor over a command channel with oneshot replies;
//! transport callbacks arrive on their own channel carrying connection ids;
//! timers are further branches of the same `select!` loop:
//!
//! | Branch | Drives |
//! |--------|--------|
//! | command channel | `broadcast`, queries, teardown |
//! | transport events | connection state machines, gossip ingest |
//! | presence timer | periodic self-announcement (plus ≤100 ms jitter) |
//! | GC timer | dead connection collection, seen-memory sweep |
//! | switchboard deadline | adaptive rendezvous polling |

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::connection::{
    ConnEffect, ConnectionId, ConnectionInfo, ConnectionManager, ConnectionState, NegotiationPath,
};
use crate::crypto::SdpCipher;
use crate::gossip::{Draft, GossipEngine};
use crate::identity::{Address, Keypair};
use crate::negotiate;
use crate::rude::RudeList;
use crate::switchboard::{HttpSwitchboard, Switchboard, SwitchboardClient};
use crate::transport::{TransportEvent, TransportFactory};
use crate::transport::memory::{MemoryHub, MemoryTransportFactory};
use crate::wire::{
    Message, NegotiationItem, NegotiationKind, SwitchboardResponse, TYPE_ANSWER, TYPE_OFFER,
};

/// Upper bound of the random jitter added to each presence period.
const PRESENCE_JITTER_MS: u64 = 100;

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 1024;
const TRANSPORT_CHANNEL_CAPACITY: usize = 1024;

/// A receiver that can be taken exactly once via `.take()`.
type TakeOnce<T> = tokio::sync::Mutex<Option<mpsc::Receiver<T>>>;

// ============================================================================
// Configuration
// ============================================================================

/// Tunable node behavior. Every field has a sensible default.
#[derive(Clone, Debug)]
pub struct Config {
    /// Period of the presence self-announcement.
    pub presence_broadcast_interval: Duration,
    /// Switchboard poll period while the node has no active connections.
    pub fast_switchboard_request_interval: Duration,
    /// Switchboard poll period once at least one connection is active.
    pub slow_switchboard_request_interval: Duration,
    /// Period of the garbage-collection pass.
    pub garbage_collect_interval: Duration,
    /// Messages per second per sender before that sender is rude.
    /// `None` (the default) disables the rude filter entirely.
    pub max_message_rate_before_rude: Option<u32>,
    /// Hard cap on total connections, in any state.
    pub max_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            presence_broadcast_interval: Duration::from_millis(5000),
            fast_switchboard_request_interval: Duration::from_millis(500),
            slow_switchboard_request_interval: Duration::from_millis(3000),
            garbage_collect_interval: Duration::from_millis(5000),
            max_message_rate_before_rude: None,
            max_connections: 10,
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// Everything a node reports to its embedder, as one tagged union carried
/// on a single take-once channel.
#[derive(Clone, Debug)]
pub enum NodeEvent {
    /// A message addressed to us (or broadcast) was delivered.
    Message(Message),
    /// A message left this node, freshly originated or forwarded.
    BroadcastMessage(Message),
    /// An inbound message failed signature verification.
    BadMessage { address: Address, reason: String },
    /// A connection reached Connected.
    AddConnection { id: ConnectionId, address: Address },
    /// A connection was destroyed.
    DestroyConnection {
        id: ConnectionId,
        address: Option<Address>,
    },
    /// One switchboard response arrived.
    SwitchboardResponse(SwitchboardResponse),
    /// A connection's transport reported an error.
    ConnectionError { id: ConnectionId, error: String },
    /// A connection advanced through its state machine.
    ConnectionProcess {
        id: ConnectionId,
        state: ConnectionState,
        address: Option<Address>,
    },
}

/// Best-effort event emission: a consumer that stops draining loses events
/// rather than wedging the actor.
pub(crate) struct EventSink {
    tx: mpsc::Sender<NodeEvent>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::Sender<NodeEvent>) -> Self {
        Self { tx }
    }

    pub(crate) fn emit(&self, event: NodeEvent) {
        if self.tx.try_send(event).is_err() {
            trace!("event dropped: receiver gone or not draining");
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

enum Command {
    Broadcast(Draft, oneshot::Sender<Result<Message>>),
    Connections(oneshot::Sender<Vec<ConnectionInfo>>),
    ActiveConnections(oneshot::Sender<Vec<ConnectionInfo>>),
    StopSwitchboard(oneshot::Sender<()>),
    StartSwitchboard(oneshot::Sender<()>),
    Teardown(oneshot::Sender<()>),
}

#[derive(Debug)]
pub struct Node {
    address: Address,
    cmd_tx: mpsc::Sender<Command>,
    events: TakeOnce<NodeEvent>,
}

impl Node {
    pub fn builder(
        network_id: impl Into<String>,
        switch_address: impl Into<String>,
    ) -> NodeBuilder {
        NodeBuilder::new(network_id, switch_address)
    }

    /// This node's address on the mesh.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Take the event receiver. Can be taken exactly once.
    pub async fn events(&self) -> Result<mpsc::Receiver<NodeEvent>> {
        let mut guard = self.events.lock().await;
        guard.take().context("event receiver already taken")
    }

    /// Stamp, sign and fan a message out to every connected peer.
    ///
    /// Missing `app_id` or `kind` fails synchronously; everything else is
    /// fire-and-forget.
    pub async fn broadcast(&self, draft: Draft) -> Result<Message> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Broadcast(draft, tx))
            .await
            .map_err(|_| anyhow!("node is torn down"))?;
        rx.await.map_err(|_| anyhow!("node is torn down"))?
    }

    /// Send a `log` control message to `destination`.
    pub async fn send_log(&self, destination: Address, text: &str) -> Result<Message> {
        self.broadcast(Draft::log(destination, text)).await
    }

    /// Snapshot of every connection, in any state.
    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        self.query(Command::Connections).await
    }

    /// Snapshot of Connected connections with live transports.
    pub async fn active_connections(&self) -> Vec<ConnectionInfo> {
        self.query(Command::ActiveConnections).await
    }

    async fn query<T: Default>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> T {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(make(tx)).await.is_err() {
            return T::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Park the switchboard polling loop.
    pub async fn stop_switchboard_requests(&self) {
        self.query(Command::StopSwitchboard).await
    }

    /// Re-enter the switchboard polling loop after a stop.
    pub async fn start_switchboard_requests(&self) {
        self.query(Command::StartSwitchboard).await
    }

    /// Stop everything: timers, the switchboard loop, every connection.
    ///
    /// Idempotent. After this returns no further events are emitted and no
    /// further switchboard requests are initiated.
    pub async fn teardown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Teardown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct NodeBuilder {
    network_id: String,
    switch_address: String,
    secret: Option<String>,
    address: Option<String>,
    config: Config,
    switchboard: Option<Arc<dyn Switchboard>>,
    transport: Option<Arc<dyn TransportFactory>>,
}

impl NodeBuilder {
    pub fn new(network_id: impl Into<String>, switch_address: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into(),
            switch_address: switch_address.into(),
            secret: None,
            address: None,
            config: Config::default(),
            switchboard: None,
            transport: None,
        }
    }

    /// Run signed: a 64-char hex Ed25519 seed. The node's address becomes
    /// the corresponding public key.
    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Run unsigned under an arbitrary address. Ignored when a secret is
    /// also given.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Replace the HTTP rendezvous, e.g. with an in-process one for tests.
    pub fn switchboard(mut self, switchboard: Arc<dyn Switchboard>) -> Self {
        self.switchboard = Some(switchboard);
        self
    }

    /// Replace the transport factory. Defaults to the in-process memory
    /// transport on the global hub; real deployments supply their WebRTC
    /// binding here.
    pub fn transport(mut self, transport: Arc<dyn TransportFactory>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub async fn spawn(self) -> Result<Node> {
        let keypair = match &self.secret {
            Some(secret) => Some(Keypair::from_secret_hex(secret).context("invalid secret")?),
            None => None,
        };
        let address = match (&keypair, self.address) {
            (Some(keypair), _) => keypair.address(),
            (None, Some(address)) => Address::new(address),
            (None, None) => bail!("a node needs either a secret or an address"),
        };

        let switchboard: Arc<dyn Switchboard> = match self.switchboard {
            Some(switchboard) => switchboard,
            None => Arc::new(HttpSwitchboard::new(&self.switch_address)?),
        };
        let transport: Arc<dyn TransportFactory> = match self.transport {
            Some(transport) => transport,
            None => MemoryTransportFactory::new(MemoryHub::global()),
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (transport_tx, transport_rx) = mpsc::channel(TRANSPORT_CHANNEL_CAPACITY);

        let connections = ConnectionManager::new(
            self.network_id.clone(),
            address.clone(),
            SdpCipher::new(keypair.clone()),
            transport,
            transport_tx,
            self.config.max_connections,
        );
        let rude = RudeList::new(self.config.max_message_rate_before_rude);
        let gossip = GossipEngine::new(address.clone(), keypair);
        let switchboard =
            SwitchboardClient::new(switchboard, self.network_id.clone(), address.clone());

        let next_presence =
            Instant::now() + self.config.presence_broadcast_interval + presence_jitter();
        let actor = NodeActor {
            address: address.clone(),
            config: self.config,
            connections,
            gossip,
            rude,
            switchboard,
            events: EventSink::new(event_tx),
            cmd_rx,
            transport_rx,
            next_presence,
        };
        tokio::spawn(actor.run());

        info!(%address, network = %self.network_id, "node started");
        Ok(Node {
            address,
            cmd_tx,
            events: tokio::sync::Mutex::new(Some(event_rx)),
        })
    }
}

fn presence_jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..=PRESENCE_JITTER_MS))
}

// ============================================================================
// Actor
// ============================================================================

struct NodeActor {
    address: Address,
    config: Config,
    connections: ConnectionManager,
    gossip: GossipEngine,
    rude: RudeList,
    switchboard: SwitchboardClient,
    events: EventSink,
    cmd_rx: mpsc::Receiver<Command>,
    transport_rx: mpsc::Receiver<(ConnectionId, TransportEvent)>,
    next_presence: Instant,
}

impl NodeActor {
    async fn run(mut self) {
        let mut gc_interval = tokio::time::interval(self.config.garbage_collect_interval);

        loop {
            let switchboard_deadline = self.switchboard.next_deadline();
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Broadcast(draft, reply)) => {
                            let result =
                                self.gossip.broadcast(draft, &self.connections, &self.events);
                            let _ = reply.send(result);
                        }
                        Some(Command::Connections(reply)) => {
                            let _ = reply.send(
                                self.connections.connections().map(|c| c.info()).collect(),
                            );
                        }
                        Some(Command::ActiveConnections(reply)) => {
                            let _ = reply
                                .send(self.connections.active().map(|c| c.info()).collect());
                        }
                        Some(Command::StopSwitchboard(reply)) => {
                            self.switchboard.stop();
                            let _ = reply.send(());
                        }
                        Some(Command::StartSwitchboard(reply)) => {
                            self.switchboard.start();
                            let _ = reply.send(());
                        }
                        Some(Command::Teardown(reply)) => {
                            self.teardown();
                            let _ = reply.send(());
                            break;
                        }
                        None => {
                            debug!("node handle dropped, actor quitting");
                            self.teardown();
                            break;
                        }
                    }
                }
                event = self.transport_rx.recv() => {
                    if let Some((id, event)) = event {
                        let effects = self.connections.handle_transport_event(&id, event);
                        self.apply_effects(effects);
                    }
                }
                _ = tokio::time::sleep_until(self.next_presence) => {
                    self.announce_presence();
                    self.next_presence = Instant::now()
                        + self.config.presence_broadcast_interval
                        + presence_jitter();
                }
                _ = gc_interval.tick() => {
                    self.collect_garbage();
                }
                _ = tokio::time::sleep_until(switchboard_deadline),
                    if self.switchboard.is_running() =>
                {
                    self.switchboard_tick().await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Effect routing
    // ------------------------------------------------------------------

    /// Drain a batch of connection effects, including any produced while
    /// processing (gossip ingest can create or destroy connections).
    fn apply_effects(&mut self, effects: Vec<ConnEffect>) {
        let mut queue: VecDeque<ConnEffect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                ConnEffect::OfferReady(id) => {
                    self.emit_process(&id, ConnectionState::Open);
                    self.route_offer(&id);
                }
                ConnEffect::AnswerReady(id) => {
                    self.emit_process(&id, ConnectionState::Open);
                    self.route_answer(&id);
                }
                ConnEffect::Established(id) => {
                    let address = self
                        .connections
                        .get(&id)
                        .and_then(|c| c.peer_address().cloned());
                    self.emit_process(&id, ConnectionState::Connected);
                    if let Some(address) = address {
                        self.events.emit(NodeEvent::AddConnection { id, address });
                    }
                }
                ConnEffect::Inbound { bytes, .. } => {
                    let more = self.gossip.ingest(
                        &bytes,
                        &mut self.connections,
                        &mut self.rude,
                        &self.events,
                    );
                    queue.extend(more);
                }
                ConnEffect::Died { id, address, error } => {
                    if let Some(error) = error {
                        self.events.emit(NodeEvent::ConnectionError {
                            id: id.clone(),
                            error,
                        });
                    }
                    self.events.emit(NodeEvent::DestroyConnection { id, address });
                }
            }
        }
    }

    fn emit_process(&self, id: &ConnectionId, state: ConnectionState) {
        let address = self
            .connections
            .get(id)
            .and_then(|c| c.peer_address().cloned());
        self.events.emit(NodeEvent::ConnectionProcess {
            id: id.clone(),
            state,
            address,
        });
    }

    /// An initiator's offer is ready: deliver it back along the channel the
    /// negotiation came from.
    fn route_offer(&mut self, id: &ConnectionId) {
        let Some(connection) = self.connections.get(id) else {
            return;
        };
        let Some(target) = connection.peer_address().cloned() else {
            return;
        };
        let record = connection.offer().clone();
        match connection.origin() {
            NegotiationPath::Switchboard => self.switchboard.queue(NegotiationItem {
                recipient: target,
                from: self.address.clone(),
                negotiation: record,
            }),
            NegotiationPath::Gossip => {
                let draft = Draft::negotiation(TYPE_OFFER, target, &record);
                if let Err(e) = self.gossip.broadcast(draft, &self.connections, &self.events) {
                    debug!(error = %e, "in-band offer not sent");
                }
            }
        }
    }

    /// A responder's answer is ready: route it to the offer's originator.
    fn route_answer(&mut self, id: &ConnectionId) {
        let Some(connection) = self.connections.get(id) else {
            return;
        };
        let Some(record) = connection.answer().cloned() else {
            return;
        };
        let target = connection.offer().address.clone();
        match connection.origin() {
            NegotiationPath::Switchboard => self.switchboard.queue(NegotiationItem {
                recipient: target,
                from: self.address.clone(),
                negotiation: record,
            }),
            NegotiationPath::Gossip => {
                let draft = Draft::negotiation(TYPE_ANSWER, target, &record);
                if let Err(e) = self.gossip.broadcast(draft, &self.connections, &self.events) {
                    debug!(error = %e, "in-band answer not sent");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn announce_presence(&mut self) {
        let draft = Draft::presence(&self.address);
        if let Err(e) = self.gossip.broadcast(draft, &self.connections, &self.events) {
            debug!(error = %e, "presence broadcast failed");
        }
    }

    fn collect_garbage(&mut self) {
        let effects = self.connections.gc();
        self.apply_effects(effects);
        self.gossip.sweep_seen();
    }

    async fn switchboard_tick(&mut self) {
        if let Some(response) = self.switchboard.tick().await {
            self.events
                .emit(NodeEvent::SwitchboardResponse(response.clone()));
            self.handle_switchboard_response(response);
        }
        self.switchboard
            .reschedule(self.connections.active_count(), &self.config);
    }

    fn handle_switchboard_response(&mut self, response: SwitchboardResponse) {
        for item in &response.negotiation_items {
            if item.recipient != self.address {
                continue;
            }
            match item.negotiation.kind {
                NegotiationKind::Offer => {
                    match negotiate::evaluate_offer(
                        &item.negotiation,
                        &self.address,
                        &self.connections,
                        &mut self.rude,
                    ) {
                        Ok(()) => match self
                            .connections
                            .accept_offer(&item.negotiation, NegotiationPath::Switchboard)
                        {
                            Ok((_, effects)) => self.apply_effects(effects),
                            Err(e) => {
                                debug!(from = %item.negotiation.address, error = %e,
                                    "switchboard offer not built");
                            }
                        },
                        Err(reason) => {
                            trace!(from = %item.negotiation.address, %reason,
                                "switchboard offer refused");
                        }
                    }
                }
                NegotiationKind::Answer => {
                    negotiate::apply_answer(&item.negotiation, &self.address, &mut self.connections);
                }
            }
        }

        for address in &response.addresses {
            if negotiate::should_initiate(address, &self.address, &self.connections, &mut self.rude)
            {
                let (_, effects) = self
                    .connections
                    .ensure_initiator(address, NegotiationPath::Switchboard);
                self.apply_effects(effects);
            }
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    fn teardown(&mut self) {
        self.switchboard.stop();
        let effects = self.connections.destroy_all();
        self.apply_effects(effects);
        debug!(address = %self.address, "node torn down");
    }
}
