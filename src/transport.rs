//! # Peer Transport Contract
//!
//! The underlying WebRTC peer is deliberately opaque to this crate. A
//! [`Transport`] is anything that can run the offer/answer signaling dance,
//! report connectivity, and move ordered byte frames; a [`TransportFactory`]
//! mints one per connection attempt.
//!
//! ## Event Contract
//!
//! A transport reports back on the event channel handed to the factory,
//! tagging each event with the owning connection id:
//!
//! | Event | Meaning |
//! |-------|---------|
//! | `Signal` | the local peer produced a session description (offer when created as initiator, answer otherwise) |
//! | `Connect` | the peer-to-peer link is up and the data channel is open |
//! | `Data` | one inbound frame, FIFO per connection |
//! | `Close` | the link closed |
//! | `Error` | the link failed |
//!
//! A transport is created with `initiator == true` exactly when no foreign
//! offer was supplied, and is expected to negotiate without trickle ICE:
//! one complete description per side.
//!
//! ## In-memory implementation
//!
//! [`memory`] wires transports of nodes living in the same process through a
//! shared [`memory::MemoryHub`], performing the same signaling dance over
//! shared state. It exists for tests, demos and embedders who want a mesh
//! without real networking.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::connection::ConnectionId;

/// Which side of the dance a session description belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
}

/// Events a transport reports to its owning connection.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    Signal { kind: SignalKind, sdp: String },
    Connect,
    Data(Vec<u8>),
    Close,
    Error(String),
}

/// Channel on which transports report `(connection, event)` pairs.
pub type TransportEvents = mpsc::Sender<(ConnectionId, TransportEvent)>;

/// Error type for transport send failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// The link is not (or no longer) connected.
    NotConnected,
    /// The frame was dropped before reaching the peer.
    Dropped,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::NotConnected => write!(f, "transport is not connected"),
            TransportError::Dropped => write!(f, "frame dropped in transit"),
        }
    }
}

impl std::error::Error for TransportError {}

/// One peer-to-peer transport session.
pub trait Transport: Send + Sync {
    /// Feed the remote side's session description into the peer.
    fn signal(&self, sdp: &str);

    /// Send one frame to the peer. FIFO per transport.
    fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    fn connected(&self) -> bool;

    fn destroyed(&self) -> bool;

    /// Label of the negotiated data channel, once one exists.
    fn channel_name(&self) -> Option<String>;

    /// Tear the session down. Idempotent.
    fn destroy(&self);
}

/// Mints a transport per connection attempt.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        id: ConnectionId,
        initiator: bool,
        events: TransportEvents,
    ) -> Arc<dyn Transport>;
}

pub mod memory {
    //! In-process transport: the signaling dance over a shared hub.

    use std::collections::HashMap;
    use std::sync::{Arc, Mutex, OnceLock, Weak};

    use super::{
        SignalKind, Transport, TransportError, TransportEvent, TransportEvents, TransportFactory,
    };
    use crate::connection::ConnectionId;
    use crate::wire::fresh_hex_id;

    /// How long a transport may sit unconnected before it gives up.
    ///
    /// Real peers fail ICE on their own after a while; this double must do
    /// the same, because the overlay relies on the transport's own timeout
    /// to clear handshakes that lost their counterpart (e.g. both ends of a
    /// simultaneous dial torn down in favor of responders).
    pub const CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

    /// Meeting point pairing initiator and responder transports.
    ///
    /// An initiator invents a token and emits it as its offer; the responder
    /// that is signaled with that token registers itself here and emits the
    /// token back as its answer; when the answer is signaled into the
    /// initiator, both sides link up and report `Connect`.
    pub struct MemoryHub {
        answered: Mutex<HashMap<String, Arc<MemoryTransport>>>,
    }

    impl MemoryHub {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                answered: Mutex::new(HashMap::new()),
            })
        }

        /// Process-wide hub shared by every factory that does not bring its
        /// own. Lets two nodes in one process connect with zero setup.
        pub fn global() -> Arc<Self> {
            static GLOBAL: OnceLock<Arc<MemoryHub>> = OnceLock::new();
            GLOBAL.get_or_init(|| {
                Arc::new(Self {
                    answered: Mutex::new(HashMap::new()),
                })
            })
            .clone()
        }
    }

    impl Default for MemoryHub {
        fn default() -> Self {
            Self {
                answered: Mutex::new(HashMap::new()),
            }
        }
    }

    struct LinkState {
        token: Option<String>,
        connected: bool,
        destroyed: bool,
        peer: Option<Arc<MemoryTransport>>,
    }

    pub struct MemoryTransport {
        id: ConnectionId,
        initiator: bool,
        hub: Arc<MemoryHub>,
        events: TransportEvents,
        state: Mutex<LinkState>,
        self_ref: Weak<MemoryTransport>,
    }

    impl MemoryTransport {
        fn new(
            id: ConnectionId,
            initiator: bool,
            hub: Arc<MemoryHub>,
            events: TransportEvents,
        ) -> Arc<Self> {
            let transport = Arc::new_cyclic(|self_ref| Self {
                id,
                initiator,
                hub,
                events,
                state: Mutex::new(LinkState {
                    token: None,
                    connected: false,
                    destroyed: false,
                    peer: None,
                }),
                self_ref: self_ref.clone(),
            });

            if initiator {
                // Produce the offer immediately; real peers do this as soon
                // as the data channel is declared.
                let token = fresh_hex_id();
                transport.state.lock().expect("hub state lock").token = Some(token.clone());
                transport.emit(TransportEvent::Signal {
                    kind: SignalKind::Offer,
                    sdp: token,
                });
            }

            // The watchdog needs a runtime; without one (plain sync tests)
            // the transport simply never times out.
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let watchdog = Arc::downgrade(&transport);
                runtime.spawn(async move {
                    tokio::time::sleep(CONNECT_TIMEOUT).await;
                    if let Some(transport) = watchdog.upgrade() {
                        let still_pending = {
                            let state = transport.state.lock().expect("hub state lock");
                            !state.connected && !state.destroyed
                        };
                        if still_pending {
                            transport.emit(TransportEvent::Error("connect timeout".to_string()));
                            transport.destroy();
                        }
                    }
                });
            }
            transport
        }

        fn emit(&self, event: TransportEvent) {
            // The owning node drains this channel on its event loop; if the
            // node is gone the frame has nowhere to go anyway.
            let _ = self.events.try_send((self.id.clone(), event));
        }

        /// Called on the surviving side when its peer goes away.
        fn peer_hung_up(&self) {
            let was_linked = {
                let mut state = self.state.lock().expect("hub state lock");
                let linked = state.peer.take().is_some();
                state.connected = false;
                linked && !state.destroyed
            };
            if was_linked {
                self.emit(TransportEvent::Close);
            }
        }

        fn link_with(self: &Arc<Self>, peer: Arc<MemoryTransport>) {
            {
                let mut ours = self.state.lock().expect("hub state lock");
                ours.peer = Some(peer.clone());
                ours.connected = true;
            }
            {
                let mut theirs = peer.state.lock().expect("hub state lock");
                theirs.peer = Some(self.clone());
                theirs.connected = true;
            }
            self.emit(TransportEvent::Connect);
            peer.emit(TransportEvent::Connect);
        }
    }

    impl Transport for MemoryTransport {
        fn signal(&self, sdp: &str) {
            let destroyed = self.state.lock().expect("hub state lock").destroyed;
            if destroyed {
                return;
            }

            if self.initiator {
                // The answer came back: find whoever registered under our
                // token and link up.
                let peer = self
                    .hub
                    .answered
                    .lock()
                    .expect("hub registry lock")
                    .remove(sdp);
                match (peer, self.self_ref.upgrade()) {
                    (Some(peer), Some(this)) => this.link_with(peer),
                    _ => self.emit(TransportEvent::Error(
                        "answer references an unknown session".to_string(),
                    )),
                }
            } else {
                // The foreign offer: adopt its token, register, answer back.
                let token = sdp.to_string();
                self.state.lock().expect("hub state lock").token = Some(token.clone());
                if let Some(this) = self.self_ref.upgrade() {
                    self.hub
                        .answered
                        .lock()
                        .expect("hub registry lock")
                        .insert(token.clone(), this);
                }
                self.emit(TransportEvent::Signal {
                    kind: SignalKind::Answer,
                    sdp: token,
                });
            }
        }

        fn send(&self, data: &[u8]) -> Result<(), TransportError> {
            let peer = {
                let state = self.state.lock().expect("hub state lock");
                if !state.connected || state.destroyed {
                    return Err(TransportError::NotConnected);
                }
                state.peer.clone()
            };
            let peer = peer.ok_or(TransportError::NotConnected)?;
            let delivered = peer
                .events
                .try_send((peer.id.clone(), TransportEvent::Data(data.to_vec())))
                .is_ok();
            if delivered {
                Ok(())
            } else {
                Err(TransportError::Dropped)
            }
        }

        fn connected(&self) -> bool {
            let state = self.state.lock().expect("hub state lock");
            state.connected && !state.destroyed
        }

        fn destroyed(&self) -> bool {
            self.state.lock().expect("hub state lock").destroyed
        }

        fn channel_name(&self) -> Option<String> {
            let state = self.state.lock().expect("hub state lock");
            if state.connected {
                state.token.clone()
            } else {
                None
            }
        }

        fn destroy(&self) {
            let (peer, token) = {
                let mut state = self.state.lock().expect("hub state lock");
                if state.destroyed {
                    return;
                }
                state.destroyed = true;
                state.connected = false;
                (state.peer.take(), state.token.take())
            };
            if let Some(token) = token {
                let mut answered = self.hub.answered.lock().expect("hub registry lock");
                if answered
                    .get(&token)
                    .is_some_and(|t| std::ptr::eq(t.as_ref(), self))
                {
                    answered.remove(&token);
                }
            }
            if let Some(peer) = peer {
                peer.peer_hung_up();
            }
        }
    }

    pub struct MemoryTransportFactory {
        hub: Arc<MemoryHub>,
    }

    impl MemoryTransportFactory {
        pub fn new(hub: Arc<MemoryHub>) -> Arc<Self> {
            Arc::new(Self { hub })
        }
    }

    impl TransportFactory for MemoryTransportFactory {
        fn create(
            &self,
            id: ConnectionId,
            initiator: bool,
            events: TransportEvents,
        ) -> Arc<dyn Transport> {
            MemoryTransport::new(id, initiator, self.hub.clone(), events)
        }
    }

}
