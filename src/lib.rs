//! # Meshweave - Self-Healing P2P Mesh Overlay
//!
//! Meshweave connects many participating processes into a single
//! application-level broadcast domain over direct peer-to-peer connections:
//!
//! - **Bootstrap**: a trivial HTTP rendezvous (the "switchboard") is used
//!   only to meet a first neighbor and exchange initial session
//!   descriptions
//! - **In-band growth**: further offers and answers travel through the mesh
//!   itself as gossip, so new connections form without the switchboard once
//!   any node is reachable
//! - **Signed gossip**: messages carry a per-hop Ed25519 signature chain
//!   that doubles as the hop counter, with duplicate suppression at every
//!   node
//! - **Self-healing**: dead connections are torn down, misbehaving peers
//!   are dropped, and periodic presence announcements keep discovering new
//!   neighbors
//!
//! ## Architecture
//!
//! The public [`Node`] is a cheap handle; a private actor task owns all
//! mutable state and serializes every operation, timer and transport event
//! onto one loop. The WebRTC peer itself is out of scope: it enters as the
//! [`transport::Transport`] trait, and an in-process implementation ships
//! in [`transport::memory`] for tests and demos.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API wiring all components |
//! | `identity` | Keypairs and node addresses |
//! | `crypto` | Signature chains and session-description sealing |
//! | `wire` | JSON wire shapes (messages, negotiations, switchboard) |
//! | `connection` | Connection state machines and their manager |
//! | `negotiate` | Offer/answer acceptance policy |
//! | `gossip` | Broadcast, dedup, verify, hop-limited forwarding |
//! | `switchboard` | Rendezvous trait, HTTP client, adaptive polling |
//! | `rude` | Per-sender rate accounting |
//! | `seen` | Time-bounded duplicate suppression |
//! | `transport` | Opaque peer-transport contract + memory impl |

pub mod connection;
pub mod crypto;
pub mod gossip;
pub mod identity;
pub mod negotiate;
pub mod node;
pub mod rude;
pub mod seen;
pub mod switchboard;
pub mod transport;
pub mod wire;

pub use connection::{ConnectionId, ConnectionInfo, ConnectionRole, ConnectionState};
pub use gossip::Draft;
pub use identity::{Address, Keypair};
pub use node::{Config, Node, NodeBuilder, NodeEvent};
pub use switchboard::{HttpSwitchboard, Switchboard};
pub use transport::{Transport, TransportEvent, TransportFactory};
pub use wire::{Message, Negotiation, NegotiationItem, SwitchboardRequest, SwitchboardResponse};
