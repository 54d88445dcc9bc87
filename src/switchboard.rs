//! # Switchboard Rendezvous
//!
//! The switchboard is the only piece of infrastructure the mesh ever
//! needs, and it needs it only to meet a first neighbor: a stateless HTTP
//! endpoint holding a short-lived set of addresses and undelivered
//! negotiation items per network. Everything after the first connection
//! travels in-band.
//!
//! The endpoint is consumed through the [`Switchboard`] trait so the
//! polling logic stays independent of the wire: [`HttpSwitchboard`] POSTs
//! JSON at a real server, [`memory::MemorySwitchboard`] implements the same
//! contract in-process for tests and demos.
//!
//! ## Adaptive Cadence
//!
//! [`SwitchboardClient`] keeps a single scheduled tick. A node with no
//! active connections polls every `fast_switchboard_request_interval`
//! (it is alone and wants in); once at least one connection is up the
//! cadence drops to `slow_switchboard_request_interval` (the mesh carries
//! negotiations from here, the switchboard is a fallback). `stop()` parks
//! the loop; `start()` re-enters it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use tokio::time::Instant;
use tracing::debug;

use crate::identity::Address;
use crate::node::Config;
use crate::wire::{NegotiationItem, SwitchboardRequest, SwitchboardResponse};

/// Timeout for one switchboard HTTP round trip. A hung rendezvous must not
/// stall the node's event loop indefinitely.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// A rendezvous endpoint: one request in, one response out, no session.
#[async_trait]
pub trait Switchboard: Send + Sync {
    async fn exchange(&self, request: SwitchboardRequest) -> Result<SwitchboardResponse>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// The production switchboard: POST JSON to a URL.
pub struct HttpSwitchboard {
    client: reqwest::Client,
    url: String,
}

impl HttpSwitchboard {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Switchboard for HttpSwitchboard {
    async fn exchange(&self, request: SwitchboardRequest) -> Result<SwitchboardResponse> {
        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .context("switchboard request failed")?
            .error_for_status()
            .context("switchboard returned an error status")?;
        response
            .json()
            .await
            .context("switchboard response is not valid JSON")
    }
}

// ============================================================================
// Polling client
// ============================================================================

/// Client-side state of the rendezvous loop: the outbox of negotiation
/// items awaiting delivery and the next scheduled tick.
pub struct SwitchboardClient {
    switchboard: Arc<dyn Switchboard>,
    network_id: String,
    address: Address,
    outbox: Vec<NegotiationItem>,
    running: bool,
    next_at: Instant,
}

impl SwitchboardClient {
    pub fn new(switchboard: Arc<dyn Switchboard>, network_id: String, address: Address) -> Self {
        Self {
            switchboard,
            network_id,
            address,
            outbox: Vec::new(),
            running: true,
            // First request fires immediately; a fresh node wants in.
            next_at: Instant::now(),
        }
    }

    /// Queue a ready offer or answer for the follow-up request.
    pub fn queue(&mut self, item: NegotiationItem) {
        self.outbox.push(item);
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn next_deadline(&self) -> Instant {
        self.next_at
    }

    /// Park the loop. Queued items stay queued for a later `start`.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Re-enter the loop, polling immediately.
    pub fn start(&mut self) {
        self.running = true;
        self.next_at = Instant::now();
    }

    /// Perform one request, draining the outbox into it.
    ///
    /// An I/O error drops this tick; the caller reschedules by the usual
    /// cadence rule either way.
    pub async fn tick(&mut self) -> Option<SwitchboardResponse> {
        let request = SwitchboardRequest {
            network_id: self.network_id.clone(),
            address: self.address.clone(),
            negotiation_items: std::mem::take(&mut self.outbox),
        };
        match self.switchboard.exchange(request).await {
            Ok(response) => Some(response),
            Err(e) => {
                debug!(error = %e, "switchboard tick dropped");
                None
            }
        }
    }

    /// Schedule the next tick: fast while lonely, slow once meshed.
    ///
    /// A few percent of jitter desynchronizes nodes that started in the
    /// same instant; without it two lonely nodes can keep dialing each
    /// other in lockstep round after round.
    pub fn reschedule(&mut self, active_connections: usize, config: &Config) {
        let interval = if active_connections == 0 {
            config.fast_switchboard_request_interval
        } else {
            config.slow_switchboard_request_interval
        };
        let jittered = interval.mul_f64(rand::thread_rng().gen_range(0.95..=1.05));
        self.next_at = Instant::now() + jittered;
    }
}

// ============================================================================
// In-memory implementation
// ============================================================================

pub mod memory {
    //! An in-process switchboard implementing the same semantics a real
    //! server would: per-network address presence with a short TTL and a
    //! mailbox of undelivered negotiation items per address.

    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use anyhow::Result;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::Switchboard;
    use crate::identity::Address;
    use crate::wire::{NegotiationItem, SwitchboardRequest, SwitchboardResponse};

    /// How long an address stays listed after its last request.
    const ADDRESS_TTL: Duration = Duration::from_secs(30);

    /// SECURITY: Caps undelivered items per recipient; a recipient that
    /// never polls must not grow the mailbox without bound.
    const MAX_MAILBOX_ITEMS: usize = 64;

    #[derive(Default)]
    struct NetworkState {
        addresses: HashMap<Address, Instant>,
        mailboxes: HashMap<Address, Vec<NegotiationItem>>,
    }

    #[derive(Default)]
    pub struct MemorySwitchboard {
        networks: Mutex<HashMap<String, NetworkState>>,
    }

    impl MemorySwitchboard {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }
    }

    #[async_trait]
    impl Switchboard for MemorySwitchboard {
        async fn exchange(&self, request: SwitchboardRequest) -> Result<SwitchboardResponse> {
            let mut networks = self.networks.lock().await;
            let network = networks.entry(request.network_id.clone()).or_default();
            let now = Instant::now();

            network
                .addresses
                .retain(|_, last_seen| now.duration_since(*last_seen) <= ADDRESS_TTL);
            network.addresses.insert(request.address.clone(), now);

            for item in request.negotiation_items {
                let mailbox = network.mailboxes.entry(item.recipient.clone()).or_default();
                mailbox.push(item);
                if mailbox.len() > MAX_MAILBOX_ITEMS {
                    mailbox.remove(0);
                }
            }

            let addresses = network
                .addresses
                .keys()
                .filter(|a| **a != request.address)
                .cloned()
                .collect();
            let negotiation_items = network
                .mailboxes
                .remove(&request.address)
                .unwrap_or_default();

            Ok(SwitchboardResponse {
                addresses,
                negotiation_items,
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::wire::{Negotiation, NegotiationKind, fresh_hex_id};

        fn request(network: &str, address: &str) -> SwitchboardRequest {
            SwitchboardRequest {
                network_id: network.to_string(),
                address: Address::new(address),
                negotiation_items: Vec::new(),
            }
        }

        #[tokio::test]
        async fn addresses_are_scoped_per_network() {
            let switchboard = MemorySwitchboard::new();
            switchboard.exchange(request("net-1", "a")).await.unwrap();
            switchboard.exchange(request("net-2", "b")).await.unwrap();

            let response = switchboard.exchange(request("net-1", "c")).await.unwrap();
            assert_eq!(response.addresses, vec![Address::new("a")]);
        }

        #[tokio::test]
        async fn own_address_is_not_echoed_back() {
            let switchboard = MemorySwitchboard::new();
            let response = switchboard.exchange(request("net", "a")).await.unwrap();
            assert!(response.addresses.is_empty());
        }

        #[tokio::test]
        async fn negotiation_items_are_held_for_their_recipient() {
            let switchboard = MemorySwitchboard::new();
            let mut req = request("net", "a");
            req.negotiation_items.push(NegotiationItem {
                recipient: Address::new("b"),
                from: Address::new("a"),
                negotiation: Negotiation {
                    kind: NegotiationKind::Offer,
                    address: Address::new("a"),
                    sdp: Some("sdp".to_string()),
                    connection_id: fresh_hex_id(),
                    network_id: "net".to_string(),
                    timestamp: 1,
                },
            });
            switchboard.exchange(req).await.unwrap();

            // Someone else polls: nothing for them.
            let response = switchboard.exchange(request("net", "c")).await.unwrap();
            assert!(response.negotiation_items.is_empty());

            // The recipient polls: item delivered exactly once.
            let response = switchboard.exchange(request("net", "b")).await.unwrap();
            assert_eq!(response.negotiation_items.len(), 1);
            let response = switchboard.exchange(request("net", "b")).await.unwrap();
            assert!(response.negotiation_items.is_empty());
        }
    }
}
