//! # Negotiation Policy
//!
//! Stateless acceptance rules consulted by both negotiation channels (the
//! switchboard poll loop and in-band gossip) before the
//! [`ConnectionManager`](crate::connection::ConnectionManager) mutates
//! anything. Keeping the policy out of the manager means both channels
//! apply exactly the same rules.
//!
//! One asymmetry is deliberate: an incoming *offer* is refused only when a
//! **Connected** connection to that address already exists. An in-progress
//! initiator of our own does not refuse it: two nodes that dialed each
//! other simultaneously would otherwise deadlock, each refusing the other's
//! offer while its own never completes. Building the responder anyway lets
//! one side win; the loser is collected as a duplicate later.

use tracing::trace;

use crate::connection::{ConnectError, ConnectionManager};
use crate::identity::Address;
use crate::rude::RudeList;
use crate::wire::Negotiation;

/// Why an incoming offer was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferRejection {
    /// The offer originated from our own address.
    OurOwn,
    /// A Connected connection to the originator already exists.
    AlreadyConnected,
    /// The offer carries no session description.
    MissingSdp,
    /// The originator is currently rude.
    RudeSender,
    /// The hard connection cap is reached.
    AtCapacity,
}

impl std::fmt::Display for OfferRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OfferRejection::OurOwn => write!(f, "offer is our own"),
            OfferRejection::AlreadyConnected => write!(f, "already connected to originator"),
            OfferRejection::MissingSdp => write!(f, "offer has no session description"),
            OfferRejection::RudeSender => write!(f, "originator is rude"),
            OfferRejection::AtCapacity => write!(f, "connection limit reached"),
        }
    }
}

/// Should this incoming offer become a responder connection?
pub fn evaluate_offer(
    offer: &Negotiation,
    local: &Address,
    connections: &ConnectionManager,
    rude: &mut RudeList,
) -> Result<(), OfferRejection> {
    if &offer.address == local {
        return Err(OfferRejection::OurOwn);
    }
    if connections.connected_to(&offer.address) {
        return Err(OfferRejection::AlreadyConnected);
    }
    if offer.sdp.is_none() {
        return Err(OfferRejection::MissingSdp);
    }
    if rude.is_rude(&offer.address) {
        return Err(OfferRejection::RudeSender);
    }
    if connections.at_capacity() {
        return Err(OfferRejection::AtCapacity);
    }
    Ok(())
}

/// Should we dial `target` after seeing it in a switchboard address list?
///
/// Refuses when *any* connection to the target exists, whatever its state:
/// an in-flight handshake is reason enough not to dial again, and one that
/// never completes is failed by the transport's own timeout before the
/// address shows up again.
pub fn should_initiate(
    target: &Address,
    local: &Address,
    connections: &ConnectionManager,
    rude: &mut RudeList,
) -> bool {
    target != local
        && !target.is_wildcard()
        && !connections.any_to(target)
        && !rude.is_rude(target)
        && !connections.at_capacity()
}

/// Should this presence announcement produce a fresh initiator?
///
/// Presence is the mesh's retry loop, so the bar is lower than for
/// switchboard addresses: only a *Connected* connection to the announcer
/// blocks the dial. Anything half-built to that address is torn down by
/// [`ConnectionManager::ensure_initiator`] and replaced; that replacement
/// is what unsticks handshakes whose counterpart is gone.
pub fn presence_warrants_dial(
    target: &Address,
    local: &Address,
    connections: &ConnectionManager,
    rude: &mut RudeList,
) -> bool {
    target != local
        && !target.is_wildcard()
        && !connections.connected_to(target)
        && !rude.is_rude(target)
}

/// Apply an incoming answer to the connection it references.
///
/// Duplicate and unrelated answers are a normal byproduct of the
/// simultaneous-dial mitigation above, so every failure here is silent:
/// traced, never surfaced.
pub fn apply_answer(answer: &Negotiation, local: &Address, connections: &mut ConnectionManager) {
    if &answer.address == local {
        return;
    }
    match connections.signal_answer(answer) {
        Ok(id) => trace!(connection = %id, from = %answer.address, "answer accepted"),
        Err(ConnectError::UnknownConnection) | Err(ConnectError::NotApplicable) => {
            trace!(from = %answer.address, "unrelated answer ignored");
        }
        Err(e) => trace!(from = %answer.address, error = %e, "answer dropped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::NegotiationPath;
    use crate::crypto::SdpCipher;
    use crate::identity::now_ms;
    use crate::transport::memory::{MemoryHub, MemoryTransportFactory};
    use crate::wire::{NegotiationKind, fresh_hex_id};
    use tokio::sync::mpsc;

    fn fixtures(max: usize) -> (ConnectionManager, RudeList, Address) {
        let (tx, _rx) = mpsc::channel(64);
        let manager = ConnectionManager::new(
            "net".to_string(),
            Address::new("self"),
            SdpCipher::new(None),
            MemoryTransportFactory::new(MemoryHub::new()),
            tx,
            max,
        );
        (manager, RudeList::new(Some(1000)), Address::new("self"))
    }

    fn offer_from(address: &str) -> Negotiation {
        Negotiation {
            kind: NegotiationKind::Offer,
            address: Address::new(address),
            sdp: Some("sdp".to_string()),
            connection_id: fresh_hex_id(),
            network_id: "net".to_string(),
            timestamp: now_ms(),
        }
    }

    #[test]
    fn valid_offer_is_accepted() {
        let (conns, mut rude, local) = fixtures(10);
        assert_eq!(
            evaluate_offer(&offer_from("peer"), &local, &conns, &mut rude),
            Ok(())
        );
    }

    #[test]
    fn own_offer_is_rejected() {
        let (conns, mut rude, local) = fixtures(10);
        assert_eq!(
            evaluate_offer(&offer_from("self"), &local, &conns, &mut rude),
            Err(OfferRejection::OurOwn)
        );
    }

    #[test]
    fn pending_sdp_is_rejected() {
        let (conns, mut rude, local) = fixtures(10);
        let mut offer = offer_from("peer");
        offer.sdp = None;
        assert_eq!(
            evaluate_offer(&offer, &local, &conns, &mut rude),
            Err(OfferRejection::MissingSdp)
        );
    }

    #[test]
    fn full_house_rejects_offers() {
        let (mut conns, mut rude, local) = fixtures(1);
        conns.ensure_initiator(&Address::new("other"), NegotiationPath::Switchboard);
        assert_eq!(
            evaluate_offer(&offer_from("peer"), &local, &conns, &mut rude),
            Err(OfferRejection::AtCapacity)
        );
    }

    #[test]
    fn in_progress_initiator_does_not_block_their_offer() {
        // Simultaneous dial: we are mid-handshake toward "peer" when their
        // offer arrives. The policy still accepts it.
        let (mut conns, mut rude, local) = fixtures(10);
        conns.ensure_initiator(&Address::new("peer"), NegotiationPath::Gossip);
        assert_eq!(
            evaluate_offer(&offer_from("peer"), &local, &conns, &mut rude),
            Ok(())
        );
    }

    #[test]
    fn switchboard_address_is_not_redialed_while_any_connection_exists() {
        let (mut conns, mut rude, local) = fixtures(10);
        let target = Address::new("peer");
        assert!(should_initiate(&target, &local, &conns, &mut rude));
        conns.ensure_initiator(&target, NegotiationPath::Gossip);
        assert!(!should_initiate(&target, &local, &conns, &mut rude));
    }

    #[test]
    fn presence_redials_over_a_half_built_connection() {
        let (mut conns, mut rude, local) = fixtures(10);
        let target = Address::new("peer");
        assert!(presence_warrants_dial(&target, &local, &conns, &mut rude));
        // A stuck handshake does not block the presence retry loop.
        conns.ensure_initiator(&target, NegotiationPath::Gossip);
        assert!(presence_warrants_dial(&target, &local, &conns, &mut rude));
        assert!(!presence_warrants_dial(&local, &local, &conns, &mut rude));
    }

    #[test]
    fn never_dial_self_or_wildcard() {
        let (conns, mut rude, local) = fixtures(10);
        assert!(!should_initiate(&local, &local, &conns, &mut rude));
        assert!(!should_initiate(&Address::wildcard(), &local, &conns, &mut rude));
    }
}
