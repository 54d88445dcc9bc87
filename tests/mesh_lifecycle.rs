//! End-to-end mesh lifecycle scenarios: bootstrap, switchboard-free
//! healing, the connection cap, and teardown/restore.
//!
//! Every scenario runs real nodes over the in-process transport hub and the
//! in-process switchboard, with intervals tightened so convergence happens
//! in test time.

use std::sync::Arc;
use std::time::Duration;

use meshweave::switchboard::memory::MemorySwitchboard;
use meshweave::transport::memory::{MemoryHub, MemoryTransportFactory};
use meshweave::{Address, Config, ConnectionRole, Keypair, Node, NodeEvent};

fn fast_config() -> Config {
    Config {
        presence_broadcast_interval: Duration::from_millis(250),
        fast_switchboard_request_interval: Duration::from_millis(50),
        slow_switchboard_request_interval: Duration::from_millis(200),
        garbage_collect_interval: Duration::from_millis(250),
        max_message_rate_before_rude: None,
        max_connections: 10,
    }
}

/// One in-process mesh: a shared rendezvous and a shared transport hub.
struct Mesh {
    switchboard: Arc<MemorySwitchboard>,
    hub: Arc<MemoryHub>,
    network: String,
}

impl Mesh {
    fn new(network: &str) -> Self {
        Self {
            switchboard: MemorySwitchboard::new(),
            hub: MemoryHub::new(),
            network: network.to_string(),
        }
    }

    async fn spawn(&self, config: Config) -> (Node, Keypair) {
        let keypair = Keypair::generate();
        let node = self.spawn_with_secret(&keypair.to_secret_hex(), config).await;
        (node, keypair)
    }

    async fn spawn_with_secret(&self, secret: &str, config: Config) -> Node {
        Node::builder(&self.network, "memory://switch")
            .secret(secret)
            .config(config)
            .switchboard(self.switchboard.clone())
            .transport(MemoryTransportFactory::new(self.hub.clone()))
            .spawn()
            .await
            .expect("node spawns")
    }
}

async fn wait_active(node: &Node, want: usize, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if node.active_connections().await.len() >= want {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {want} active connections on {}",
            node.address()
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn wait_active_to(node: &Node, peer: &Address, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if node
            .active_connections()
            .await
            .iter()
            .any(|c| c.address.as_ref() == Some(peer))
        {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {} to reach {peer}",
            node.address()
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn three_nodes_bootstrap_into_a_full_mesh() {
    let mesh = Mesh::new("bootstrap");
    let (a, _) = mesh.spawn(fast_config()).await;
    let (b, _) = mesh.spawn(fast_config()).await;
    let (c, _) = mesh.spawn(fast_config()).await;

    let timeout = Duration::from_secs(30);
    wait_active(&a, 2, timeout).await;
    wait_active(&b, 2, timeout).await;
    wait_active(&c, 2, timeout).await;

    // Each node sees exactly the other two.
    for (node, others) in [
        (&a, [b.address(), c.address()]),
        (&b, [a.address(), c.address()]),
        (&c, [a.address(), b.address()]),
    ] {
        let peers: Vec<Address> = node
            .active_connections()
            .await
            .into_iter()
            .filter_map(|c| c.address)
            .collect();
        for other in others {
            assert!(peers.contains(other), "{} misses {other}", node.address());
        }
    }

    for node in [&a, &b, &c] {
        node.teardown().await;
    }
}

#[tokio::test]
async fn late_joiner_reaches_a_node_that_left_the_switchboard() {
    let mesh = Mesh::new("healing");
    let (a, _) = mesh.spawn(fast_config()).await;
    let (b, _) = mesh.spawn(fast_config()).await;
    wait_active(&a, 1, Duration::from_secs(20)).await;
    wait_active(&b, 1, Duration::from_secs(20)).await;

    // A goes dark on the rendezvous. From here on it is reachable only
    // through the mesh.
    a.stop_switchboard_requests().await;

    let (c, _) = mesh.spawn(fast_config()).await;
    wait_active_to(&c, a.address(), Duration::from_secs(30)).await;

    // The in-band path ran offer -> answer with C initiating.
    let to_a = c
        .active_connections()
        .await
        .into_iter()
        .find(|conn| conn.address.as_ref() == Some(a.address()))
        .expect("connection to A");
    assert_eq!(to_a.role, ConnectionRole::Initiator);

    for node in [&a, &b, &c] {
        node.teardown().await;
    }
}

#[tokio::test]
async fn connection_cap_keeps_a_fourth_node_out() {
    let capped = Config {
        max_connections: 2,
        ..fast_config()
    };
    let mesh = Mesh::new("capped");
    let (a, _) = mesh.spawn(capped.clone()).await;
    let (b, _) = mesh.spawn(capped.clone()).await;
    let (c, _) = mesh.spawn(capped.clone()).await;

    let timeout = Duration::from_secs(30);
    wait_active(&a, 2, timeout).await;
    wait_active(&b, 2, timeout).await;
    wait_active(&c, 2, timeout).await;

    let (d, _) = mesh.spawn(capped.clone()).await;
    let mut d_events = d.events().await.unwrap();

    // Observe for a while: the saturated mesh must neither open a slot for
    // D nor route any negotiation to it.
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert!(d.active_connections().await.is_empty());
    while let Ok(event) = d_events.try_recv() {
        if let NodeEvent::SwitchboardResponse(response) = event {
            assert!(
                response.negotiation_items.is_empty(),
                "saturated mesh routed a negotiation to the newcomer"
            );
        }
    }
    for node in [&a, &b, &c] {
        let connections = node.connections().await;
        assert!(
            connections.len() <= 2,
            "{} exceeded its connection cap",
            node.address()
        );
        assert_eq!(node.active_connections().await.len(), 2);
    }

    for node in [&a, &b, &c, &d] {
        node.teardown().await;
    }
}

#[tokio::test]
async fn torn_down_node_restores_under_the_same_secret() {
    let mesh = Mesh::new("restore");
    let (a, a_keypair) = mesh.spawn(fast_config()).await;
    let (b, _) = mesh.spawn(fast_config()).await;
    let (c, _) = mesh.spawn(fast_config()).await;

    let timeout = Duration::from_secs(30);
    wait_active(&a, 2, timeout).await;
    wait_active(&b, 2, timeout).await;
    wait_active(&c, 2, timeout).await;

    a.teardown().await;
    assert!(
        a.broadcast(meshweave::Draft::new("chat", "text")).await.is_err(),
        "a torn down node accepts no work"
    );

    // B and C notice the loss.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let b_peers = b.active_connections().await.len();
        let c_peers = c.active_connections().await.len();
        if b_peers == 1 && c_peers == 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "peers never noticed the teardown"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Same secret, same config: the reborn node reclaims its address and
    // its place in the mesh.
    let reborn = mesh
        .spawn_with_secret(&a_keypair.to_secret_hex(), fast_config())
        .await;
    assert_eq!(reborn.address(), &a_keypair.address());
    wait_active(&reborn, 2, Duration::from_secs(30)).await;

    for node in [&b, &c, &reborn] {
        node.teardown().await;
    }
}

#[tokio::test]
async fn flooding_peer_is_expelled() {
    let strict = Config {
        max_message_rate_before_rude: Some(20),
        ..fast_config()
    };
    let mesh = Mesh::new("flood");
    let (victim, _) = {
        let keypair = Keypair::generate();
        let node = Node::builder(&mesh.network, "memory://switch")
            .secret(keypair.to_secret_hex())
            .config(strict)
            .switchboard(mesh.switchboard.clone())
            .transport(MemoryTransportFactory::new(mesh.hub.clone()))
            .spawn()
            .await
            .unwrap();
        (node, keypair)
    };
    let (flooder, _) = mesh.spawn(fast_config()).await;

    wait_active(&victim, 1, Duration::from_secs(20)).await;
    let mut victim_events = victim.events().await.unwrap();

    for i in 0..100 {
        flooder
            .broadcast(meshweave::Draft::new("chat", "text").data(serde_json::json!({"n": i})))
            .await
            .unwrap();
    }

    // The victim notices the rate violation and cuts the flooder off.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if victim.active_connections().await.is_empty() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "flooder was never expelled"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let mut saw_destroy = false;
    while let Ok(event) = victim_events.try_recv() {
        if matches!(event, NodeEvent::DestroyConnection { .. }) {
            saw_destroy = true;
        }
    }
    assert!(saw_destroy, "expulsion must surface as destroy-connection");

    victim.teardown().await;
    flooder.teardown().await;
}

#[tokio::test]
async fn teardown_silences_the_event_stream() {
    let mesh = Mesh::new("silence");
    let (a, _) = mesh.spawn(fast_config()).await;
    let (b, _) = mesh.spawn(fast_config()).await;
    wait_active(&a, 1, Duration::from_secs(20)).await;

    let mut events = a.events().await.unwrap();
    a.teardown().await;

    // Drain whatever was emitted up to and during teardown; afterwards the
    // stream must end rather than produce more.
    let ended = tokio::time::timeout(Duration::from_secs(5), async {
        while events.recv().await.is_some() {}
    })
    .await;
    assert!(ended.is_ok(), "event stream stayed open after teardown");

    b.teardown().await;
}
