//! Multi-node behaviour over an in-memory network.
//!
//! Run with: cargo test --test network

use std::thread;
use std::time::{Duration, Instant};

use std::net::SocketAddr;

use kadmium::common::{
    Message, MessageBody, MessageId, RequestBody, RequestKind, ResponseBody, KUID_BITS,
};
use kadmium::{
    Config, Contact, Dht, DhtError, DhtValue, EntityKey, Kuid, MemoryNetwork, MemorySocket, Testnet,
    Transport, ValueType, Version,
};

fn text(content: &'static str) -> DhtValue {
    DhtValue::new(ValueType::TEXT, Version::new(1, 0), content.as_bytes())
}

/// Polls `condition` every few milliseconds until it holds or `timeout` elapses.
fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }

    condition()
}

/// Testnet config with short timeouts, for tests waiting on silent peers.
fn fast_config() -> Config {
    Config {
        request_timeout: Duration::from_millis(200),
        ..Testnet::config()
    }
}

/// A peer that pings `node` once, so `node` adds it to its route table, and
/// then never answers on its own.
fn silent_peer(testnet: &Testnet, node: usize, address: &str) -> (MemorySocket, Contact) {
    let address: SocketAddr = address.parse().unwrap();
    let mut socket = testnet.network.bind(address).unwrap();
    let contact = Contact::live(Kuid::random(), address, 1);

    socket
        .send(
            testnet.addresses[node],
            Message::request(MessageId(1), contact.clone(), RequestBody::Ping),
        )
        .unwrap();

    let added = eventually(Duration::from_secs(2), || {
        let contacts = testnet.nodes[node].contacts().unwrap();
        contacts.iter().any(|c| c.id() == contact.id())
    });
    assert!(added);

    (socket, contact)
}

#[test]
fn bootstrap_fills_route_tables() {
    let testnet = Testnet::new(12).unwrap();

    for node in &testnet.nodes {
        let info = node.info().unwrap();

        assert!(info.bootstrapped());
        assert!(info.route_table_size() >= 6, "{}", info);
    }

    let contacts = testnet.nodes[0].contacts().unwrap();
    assert!(contacts.iter().any(|c| c.address() == testnet.addresses[11]));
}

#[test]
fn bootstrap_through_unreachable_address_fails() {
    let network = MemoryNetwork::new();
    let dht = Dht::builder()
        .config(Testnet::config())
        .request_timeout(Duration::from_millis(100))
        .network(&network)
        .build()
        .unwrap();

    let result = dht.bootstrap(&["10.99.0.1:6881".parse().unwrap()]).wait();

    assert!(matches!(result, Err(DhtError::Timeout { .. })));
    assert!(!dht.info().unwrap().bootstrapped());
}

#[test]
fn find_node_returns_nearest_first() {
    let testnet = Testnet::new(15).unwrap();
    let target = Kuid::random();

    let result = testnet.nodes[4].find_node(target).wait().unwrap();
    let path = result.path();

    assert!(!path.is_empty());
    assert!(path.len() <= Config::default().k());
    for pair in path.windows(2) {
        assert!(!pair[1].id().is_nearer_to(&target, pair[0].id()));
    }
}

#[test]
fn put_then_find_value() {
    let testnet = Testnet::new(10).unwrap();

    let key = Kuid::from_key_material("integration");
    let stored = testnet.nodes[2].put(key, text("value")).wait().unwrap();

    assert!(stored.failed().is_empty());
    assert_eq!(stored.locations().len(), testnet.nodes.len());

    for node in &testnet.nodes {
        let found = node.find_value(EntityKey::any(key)).wait().unwrap();

        assert!(found.is_found());
        assert_eq!(found.entities()[0].value(), &text("value"));
        assert_eq!(found.entities()[0].creator().address(), testnet.addresses[2]);
    }
}

#[test]
fn put_replaces_previous_value() {
    let testnet = Testnet::new(6).unwrap();
    let key = Kuid::from_key_material("replace");

    testnet.nodes[1].put(key, text("first")).wait().unwrap();
    testnet.nodes[1].put(key, text("second")).wait().unwrap();

    let found = testnet.nodes[4].find_value(EntityKey::any(key)).wait().unwrap();

    assert_eq!(found.entities().len(), 1);
    assert_eq!(found.entities()[0].value(), &text("second"));
}

#[test]
fn values_of_different_creators_coexist() {
    let testnet = Testnet::new(6).unwrap();
    let key = Kuid::from_key_material("shared");

    testnet.nodes[1].put(key, text("one")).wait().unwrap();
    testnet.nodes[2].put(key, text("two")).wait().unwrap();

    let info = testnet.nodes[3].info().unwrap();
    assert_eq!(info.keys(), 1);
    assert_eq!(info.values(), 2);
}

#[test]
fn remove_is_idempotent() {
    let testnet = Testnet::new(6).unwrap();
    let key = Kuid::from_key_material("short lived");

    testnet.nodes[0].put(key, text("bye")).wait().unwrap();
    testnet.nodes[0].remove(key).wait().unwrap();

    let found = testnet.nodes[5].find_value(EntityKey::any(key)).wait().unwrap();
    assert!(!found.is_found());

    let removed = testnet.nodes[0].remove(key).wait().unwrap();
    assert!(removed.failed().is_empty());
}

#[test]
fn oversized_value_is_rejected() {
    let testnet = Testnet::new(3).unwrap();
    let value = DhtValue::new(ValueType::BINARY, Version::default(), vec![0u8; 4096]);

    let result = testnet.nodes[0].put(Kuid::random(), value).wait();

    assert!(matches!(result, Err(DhtError::Value(_))));
}

#[test]
fn operations_require_bootstrap() {
    let dht = Dht::builder().config(Testnet::config()).build().unwrap();

    assert!(matches!(
        dht.find_value(EntityKey::any(Kuid::random())).wait(),
        Err(DhtError::NotBootstrapped("find_value"))
    ));
    assert!(matches!(
        dht.store(Vec::new()).wait(),
        Err(DhtError::NotBootstrapped("store"))
    ));
}

#[test]
fn store_forward_to_newcomer() {
    let testnet = Testnet::new(25).unwrap();

    let key = Kuid::from_key_material("forwarded");
    testnet.nodes[0].put(key, text("copied")).wait().unwrap();

    let newcomer = Dht::builder()
        .config(Testnet::config())
        .node_id(key.flip_bit(KUID_BITS - 1))
        .network(&testnet.network)
        .build()
        .unwrap();

    assert!(newcomer.bootstrap(testnet.bootstrap()).wait().unwrap().is_success());

    let forwarded = eventually(Duration::from_secs(5), || {
        newcomer.info().map(|info| info.values() == 1).unwrap_or(false)
    });

    assert!(forwarded, "{}", newcomer.database_dump().unwrap());
}

#[test]
fn unresponsive_contact_is_marked_failed() {
    let testnet = Testnet::with_config(3, fast_config()).unwrap();
    let (_silent, contact) = silent_peer(&testnet, 0, "10.250.0.1:6881");

    let result = testnet.nodes[0].ping_contact(contact.clone()).wait();
    assert!(matches!(result, Err(DhtError::Timeout { .. })));

    let contacts = testnet.nodes[0].contacts().unwrap();
    let failed = contacts
        .iter()
        .find(|c| c.id() == contact.id())
        .map(|c| c.failures() > 0)
        .unwrap_or(true);
    assert!(failed);
}

#[test]
fn lookups_fail_when_every_contact_fails() {
    let testnet = Testnet::with_config(2, fast_config()).unwrap();
    let (_silent, _) = silent_peer(&testnet, 0, "10.250.0.2:6881");

    testnet.nodes[1].shutdown();
    let gone = eventually(Duration::from_secs(2), || {
        let contacts = testnet.nodes[0].contacts().unwrap();
        contacts
            .iter()
            .filter(|c| c.address() == testnet.addresses[1])
            .all(|c| c.is_shutdown())
    });
    assert!(gone);

    let found = testnet.nodes[0]
        .find_value(EntityKey::any(Kuid::random()))
        .wait();
    assert!(matches!(
        found,
        Err(DhtError::AllContactsFailed {
            operation: RequestKind::FindValue,
            ..
        })
    ));

    let nodes = testnet.nodes[0].find_node(Kuid::random()).wait();
    assert!(matches!(
        nodes,
        Err(DhtError::AllContactsFailed {
            operation: RequestKind::FindNode,
            ..
        })
    ));
}

#[test]
fn find_node_counts_route_table_failures() {
    let testnet = Testnet::with_config(3, fast_config()).unwrap();
    let (_silent, contact) = silent_peer(&testnet, 0, "10.250.0.3:6881");

    let result = testnet.nodes[0].find_node(Kuid::random()).wait().unwrap();

    assert_eq!(result.route_table_failure_count(), 1);
    assert!(result.queried().contains(contact.id()));
    assert!(result.path().iter().all(|c| c.id() != contact.id()));
    assert!(result.collisions().is_empty());
}

#[test]
fn find_node_reports_collisions() {
    let testnet = Testnet::with_config(2, fast_config()).unwrap();
    let (mut peer, peer_contact) = silent_peer(&testnet, 0, "10.250.0.4:6881");

    let local = testnet.nodes[0].info().unwrap();
    let impostor = Contact::live(*local.id(), "10.250.0.5:6881".parse().unwrap(), 0);

    let lookup = testnet.nodes[0].find_node(Kuid::random());

    // Answer the FIND_NODE with a contact using node 0's id elsewhere.
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(2) {
        let Some((message, from)) = peer.recv_timeout(Duration::from_millis(50)) else {
            continue;
        };

        if let MessageBody::Request(RequestBody::FindNode { lookup_id }) = message.body {
            let response = ResponseBody::FindNode {
                lookup_id,
                token: None,
                nodes: vec![impostor.clone()],
            };
            peer.send(
                from,
                Message::response_to(message.id, peer_contact.clone(), response),
            )
            .unwrap();
            break;
        }
    }

    let result = lookup.wait().unwrap();

    assert_eq!(result.collisions().len(), 1);
    assert_eq!(result.collisions()[0].address(), impostor.address());
    assert!(result.queried().contains(peer_contact.id()));
    assert!(result.path().iter().all(|c| c.address() != impostor.address()));
}

#[test]
fn shutdown_notifies_nearest_contacts() {
    let testnet = Testnet::new(5).unwrap();
    let leaving = testnet.nodes[4].info().unwrap();

    testnet.nodes[4].shutdown();

    let noticed = eventually(Duration::from_secs(2), || {
        let contacts = testnet.nodes[0].contacts().unwrap();
        contacts
            .iter()
            .find(|c| c.id() == leaving.id())
            .map(|c| c.is_shutdown())
            .unwrap_or(true)
    });

    assert!(noticed);
    assert!(matches!(
        testnet.nodes[4].ping(testnet.addresses[0]).wait(),
        Err(DhtError::Shutdown)
    ));
}
