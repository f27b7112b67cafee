//! Dht node.

use std::fmt::{self, Debug, Formatter};
use std::io;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::info;

use crate::actor::transport::{MemoryNetwork, Transport};
use crate::actor::{Actor, ActorMessage, Config, Info, PingTarget};
use crate::common::{Contact, DhtValue, DhtValueEntity, EntityKey, Kuid, StatsKind};
use crate::core::results::{BootstrapResult, FindNodeResult, FindValueResult, PingResult, StoreResult};
use crate::{DhtError, Result};

#[derive(Debug, Clone)]
/// Kadmium DHT node.
///
/// A cheap handle to the node's actor thread. The node shuts down once
/// [Dht::shutdown] is called or every clone of the handle is dropped.
pub struct Dht(pub(crate) Sender<ActorMessage>);

#[derive(Default)]
/// A builder for [Dht].
pub struct DhtBuilder {
    config: Config,
    network: Option<MemoryNetwork>,
    transport: Option<Box<dyn Transport>>,
}

impl Debug for DhtBuilder {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhtBuilder")
            .field("config", &self.config)
            .field("network", &self.network.is_some())
            .field("transport", &self.transport.is_some())
            .finish()
    }
}

impl DhtBuilder {
    /// Replace the whole [Config].
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Set the replication parameter `k`.
    pub fn k(mut self, k: usize) -> Self {
        self.config.routing.k = k;
        self
    }

    /// Set the default request timeout.
    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.config.request_timeout = request_timeout;
        self
    }

    /// Announce this node as unreachable.
    pub fn firewalled(mut self, firewalled: bool) -> Self {
        self.config.firewalled = firewalled;
        self
    }

    /// Whether loopback and site-local addresses are never routed to.
    pub fn local_is_private(mut self, local_is_private: bool) -> Self {
        self.config.local_is_private = local_is_private;
        self
    }

    /// Use a fixed node id instead of a random one.
    pub fn node_id(mut self, node_id: Kuid) -> Self {
        self.config.node_id = Some(node_id);
        self
    }

    /// Bind the node to the next free address of `network`.
    pub fn network(mut self, network: &MemoryNetwork) -> Self {
        self.network = Some(network.clone());
        self
    }

    /// Run the node on an already bound transport.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    /// Create a Dht node, running on its own thread.
    ///
    /// Without a transport or a network, the node gets a network of its own.
    pub fn build(self) -> io::Result<Dht> {
        let transport: Box<dyn Transport> = match (self.transport, self.network) {
            (Some(transport), _) => transport,
            (None, Some(network)) => Box::new(network.bind_any()?),
            (None, None) => Box::new(MemoryNetwork::new().bind_any()?),
        };

        Dht::spawn(self.config, transport)
    }
}

impl Dht {
    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    /// Create a new Dht node with the given [Config].
    pub fn new(config: Config) -> io::Result<Self> {
        Dht::builder().config(config).build()
    }

    fn spawn(config: Config, transport: Box<dyn Transport>) -> io::Result<Self> {
        let (sender, receiver) = flume::unbounded();

        thread::Builder::new()
            .name(format!("kadmium {}", transport.local_addr()))
            .spawn(move || Actor::new(config, transport).run(receiver))?;

        Ok(Dht(sender))
    }

    // === Getters ===

    /// Information and statistics about this node.
    pub fn info(&self) -> Result<Info> {
        self.request(ActorMessage::Info).recv()
    }

    /// Every contact of the route table, most recently seen first.
    pub fn contacts(&self) -> Result<Vec<Contact>> {
        self.request(ActorMessage::Contacts).recv()
    }

    /// Human readable listing of the route table.
    pub fn route_table_dump(&self) -> Result<String> {
        self.request(|sender| ActorMessage::Dump(StatsKind::RouteTable, sender))
            .recv()
    }

    /// Human readable listing of the database.
    pub fn database_dump(&self) -> Result<String> {
        self.request(|sender| ActorMessage::Dump(StatsKind::Database, sender))
            .recv()
    }

    /// Human readable message counters.
    pub fn statistics_dump(&self) -> Result<String> {
        self.request(|sender| ActorMessage::Dump(StatsKind::Statistics, sender))
            .recv()
    }

    // === Public Methods ===

    /// Stop the node, telling its nearest contacts it is leaving.
    ///
    /// Pending operations fail with [DhtError::Shutdown].
    pub fn shutdown(&self) {
        let _ = self.request(ActorMessage::Shutdown).recv();
    }

    /// Ping a node we only know the address of.
    pub fn ping(&self, address: SocketAddr) -> DhtFuture<PingResult> {
        self.operation(|sender| ActorMessage::Ping(PingTarget::Address(address), sender))
    }

    /// Ping a known contact.
    pub fn ping_contact(&self, contact: Contact) -> DhtFuture<PingResult> {
        self.operation(|sender| ActorMessage::Ping(PingTarget::Contact(contact), sender))
    }

    /// Join the network through the first of `addresses` that answers.
    pub fn bootstrap(&self, addresses: &[SocketAddr]) -> DhtFuture<BootstrapResult> {
        let targets = addresses.iter().copied().map(PingTarget::Address).collect();
        self.operation(|sender| ActorMessage::Bootstrap(targets, sender))
    }

    /// Join the network through a known contact.
    pub fn bootstrap_contact(&self, contact: Contact) -> DhtFuture<BootstrapResult> {
        self.operation(|sender| ActorMessage::Bootstrap(vec![PingTarget::Contact(contact)], sender))
    }

    /// Find the `k` nearest contacts to `id`.
    pub fn find_node(&self, id: Kuid) -> DhtFuture<FindNodeResult> {
        self.operation(|sender| ActorMessage::FindNode(id, sender))
    }

    /// Find the values stored under `key`.
    pub fn find_value(&self, key: EntityKey) -> DhtFuture<FindValueResult> {
        self.operation(|sender| ActorMessage::FindValue(key, sender))
    }

    /// Publish `value` under `key` at the `k` nearest nodes, this one included
    /// if it is one of them.
    pub fn put(&self, key: Kuid, value: DhtValue) -> DhtFuture<StoreResult> {
        self.operation(|sender| ActorMessage::Put(key, value, sender))
    }

    /// Remove the value this node published under `key`.
    pub fn remove(&self, key: Kuid) -> DhtFuture<StoreResult> {
        self.put(key, DhtValue::empty())
    }

    /// Store entities sharing a primary key at the `k` nearest nodes, like
    /// values found with [Dht::find_value] that should be republished.
    pub fn store(&self, entities: Vec<DhtValueEntity>) -> DhtFuture<StoreResult> {
        self.operation(|sender| ActorMessage::Store(entities, sender))
    }

    // === Private Methods ===

    fn request<T>(&self, message: impl FnOnce(Sender<T>) -> ActorMessage) -> Reply<T> {
        let (sender, receiver) = flume::bounded(1);
        let _ = self.0.send(message(sender));
        Reply(receiver)
    }

    fn operation<T>(&self, message: impl FnOnce(Sender<Result<T>>) -> ActorMessage) -> DhtFuture<T> {
        let (sender, receiver) = flume::bounded(1);
        // If the actor is gone, the message and its sender are dropped, and
        // the future resolves to DhtError::Shutdown.
        let _ = self.0.send(message(sender));
        DhtFuture { receiver }
    }
}

struct Reply<T>(Receiver<T>);

impl<T> Reply<T> {
    fn recv(self) -> Result<T> {
        self.0.recv().map_err(|_| DhtError::Shutdown)
    }
}

#[derive(Debug)]
#[must_use = "dropping a DhtFuture cancels its operation"]
/// The pending result of an operation.
///
/// Dropping it cancels the operation.
pub struct DhtFuture<T> {
    pub(crate) receiver: Receiver<Result<T>>,
}

impl<T> DhtFuture<T> {
    /// Block until the operation completes.
    pub fn wait(self) -> Result<T> {
        self.receiver.recv().map_err(|_| DhtError::Shutdown)?
    }

    /// Block until the operation completes, or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(DhtError::Shutdown)),
        }
    }

    /// Returns the result if the operation already completed.
    pub fn try_get(&self) -> Option<Result<T>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(DhtError::Shutdown)),
        }
    }
}

/// Create a testnet of Dht nodes on a [MemoryNetwork], to run tests against
/// instead of a real network.
#[derive(Debug)]
pub struct Testnet {
    pub network: MemoryNetwork,
    pub nodes: Vec<Dht>,
    /// Node addresses, in the order of [Self::nodes].
    pub addresses: Vec<SocketAddr>,
}

impl Testnet {
    /// Starts `count` bootstrapped nodes.
    pub fn new(count: usize) -> Result<Testnet> {
        Testnet::with_config(count, Testnet::config())
    }

    /// Default [Config] of testnet nodes: private addresses are routable and
    /// requests time out faster.
    pub fn config() -> Config {
        Config {
            local_is_private: false,
            request_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    /// Starts `count` nodes with `config`.
    ///
    /// The first node is the bootstrap node of every other one, and then
    /// bootstraps from the second node itself.
    pub fn with_config(count: usize, config: Config) -> Result<Testnet> {
        let network = MemoryNetwork::new();
        let mut nodes: Vec<Dht> = Vec::with_capacity(count);
        let mut addresses = Vec::with_capacity(count);

        for i in 0..count {
            let node = Dht::builder()
                .config(config.clone())
                .network(&network)
                .build()?;

            let address = node.info()?.local_addr();

            if i > 0 {
                bootstrapped(node.bootstrap(&addresses[..1]).wait()?)?;
            }

            nodes.push(node);
            addresses.push(address);
        }

        if count > 1 {
            bootstrapped(nodes[0].bootstrap(&addresses[1..2]).wait()?)?;
        }

        info!(nodes = count, "Testnet ready");

        Ok(Testnet {
            network,
            nodes,
            addresses,
        })
    }

    /// Address of the first node, to bootstrap additional nodes from.
    pub fn bootstrap(&self) -> &[SocketAddr] {
        &self.addresses[..self.addresses.len().min(1)]
    }
}

fn bootstrapped(result: BootstrapResult) -> Result<()> {
    if result.is_success() {
        Ok(())
    } else {
        Err(DhtError::NotBootstrapped("join the testnet"))
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::common::{DhtValue, ValueType, Version};

    #[test]
    fn shutdown() {
        let dht = Dht::builder().build().unwrap();
        let clone = dht.clone();

        let info = dht.info().unwrap();
        assert!(!info.bootstrapped());

        clone.shutdown();

        assert!(matches!(dht.info(), Err(DhtError::Shutdown)));
        assert!(matches!(
            dht.find_node(Kuid::random()).wait(),
            Err(DhtError::Shutdown)
        ));
    }

    #[test]
    fn not_bootstrapped() {
        let dht = Dht::builder().build().unwrap();

        assert!(matches!(
            dht.find_node(Kuid::random()).wait(),
            Err(DhtError::NotBootstrapped("find_node"))
        ));

        let value = DhtValue::new(ValueType::TEXT, Version::default(), &b"hello"[..]);
        assert!(matches!(
            dht.put(Kuid::random(), value).wait(),
            Err(DhtError::NotBootstrapped("put"))
        ));
        assert!(matches!(
            dht.remove(Kuid::random()).wait(),
            Err(DhtError::NotBootstrapped("remove"))
        ));
    }

    #[test]
    fn ping_unbound_address_times_out() {
        let network = MemoryNetwork::new();
        let dht = Dht::builder()
            .local_is_private(false)
            .request_timeout(Duration::from_millis(50))
            .network(&network)
            .build()
            .unwrap();

        let result = dht.ping(SocketAddr::from(([10, 200, 0, 1], 6881))).wait();

        assert!(matches!(result, Err(DhtError::Timeout { .. })));
    }

    #[test]
    fn bootstrap_from_self_fails() {
        let dht = Dht::builder().local_is_private(false).build().unwrap();
        let address = dht.info().unwrap().local_addr();

        let result = dht.bootstrap(&[address]).wait();

        assert!(matches!(result, Err(DhtError::RequestBound { .. })));
        assert!(!dht.info().unwrap().bootstrapped());
    }

    #[test]
    fn testnet() {
        let testnet = Testnet::new(5).unwrap();

        for node in &testnet.nodes {
            let info = node.info().unwrap();
            assert!(info.bootstrapped());
            assert!(info.route_table_size() > 1);
        }
    }

    #[test]
    fn put_get() {
        let testnet = Testnet::new(10).unwrap();

        let key = Kuid::from_key_material(b"hello");
        let value = DhtValue::new(ValueType::TEXT, Version::default(), &b"world"[..]);

        let stored = testnet.nodes[3].put(key, value.clone()).wait().unwrap();
        assert!(!stored.locations().is_empty());

        let found = testnet.nodes[7]
            .find_value(EntityKey::any(key))
            .wait()
            .unwrap();

        assert!(found.is_found());
        assert_eq!(found.entities()[0].value(), &value);
    }
}
