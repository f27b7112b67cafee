//! AsyncDht node.

use std::net::SocketAddr;

use crate::actor::{ActorMessage, Info};
use crate::common::{Contact, DhtValue, DhtValueEntity, EntityKey, Kuid};
use crate::core::results::{BootstrapResult, FindNodeResult, FindValueResult, PingResult, StoreResult};
use crate::dht::{Dht, DhtFuture};
use crate::{DhtError, Result};

impl Dht {
    /// Return an async version of the Dht client.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

impl<T> DhtFuture<T> {
    /// Wait for the operation without blocking the executor.
    pub async fn wait_async(self) -> Result<T> {
        self.receiver
            .recv_async()
            .await
            .map_err(|_| DhtError::Shutdown)?
    }
}

#[derive(Debug, Clone)]
/// Async version of the Dht node.
///
/// Dropping a returned future before it completes cancels its operation.
pub struct AsyncDht(Dht);

impl AsyncDht {
    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub async fn info(&self) -> Result<Info> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.0
             .0
            .send(ActorMessage::Info(sender))
            .map_err(|_| DhtError::Shutdown)?;

        receiver.recv_async().await.map_err(|_| DhtError::Shutdown)
    }

    /// Every contact of the route table, most recently seen first.
    pub async fn contacts(&self) -> Result<Vec<Contact>> {
        let (sender, receiver) = flume::bounded::<Vec<Contact>>(1);

        self.0
             .0
            .send(ActorMessage::Contacts(sender))
            .map_err(|_| DhtError::Shutdown)?;

        receiver.recv_async().await.map_err(|_| DhtError::Shutdown)
    }

    /// Returns the blocking [Dht] handle of the same node.
    pub fn as_blocking(&self) -> &Dht {
        &self.0
    }

    // === Public Methods ===

    /// Shutdown the actor thread loop.
    pub async fn shutdown(&self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.0 .0.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv_async().await;
    }

    pub async fn ping(&self, address: SocketAddr) -> Result<PingResult> {
        self.0.ping(address).wait_async().await
    }

    pub async fn ping_contact(&self, contact: Contact) -> Result<PingResult> {
        self.0.ping_contact(contact).wait_async().await
    }

    /// Join the network through the first of `addresses` that answers.
    pub async fn bootstrap(&self, addresses: &[SocketAddr]) -> Result<BootstrapResult> {
        self.0.bootstrap(addresses).wait_async().await
    }

    pub async fn find_node(&self, id: Kuid) -> Result<FindNodeResult> {
        self.0.find_node(id).wait_async().await
    }

    pub async fn find_value(&self, key: EntityKey) -> Result<FindValueResult> {
        self.0.find_value(key).wait_async().await
    }

    /// Publish `value` under `key`, see [Dht::put].
    pub async fn put(&self, key: Kuid, value: DhtValue) -> Result<StoreResult> {
        self.0.put(key, value).wait_async().await
    }

    pub async fn remove(&self, key: Kuid) -> Result<StoreResult> {
        self.0.remove(key).wait_async().await
    }

    pub async fn store(&self, entities: Vec<DhtValueEntity>) -> Result<StoreResult> {
        self.0.store(entities).wait_async().await
    }
}

#[cfg(test)]
mod test {
    use futures::executor;

    use super::*;
    use crate::common::{ValueType, Version};
    use crate::dht::Testnet;

    #[test]
    fn shutdown() {
        async fn test() {
            let dht = Dht::builder().build().unwrap().as_async();

            let info = dht.info().await.unwrap();
            assert!(!info.bootstrapped());

            dht.shutdown().await;

            assert!(matches!(dht.info().await, Err(DhtError::Shutdown)));
        }

        executor::block_on(test());
    }

    #[test]
    fn put_get_remove() {
        async fn test() {
            let testnet = Testnet::new(8).unwrap();

            let a = testnet.nodes[1].clone().as_async();
            let b = testnet.nodes[6].clone().as_async();

            let key = Kuid::from_key_material(b"async");
            let value = DhtValue::new(ValueType::BINARY, Version::new(1, 0), vec![1, 2, 3]);

            a.put(key, value.clone()).await.unwrap();

            let found = b.find_value(EntityKey::any(key)).await.unwrap();
            assert_eq!(found.entities()[0].value(), &value);

            a.remove(key).await.unwrap();

            let found = b.find_value(EntityKey::any(key)).await.unwrap();
            assert!(!found.is_found());
        }

        executor::block_on(test());
    }
}
