//! Datagram transport the actor sends and receives decoded messages on.
//!
//! Encoding messages for a real socket is left to [Transport] implementors;
//! [MemoryNetwork] connects nodes of the same process, for tests and demos.

use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::trace;

use crate::common::Message;

/// Port every [MemoryNetwork::bind_any] address uses.
pub const MEMORY_NETWORK_PORT: u16 = 6881;

/// An unreliable datagram transport.
///
/// Sends never block and may silently drop the message, like UDP.
pub trait Transport: Debug + Send {
    /// The address other nodes reach this transport at.
    fn local_addr(&self) -> SocketAddr;

    fn send(&mut self, to: SocketAddr, message: Message) -> io::Result<()>;

    /// Waits up to `timeout` for the next message, and the address it came from.
    fn recv_timeout(&mut self, timeout: Duration) -> Option<(Message, SocketAddr)>;

    /// Returns the next message if one is already queued.
    fn try_recv(&mut self) -> Option<(Message, SocketAddr)> {
        self.recv_timeout(Duration::ZERO)
    }
}

type Datagram = (Message, SocketAddr);

#[derive(Debug, Default)]
struct NetworkState {
    sockets: HashMap<SocketAddr, Sender<Datagram>>,
    next_host: u32,
}

#[derive(Debug, Clone, Default)]
/// An in-process network of [MemorySocket]s.
///
/// Messages to an address nobody is bound to are dropped.
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a socket to `address`.
    pub fn bind(&self, address: SocketAddr) -> io::Result<MemorySocket> {
        let mut state = self.lock();

        if state.sockets.contains_key(&address) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{} is already bound", address),
            ));
        }

        let (sender, receiver) = flume::unbounded();
        state.sockets.insert(address, sender);

        Ok(MemorySocket {
            network: self.clone(),
            address,
            receiver,
        })
    }

    /// Binds a socket to the next free address.
    ///
    /// Every socket gets its own `10.x.y.1` host, so per address and per
    /// network limits apply to each node separately.
    pub fn bind_any(&self) -> io::Result<MemorySocket> {
        let address = loop {
            let mut state = self.lock();
            state.next_host = state.next_host.wrapping_add(1);

            let [_, _, high, low] = state.next_host.to_be_bytes();
            let address = SocketAddr::from((Ipv4Addr::new(10, high, low, 1), MEMORY_NETWORK_PORT));

            if !state.sockets.contains_key(&address) {
                break address;
            }
        };

        self.bind(address)
    }

    /// Number of bound sockets.
    pub fn len(&self) -> usize {
        self.lock().sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // === Private Methods ===

    fn deliver(&self, from: SocketAddr, to: SocketAddr, message: Message) {
        let sender = self.lock().sockets.get(&to).cloned();

        match sender {
            Some(sender) => {
                if sender.send((message, from)).is_err() {
                    trace!(?to, "Socket closed, dropping message");
                }
            }
            None => trace!(?to, "Nobody is bound to address, dropping message"),
        }
    }

    fn unbind(&self, address: SocketAddr) {
        self.lock().sockets.remove(&address);
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
/// A [Transport] bound to an address of a [MemoryNetwork].
///
/// The address is released when the socket is dropped.
pub struct MemorySocket {
    network: MemoryNetwork,
    address: SocketAddr,
    receiver: Receiver<Datagram>,
}

impl Transport for MemorySocket {
    fn local_addr(&self) -> SocketAddr {
        self.address
    }

    fn send(&mut self, to: SocketAddr, message: Message) -> io::Result<()> {
        if to.port() == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Can't send to {}", to),
            ));
        }

        trace!(context = "socket_message_sending", ?to, id = %message.id);
        self.network.deliver(self.address, to, message);

        Ok(())
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Option<(Message, SocketAddr)> {
        match self.receiver.recv_timeout(timeout) {
            Ok(datagram) => Some(datagram),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    fn try_recv(&mut self) -> Option<(Message, SocketAddr)> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        self.network.unbind(self.address);
    }
}
