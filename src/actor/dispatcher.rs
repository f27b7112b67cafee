//! Correlates outbound requests with their responses, and fires timeouts.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::{debug, trace};

use crate::common::{
    is_private_address, is_valid_address, Contact, Kuid, Message, MessageBody, MessageId,
    RequestBody,
};
use crate::{DhtError, ProtocolViolation};

use super::handler::{ProcessId, SentRequest};
use super::inflight_requests::{InflightRequest, InflightRequests};
use super::transport::Transport;

#[derive(Debug)]
pub(crate) struct Outbound {
    pub node_id: Option<Kuid>,
    pub address: SocketAddr,
    pub request: RequestBody,
    /// The identity the request is sent with, usually the local contact.
    pub sender: Contact,
    pub timeout: Duration,
}

#[derive(Debug)]
pub(crate) enum Received {
    /// Answers a pending request.
    Expected(InflightRequest),
    /// Answers a request that already timed out.
    Late,
    Unexpected,
}

#[derive(Debug)]
pub(crate) struct Dispatcher {
    next_id: u32,
    inflight: InflightRequests,
    /// Recently expired request ids and the address they were sent to.
    expired: LruCache<MessageId, SocketAddr>,
    max_errors: usize,
    local_is_private: bool,
}

impl Dispatcher {
    pub fn new(max_errors: usize, late_response_cache_size: usize, local_is_private: bool) -> Self {
        Dispatcher {
            next_id: rand::random(),
            inflight: InflightRequests::new(),
            expired: LruCache::new(
                NonZeroUsize::new(late_response_cache_size).unwrap_or(NonZeroUsize::MIN),
            ),
            max_errors,
            local_is_private,
        }
    }

    // === Getters ===

    /// Number of requests waiting for a response.
    pub fn pending(&self) -> usize {
        self.inflight.len()
    }

    // === Public Methods ===

    /// Sends a request and registers it for `owner`.
    ///
    /// Requests to this node itself or to unroutable addresses are never put
    /// on the wire.
    pub fn send(
        &mut self,
        transport: &mut dyn Transport,
        local: &Contact,
        owner: ProcessId,
        outbound: Outbound,
    ) -> Result<SentRequest, (SentRequest, DhtError)> {
        let id = self.next_id();

        let Outbound {
            node_id,
            address,
            request,
            sender,
            timeout,
        } = outbound;

        let sent = SentRequest {
            id,
            node_id,
            address,
            request,
            sent_at: Instant::now(),
        };

        if let Some(reason) = self.check(local, &sender, &sent) {
            debug!(?node_id, ?address, request = %sent.kind(), %reason, "Refusing to send request");

            let error = DhtError::RequestBound {
                node_id,
                address,
                request: sent.kind(),
                reason,
            };
            return Err((sent, error));
        }

        let message = Message::request(id, sender, sent.request.clone());

        if let Err(source) = transport.send(address, message.clone()) {
            let error = DhtError::Backend {
                node_id,
                address,
                request: sent.kind(),
                source,
            };
            return Err((sent, error));
        }

        trace!(?node_id, ?address, %id, request = %sent.kind(), "Sent request");

        self.inflight.add(InflightRequest {
            sent: sent.clone(),
            owner,
            message,
            timeout,
            deadline: Instant::now() + timeout,
            resends_left: self.max_errors,
        });

        Ok(sent)
    }

    /// Matches a response with the request it answers.
    ///
    /// The response must come from the address the request went to, from the
    /// node it was meant for, and be of the requested kind.
    pub fn receive(&mut self, message: &Message, from: SocketAddr) -> Received {
        let MessageBody::Response(response) = &message.body else {
            return Received::Unexpected;
        };

        let Some(pending) = self.inflight.get(message.id) else {
            return match self.expired.pop(&message.id) {
                Some(address) if address == from => Received::Late,
                _ => {
                    trace!(id = %message.id, ?from, "Unexpected response id");
                    Received::Unexpected
                }
            };
        };

        if !response.answers(pending.sent.kind()) {
            debug!(id = %message.id, ?from, reason = %ProtocolViolation::UnexpectedResponse, "Dropping response");
            return Received::Unexpected;
        }

        if let Some(node_id) = pending.sent.node_id {
            if &node_id != message.contact.id() {
                debug!(?node_id, responder = ?message.contact.id(), "Response from another node id");
                return Received::Unexpected;
            }
        }

        match self.inflight.remove(message.id, &from) {
            Some(request) => Received::Expected(request),
            None => {
                debug!(id = %message.id, ?from, reason = %ProtocolViolation::AddressMismatch, "Dropping response");
                Received::Unexpected
            }
        }
    }

    /// Re-sends expired requests with resends left, and returns the ones that
    /// timed out for good.
    ///
    /// A resend reuses the request's id, so an answer to any attempt is
    /// expected until the last attempt times out.
    pub fn tick(&mut self, now: Instant, transport: &mut dyn Transport) -> Vec<InflightRequest> {
        let mut timed_out = Vec::new();

        for mut request in self.inflight.expired(now) {
            if request.resends_left > 0 {
                request.resends_left -= 1;
                request.deadline = now + request.timeout;

                trace!(id = %request.sent.id, address = ?request.sent.address, "Re-sending request");

                if transport
                    .send(request.sent.address, request.message.clone())
                    .is_ok()
                {
                    self.inflight.add(request);
                    continue;
                }
            }

            self.expired.put(request.sent.id, request.sent.address);
            timed_out.push(request);
        }

        timed_out
    }

    // === Private Methods ===

    /// Increments self.next_id and returns the previous value.
    fn next_id(&mut self) -> MessageId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        MessageId(id)
    }

    fn check(&self, local: &Contact, sender: &Contact, sent: &SentRequest) -> Option<ProtocolViolation> {
        if sent.address == local.address() {
            return Some(ProtocolViolation::SelfAddressed);
        }

        if sent.node_id.as_ref() == Some(local.id())
            && !Contact::is_collision_ping_sender(local.id(), sender)
        {
            return Some(ProtocolViolation::SelfAddressed);
        }

        if !is_valid_address(&sent.address) || is_private_address(&sent.address, self.local_is_private) {
            return Some(ProtocolViolation::UnroutableAddress);
        }

        None
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::actor::transport::{MemoryNetwork, MemorySocket};
    use crate::common::{Kuid, ResponseBody};

    const TIMEOUT: Duration = Duration::from_secs(1);

    struct Fixture {
        dispatcher: Dispatcher,
        socket: MemorySocket,
        peer: MemorySocket,
        local: Contact,
        remote: Contact,
    }

    impl Fixture {
        fn new(max_errors: usize) -> Fixture {
            let network = MemoryNetwork::new();
            let socket = network.bind_any().unwrap();
            let peer = network.bind_any().unwrap();

            Fixture {
                dispatcher: Dispatcher::new(max_errors, 16, false),
                local: Contact::live(Kuid::random(), socket.local_addr(), 0),
                remote: Contact::live(Kuid::random(), peer.local_addr(), 0),
                socket,
                peer,
            }
        }

        fn ping(&mut self, to: &Contact) -> Result<SentRequest, (SentRequest, DhtError)> {
            let outbound = Outbound {
                node_id: Some(*to.id()),
                address: to.address(),
                request: RequestBody::Ping,
                sender: self.local.clone(),
                timeout: TIMEOUT,
            };
            self.dispatcher.send(&mut self.socket, &self.local.clone(), 1, outbound)
        }

        fn pong(&self, id: MessageId) -> Message {
            Message::response_to(
                id,
                self.remote.clone(),
                ResponseBody::Pong {
                    external_address: self.local.address(),
                    token: None,
                },
            )
        }
    }

    #[test]
    fn expected_response() {
        let mut fixture = Fixture::new(0);
        let sent = fixture.ping(&fixture.remote.clone()).unwrap();

        let (request, from) = fixture.peer.try_recv().unwrap();
        assert_eq!(request.id, sent.id);
        assert_eq!(from, fixture.local.address());

        let pong = fixture.pong(sent.id);
        match fixture.dispatcher.receive(&pong, fixture.remote.address()) {
            Received::Expected(request) => assert_eq!(request.sent.id, sent.id),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fixture.dispatcher.pending(), 0);
    }

    #[test]
    fn response_from_wrong_address() {
        let mut fixture = Fixture::new(0);
        let sent = fixture.ping(&fixture.remote.clone()).unwrap();

        let pong = fixture.pong(sent.id);
        let elsewhere = SocketAddr::from(([10, 9, 9, 9], 6881));

        assert!(matches!(
            fixture.dispatcher.receive(&pong, elsewhere),
            Received::Unexpected
        ));
        assert_eq!(fixture.dispatcher.pending(), 1);
    }

    #[test]
    fn response_of_wrong_kind() {
        let mut fixture = Fixture::new(0);
        let sent = fixture.ping(&fixture.remote.clone()).unwrap();

        let response = Message::response_to(
            sent.id,
            fixture.remote.clone(),
            ResponseBody::Store { statuses: vec![] },
        );

        assert!(matches!(
            fixture.dispatcher.receive(&response, fixture.remote.address()),
            Received::Unexpected
        ));
    }

    #[test]
    fn refuse_sending_to_self() {
        let mut fixture = Fixture::new(0);
        let local = fixture.local.clone();

        let (_, error) = fixture.ping(&local).unwrap_err();
        assert!(matches!(
            error,
            DhtError::RequestBound {
                reason: ProtocolViolation::SelfAddressed,
                ..
            }
        ));
        assert!(fixture.peer.try_recv().is_none());
        assert_eq!(fixture.dispatcher.pending(), 0);
    }

    #[test]
    fn refuse_private_address() {
        let mut fixture = Fixture::new(0);
        fixture.dispatcher.local_is_private = true;
        let remote = fixture.remote.clone();

        let (_, error) = fixture.ping(&remote).unwrap_err();
        assert!(matches!(
            error,
            DhtError::RequestBound {
                reason: ProtocolViolation::UnroutableAddress,
                ..
            }
        ));
    }

    #[test]
    fn resend_then_timeout() {
        let mut fixture = Fixture::new(1);
        let sent = fixture.ping(&fixture.remote.clone()).unwrap();
        let _ = fixture.peer.try_recv();

        let later = Instant::now() + TIMEOUT * 2;
        assert!(fixture.dispatcher.tick(later, &mut fixture.socket).is_empty());
        assert_eq!(fixture.dispatcher.pending(), 1);

        let (resent, _) = fixture.peer.try_recv().unwrap();
        assert_eq!(resent.id, sent.id);

        let timed_out = fixture.dispatcher.tick(later + TIMEOUT * 2, &mut fixture.socket);
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].sent.id, sent.id);
        assert_eq!(fixture.dispatcher.pending(), 0);

        // Answered after the last attempt timed out.
        let pong = fixture.pong(sent.id);
        assert!(matches!(
            fixture.dispatcher.receive(&pong, fixture.remote.address()),
            Received::Late
        ));
    }

    #[test]
    fn first_attempt_answered_during_resend() {
        let mut fixture = Fixture::new(1);
        let sent = fixture.ping(&fixture.remote.clone()).unwrap();

        let later = Instant::now() + TIMEOUT * 2;
        assert!(fixture.dispatcher.tick(later, &mut fixture.socket).is_empty());

        let pong = fixture.pong(sent.id);
        match fixture.dispatcher.receive(&pong, fixture.remote.address()) {
            Received::Expected(request) => assert_eq!(request.sent.id, sent.id),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fixture.dispatcher.pending(), 0);

        // Nothing is left to time out.
        assert!(fixture
            .dispatcher
            .tick(later + TIMEOUT * 2, &mut fixture.socket)
            .is_empty());
    }
}
