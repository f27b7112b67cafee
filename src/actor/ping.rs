//! PING operations: liveness checks, address discovery and spoof checks.

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::debug;

use crate::common::{Contact, Message, MessageBody, MessageId, RequestBody, ResponseBody};
use crate::core::results::PingResult;
use crate::DhtError;

use super::handler::{HandlerContext, Progress, SentRequest, Task};

#[derive(Debug, Clone)]
pub(crate) enum PingTarget {
    /// A node we only know the address of, like a bootstrap node.
    Address(SocketAddr),
    Contact(Contact),
}

#[derive(Debug)]
/// Pings every target at once, and succeeds with the first pong.
pub(crate) struct Ping {
    targets: Vec<PingTarget>,
    /// Identity to ping with instead of the local contact.
    sender: Option<Contact>,
    inflight: HashMap<MessageId, PingTarget>,
    last_error: Option<DhtError>,
}

impl Ping {
    pub fn new(target: PingTarget) -> Self {
        Self::all(vec![target])
    }

    pub fn all(targets: Vec<PingTarget>) -> Self {
        Ping {
            targets,
            sender: None,
            inflight: HashMap::new(),
            last_error: None,
        }
    }

    /// Pings contacts that claim our id, with an identity they won't route to.
    pub fn collisions(local: &Contact, collisions: Vec<Contact>) -> Self {
        Ping {
            sender: Some(Contact::collision_ping_sender(local)),
            ..Self::all(collisions.into_iter().map(PingTarget::Contact).collect())
        }
    }

    fn failed(&mut self, request: &SentRequest, error: DhtError) -> Progress<PingResult> {
        if self.inflight.remove(&request.id).is_none() {
            return Progress::Pending;
        }

        self.last_error = Some(error);

        if !self.inflight.is_empty() {
            return Progress::Pending;
        }

        match self.last_error.take() {
            Some(error) => Progress::Done(Err(error)),
            None => Progress::Pending,
        }
    }
}

impl Task for Ping {
    type Output = PingResult;

    fn start(&mut self, context: &mut HandlerContext<'_>) -> Progress<PingResult> {
        if self.targets.is_empty() {
            return Progress::Done(Err(DhtError::InvalidInput("Nothing to ping".to_string())));
        }

        for target in std::mem::take(&mut self.targets) {
            let id = match (&target, &self.sender) {
                (PingTarget::Contact(contact), Some(sender)) => context.request_as(
                    sender.clone(),
                    Some(*contact.id()),
                    contact.address(),
                    RequestBody::Ping,
                ),
                (PingTarget::Address(address), Some(sender)) => {
                    context.request_as(sender.clone(), None, *address, RequestBody::Ping)
                }
                (PingTarget::Contact(contact), None) => context.request(contact, RequestBody::Ping),
                (PingTarget::Address(address), None) => {
                    context.request_address(*address, RequestBody::Ping)
                }
            };

            self.inflight.insert(id, target);
        }

        Progress::Pending
    }

    fn handle_response(
        &mut self,
        _context: &mut HandlerContext<'_>,
        request: &SentRequest,
        response: &Message,
    ) -> Progress<PingResult> {
        if self.inflight.remove(&request.id).is_none() {
            return Progress::Pending;
        }

        match &response.body {
            MessageBody::Response(ResponseBody::Pong {
                external_address, ..
            }) => Progress::Done(Ok(PingResult::new(
                response.contact.clone(),
                *external_address,
                request.elapsed(),
            ))),
            _ => Progress::Pending,
        }
    }

    fn handle_timeout(
        &mut self,
        _context: &mut HandlerContext<'_>,
        request: &SentRequest,
    ) -> Progress<PingResult> {
        self.failed(request, request.timeout_error())
    }

    fn handle_error(
        &mut self,
        _context: &mut HandlerContext<'_>,
        request: &SentRequest,
        error: DhtError,
    ) -> Progress<PingResult> {
        self.failed(request, error)
    }
}

#[derive(Debug)]
/// Pings a route table entry that a newcomer with its id but another address
/// challenges, and lets the newcomer take its place if it doesn't answer.
pub(crate) struct SpoofCheck {
    ping: Ping,
    candidate: Contact,
}

impl SpoofCheck {
    pub fn new(existing: Contact, candidate: Contact) -> Self {
        SpoofCheck {
            ping: Ping::new(PingTarget::Contact(existing)),
            candidate,
        }
    }

    fn check(&mut self, context: &mut HandlerContext<'_>, progress: Progress<PingResult>) -> Progress<bool> {
        match progress {
            Progress::Pending => Progress::Pending,
            Progress::Done(Ok(_)) => Progress::Done(Ok(false)),
            Progress::Done(Err(DhtError::Timeout { .. })) => {
                debug!(candidate = ?self.candidate, "Existing contact didn't answer, replacing it");
                Progress::Done(Ok(context.routing_table.replace(self.candidate.clone())))
            }
            Progress::Done(Err(error)) => Progress::Done(Err(error)),
        }
    }
}

impl Task for SpoofCheck {
    /// Whether the candidate replaced the existing contact.
    type Output = bool;

    fn start(&mut self, context: &mut HandlerContext<'_>) -> Progress<bool> {
        let progress = self.ping.start(context);
        self.check(context, progress)
    }

    fn handle_response(
        &mut self,
        context: &mut HandlerContext<'_>,
        request: &SentRequest,
        response: &Message,
    ) -> Progress<bool> {
        let progress = self.ping.handle_response(context, request, response);
        self.check(context, progress)
    }

    fn handle_timeout(&mut self, context: &mut HandlerContext<'_>, request: &SentRequest) -> Progress<bool> {
        let progress = self.ping.handle_timeout(context, request);
        self.check(context, progress)
    }

    fn handle_error(
        &mut self,
        context: &mut HandlerContext<'_>,
        request: &SentRequest,
        error: DhtError,
    ) -> Progress<bool> {
        let progress = self.ping.handle_error(context, request, error);
        self.check(context, progress)
    }
}
