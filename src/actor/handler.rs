//! The callbacks an outbound operation receives from the dispatcher.

use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use flume::Sender;
use tracing::debug;

use crate::common::{Contact, Kuid, Message, MessageId, RequestBody, RequestKind, RouteTable};
use crate::core::database::Database;
use crate::core::statistics::Statistics;
use crate::{DhtError, Result};

use super::config::Config;
use super::dispatcher::{Dispatcher, Outbound};
use super::transport::Transport;

/// Identifies a running operation, the owner of its requests.
pub(crate) type ProcessId = u64;

#[derive(Debug, Clone)]
/// A request as the dispatcher sent it.
pub(crate) struct SentRequest {
    /// Shared by every attempt, resends included.
    pub id: MessageId,
    pub node_id: Option<Kuid>,
    pub address: SocketAddr,
    pub request: RequestBody,
    /// When the first attempt was sent.
    pub sent_at: Instant,
}

impl SentRequest {
    pub fn kind(&self) -> RequestKind {
        self.request.kind()
    }

    pub fn elapsed(&self) -> Duration {
        self.sent_at.elapsed()
    }

    pub fn timeout_error(&self) -> DhtError {
        DhtError::Timeout {
            node_id: self.node_id,
            address: self.address,
            request: self.kind(),
            elapsed: self.elapsed(),
        }
    }
}

/// Receives the outcome of every request an operation sent.
///
/// For one request, exactly one of `handle_response`, `handle_timeout` and
/// `handle_error` is called.
pub(crate) trait ResponseHandler: Debug {
    fn start(&mut self, context: &mut HandlerContext<'_>);

    fn handle_response(
        &mut self,
        context: &mut HandlerContext<'_>,
        request: &SentRequest,
        response: &Message,
    );

    fn handle_timeout(&mut self, context: &mut HandlerContext<'_>, request: &SentRequest);

    /// The request could not be sent at all.
    fn handle_error(&mut self, context: &mut HandlerContext<'_>, request: &SentRequest, error: DhtError);

    /// Called on every actor tick.
    fn handle_tick(&mut self, context: &mut HandlerContext<'_>);

    fn is_done(&self) -> bool;

    /// Nobody waits for the result anymore.
    fn is_cancelled(&self) -> bool;
}

#[derive(Debug)]
pub(crate) enum Progress<T> {
    Pending,
    Done(Result<T>),
}

/// The state machine of one outbound operation, wrapped in an [Operation]
/// to become a [ResponseHandler].
pub(crate) trait Task: Debug {
    type Output: Debug;

    fn start(&mut self, context: &mut HandlerContext<'_>) -> Progress<Self::Output>;

    fn handle_response(
        &mut self,
        context: &mut HandlerContext<'_>,
        request: &SentRequest,
        response: &Message,
    ) -> Progress<Self::Output>;

    fn handle_timeout(
        &mut self,
        context: &mut HandlerContext<'_>,
        request: &SentRequest,
    ) -> Progress<Self::Output>;

    fn handle_error(
        &mut self,
        context: &mut HandlerContext<'_>,
        request: &SentRequest,
        error: DhtError,
    ) -> Progress<Self::Output>;

    fn handle_tick(&mut self, _context: &mut HandlerContext<'_>) -> Progress<Self::Output> {
        Progress::Pending
    }
}

/// Runs a [Task] and hands its result to whoever waits for it.
pub(crate) struct Operation<T: Task> {
    name: &'static str,
    task: T,
    /// `None` for operations started by the node itself.
    sender: Option<Sender<Result<T::Output>>>,
    done: bool,
}

impl<T: Task> Operation<T> {
    pub fn new(name: &'static str, task: T, sender: Sender<Result<T::Output>>) -> Self {
        Operation {
            name,
            task,
            sender: Some(sender),
            done: false,
        }
    }

    /// An operation whose result is only logged.
    pub fn detached(name: &'static str, task: T) -> Self {
        Operation {
            name,
            task,
            sender: None,
            done: false,
        }
    }

    fn advance(&mut self, progress: Progress<T::Output>) {
        let Progress::Done(result) = progress else {
            return;
        };

        self.done = true;

        match self.sender.take() {
            Some(sender) => {
                let _ = sender.send(result);
            }
            None => match result {
                Ok(output) => debug!(operation = self.name, ?output, "Operation done"),
                Err(error) => debug!(operation = self.name, %error, "Operation failed"),
            },
        }
    }
}

impl<T: Task> Debug for Operation<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("task", &self.task)
            .field("done", &self.done)
            .finish()
    }
}

impl<T: Task> ResponseHandler for Operation<T> {
    fn start(&mut self, context: &mut HandlerContext<'_>) {
        let progress = self.task.start(context);
        self.advance(progress);
    }

    fn handle_response(
        &mut self,
        context: &mut HandlerContext<'_>,
        request: &SentRequest,
        response: &Message,
    ) {
        if self.done {
            return;
        }
        let progress = self.task.handle_response(context, request, response);
        self.advance(progress);
    }

    fn handle_timeout(&mut self, context: &mut HandlerContext<'_>, request: &SentRequest) {
        if self.done {
            return;
        }
        let progress = self.task.handle_timeout(context, request);
        self.advance(progress);
    }

    fn handle_error(&mut self, context: &mut HandlerContext<'_>, request: &SentRequest, error: DhtError) {
        if self.done {
            return;
        }
        let progress = self.task.handle_error(context, request, error);
        self.advance(progress);
    }

    fn handle_tick(&mut self, context: &mut HandlerContext<'_>) {
        if self.done {
            return;
        }
        let progress = self.task.handle_tick(context);
        self.advance(progress);
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn is_cancelled(&self) -> bool {
        self.sender
            .as_ref()
            .map(|sender| sender.is_disconnected())
            .unwrap_or(false)
    }
}

/// One [Task] callback, for tasks that drive other tasks in phases.
pub(crate) enum Callback<'a> {
    Response(&'a SentRequest, &'a Message),
    Timeout(&'a SentRequest),
    Error(&'a SentRequest, DhtError),
    Tick,
}

impl Callback<'_> {
    pub fn apply<T: Task>(self, task: &mut T, context: &mut HandlerContext<'_>) -> Progress<T::Output> {
        match self {
            Callback::Response(request, response) => task.handle_response(context, request, response),
            Callback::Timeout(request) => task.handle_timeout(context, request),
            Callback::Error(request, error) => task.handle_error(context, request, error),
            Callback::Tick => task.handle_tick(context),
        }
    }
}

#[derive(Debug)]
/// A request the dispatcher refused to send, reported to its owner through
/// [ResponseHandler::handle_error] once the current callback returns.
pub(crate) struct RejectedRequest {
    pub owner: ProcessId,
    pub request: SentRequest,
    pub error: DhtError,
}

/// What an operation may read and change while handling a callback.
pub(crate) struct HandlerContext<'a> {
    pub routing_table: &'a mut RouteTable,
    pub database: &'a mut Database,
    pub statistics: &'a mut Statistics,
    pub config: &'a Config,
    pub bootstrapped: &'a mut bool,
    pub(crate) owner: ProcessId,
    pub(crate) dispatcher: &'a mut Dispatcher,
    pub(crate) transport: &'a mut dyn Transport,
    pub(crate) rejected: &'a mut Vec<RejectedRequest>,
}

impl HandlerContext<'_> {
    pub fn local(&self) -> &Contact {
        self.routing_table.local()
    }

    /// Sends `request` to `to`, returning the id responses will be correlated with.
    pub fn request(&mut self, to: &Contact, request: RequestBody) -> MessageId {
        let timeout = to.adaptive_timeout(self.config.request_timeout);
        self.send(Some(*to.id()), to.address(), request, None, timeout)
    }

    /// Sends `request` to a node we only know the address of.
    pub fn request_address(&mut self, address: SocketAddr, request: RequestBody) -> MessageId {
        let timeout = self.config.request_timeout;
        self.send(None, address, request, None, timeout)
    }

    /// Sends `request` with another identity than the local contact.
    pub fn request_as(
        &mut self,
        sender: Contact,
        node_id: Option<Kuid>,
        address: SocketAddr,
        request: RequestBody,
    ) -> MessageId {
        let timeout = self.config.request_timeout;
        self.send(node_id, address, request, Some(sender), timeout)
    }

    fn send(
        &mut self,
        node_id: Option<Kuid>,
        address: SocketAddr,
        request: RequestBody,
        sender: Option<Contact>,
        timeout: Duration,
    ) -> MessageId {
        let kind = request.kind();
        let outbound = Outbound {
            node_id,
            address,
            request,
            sender: sender.unwrap_or_else(|| self.routing_table.local().clone()),
            timeout,
        };

        match self
            .dispatcher
            .send(&mut *self.transport, self.routing_table.local(), self.owner, outbound)
        {
            Ok(sent) => {
                self.statistics.request_sent(kind);
                sent.id
            }
            Err((sent, error)) => {
                let id = sent.id;
                self.rejected.push(RejectedRequest {
                    owner: self.owner,
                    request: sent,
                    error,
                });
                id
            }
        }
    }
}
