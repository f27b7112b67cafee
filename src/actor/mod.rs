//! Actor implementation - I/O orchestration layer for the DHT.
//!
//! One actor thread per node owns the route table, the database and every
//! running operation, so all mutations are serialized by ownership.

mod bootstrap;
pub(crate) mod config;
mod dispatcher;
mod handler;
mod inflight_requests;
mod info;
mod lookup;
mod ping;
mod store;
pub mod transport;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use flume::{Receiver, Sender, TryRecvError};
use tracing::{debug, info, trace};

use crate::common::{
    Contact, DhtValue, DhtValueEntity, EntityKey, Kuid, Message, MessageBody, MessageId,
    RequestBody, RouteTable, SelectMode, StatsKind,
};
use crate::core::database::Database;
use crate::core::message_handler::{DefaultMessageHandler, FollowUp, RoutingContext};
use crate::core::results::{BootstrapResult, FindNodeResult, FindValueResult, PingResult, StoreResult};
use crate::core::routing_maintenance::RoutingMaintenance;
use crate::core::server::{RequestContext, Server};
use crate::core::statistics::Statistics;
use crate::{DhtError, Result};

use bootstrap::Bootstrap;
use dispatcher::{Dispatcher, Received};
use handler::{HandlerContext, Operation, ProcessId, RejectedRequest, ResponseHandler, Task};
use inflight_requests::InflightRequest;
use lookup::{FindNode, FindValue};
use ping::{Ping, SpoofCheck};
use store::Store;
use transport::Transport;

pub use config::{Config, DEFAULT_LOOKUP_TIMEOUT, DEFAULT_PARALLELISM, DEFAULT_REQUEST_TIMEOUT};
pub use info::Info;
pub(crate) use ping::PingTarget;

/// How long a tick waits for inbound messages.
const TICK_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug)]
pub(crate) enum ActorMessage {
    Info(Sender<Info>),
    Ping(PingTarget, Sender<Result<PingResult>>),
    Bootstrap(Vec<PingTarget>, Sender<Result<BootstrapResult>>),
    FindNode(Kuid, Sender<Result<FindNodeResult>>),
    FindValue(EntityKey, Sender<Result<FindValueResult>>),
    Put(Kuid, DhtValue, Sender<Result<StoreResult>>),
    Store(Vec<DhtValueEntity>, Sender<Result<StoreResult>>),
    Contacts(Sender<Vec<Contact>>),
    Dump(StatsKind, Sender<String>),
    Shutdown(Sender<()>),
}

#[derive(Debug)]
/// Internal Actor called in the Dht thread loop.
pub(crate) struct Actor {
    config: Config,
    transport: Box<dyn Transport>,

    // Routing
    routing_table: RouteTable,
    maintenance: RoutingMaintenance,
    message_handler: DefaultMessageHandler,

    database: Database,
    statistics: Statistics,
    server: Server,

    // Running operations
    dispatcher: Dispatcher,
    processes: HashMap<ProcessId, Box<dyn ResponseHandler>>,
    next_process: ProcessId,
    rejected: Vec<RejectedRequest>,

    bootstrapped: bool,
}

impl Actor {
    pub fn new(config: Config, transport: Box<dyn Transport>) -> Self {
        let id = config.node_id.unwrap_or_else(Kuid::random);
        let local = Contact::live(id, transport.local_addr(), rand::random())
            .with_firewalled(config.firewalled);

        let mut message_handler = config.message_handler.clone();
        message_handler.local_is_private = config.local_is_private;

        Actor {
            routing_table: RouteTable::new(local, config.routing.clone()),
            maintenance: RoutingMaintenance::new(config.maintenance_interval),
            message_handler: DefaultMessageHandler::new(message_handler),

            database: Database::new(config.database.clone(), config.local_is_private),
            statistics: Statistics::new(),
            server: Server::new(config.server_settings.clone()),

            dispatcher: Dispatcher::new(
                config.max_errors,
                config.late_response_cache_size,
                config.local_is_private,
            ),
            processes: HashMap::new(),
            next_process: 0,
            rejected: Vec::new(),

            bootstrapped: false,

            transport,
            config,
        }
    }

    // === Getters ===

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn info(&self) -> Info {
        Info::from(self)
    }

    // === Public Methods ===

    /// Runs until a shutdown is requested or every [crate::Dht] handle is dropped.
    pub fn run(mut self, receiver: Receiver<ActorMessage>) {
        info!(
            address = ?self.local_addr(),
            id = ?self.routing_table.local_id(),
            "Kadmium node listening"
        );

        loop {
            match receiver.try_recv() {
                Ok(ActorMessage::Shutdown(sender)) => {
                    self.shutdown();
                    let _ = sender.send(());
                    break;
                }
                Ok(message) => {
                    self.handle_actor_message(message);
                    continue;
                }
                Err(TryRecvError::Disconnected) => {
                    debug!("Every Dht handle was dropped");
                    self.shutdown();
                    break;
                }
                Err(TryRecvError::Empty) => {}
            }

            self.tick();
        }
    }

    /// Handles inbound messages, timeouts, operation ticks and maintenance.
    pub fn tick(&mut self) {
        if let Some((message, from)) = self.transport.recv_timeout(TICK_INTERVAL) {
            self.handle_message(message, from);

            while let Some((message, from)) = self.transport.try_recv() {
                self.handle_message(message, from);
            }
        }

        for request in self.dispatcher.tick(Instant::now(), &mut *self.transport) {
            self.handle_timeout(request);
        }

        self.tick_processes();
        self.periodic_maintenance();
    }

    // === Private Methods ===

    fn handle_actor_message(&mut self, message: ActorMessage) {
        match message {
            ActorMessage::Info(sender) => {
                let _ = sender.send(self.info());
            }
            ActorMessage::Ping(target, sender) => {
                self.spawn(Operation::new("ping", Ping::new(target), sender));
            }
            ActorMessage::Bootstrap(targets, sender) => {
                self.spawn(Operation::new("bootstrap", Bootstrap::new(targets), sender));
            }
            ActorMessage::FindNode(id, sender) => {
                if let Err(error) = self.check_bootstrapped("find_node") {
                    let _ = sender.send(Err(error));
                    return;
                }
                let lookup = FindNode::new(id, &self.config);
                self.spawn(Operation::new("find_node", lookup, sender));
            }
            ActorMessage::FindValue(key, sender) => {
                if let Err(error) = self.check_bootstrapped("find_value") {
                    let _ = sender.send(Err(error));
                    return;
                }
                let lookup = FindValue::new(key, &self.config);
                self.spawn(Operation::new("find_value", lookup, sender));
            }
            ActorMessage::Put(key, value, sender) => {
                let operation = if value.is_empty() { "remove" } else { "put" };

                let result = self
                    .check_bootstrapped(operation)
                    .and_then(|_| {
                        value
                            .validate(self.config.database.max_value_size)
                            .map_err(DhtError::from)
                    });

                if let Err(error) = result {
                    let _ = sender.send(Err(error));
                    return;
                }

                let entity = DhtValueEntity::local(self.routing_table.local().clone(), key, value);
                let store = Store::with_lookup(key, vec![entity], FindNode::new(key, &self.config));
                self.spawn(Operation::new(operation, store, sender));
            }
            ActorMessage::Store(entities, sender) => {
                let result = self
                    .check_bootstrapped("store")
                    .and_then(|_| primary_key(&entities));

                match result {
                    Ok(key) => {
                        let lookup = FindNode::new(key, &self.config);
                        let store = Store::with_lookup(key, entities, lookup);
                        self.spawn(Operation::new("store", store, sender));
                    }
                    Err(error) => {
                        let _ = sender.send(Err(error));
                    }
                }
            }
            ActorMessage::Contacts(sender) => {
                let _ = sender.send(self.routing_table.get_contacts());
            }
            ActorMessage::Dump(kind, sender) => {
                let dump = match kind {
                    StatsKind::Statistics => self.statistics.to_string(),
                    StatsKind::Database => self.database.to_string(),
                    StatsKind::RouteTable => self.routing_table.to_string(),
                };
                let _ = sender.send(dump);
            }
            ActorMessage::Shutdown(sender) => {
                self.shutdown();
                let _ = sender.send(());
            }
        }
    }

    fn check_bootstrapped(&self, operation: &'static str) -> Result<()> {
        if self.bootstrapped {
            return Ok(());
        }

        debug!(operation, "Rejecting operation, node is not bootstrapped");
        Err(DhtError::NotBootstrapped(operation))
    }

    fn handle_message(&mut self, mut message: Message, from: SocketAddr) {
        // Trust the address we see over the one advertised, except for the port.
        let advertised = &message.contact;
        let address = SocketAddr::new(from.ip(), advertised.address().port());

        message.contact = Contact::live(*advertised.id(), address, advertised.instance_id())
            .with_firewalled(advertised.is_firewalled())
            .with_shutdown(advertised.is_shutdown());

        trace!(context = "socket_message_receiving", ?from, id = %message.id);

        if let MessageBody::Request(request) = &message.body {
            self.handle_request(&message, request, from);
        } else {
            self.handle_response(message, from);
        }
    }

    fn handle_request(&mut self, message: &Message, request: &RequestBody, from: SocketAddr) {
        let follow_ups = self.message_handler.handle_request(
            RoutingContext {
                routing_table: &mut self.routing_table,
                database: &mut self.database,
                statistics: &mut self.statistics,
                bootstrapped: self.bootstrapped,
            },
            message,
        );

        let response = self.server.handle_request(
            RequestContext {
                routing_table: &self.routing_table,
                database: &mut self.database,
                statistics: &mut self.statistics,
            },
            &message.contact,
            request,
        );

        if let Some(response) = response {
            let response = Message::response_to(message.id, self.routing_table.local().clone(), response);

            match self.transport.send(from, response) {
                Ok(()) => self.statistics.response_sent(),
                Err(error) => debug!(?from, %error, "Failed to send response"),
            }
        }

        self.follow_up(follow_ups);
    }

    fn handle_response(&mut self, mut message: Message, from: SocketAddr) {
        match self.dispatcher.receive(&message, from) {
            Received::Expected(request) => {
                self.statistics.response_received();
                message.contact.set_round_trip_time(request.sent.elapsed());

                let follow_ups = self.message_handler.handle_response(
                    RoutingContext {
                        routing_table: &mut self.routing_table,
                        database: &mut self.database,
                        statistics: &mut self.statistics,
                        bootstrapped: self.bootstrapped,
                    },
                    &message,
                );
                self.follow_up(follow_ups);

                self.call_process(request.owner, |process, context| {
                    process.handle_response(context, &request.sent, &message)
                });
                self.deliver_rejected();
            }
            Received::Late => {
                trace!(?from, id = %message.id, "Late response");
                self.statistics.late_response();

                let follow_ups = self
                    .message_handler
                    .handle_late_response(&mut self.routing_table, &message);
                self.follow_up(follow_ups);
            }
            Received::Unexpected => {
                trace!(?from, id = %message.id, "Dropping unexpected response");
            }
        }
    }

    fn handle_timeout(&mut self, request: InflightRequest) {
        trace!(
            node_id = ?request.sent.node_id,
            address = ?request.sent.address,
            request = %request.sent.kind(),
            "Request timed out"
        );
        self.statistics.timeout();

        if let Some(node_id) = request.sent.node_id {
            self.message_handler
                .handle_timeout(&mut self.routing_table, &node_id, request.sent.address);
        }

        let cancelled = self
            .processes
            .get(&request.owner)
            .map(|process| process.is_cancelled())
            .unwrap_or(true);

        if !cancelled {
            self.call_process(request.owner, |process, context| {
                process.handle_timeout(context, &request.sent)
            });
            self.deliver_rejected();
        }
    }

    fn follow_up(&mut self, follow_ups: Vec<FollowUp>) {
        for follow_up in follow_ups {
            match follow_up {
                FollowUp::Ping(contact) => {
                    let ping = Ping::new(PingTarget::Contact(contact));
                    self.spawn(Operation::detached("ping", ping));
                }
                FollowUp::SpoofCheck {
                    existing,
                    candidate,
                } => {
                    let check = SpoofCheck::new(existing, candidate);
                    self.spawn(Operation::detached("spoof_check", check));
                }
                FollowUp::Forward {
                    node,
                    token,
                    entities,
                } => {
                    debug!(?node, values = entities.len(), "Forwarding values");
                    let store = Store::direct(node, token, entities);
                    self.spawn(Operation::detached("store_forward", store));
                }
            }
        }
    }

    fn periodic_maintenance(&mut self) {
        let Some(decisions) = self
            .maintenance
            .periodic_maintenance_decisions(&mut self.routing_table, self.bootstrapped)
        else {
            return;
        };

        for id in decisions.nodes_to_purge {
            trace!(?id, "Purging dead contact");
            self.routing_table.remove(&id);
        }

        if !decisions.refresh_ids.is_empty() {
            debug!(buckets = decisions.refresh_ids.len(), "Refreshing stale buckets");
        }

        for id in decisions.refresh_ids {
            let lookup = FindNode::new(id, &self.config);
            self.spawn(Operation::detached("refresh", lookup));
        }

        if decisions.rotate_tokens {
            self.server.maintain();
        }
    }

    /// Tells the nearest alive contacts we are leaving, so they stop routing to us.
    fn shutdown(&mut self) {
        let local = self.routing_table.local().clone().with_shutdown(true);
        let contacts = self
            .routing_table
            .select(local.id(), self.config.k(), SelectMode::Alive);

        info!(notified = contacts.len(), "Kadmium node shutting down");

        for contact in contacts {
            let message = Message::request(MessageId(rand::random()), local.clone(), RequestBody::Ping);

            if let Err(error) = self.transport.send(contact.address(), message) {
                debug!(?contact, %error, "Failed to send shutdown notice");
            }
        }

        self.processes.clear();
    }

    // === Processes ===

    fn spawn<T: Task + 'static>(&mut self, operation: Operation<T>) {
        let id = self.next_process;
        self.next_process = self.next_process.wrapping_add(1);

        self.processes.insert(id, Box::new(operation));

        self.call_process(id, |process, context| process.start(context));
        self.deliver_rejected();
    }

    fn tick_processes(&mut self) {
        let ids: Vec<ProcessId> = self.processes.keys().copied().collect();

        for id in ids {
            let cancelled = self
                .processes
                .get(&id)
                .map(|process| process.is_cancelled())
                .unwrap_or(false);

            if cancelled {
                debug!(process = id, "Operation cancelled");
                self.processes.remove(&id);
                continue;
            }

            self.call_process(id, |process, context| process.handle_tick(context));
        }

        self.deliver_rejected();
    }

    /// Hands a callback to a process, dropping the process once it is done.
    fn call_process<F>(&mut self, id: ProcessId, callback: F)
    where
        F: FnOnce(&mut dyn ResponseHandler, &mut HandlerContext<'_>),
    {
        let Some(mut process) = self.processes.remove(&id) else {
            return;
        };

        let mut context = HandlerContext {
            routing_table: &mut self.routing_table,
            database: &mut self.database,
            statistics: &mut self.statistics,
            config: &self.config,
            bootstrapped: &mut self.bootstrapped,
            owner: id,
            dispatcher: &mut self.dispatcher,
            transport: &mut *self.transport,
            rejected: &mut self.rejected,
        };

        callback(process.as_mut(), &mut context);

        if !process.is_done() {
            self.processes.insert(id, process);
        }
    }

    /// Reports requests the dispatcher refused to send to their owners.
    fn deliver_rejected(&mut self) {
        loop {
            let rejected = std::mem::take(&mut self.rejected);
            if rejected.is_empty() {
                break;
            }

            for RejectedRequest {
                owner,
                request,
                error,
            } in rejected
            {
                self.call_process(owner, |process, context| {
                    process.handle_error(context, &request, error)
                });
            }
        }
    }
}

/// The primary key every entity of a store batch shares.
fn primary_key(entities: &[DhtValueEntity]) -> Result<Kuid> {
    let Some(first) = entities.first() else {
        return Err(DhtError::InvalidInput("Nothing to store".to_string()));
    };

    let key = *first.primary_key();

    if entities.iter().any(|entity| entity.primary_key() != &key) {
        return Err(DhtError::InvalidInput(
            "Entities stored together must share their primary key".to_string(),
        ));
    }

    Ok(key)
}
