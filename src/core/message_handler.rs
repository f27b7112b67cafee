//! Route table maintenance and store-forward replication, run for every
//! inbound message before protocol specific handling.

use std::net::SocketAddr;

use tracing::{debug, info, trace};

use crate::common::{
    is_private_address, AddOutcome, Contact, DhtValueEntity, Kuid, Message, MessageBody,
    ResponseBody, RouteTable, SecurityToken, SelectMode,
};
use crate::core::database::Database;
use crate::core::statistics::Statistics;

/// How many times `k` contacts are selected around a new contact to decide
/// whether this node is near enough to take part in store-forward.
pub const STORE_FORWARD_SELECTION_FACTOR: usize = 2;

#[derive(Debug, Clone)]
pub struct MessageHandlerSettings {
    /// Forward values to new contacts joining their replica set.
    pub store_forward_enabled: bool,
    /// Drop values this node is pushed out of the replica set of.
    pub delete_value_if_furthest_node: bool,
    /// Abandon forwarding when a message that should carry a token doesn't.
    pub store_requires_security_token: bool,
    /// See [crate::common::is_private_address].
    pub local_is_private: bool,
}

impl Default for MessageHandlerSettings {
    fn default() -> Self {
        MessageHandlerSettings {
            store_forward_enabled: true,
            delete_value_if_furthest_node: false,
            store_requires_security_token: true,
            local_is_private: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What to do with a stored key when a contact joins.
pub enum ForwardOperation {
    Nothing,
    /// Send the key's values to the new contact.
    Forward,
    /// This node left the key's replica set.
    Delete,
}

#[derive(Debug, Clone)]
/// Network work decided while handling a message, for the caller to start.
pub enum FollowUp {
    /// Ping the least recently seen contact of a full bucket.
    Ping(Contact),
    /// Ping `existing`, and replace it with `candidate` if it doesn't answer.
    SpoofCheck { existing: Contact, candidate: Contact },
    /// Store `entities` at `node`.
    ///
    /// Without a token, the caller has to obtain one from `node` first.
    Forward {
        node: Contact,
        token: Option<SecurityToken>,
        entities: Vec<DhtValueEntity>,
    },
}

/// The node state a message updates.
pub struct RoutingContext<'a> {
    pub routing_table: &'a mut RouteTable,
    pub database: &'a mut Database,
    pub statistics: &'a mut Statistics,
    pub bootstrapped: bool,
}

#[derive(Debug, Clone, Default)]
/// Keeps the route table current from inbound traffic and replicates values
/// to contacts joining their replica set.
pub struct DefaultMessageHandler {
    settings: MessageHandlerSettings,
}

impl DefaultMessageHandler {
    pub fn new(settings: MessageHandlerSettings) -> Self {
        DefaultMessageHandler { settings }
    }

    pub fn settings(&self) -> &MessageHandlerSettings {
        &self.settings
    }

    // === Public Methods ===

    pub fn handle_request(&self, context: RoutingContext<'_>, message: &Message) -> Vec<FollowUp> {
        self.add_live_contact_info(context, message)
    }

    pub fn handle_response(&self, context: RoutingContext<'_>, message: &Message) -> Vec<FollowUp> {
        self.add_live_contact_info(context, message)
    }

    /// A response that arrived after its request timed out still tells us the
    /// sender is alive.
    pub fn handle_late_response(&self, routing_table: &mut RouteTable, message: &Message) -> Vec<FollowUp> {
        let contact = &message.contact;

        if contact.is_firewalled() {
            return Vec::new();
        }

        follow_ups(routing_table.add(contact.clone()))
    }

    pub fn handle_timeout(&self, routing_table: &mut RouteTable, node_id: &Kuid, address: SocketAddr) {
        routing_table.handle_failure(node_id, address);
    }

    /// Decides whether this node forwards, deletes or keeps `value_id` when
    /// `node` joins, given the contact `existing` we had for its id.
    ///
    /// Must be called before `node` is added to the route table.
    pub fn get_operation(
        routing_table: &RouteTable,
        node: &Contact,
        existing: Option<&Contact>,
        value_id: &Kuid,
    ) -> ForwardOperation {
        let k = routing_table.settings().k;
        let local_id = routing_table.local_id();
        let nodes = routing_table.select(value_id, k, SelectMode::All);

        let (Some(closest), Some(furthest)) = (nodes.first(), nodes.last()) else {
            return ForwardOperation::Nothing;
        };

        // We are the nearest, or the second nearest after the node itself,
        // which came back with a new instance and lost its values.
        let responsible = closest.id() == local_id
            || (closest.id() == node.id() && nodes.len() > 1 && nodes[1].id() == local_id);

        if responsible {
            // The node has to make it into the k nearest.
            if node.id() == furthest.id() || node.id().is_nearer_to(value_id, furthest.id()) {
                return ForwardOperation::Forward;
            }
        } else if nodes.len() >= k
            && furthest.id() == local_id
            && existing.map(|e| e.is_dead()).unwrap_or(true)
            && node.id().is_nearer_to(value_id, furthest.id())
        {
            return ForwardOperation::Delete;
        }

        ForwardOperation::Nothing
    }

    // === Private Methods ===

    fn add_live_contact_info(&self, context: RoutingContext<'_>, message: &Message) -> Vec<FollowUp> {
        let RoutingContext {
            routing_table,
            database,
            statistics,
            bootstrapped,
        } = context;
        let node = &message.contact;

        if node.is_shutdown() {
            debug!(?node, "Contact is shutting down");

            let known = routing_table
                .get(node.id())
                .map(|existing| existing.is_same(node))
                .unwrap_or(false);

            if known {
                return follow_ups(routing_table.add(node.clone()));
            }
            return Vec::new();
        }

        if node.is_firewalled() {
            trace!(?node, "Contact is firewalled");
            return Vec::new();
        }

        if is_private_address(&node.address(), self.settings.local_is_private) {
            trace!(?node, "Contact has a private address");
            return Vec::new();
        }

        if node.id() == routing_table.local_id() {
            info!(?node, "Our node id collides with another contact");
            return Vec::new();
        }

        let mut result = Vec::new();

        if self.settings.store_forward_enabled && bootstrapped {
            let existing = routing_table.get(node.id()).cloned();

            let rejoining = existing
                .as_ref()
                .map(|e| e.is_dead() || e.instance_id() != node.instance_id())
                .unwrap_or(true);

            if rejoining {
                let k = routing_table.settings().k;
                let nearby = routing_table.select(
                    node.id(),
                    STORE_FORWARD_SELECTION_FACTOR * k,
                    SelectMode::All,
                );

                if nearby.iter().any(|c| c.id() == routing_table.local_id()) {
                    trace!(?node, "New or restarted contact, checking store forward");

                    if let Some(forward) = self.forward_or_remove(
                        routing_table,
                        database,
                        statistics,
                        node,
                        existing.as_ref(),
                        carried_token(message),
                    ) {
                        result.push(forward);
                    }
                }
            }
        }

        result.extend(follow_ups(routing_table.add(node.clone())));

        result
    }

    fn forward_or_remove(
        &self,
        routing_table: &RouteTable,
        database: &mut Database,
        statistics: &mut Statistics,
        node: &Contact,
        existing: Option<&Contact>,
        token: Option<Option<&SecurityToken>>,
    ) -> Option<FollowUp> {
        let mut entities = Vec::new();
        let mut forwarded_keys = 0;

        for key in database.keys() {
            match Self::get_operation(routing_table, node, existing, &key) {
                ForwardOperation::Forward => {
                    if let Some(bag) = database.get(&key) {
                        entities.extend(bag.values().cloned());
                        forwarded_keys += 1;
                    }
                }
                ForwardOperation::Delete if self.settings.delete_value_if_furthest_node => {
                    debug!(?key, ?node, "Deleting values we are no longer responsible for");
                    database.remove_all(&key);
                    statistics.key_deleted();
                }
                _ => {}
            }
        }

        if entities.is_empty() {
            return None;
        }

        let token = match token {
            Some(None) if self.settings.store_requires_security_token => {
                debug!(?node, "Missing security token, not forwarding");
                return None;
            }
            Some(token) => token.cloned(),
            None => None,
        };

        statistics.keys_forwarded_add(forwarded_keys);

        Some(FollowUp::Forward {
            node: node.clone(),
            token,
            entities,
        })
    }
}

/// `Some` if the message is of a kind that carries the sender's security token.
fn carried_token(message: &Message) -> Option<Option<&SecurityToken>> {
    match &message.body {
        MessageBody::Response(
            response @ (ResponseBody::Pong { .. } | ResponseBody::FindNode { .. }),
        ) => Some(response.security_token()),
        _ => None,
    }
}

fn follow_ups(outcome: AddOutcome) -> Vec<FollowUp> {
    match outcome {
        AddOutcome::Cached { ping: Some(lrs) } | AddOutcome::Dropped { ping: Some(lrs) } => {
            vec![FollowUp::Ping(lrs)]
        }
        AddOutcome::SpoofCheck {
            existing,
            candidate,
        } => vec![FollowUp::SpoofCheck {
            existing,
            candidate,
        }],
        AddOutcome::Replaced(evicted) => {
            trace!(?evicted, "Replaced least recently seen contact");
            Vec::new()
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use super::*;
    use crate::common::{
        DhtValue, MessageId, RequestBody, RoutingSettings, ValueType, Version, KUID_SIZE,
    };
    use crate::core::database::DatabaseSettings;

    /// An id at xor distance `distance` from [Kuid::MINIMUM].
    fn id(distance: u8) -> Kuid {
        let mut bytes = [0; KUID_SIZE];
        bytes[KUID_SIZE - 1] = distance;
        Kuid(bytes)
    }

    fn contact(distance: u8) -> Contact {
        Contact::live(id(distance), SocketAddr::from(([21, 0, 0, distance], 6881)), 0)
    }

    struct Node {
        routing_table: RouteTable,
        database: Database,
        statistics: Statistics,
        handler: DefaultMessageHandler,
    }

    impl Node {
        fn new(local: Contact, k: usize, delete: bool) -> Node {
            let settings = RoutingSettings {
                k,
                ..Default::default()
            };

            Node {
                routing_table: RouteTable::new(local, settings),
                database: Database::new(DatabaseSettings::default(), true),
                statistics: Statistics::new(),
                handler: DefaultMessageHandler::new(MessageHandlerSettings {
                    delete_value_if_furthest_node: delete,
                    ..Default::default()
                }),
            }
        }

        fn store_local(&mut self, key: Kuid) {
            let value = DhtValue::new(ValueType::TEXT, Version::default(), &b"value"[..]);
            let local = self.routing_table.local().clone();
            assert!(self.database.store(DhtValueEntity::local(local, key, value)));
        }

        fn receive(&mut self, message: Message) -> Vec<FollowUp> {
            let context = RoutingContext {
                routing_table: &mut self.routing_table,
                database: &mut self.database,
                statistics: &mut self.statistics,
                bootstrapped: true,
            };

            if message.is_request() {
                self.handler.handle_request(context, &message)
            } else {
                self.handler.handle_response(context, &message)
            }
        }
    }

    fn ping_from(contact: &Contact) -> Message {
        Message::request(MessageId(1), contact.clone(), RequestBody::Ping)
    }

    fn find_node_response_from(contact: &Contact, token: Option<SecurityToken>) -> Message {
        Message::response_to(
            MessageId(1),
            contact.clone(),
            ResponseBody::FindNode {
                lookup_id: Kuid::random(),
                token,
                nodes: vec![],
            },
        )
    }

    /// k = 2, key K at distance 0; L at 15 holds K and knows N1 (10) and N2 (20).
    /// N3 (5) joins.
    #[test]
    fn furthest_node_does_not_forward() {
        let key = Kuid::MINIMUM;
        let mut local = Node::new(contact(15), 2, false);
        local.routing_table.add(contact(10));
        local.routing_table.add(contact(20));
        local.store_local(key);

        let n3 = contact(5);
        let operation =
            DefaultMessageHandler::get_operation(&local.routing_table, &n3, None, &key);
        assert_eq!(operation, ForwardOperation::Delete);

        let follow_ups = local.receive(ping_from(&n3));

        assert!(!follow_ups
            .iter()
            .any(|f| matches!(f, FollowUp::Forward { .. })));
        // Deleting is disabled by default.
        assert!(local.database.contains(&key));
        assert!(local.routing_table.contains(n3.id()));
    }

    #[test]
    fn furthest_node_deletes_when_enabled() {
        let key = Kuid::MINIMUM;
        let mut local = Node::new(contact(15), 2, true);
        local.routing_table.add(contact(10));
        local.routing_table.add(contact(20));
        local.store_local(key);

        local.receive(ping_from(&contact(5)));

        assert!(!local.database.contains(&key));
        assert_eq!(local.statistics.keys_deleted(), 1);
    }

    #[test]
    fn nearest_node_forwards() {
        let key = Kuid::MINIMUM;
        // N1's view of the same network.
        let mut n1 = Node::new(contact(10), 2, false);
        n1.routing_table.add(contact(15));
        n1.routing_table.add(contact(20));
        n1.store_local(key);

        let n3 = contact(5);
        let operation = DefaultMessageHandler::get_operation(&n1.routing_table, &n3, None, &key);
        assert_eq!(operation, ForwardOperation::Forward);

        let token = SecurityToken::new(vec![1, 2, 3, 4]);
        let follow_ups = n1.receive(find_node_response_from(&n3, Some(token.clone())));

        match follow_ups.first() {
            Some(FollowUp::Forward {
                node,
                token: forwarded_token,
                entities,
            }) => {
                assert_eq!(node.id(), n3.id());
                assert_eq!(forwarded_token.as_ref(), Some(&token));
                assert_eq!(entities.len(), 1);
                assert_eq!(entities[0].primary_key(), &key);
            }
            other => panic!("expected a forward, got {:?}", other),
        }
        assert_eq!(n1.statistics.keys_forwarded(), 1);
    }

    #[test]
    fn request_forwards_without_token() {
        let key = Kuid::MINIMUM;
        let mut n1 = Node::new(contact(10), 2, false);
        n1.store_local(key);

        let follow_ups = n1.receive(ping_from(&contact(5)));

        assert!(matches!(
            follow_ups.first(),
            Some(FollowUp::Forward { token: None, .. })
        ));
    }

    #[test]
    fn missing_token_abandons_forward() {
        let key = Kuid::MINIMUM;
        let mut n1 = Node::new(contact(10), 2, false);
        n1.store_local(key);

        let n3 = contact(5);
        let follow_ups = n1.receive(find_node_response_from(&n3, None));

        assert!(follow_ups.is_empty());
        // The contact is still added.
        assert!(n1.routing_table.contains(n3.id()));
    }

    #[test]
    fn known_contact_does_not_trigger_forward() {
        let key = Kuid::MINIMUM;
        let mut n1 = Node::new(contact(10), 2, false);
        n1.store_local(key);

        let n3 = contact(5);
        n1.routing_table.add(n3.clone());

        assert!(n1.receive(ping_from(&n3)).is_empty());

        // Same contact, new instance.
        let restarted = n3.clone().with_instance_id(1);
        let follow_ups = n1.receive(ping_from(&restarted));
        assert!(matches!(follow_ups.first(), Some(FollowUp::Forward { .. })));
    }

    #[test]
    fn not_bootstrapped_does_not_forward() {
        let key = Kuid::MINIMUM;
        let mut n1 = Node::new(contact(10), 2, false);
        n1.store_local(key);

        let context = RoutingContext {
            routing_table: &mut n1.routing_table,
            database: &mut n1.database,
            statistics: &mut n1.statistics,
            bootstrapped: false,
        };
        let follow_ups = n1.handler.handle_request(context, &ping_from(&contact(5)));

        assert!(follow_ups.is_empty());
    }

    #[test]
    fn ignored_contacts() {
        let mut node = Node::new(contact(10), 20, false);

        let firewalled = Contact::random().with_firewalled(true);
        node.receive(ping_from(&firewalled));

        let private = Contact::live(Kuid::random(), SocketAddr::from(([192, 168, 0, 1], 1)), 0);
        node.receive(ping_from(&private));

        let collision = Contact::live(id(10), SocketAddr::from(([21, 9, 9, 9], 1)), 0);
        node.receive(ping_from(&collision));

        // Shutdown notice of an unknown contact.
        let shutdown = Contact::random().with_shutdown(true);
        node.receive(ping_from(&shutdown));

        assert!(node.routing_table.is_empty());
    }

    #[test]
    fn shutdown_marks_known_contact() {
        let mut node = Node::new(contact(10), 20, false);
        let known = Contact::random();
        node.routing_table.add(known.clone());

        node.receive(ping_from(&known.clone().with_shutdown(true)));

        assert!(node
            .routing_table
            .get(known.id())
            .map(|c| c.is_shutdown())
            .unwrap_or(false));
    }

    #[test]
    fn timeout_and_late_response() {
        let node = Node::new(contact(10), 20, false);
        let mut routing_table = node.routing_table;
        let remote = Contact::random();
        routing_table.add(remote.clone());

        node.handler
            .handle_timeout(&mut routing_table, remote.id(), remote.address());
        assert_eq!(routing_table.get(remote.id()).map(|c| c.failures()), Some(1));

        let late = find_node_response_from(&Contact::random(), None);
        node.handler.handle_late_response(&mut routing_table, &late);
        assert!(routing_table.contains(late.contact.id()));

        let firewalled = find_node_response_from(&Contact::random().with_firewalled(true), None);
        node.handler
            .handle_late_response(&mut routing_table, &firewalled);
        assert!(!routing_table.contains(firewalled.contact.id()));
    }
}
