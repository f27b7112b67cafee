//! Iterative FIND_NODE and FIND_VALUE lookups.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::{
    is_private_address, is_valid_address, most_recently_seen_first, Contact, DhtValueEntity,
    EntityKey, Kuid, Message, MessageBody, MessageId, RequestBody, RequestKind, ResponseBody,
    SecurityToken, SelectMode,
};
use crate::core::results::{FindNodeResult, FindValueResult};
use crate::{DhtError, Result};

use super::config::Config;
use super::handler::{HandlerContext, Progress, SentRequest, Task};

/// An iterative process of concurrently sending a request to the nearest
/// known contacts to the lookup id, learning nearer contacts from their
/// responses, until the `k` nearest contacts answered or nobody nearer is
/// left to ask.
#[derive(Debug)]
pub(crate) struct Lookup {
    lookup_id: Kuid,
    local_id: Kuid,
    request: RequestBody,
    parallelism: usize,
    /// Result set size.
    k: usize,
    timeout: Duration,
    alive_only: bool,
    /// Contacts queried first, whatever the route table holds.
    forced: Vec<Contact>,

    /// Candidates keyed by their distance to the lookup id.
    to_query: BTreeMap<Kuid, Contact>,
    /// Contacts that answered, and the token they issued us.
    path: BTreeMap<Kuid, (Contact, Option<SecurityToken>)>,
    queried: HashSet<Kuid>,
    hops: HashMap<Kuid, usize>,
    /// Pending requests by their first message id.
    inflight: HashMap<MessageId, Kuid>,
    route_table_nodes: HashSet<Kuid>,
    route_table_failures: usize,
    failures: usize,
    collisions: Vec<Contact>,
    started: Option<Instant>,
}

impl Lookup {
    fn new(lookup_id: Kuid, request: RequestBody, parallelism: usize, k: usize, timeout: Duration) -> Self {
        trace!(?lookup_id, request = %request.kind(), "New lookup");

        Lookup {
            lookup_id,
            local_id: Kuid::MINIMUM,
            request,
            parallelism: parallelism.max(1),
            k,
            timeout,
            alive_only: false,
            forced: Vec::new(),

            to_query: BTreeMap::new(),
            path: BTreeMap::new(),
            queried: HashSet::new(),
            hops: HashMap::new(),
            inflight: HashMap::new(),
            route_table_nodes: HashSet::new(),
            route_table_failures: 0,
            failures: 0,
            collisions: Vec::new(),
            started: None,
        }
    }

    // === Getters ===

    /// Started, and nothing left waiting for an answer.
    pub fn is_finished(&self) -> bool {
        self.started.is_some() && self.inflight.is_empty()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.map(|s| s.elapsed()).unwrap_or_default()
    }

    /// Contacts that answered, nearest first.
    pub fn path(&self) -> impl Iterator<Item = &Contact> {
        self.path.values().map(|(contact, _)| contact)
    }

    /// Hops to the nearest remote contact that answered.
    pub fn hops(&self) -> usize {
        self.path()
            .find_map(|contact| self.hops.get(contact.id()))
            .copied()
            .unwrap_or(0)
    }

    // === Public Methods ===

    /// Seeds the lookup from the route table and sends the first requests.
    pub fn start(&mut self, context: &mut HandlerContext<'_>) {
        self.started = Some(Instant::now());

        let local = context.local().clone();
        self.local_id = *local.id();

        let seeds = if self.alive_only {
            context
                .routing_table
                .select(&self.lookup_id, self.k * 2, SelectMode::Alive)
        } else {
            context
                .routing_table
                .select(&self.lookup_id, self.k, SelectMode::All)
        };

        self.queried.insert(*local.id());
        self.path.insert(local.id().xor(&self.lookup_id), (local.clone(), None));

        for contact in seeds.into_iter().filter(|c| c.id() != local.id()) {
            self.route_table_nodes.insert(*contact.id());
            self.hops.insert(*contact.id(), 1);
            self.to_query.insert(contact.id().xor(&self.lookup_id), contact);
        }

        let mut first: Vec<Contact> = self.to_query.values().take(self.parallelism).cloned().collect();

        // Give the most recently seen contact a chance, in case the nearest
        // ones are stale.
        if first.len() >= 3 {
            let mut candidates: Vec<&Contact> = self.to_query.values().collect();
            candidates.sort_by(|a, b| most_recently_seen_first(a, b));

            if let Some(recent) = candidates.first() {
                if !first.iter().any(|c| c.id() == recent.id()) {
                    let last = first.len() - 1;
                    first[last] = (*recent).clone();
                }
            }
        }

        let forced = std::mem::take(&mut self.forced);
        for contact in forced {
            self.hops.insert(*contact.id(), 1);
            self.send(context, contact);
        }

        for contact in first {
            self.send(context, contact);
        }
    }

    /// Accepts a response the lookup is waiting for, returning false otherwise.
    pub fn accept(&mut self, request: &SentRequest) -> bool {
        self.inflight.remove(&request.id).is_some()
    }

    /// Learns the contacts of an accepted FIND_NODE response.
    pub fn add_nodes(
        &mut self,
        context: &mut HandlerContext<'_>,
        responder: &Contact,
        token: Option<SecurityToken>,
        nodes: &[Contact],
    ) {
        let local = context.local().clone();
        let hop = self.hops.get(responder.id()).copied().unwrap_or(1);

        for node in nodes {
            if node.id() == local.id() {
                if node.address() != local.address()
                    && !self.collisions.iter().any(|c| c.address() == node.address())
                {
                    debug!(?node, "Found a contact with our id");
                    self.collisions.push(node.clone());
                }
                continue;
            }

            if node.address() == local.address()
                || !is_valid_address(&node.address())
                || is_private_address(&node.address(), context.config.local_is_private)
                || node.is_firewalled()
            {
                trace!(?node, "Skipping unusable contact");
                continue;
            }

            let distance = node.id().xor(&self.lookup_id);

            if self.queried.contains(node.id()) || self.to_query.contains_key(&distance) {
                continue;
            }

            self.hops.insert(*node.id(), hop + 1);
            self.to_query.insert(distance, node.clone());

            context
                .routing_table
                .add(Contact::new(*node.id(), node.address()));
        }

        self.add_to_path(responder, token);
    }

    fn add_to_path(&mut self, responder: &Contact, token: Option<SecurityToken>) {
        self.path.insert(
            responder.id().xor(&self.lookup_id),
            (responder.clone(), token),
        );

        while self.path.len() > self.k {
            self.path.pop_last();
        }
    }

    /// A request timed out or could not be sent.
    pub fn failed(&mut self, request: &SentRequest) -> bool {
        let Some(id) = self.inflight.remove(&request.id) else {
            return false;
        };

        self.failures += 1;
        if self.route_table_nodes.contains(&id) {
            self.route_table_failures += 1;
        }

        true
    }

    /// Sends more requests, or stops once the lookup converged or ran out of time.
    pub fn next_step(&mut self, context: &mut HandlerContext<'_>) {
        if self.elapsed() >= self.timeout {
            if !self.inflight.is_empty() {
                debug!(lookup_id = ?self.lookup_id, inflight = self.inflight.len(), "Lookup timed out");
            }
            self.kill();
            return;
        }

        if self.found_target() {
            return;
        }

        while self.inflight.len() < self.parallelism {
            let Some(nearest) = self.to_query.keys().next() else {
                break;
            };

            if self.path.len() >= self.k {
                if let Some(furthest) = self.path.keys().next_back() {
                    if furthest < nearest {
                        break;
                    }
                }
            }

            if let Some((_, contact)) = self.to_query.pop_first() {
                self.send(context, contact);
            }
        }
    }

    /// Forgets every pending request, finishing the lookup.
    pub fn kill(&mut self) {
        self.inflight.clear();
    }

    /// Fails if every remote contact queried failed to answer.
    pub fn check_failures(&self, operation: RequestKind) -> Result<()> {
        let attempted = self.queried.len().saturating_sub(1);

        if attempted > 0 && self.failures >= attempted {
            return Err(DhtError::AllContactsFailed {
                operation,
                attempted,
            });
        }

        Ok(())
    }

    pub fn find_node_result(&self) -> Result<FindNodeResult> {
        self.check_failures(RequestKind::FindNode)?;

        let tokens = self
            .path
            .values()
            .filter_map(|(contact, token)| token.clone().map(|token| (*contact.id(), token)))
            .collect();

        Ok(FindNodeResult::new(
            self.lookup_id,
            self.path().cloned().collect(),
            tokens,
            self.collisions.clone(),
            self.queried.clone(),
            self.route_table_failures,
            self.elapsed(),
            self.hops(),
        ))
    }

    // === Private Methods ===

    /// A remote contact with the lookup id itself answered.
    fn found_target(&self) -> bool {
        self.lookup_id != self.local_id && self.path.contains_key(&Kuid::MINIMUM)
    }

    fn send(&mut self, context: &mut HandlerContext<'_>, contact: Contact) {
        if !self.queried.insert(*contact.id()) {
            return;
        }

        let distance = contact.id().xor(&self.lookup_id);
        self.to_query.remove(&distance);

        let id = context.request(&contact, self.request.clone());
        self.inflight.insert(id, *contact.id());
    }
}

#[derive(Debug)]
pub(crate) struct FindNode {
    lookup: Lookup,
}

impl FindNode {
    pub fn new(lookup_id: Kuid, config: &Config) -> Self {
        FindNode {
            lookup: Lookup::new(
                lookup_id,
                RequestBody::FindNode { lookup_id },
                config.find_node_parallelism,
                config.k(),
                config.find_node_lookup_timeout,
            ),
        }
    }

    /// Queries these contacts first.
    pub fn with_forced(mut self, contacts: Vec<Contact>) -> Self {
        self.lookup.forced = contacts;
        self
    }

    /// Only considers alive contacts of the route table, as store lookups do.
    pub fn alive_only(mut self) -> Self {
        self.lookup.alive_only = true;
        self
    }

    fn progress(&mut self, context: &mut HandlerContext<'_>) -> Progress<FindNodeResult> {
        self.lookup.next_step(context);

        if self.lookup.is_finished() {
            return Progress::Done(self.lookup.find_node_result());
        }

        Progress::Pending
    }
}

impl Task for FindNode {
    type Output = FindNodeResult;

    fn start(&mut self, context: &mut HandlerContext<'_>) -> Progress<FindNodeResult> {
        self.lookup.start(context);
        self.progress(context)
    }

    fn handle_response(
        &mut self,
        context: &mut HandlerContext<'_>,
        request: &SentRequest,
        response: &Message,
    ) -> Progress<FindNodeResult> {
        if !self.lookup.accept(request) {
            return Progress::Pending;
        }

        if let MessageBody::Response(ResponseBody::FindNode { token, nodes, .. }) = &response.body {
            self.lookup
                .add_nodes(context, &response.contact, token.clone(), nodes);
        }

        self.progress(context)
    }

    fn handle_timeout(
        &mut self,
        context: &mut HandlerContext<'_>,
        request: &SentRequest,
    ) -> Progress<FindNodeResult> {
        if !self.lookup.failed(request) {
            return Progress::Pending;
        }
        self.progress(context)
    }

    fn handle_error(
        &mut self,
        context: &mut HandlerContext<'_>,
        request: &SentRequest,
        error: DhtError,
    ) -> Progress<FindNodeResult> {
        trace!(%error, "Lookup request failed");
        if !self.lookup.failed(request) {
            return Progress::Pending;
        }
        self.progress(context)
    }

    fn handle_tick(&mut self, context: &mut HandlerContext<'_>) -> Progress<FindNodeResult> {
        if self.lookup.elapsed() < self.lookup.timeout {
            return Progress::Pending;
        }
        self.progress(context)
    }
}

#[derive(Debug)]
/// Looks up the values stored under a key, stopping at the first holder.
pub(crate) struct FindValue {
    key: EntityKey,
    lookup: Lookup,
    holder: Option<Contact>,
    entities: Vec<DhtValueEntity>,
    /// Secondary keys the holder announced, and asked for in a second request.
    missing: Vec<Kuid>,
    keys_request: Option<MessageId>,
}

impl FindValue {
    pub fn new(key: EntityKey, config: &Config) -> Self {
        let request = RequestBody::FindValue {
            lookup_id: *key.primary_key(),
            secondary_keys: key.secondary_key().into_iter().copied().collect(),
            value_type: key.value_type(),
        };

        FindValue {
            lookup: Lookup::new(
                *key.primary_key(),
                request,
                config.find_value_parallelism,
                config.k(),
                config.find_value_lookup_timeout,
            ),
            key,
            holder: None,
            entities: Vec::new(),
            missing: Vec::new(),
            keys_request: None,
        }
    }

    fn matches(&self, entity: &DhtValueEntity) -> bool {
        entity.primary_key() == self.key.primary_key()
            && self
                .key
                .secondary_key()
                .map(|key| key == entity.secondary_key())
                .unwrap_or(true)
            && self.key.value_type().matches(&entity.value().value_type())
    }

    fn wanted(&self, secondary_key: &Kuid) -> bool {
        self.key
            .secondary_key()
            .map(|key| key == secondary_key)
            .unwrap_or(true)
            && !self.entities.iter().any(|e| e.secondary_key() == secondary_key)
    }

    fn found(
        &mut self,
        context: &mut HandlerContext<'_>,
        holder: &Contact,
        entities: &[DhtValueEntity],
        secondary_keys: &[Kuid],
    ) -> Progress<FindValueResult> {
        debug!(key = %self.key, ?holder, "Found values");

        self.lookup.kill();
        self.holder = Some(holder.clone());

        let entities: Vec<DhtValueEntity> =
            entities.iter().filter(|e| self.matches(e)).cloned().collect();
        self.entities.extend(entities);

        self.missing = secondary_keys
            .iter()
            .filter(|key| self.wanted(key))
            .copied()
            .collect();

        if self.missing.is_empty() {
            return self.done();
        }

        let request = RequestBody::FindValue {
            lookup_id: *self.key.primary_key(),
            secondary_keys: self.missing.clone(),
            value_type: self.key.value_type(),
        };
        self.keys_request = Some(context.request(holder, request));

        Progress::Pending
    }

    fn done(&mut self) -> Progress<FindValueResult> {
        if self.holder.is_none() {
            if let Err(error) = self.lookup.check_failures(RequestKind::FindValue) {
                return Progress::Done(Err(error));
            }
        }

        let entity_keys = self
            .missing
            .iter()
            .map(|key| EntityKey::new(*self.key.primary_key(), Some(*key), self.key.value_type()))
            .collect();

        let mut path: Vec<Contact> = self
            .lookup
            .path()
            .filter(|c| self.holder.as_ref().map(|h| h.id() != c.id()).unwrap_or(true))
            .cloned()
            .collect();
        path.extend(self.holder.clone());

        Progress::Done(Ok(FindValueResult::new(
            self.key.clone(),
            std::mem::take(&mut self.entities),
            entity_keys,
            path,
            self.lookup.elapsed(),
            self.lookup.hops(),
        )))
    }

    fn progress(&mut self, context: &mut HandlerContext<'_>) -> Progress<FindValueResult> {
        if self.keys_request.is_some() {
            return Progress::Pending;
        }

        self.lookup.next_step(context);

        if self.lookup.is_finished() {
            return self.done();
        }

        Progress::Pending
    }
}

impl Task for FindValue {
    type Output = FindValueResult;

    fn start(&mut self, context: &mut HandlerContext<'_>) -> Progress<FindValueResult> {
        let local_entities: Vec<DhtValueEntity> = context
            .database
            .get(self.key.primary_key())
            .map(|bag| bag.values().filter(|e| self.matches(e)).cloned().collect())
            .unwrap_or_default();

        if !local_entities.is_empty() {
            trace!(key = %self.key, "Found values locally");
            self.entities = local_entities;
            self.holder = Some(context.local().clone());
            return self.done();
        }

        self.lookup.start(context);
        self.progress(context)
    }

    fn handle_response(
        &mut self,
        context: &mut HandlerContext<'_>,
        request: &SentRequest,
        response: &Message,
    ) -> Progress<FindValueResult> {
        if self.keys_request == Some(request.id) {
            self.keys_request = None;

            if let MessageBody::Response(ResponseBody::FindValue { entities, .. }) = &response.body {
                let entities: Vec<DhtValueEntity> =
                    entities.iter().filter(|e| self.matches(e)).cloned().collect();
                self.missing
                    .retain(|key| !entities.iter().any(|e| e.secondary_key() == key));
                self.entities.extend(entities);
            }

            return self.done();
        }

        if !self.lookup.accept(request) {
            return Progress::Pending;
        }

        match &response.body {
            MessageBody::Response(ResponseBody::FindValue {
                entities,
                secondary_keys,
                ..
            }) => self.found(context, &response.contact, entities, secondary_keys),
            MessageBody::Response(ResponseBody::FindNode { token, nodes, .. }) => {
                self.lookup
                    .add_nodes(context, &response.contact, token.clone(), nodes);
                self.progress(context)
            }
            _ => self.progress(context),
        }
    }

    fn handle_timeout(
        &mut self,
        context: &mut HandlerContext<'_>,
        request: &SentRequest,
    ) -> Progress<FindValueResult> {
        if self.keys_request == Some(request.id) {
            self.keys_request = None;
            return self.done();
        }

        if !self.lookup.failed(request) {
            return Progress::Pending;
        }
        self.progress(context)
    }

    fn handle_error(
        &mut self,
        context: &mut HandlerContext<'_>,
        request: &SentRequest,
        error: DhtError,
    ) -> Progress<FindValueResult> {
        trace!(%error, "Lookup request failed");
        self.handle_timeout(context, request)
    }

    fn handle_tick(&mut self, context: &mut HandlerContext<'_>) -> Progress<FindValueResult> {
        if self.keys_request.is_some() || self.lookup.elapsed() < self.lookup.timeout {
            return Progress::Pending;
        }
        self.progress(context)
    }
}
