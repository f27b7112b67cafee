//! STORE operations, to the `k` nearest contacts of a key or to a single contact.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, trace};

use crate::common::{
    Contact, DhtValueEntity, Kuid, Message, MessageBody, MessageId, RequestBody, RequestKind,
    ResponseBody, SecurityToken, StoreStatusCode,
};
use crate::core::results::{FindNodeResult, StoreResult};
use crate::DhtError;

use super::handler::{Callback, HandlerContext, Progress, SentRequest, Task};
use super::lookup::FindNode;

#[derive(Debug)]
enum Stage {
    /// Waiting for the FIND_NODE response carrying a security token.
    Token,
    /// Waiting for the STORE response.
    Store,
}

#[derive(Debug)]
struct Pending {
    contact: Contact,
    stage: Stage,
}

#[derive(Debug)]
/// Stores a batch of entities sharing a primary key.
pub(crate) struct Store {
    entities: Vec<DhtValueEntity>,
    /// Finds the replica set first, unless storing to a given contact.
    lookup: Option<FindNode>,
    queue: VecDeque<(Contact, Option<SecurityToken>)>,
    inflight: HashMap<MessageId, Pending>,
    locations: Vec<Contact>,
    failed: Vec<Contact>,
}

impl Store {
    /// Stores at the `k` nearest alive contacts of the entities' primary key,
    /// this node included if it is one of them.
    pub fn with_lookup(primary_key: Kuid, entities: Vec<DhtValueEntity>, lookup: FindNode) -> Self {
        trace!(?primary_key, entities = entities.len(), "New store");

        Store {
            entities,
            lookup: Some(lookup.alive_only()),
            queue: VecDeque::new(),
            inflight: HashMap::new(),
            locations: Vec::new(),
            failed: Vec::new(),
        }
    }

    /// Stores at `node`, fetching a security token first if `token` is missing.
    pub fn direct(node: Contact, token: Option<SecurityToken>, entities: Vec<DhtValueEntity>) -> Self {
        Store {
            entities,
            lookup: None,
            queue: VecDeque::from([(node, token)]),
            inflight: HashMap::new(),
            locations: Vec::new(),
            failed: Vec::new(),
        }
    }

    fn looked_up(
        &mut self,
        context: &mut HandlerContext<'_>,
        progress: Progress<FindNodeResult>,
    ) -> Progress<StoreResult> {
        match progress {
            Progress::Pending => Progress::Pending,
            Progress::Done(Err(error)) => Progress::Done(Err(error)),
            Progress::Done(Ok(result)) => {
                self.lookup = None;

                let local_id = *context.routing_table.local_id();

                for contact in result.path() {
                    if contact.id() == &local_id {
                        self.store_locally(context);
                    } else {
                        let token = result.token(contact.id()).cloned();
                        self.queue.push_back((contact.clone(), token));
                    }
                }

                self.next_step(context)
            }
        }
    }

    fn store_locally(&mut self, context: &mut HandlerContext<'_>) {
        let stored = self
            .entities
            .iter()
            .filter(|entity| context.database.store((*entity).clone()))
            .count();

        if stored == self.entities.len() {
            self.locations.push(context.local().clone());
        } else {
            debug!(stored, entities = self.entities.len(), "Local database refused values");
            self.failed.push(context.local().clone());
        }
    }

    fn send_store(&mut self, context: &mut HandlerContext<'_>, contact: Contact, token: Option<SecurityToken>) {
        let request = RequestBody::Store {
            token,
            entities: self.entities.clone(),
        };
        let id = context.request(&contact, request);

        self.inflight.insert(
            id,
            Pending {
                contact,
                stage: Stage::Store,
            },
        );
    }

    fn next_step(&mut self, context: &mut HandlerContext<'_>) -> Progress<StoreResult> {
        let parallelism = context.config.store_parallelism.max(1);

        while self.inflight.len() < parallelism {
            let Some((contact, token)) = self.queue.pop_front() else {
                break;
            };

            if token.is_none() && context.config.message_handler.store_requires_security_token {
                let request = RequestBody::FindNode {
                    lookup_id: *contact.id(),
                };
                let id = context.request(&contact, request);

                self.inflight.insert(
                    id,
                    Pending {
                        contact,
                        stage: Stage::Token,
                    },
                );
            } else {
                self.send_store(context, contact, token);
            }
        }

        if !self.inflight.is_empty() || !self.queue.is_empty() {
            return Progress::Pending;
        }

        if self.locations.is_empty() && !self.failed.is_empty() {
            return Progress::Done(Err(DhtError::AllContactsFailed {
                operation: RequestKind::Store,
                attempted: self.failed.len(),
            }));
        }

        Progress::Done(Ok(StoreResult::new(
            std::mem::take(&mut self.entities),
            std::mem::take(&mut self.locations),
            std::mem::take(&mut self.failed),
        )))
    }

    fn failed(&mut self, context: &mut HandlerContext<'_>, request: &SentRequest) -> Progress<StoreResult> {
        let Some(pending) = self.inflight.remove(&request.id) else {
            return Progress::Pending;
        };

        trace!(contact = ?pending.contact, stage = ?pending.stage, "Store failed");
        self.failed.push(pending.contact);

        self.next_step(context)
    }
}

impl Task for Store {
    type Output = StoreResult;

    fn start(&mut self, context: &mut HandlerContext<'_>) -> Progress<StoreResult> {
        match self.lookup.as_mut() {
            Some(lookup) => {
                let progress = lookup.start(context);
                self.looked_up(context, progress)
            }
            None => self.next_step(context),
        }
    }

    fn handle_response(
        &mut self,
        context: &mut HandlerContext<'_>,
        request: &SentRequest,
        response: &Message,
    ) -> Progress<StoreResult> {
        if let Some(lookup) = self.lookup.as_mut() {
            let progress = Callback::Response(request, response).apply(lookup, context);
            return self.looked_up(context, progress);
        }

        let Some(pending) = self.inflight.remove(&request.id) else {
            return Progress::Pending;
        };

        match (pending.stage, &response.body) {
            (Stage::Token, MessageBody::Response(body)) => match body.security_token() {
                Some(token) => self.send_store(context, pending.contact, Some(token.clone())),
                None => {
                    debug!(contact = ?pending.contact, "No security token to store with");
                    self.failed.push(pending.contact);
                }
            },
            (Stage::Store, MessageBody::Response(ResponseBody::Store { statuses })) => {
                let stored = statuses.len() == self.entities.len()
                    && statuses.iter().all(|s| s.code == StoreStatusCode::Ok);

                if stored {
                    self.locations.push(response.contact.clone());
                } else {
                    self.failed.push(pending.contact);
                }
            }
            _ => self.failed.push(pending.contact),
        }

        self.next_step(context)
    }

    fn handle_timeout(&mut self, context: &mut HandlerContext<'_>, request: &SentRequest) -> Progress<StoreResult> {
        if let Some(lookup) = self.lookup.as_mut() {
            let progress = Callback::Timeout(request).apply(lookup, context);
            return self.looked_up(context, progress);
        }

        self.failed(context, request)
    }

    fn handle_error(
        &mut self,
        context: &mut HandlerContext<'_>,
        request: &SentRequest,
        error: DhtError,
    ) -> Progress<StoreResult> {
        if let Some(lookup) = self.lookup.as_mut() {
            let progress = Callback::Error(request, error).apply(lookup, context);
            return self.looked_up(context, progress);
        }

        trace!(%error, "Store request failed");
        self.failed(context, request)
    }

    fn handle_tick(&mut self, context: &mut HandlerContext<'_>) -> Progress<StoreResult> {
        match self.lookup.as_mut() {
            Some(lookup) => {
                let progress = lookup.handle_tick(context);
                self.looked_up(context, progress)
            }
            None => Progress::Pending,
        }
    }
}
