use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::common::{Message, MessageId};

use super::handler::{ProcessId, SentRequest};

#[derive(Debug, Clone)]
pub(crate) struct InflightRequest {
    pub sent: SentRequest,
    pub owner: ProcessId,
    /// The message as sent, re-sent as is on timeout.
    pub message: Message,
    pub timeout: Duration,
    pub deadline: Instant,
    pub resends_left: usize,
}

impl InflightRequest {
    pub fn does_match(&self, from: &SocketAddr) -> bool {
        let to = self.sent.address;

        if to.port() != from.port() {
            return false;
        }

        if to.ip().is_unspecified() {
            return true;
        }

        to.ip() == from.ip()
    }
}

#[derive(Debug, Default)]
pub(crate) struct InflightRequests {
    requests: HashMap<MessageId, InflightRequest>,
}

impl InflightRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new inflight request O(1) amortized
    pub fn add(&mut self, request: InflightRequest) {
        self.requests.insert(request.sent.id, request);
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.requests.contains_key(&id)
    }

    pub fn get(&self, id: MessageId) -> Option<&InflightRequest> {
        self.requests.get(&id)
    }

    /// Remove inflight request by id if it exists and matches the address
    /// O(1) amortized
    pub fn remove(&mut self, id: MessageId, from: &SocketAddr) -> Option<InflightRequest> {
        let request = self.requests.get(&id)?;

        if !request.does_match(from) {
            return None;
        }

        self.requests.remove(&id)
    }

    /// Removes and returns every request past its deadline.
    pub fn expired(&mut self, now: Instant) -> Vec<InflightRequest> {
        let ids: Vec<MessageId> = self
            .requests
            .iter()
            .filter(|(_, request)| request.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        ids.into_iter()
            .filter_map(|id| self.requests.remove(&id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
