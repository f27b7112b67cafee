//! Per-node traffic counters.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

use crate::common::RequestKind;

const KINDS: [RequestKind; 5] = [
    RequestKind::Ping,
    RequestKind::FindNode,
    RequestKind::FindValue,
    RequestKind::Store,
    RequestKind::Stats,
];

#[derive(Debug, Clone, Default)]
/// Counters rendered by STATS requests and [crate::Dht::statistics_dump].
pub struct Statistics {
    requests_received: HashMap<RequestKind, u64>,
    requests_sent: HashMap<RequestKind, u64>,
    responses_sent: u64,
    responses_received: u64,
    timeouts: u64,
    late_responses: u64,
    store_requests_rejected: u64,
    keys_forwarded: u64,
    keys_deleted: u64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    // === Getters ===

    pub fn requests_received(&self, kind: RequestKind) -> u64 {
        self.requests_received.get(&kind).copied().unwrap_or(0)
    }

    pub fn requests_sent(&self, kind: RequestKind) -> u64 {
        self.requests_sent.get(&kind).copied().unwrap_or(0)
    }

    pub fn responses_sent(&self) -> u64 {
        self.responses_sent
    }

    pub fn responses_received(&self) -> u64 {
        self.responses_received
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts
    }

    pub fn late_responses(&self) -> u64 {
        self.late_responses
    }

    pub fn store_requests_rejected(&self) -> u64 {
        self.store_requests_rejected
    }

    pub fn keys_forwarded(&self) -> u64 {
        self.keys_forwarded
    }

    pub fn keys_deleted(&self) -> u64 {
        self.keys_deleted
    }

    // === Public Methods ===

    pub fn request_received(&mut self, kind: RequestKind) {
        *self.requests_received.entry(kind).or_default() += 1;
    }

    pub fn request_sent(&mut self, kind: RequestKind) {
        *self.requests_sent.entry(kind).or_default() += 1;
    }

    pub fn response_sent(&mut self) {
        self.responses_sent += 1;
    }

    pub fn response_received(&mut self) {
        self.responses_received += 1;
    }

    pub fn timeout(&mut self) {
        self.timeouts += 1;
    }

    pub fn late_response(&mut self) {
        self.late_responses += 1;
    }

    /// A STORE request without a valid security token.
    pub fn store_rejected(&mut self) {
        self.store_requests_rejected += 1;
    }

    pub fn keys_forwarded_add(&mut self, count: usize) {
        self.keys_forwarded += count as u64;
    }

    pub fn key_deleted(&mut self) {
        self.keys_deleted += 1;
    }
}

impl Display for Statistics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Requests received:")?;
        for kind in KINDS {
            writeln!(f, " {}: {}", kind, self.requests_received(kind))?;
        }

        writeln!(f, "Requests sent:")?;
        for kind in KINDS {
            writeln!(f, " {}: {}", kind, self.requests_sent(kind))?;
        }

        writeln!(f, "Responses sent: {}", self.responses_sent)?;
        writeln!(f, "Responses received: {}", self.responses_received)?;
        writeln!(f, "Timeouts: {}", self.timeouts)?;
        writeln!(f, "Late responses: {}", self.late_responses)?;
        writeln!(f, "Rejected stores: {}", self.store_requests_rejected)?;
        writeln!(f, "Store forward:")?;
        writeln!(f, " forwarded keys: {}", self.keys_forwarded)?;
        write!(f, " deleted keys: {}", self.keys_deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_per_kind() {
        let mut statistics = Statistics::new();

        statistics.request_received(RequestKind::Store);
        statistics.request_received(RequestKind::Store);
        statistics.request_received(RequestKind::Ping);

        assert_eq!(statistics.requests_received(RequestKind::Store), 2);
        assert_eq!(statistics.requests_received(RequestKind::Ping), 1);
        assert_eq!(statistics.requests_received(RequestKind::FindNode), 0);

        assert!(statistics.to_string().contains(" STORE: 2"));
    }
}
