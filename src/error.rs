//! Main Crate Error

use std::net::SocketAddr;
use std::time::Duration;

use crate::common::{Kuid, RequestKind};

#[derive(thiserror::Error, Debug)]
/// Kadmium crate error enum.
pub enum DhtError {
    /// An unexpected fault while talking to a specific remote node.
    #[error("{request} to {} failed: {source}", describe(node_id, address))]
    Backend {
        node_id: Option<Kuid>,
        address: SocketAddr,
        request: RequestKind,
        #[source]
        source: std::io::Error,
    },

    /// The remote node did not answer in time, after all resends.
    #[error("{request} to {} timed out after {elapsed:?}", describe(node_id, address))]
    Timeout {
        node_id: Option<Kuid>,
        address: SocketAddr,
        request: RequestKind,
        elapsed: Duration,
    },

    /// A semantic protocol violation tied to a request we sent or received.
    #[error("{request} for {} rejected: {reason}", describe(node_id, address))]
    RequestBound {
        node_id: Option<Kuid>,
        address: SocketAddr,
        request: RequestKind,
        reason: ProtocolViolation,
    },

    /// A semantic protocol violation tied to a response we received.
    #[error("Response from {} rejected: {reason}", describe(node_id, address))]
    ResponseBound {
        node_id: Option<Kuid>,
        address: SocketAddr,
        reason: ProtocolViolation,
    },

    /// A network operation was attempted before the node finished bootstrapping.
    #[error("Cannot {0} before the node is bootstrapped")]
    NotBootstrapped(&'static str),

    /// Every candidate contact of an operation failed.
    #[error("{operation} failed: none of the {attempted} contacted nodes succeeded")]
    AllContactsFailed {
        operation: RequestKind,
        attempted: usize,
    },

    #[error(transparent)]
    /// Malformed or oversized value content.
    Value(#[from] ValueError),

    /// Indicates that an id is not 20 bytes.
    #[error("Invalid Id size, expected 20, got {0}")]
    InvalidIdSize(usize),

    /// Malformed local input, like an unparsable command or id.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The operation was dropped before it could complete.
    #[error("Operation was cancelled")]
    Cancelled,

    /// The node's actor thread is no longer running.
    #[error("Dht was shutdown")]
    Shutdown,

    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
/// Errors about value content.
pub enum ValueError {
    #[error("Value of {size} bytes exceeds the maximum of {max} bytes")]
    TooLarge { size: usize, max: usize },

    #[error("Malformed value: {0}")]
    Malformed(String),
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Reasons a single request or response is rejected.
pub enum ProtocolViolation {
    #[error("missing security token")]
    MissingSecurityToken,

    #[error("invalid security token")]
    InvalidSecurityToken,

    #[error("malformed lookup id")]
    MalformedLookupId,

    #[error("response does not match the request")]
    UnexpectedResponse,

    #[error("response came from an unexpected address")]
    AddressMismatch,

    #[error("request addressed to the local node")]
    SelfAddressed,

    #[error("address is not routable")]
    UnroutableAddress,
}

fn describe(node_id: &Option<Kuid>, address: &SocketAddr) -> String {
    match node_id {
        Some(id) => format!("{} ({})", id, address),
        None => address.to_string(),
    }
}

/// Alias for results with [DhtError].
pub type Result<T, E = DhtError> = std::result::Result<T, E>;
