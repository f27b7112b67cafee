//! Decoded DHT protocol messages.
//!
//! Encoding these on a wire is left to the [Transport](crate::Transport);
//! the core only deals with these typed values.

use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;

use crate::common::{Contact, DhtValueEntity, Kuid, SecurityToken, ValueType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Correlates a response with the request it answers.
pub struct MessageId(pub u32);

impl Display for MessageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The protocol exchange a request or response belongs to.
pub enum RequestKind {
    Ping,
    FindNode,
    FindValue,
    Store,
    Stats,
}

impl Display for RequestKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestKind::Ping => "PING",
            RequestKind::FindNode => "FIND_NODE",
            RequestKind::FindValue => "FIND_VALUE",
            RequestKind::Store => "STORE",
            RequestKind::Stats => "STATS",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Which diagnostic dump a STATS request asks for.
pub enum StatsKind {
    Statistics,
    Database,
    RouteTable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatusCode {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outcome of storing one entity of a STORE request.
pub struct StoreStatus {
    pub primary_key: Kuid,
    pub secondary_key: Kuid,
    pub code: StoreStatusCode,
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Ping,
    FindNode {
        lookup_id: Kuid,
    },
    FindValue {
        lookup_id: Kuid,
        /// Empty to ask for whatever the responder holds.
        secondary_keys: Vec<Kuid>,
        value_type: ValueType,
    },
    Store {
        token: Option<SecurityToken>,
        entities: Vec<DhtValueEntity>,
    },
    Stats {
        kind: StatsKind,
        secure: bool,
    },
}

impl RequestBody {
    pub fn kind(&self) -> RequestKind {
        match self {
            RequestBody::Ping => RequestKind::Ping,
            RequestBody::FindNode { .. } => RequestKind::FindNode,
            RequestBody::FindValue { .. } => RequestKind::FindValue,
            RequestBody::Store { .. } => RequestKind::Store,
            RequestBody::Stats { .. } => RequestKind::Stats,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ResponseBody {
    Pong {
        /// The requester's address as seen by the responder.
        external_address: SocketAddr,
        token: Option<SecurityToken>,
    },
    FindNode {
        lookup_id: Kuid,
        token: Option<SecurityToken>,
        nodes: Vec<Contact>,
    },
    FindValue {
        lookup_id: Kuid,
        entities: Vec<DhtValueEntity>,
        /// Secondary keys available at the responder but not included.
        secondary_keys: Vec<Kuid>,
        request_load: f32,
    },
    Store {
        statuses: Vec<StoreStatus>,
    },
    Stats {
        kind: StatsKind,
        statistics: String,
    },
}

impl ResponseBody {
    /// The request kind this response answers.
    ///
    /// A FIND_VALUE request may be answered with a FIND_NODE response when the
    /// responder holds no value.
    pub fn kind(&self) -> RequestKind {
        match self {
            ResponseBody::Pong { .. } => RequestKind::Ping,
            ResponseBody::FindNode { .. } => RequestKind::FindNode,
            ResponseBody::FindValue { .. } => RequestKind::FindValue,
            ResponseBody::Store { .. } => RequestKind::Store,
            ResponseBody::Stats { .. } => RequestKind::Stats,
        }
    }

    /// Returns `true` if this is a valid answer to a `request` kind.
    pub fn answers(&self, request: RequestKind) -> bool {
        let kind = self.kind();
        kind == request || (request == RequestKind::FindValue && kind == RequestKind::FindNode)
    }

    pub fn security_token(&self) -> Option<&SecurityToken> {
        match self {
            ResponseBody::Pong { token, .. } => token.as_ref(),
            ResponseBody::FindNode { token, .. } => token.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum MessageBody {
    Request(RequestBody),
    Response(ResponseBody),
}

#[derive(Debug, Clone)]
/// A decoded message, with the sender's description of itself.
pub struct Message {
    pub id: MessageId,
    pub contact: Contact,
    pub body: MessageBody,
}

impl Message {
    pub fn request(id: MessageId, contact: Contact, request: RequestBody) -> Message {
        Message {
            id,
            contact,
            body: MessageBody::Request(request),
        }
    }

    /// Builds the response to a request, reusing its [MessageId].
    pub fn response_to(request_id: MessageId, contact: Contact, response: ResponseBody) -> Message {
        Message {
            id: request_id,
            contact,
            body: MessageBody::Response(response),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.body, MessageBody::Request(_))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn find_node_answers_find_value() {
        let response = ResponseBody::FindNode {
            lookup_id: Kuid::random(),
            token: None,
            nodes: vec![],
        };

        assert!(response.answers(RequestKind::FindNode));
        assert!(response.answers(RequestKind::FindValue));
        assert!(!response.answers(RequestKind::Store));
    }
}
