//! Answers inbound requests from the route table and the database.

mod find_node;
mod find_value;
mod ping;
mod stats;
mod store;

use std::fmt::Debug;
use std::sync::Arc;

use tracing::trace;

use crate::common::{
    Contact, DefaultTokenProvider, RequestBody, ResponseBody, RouteTable, SecurityToken,
    TokenProvider,
};
use crate::core::database::Database;
use crate::core::statistics::Statistics;

/// A trait for filtering incoming requests to a DHT node and
/// decide whether to allow handling it, or drop it silently.
pub trait RequestFilter: Send + Sync + Debug {
    /// Returns true if the request from this contact is allowed.
    fn allow_request(&self, request: &RequestBody, from: &Contact) -> bool;
}

#[derive(Debug, Clone)]
struct DefaultFilter;

impl RequestFilter for DefaultFilter {
    fn allow_request(&self, _request: &RequestBody, _from: &Contact) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
/// Settings for the request handlers.
pub struct ServerSettings {
    /// Filter requests before handling them.
    ///
    /// Defaults to a filter that allows everything.
    pub filter: Arc<dyn RequestFilter>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            filter: Arc::new(DefaultFilter),
        }
    }
}

/// State the request handlers read, and the database they write to.
pub struct RequestContext<'a> {
    pub routing_table: &'a RouteTable,
    pub database: &'a mut Database,
    pub statistics: &'a mut Statistics,
}

#[derive(Debug)]
/// Handles FIND_NODE, FIND_VALUE, STORE, PING and STATS requests.
///
/// Handlers never fail: malformed or unauthorized requests are logged and
/// answered with nothing.
pub struct Server {
    tokens: Box<dyn TokenProvider>,
    filter: Arc<dyn RequestFilter>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ServerSettings::default())
    }
}

impl Server {
    /// Creates a new [Server] with the [DefaultTokenProvider].
    pub fn new(settings: ServerSettings) -> Self {
        Self::with_token_provider(settings, Box::new(DefaultTokenProvider::new()))
    }

    pub fn with_token_provider(settings: ServerSettings, tokens: Box<dyn TokenProvider>) -> Self {
        Server {
            tokens,
            filter: settings.filter,
        }
    }

    // === Public Methods ===

    /// Token the requester at `from` has to present to store values here.
    pub fn issue_token(&mut self, from: &Contact) -> SecurityToken {
        self.tokens.issue_token(from.address())
    }

    pub fn validate_token(&self, token: &SecurityToken, from: &Contact) -> bool {
        self.tokens.validate(token, from.address())
    }

    /// Rotates token secrets if due.
    pub fn maintain(&mut self) {
        self.tokens.maintain()
    }

    /// Returns the response to send back to `from`, if any.
    pub fn handle_request(
        &mut self,
        context: RequestContext<'_>,
        from: &Contact,
        request: &RequestBody,
    ) -> Option<ResponseBody> {
        if !self.filter.allow_request(request, from) {
            trace!(?from, request = %request.kind(), "Request filtered");
            return None;
        }

        context.statistics.request_received(request.kind());

        match request {
            RequestBody::Ping => Some(ping::handle(self, from)),
            RequestBody::FindNode { lookup_id } => {
                Some(find_node::handle(self, context.routing_table, from, lookup_id))
            }
            RequestBody::FindValue {
                lookup_id,
                secondary_keys,
                value_type,
            } => Some(find_value::handle(
                self,
                context,
                from,
                lookup_id,
                secondary_keys,
                *value_type,
            )),
            RequestBody::Store { token, entities } => {
                store::handle(self, context, from, token.as_ref(), entities)
            }
            RequestBody::Stats { kind, secure } => stats::handle(context, *kind, *secure),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::net::SocketAddr;

    use super::*;
    use crate::common::{Kuid, RoutingSettings};
    use crate::core::database::DatabaseSettings;

    /// A server with its own route table and database.
    pub struct Fixture {
        pub routing_table: RouteTable,
        pub database: Database,
        pub statistics: Statistics,
        pub server: Server,
    }

    impl Fixture {
        pub fn new() -> Self {
            Self::with_local(Contact::live(
                Kuid::random(),
                SocketAddr::from(([21, 0, 0, 1], 6881)),
                0,
            ))
        }

        pub fn with_local(local: Contact) -> Self {
            Fixture {
                routing_table: RouteTable::new(local, RoutingSettings::default()),
                database: Database::new(DatabaseSettings::default(), true),
                statistics: Statistics::new(),
                server: Server::default(),
            }
        }

        pub fn handle(&mut self, from: &Contact, request: RequestBody) -> Option<ResponseBody> {
            let context = RequestContext {
                routing_table: &self.routing_table,
                database: &mut self.database,
                statistics: &mut self.statistics,
            };

            self.server.handle_request(context, from, &request)
        }
    }
}

#[cfg(test)]
mod test {
    use super::test_util::Fixture;
    use super::*;
    use crate::common::RequestKind;

    #[derive(Debug)]
    struct DenyAll;

    impl RequestFilter for DenyAll {
        fn allow_request(&self, _request: &RequestBody, _from: &Contact) -> bool {
            false
        }
    }

    #[test]
    fn filtered_requests_are_dropped() {
        let mut fixture = Fixture::new();
        fixture.server = Server::new(ServerSettings {
            filter: Arc::new(DenyAll),
        });

        assert!(fixture.handle(&Contact::random(), RequestBody::Ping).is_none());
        assert_eq!(fixture.statistics.requests_received(RequestKind::Ping), 0);
    }

    #[test]
    fn requests_are_counted() {
        let mut fixture = Fixture::new();

        fixture.handle(&Contact::random(), RequestBody::Ping);

        assert_eq!(fixture.statistics.requests_received(RequestKind::Ping), 1);
    }
}
