use std::time::Duration;

use crate::common::{Kuid, RoutingSettings};
use crate::core::database::DatabaseSettings;
use crate::core::message_handler::MessageHandlerSettings;
use crate::core::server::ServerSettings;

/// Default request timeout before a non-responding node is given up on.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time budget of an iterative lookup.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of requests a lookup or store keeps in flight.
pub const DEFAULT_PARALLELISM: usize = 5;

#[derive(Debug, Clone)]
/// Dht Configurations
pub struct Config {
    /// This node's id.
    ///
    /// Defaults to None, where a random id is generated.
    pub node_id: Option<Kuid>,
    /// Announce this node as unreachable, so others never add it to their
    /// route tables.
    ///
    /// Defaults to false
    pub firewalled: bool,
    /// Treat loopback and site-local addresses as private, so contacts using
    /// them are never routed to.
    ///
    /// Defaults to true, test networks turn it off.
    pub local_is_private: bool,
    /// Request timeout duration.
    ///
    /// Alive contacts with a known round trip time use a shorter, adaptive
    /// timeout capped at this value.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// How many times a request is re-sent before its timeout is reported.
    ///
    /// Defaults to 1
    pub max_errors: usize,
    /// Defaults to [DEFAULT_PARALLELISM]
    pub find_node_parallelism: usize,
    /// Defaults to [DEFAULT_PARALLELISM]
    pub find_value_parallelism: usize,
    /// Defaults to [DEFAULT_PARALLELISM]
    pub store_parallelism: usize,
    /// Defaults to [DEFAULT_LOOKUP_TIMEOUT]
    pub find_node_lookup_timeout: Duration,
    /// Defaults to [DEFAULT_LOOKUP_TIMEOUT]
    pub find_value_lookup_timeout: Duration,
    /// Route table contacts failing during bootstrap before the table is
    /// considered stale and the bootstrap retried once.
    ///
    /// Defaults to 40
    pub max_bootstrap_failures: usize,
    /// Share of alive contacts needed after bootstrapping to count as bootstrapped.
    ///
    /// Defaults to 0.5
    pub is_bootstrapped_ratio: f32,
    /// How many expired request ids are remembered to recognize late responses.
    ///
    /// Defaults to 512
    pub late_response_cache_size: usize,
    /// Interval of routing table maintenance.
    ///
    /// Defaults to 60 seconds
    pub maintenance_interval: Duration,
    /// Route table tunables, including `k`.
    pub routing: RoutingSettings,
    /// Database limits.
    pub database: DatabaseSettings,
    /// Store-forward behaviour.
    pub message_handler: MessageHandlerSettings,
    /// Request handling.
    pub server_settings: ServerSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: None,
            firewalled: false,
            local_is_private: true,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_errors: 1,
            find_node_parallelism: DEFAULT_PARALLELISM,
            find_value_parallelism: DEFAULT_PARALLELISM,
            store_parallelism: DEFAULT_PARALLELISM,
            find_node_lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            find_value_lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            max_bootstrap_failures: 40,
            is_bootstrapped_ratio: 0.5,
            late_response_cache_size: 512,
            maintenance_interval: Duration::from_secs(60),
            routing: RoutingSettings::default(),
            database: DatabaseSettings::default(),
            message_handler: MessageHandlerSettings::default(),
            server_settings: ServerSettings::default(),
        }
    }
}

impl Config {
    /// The replication parameter.
    pub fn k(&self) -> usize {
        self.routing.k
    }
}
