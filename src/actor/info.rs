use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;

use crate::common::Kuid;

use super::Actor;

/// Information and statistics about this node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Kuid,
    local_addr: SocketAddr,
    firewalled: bool,
    bootstrapped: bool,
    route_table_size: usize,
    keys: usize,
    values: usize,
    pending_requests: usize,
}

impl Info {
    /// This node's [Kuid], which changes if bootstrapping finds another node using it.
    pub fn id(&self) -> &Kuid {
        &self.id
    }

    /// Address of the transport this node is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns `true` if this node announces itself as unreachable.
    pub fn firewalled(&self) -> bool {
        self.firewalled
    }

    /// Returns `true` once a bootstrap succeeded.
    pub fn bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    /// Contacts in the route table, this node included.
    pub fn route_table_size(&self) -> usize {
        self.route_table_size
    }

    /// Primary keys in the database.
    pub fn keys(&self) -> usize {
        self.keys
    }

    /// Entities in the database.
    pub fn values(&self) -> usize {
        self.values
    }

    /// Requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.pending_requests
    }
}

impl From<&Actor> for Info {
    fn from(actor: &Actor) -> Self {
        Self {
            id: *actor.routing_table.local_id(),
            local_addr: actor.local_addr(),
            firewalled: actor.routing_table.local().is_firewalled(),
            bootstrapped: actor.bootstrapped,
            route_table_size: actor.routing_table.size(),
            keys: actor.database.key_count(),
            values: actor.database.value_count(),
            pending_requests: actor.dispatcher.pending(),
        }
    }
}

impl Display for Info {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "id: {}", self.id)?;
        writeln!(f, "address: {}", self.local_addr)?;
        writeln!(f, "firewalled: {}", self.firewalled)?;
        writeln!(f, "bootstrapped: {}", self.bootstrapped)?;
        writeln!(f, "contacts: {}", self.route_table_size)?;
        writeln!(f, "keys: {}, values: {}", self.keys, self.values)?;
        write!(f, "pending requests: {}", self.pending_requests)
    }
}
