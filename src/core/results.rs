//! Outcomes of outbound operations, built once when the operation completes.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;
use std::time::Duration;

use crate::common::{Contact, DhtValueEntity, EntityKey, Kuid, SecurityToken};

#[derive(Debug, Clone)]
pub struct PingResult {
    contact: Contact,
    external_address: SocketAddr,
    rtt: Duration,
}

impl PingResult {
    pub(crate) fn new(contact: Contact, external_address: SocketAddr, rtt: Duration) -> Self {
        PingResult {
            contact,
            external_address,
            rtt,
        }
    }

    /// The contact that answered.
    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    /// Our address as seen by the contact.
    pub fn external_address(&self) -> SocketAddr {
        self.external_address
    }

    pub fn rtt(&self) -> Duration {
        self.rtt
    }
}

impl Display for PingResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} answered in {:?}, sees us at {}",
            self.contact, self.rtt, self.external_address
        )
    }
}

#[derive(Debug, Clone)]
/// Outcome of an iterative FIND_NODE lookup.
pub struct FindNodeResult {
    lookup_id: Kuid,
    path: Vec<Contact>,
    tokens: HashMap<Kuid, SecurityToken>,
    collisions: Vec<Contact>,
    queried: HashSet<Kuid>,
    route_table_failure_count: usize,
    elapsed: Duration,
    hops: usize,
}

impl FindNodeResult {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        lookup_id: Kuid,
        path: Vec<Contact>,
        tokens: HashMap<Kuid, SecurityToken>,
        collisions: Vec<Contact>,
        queried: HashSet<Kuid>,
        route_table_failure_count: usize,
        elapsed: Duration,
        hops: usize,
    ) -> Self {
        FindNodeResult {
            lookup_id,
            path,
            tokens,
            collisions,
            queried,
            route_table_failure_count,
            elapsed,
            hops,
        }
    }

    pub fn lookup_id(&self) -> &Kuid {
        &self.lookup_id
    }

    /// Contacts that answered, nearest to the lookup id first.
    pub fn path(&self) -> &[Contact] {
        &self.path
    }

    /// Security token a contact of the [Self::path] issued to us.
    pub fn token(&self, id: &Kuid) -> Option<&SecurityToken> {
        self.tokens.get(id)
    }

    /// Contacts found with our own id.
    pub fn collisions(&self) -> &[Contact] {
        &self.collisions
    }

    /// Every id a request was sent to.
    pub fn queried(&self) -> &HashSet<Kuid> {
        &self.queried
    }

    /// How many contacts taken from our own route table didn't answer.
    pub fn route_table_failure_count(&self) -> usize {
        self.route_table_failure_count
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Hops from us to the nearest contact found.
    pub fn hops(&self) -> usize {
        self.hops
    }
}

impl Display for FindNodeResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {} contacts in {:?}, {} hops, {} queried, {} route table failures",
            self.lookup_id,
            self.path.len(),
            self.elapsed,
            self.hops,
            self.queried.len(),
            self.route_table_failure_count
        )?;

        for contact in &self.path {
            writeln!(f, " {}", contact)?;
        }

        for contact in &self.collisions {
            writeln!(f, " collision: {}", contact)?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone)]
/// Outcome of an iterative FIND_VALUE lookup.
pub struct FindValueResult {
    lookup: EntityKey,
    entities: Vec<DhtValueEntity>,
    entity_keys: Vec<EntityKey>,
    path: Vec<Contact>,
    elapsed: Duration,
    hops: usize,
}

impl FindValueResult {
    pub(crate) fn new(
        lookup: EntityKey,
        entities: Vec<DhtValueEntity>,
        entity_keys: Vec<EntityKey>,
        path: Vec<Contact>,
        elapsed: Duration,
        hops: usize,
    ) -> Self {
        FindValueResult {
            lookup,
            entities,
            entity_keys,
            path,
            elapsed,
            hops,
        }
    }

    pub fn lookup(&self) -> &EntityKey {
        &self.lookup
    }

    pub fn entities(&self) -> &[DhtValueEntity] {
        &self.entities
    }

    /// Keys a holder announced but never sent the entity for.
    pub fn entity_keys(&self) -> &[EntityKey] {
        &self.entity_keys
    }

    /// Contacts queried on the way to the holder, the holder last.
    pub fn path(&self) -> &[Contact] {
        &self.path
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn hops(&self) -> usize {
        self.hops
    }

    pub fn is_found(&self) -> bool {
        !self.entities.is_empty()
    }
}

impl Display for FindValueResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {} values in {:?}, {} hops",
            self.lookup,
            self.entities.len(),
            self.elapsed,
            self.hops
        )?;

        for entity in &self.entities {
            writeln!(f, " {}", entity)?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct StoreResult {
    entities: Vec<DhtValueEntity>,
    locations: Vec<Contact>,
    failed: Vec<Contact>,
}

impl StoreResult {
    pub(crate) fn new(
        entities: Vec<DhtValueEntity>,
        locations: Vec<Contact>,
        failed: Vec<Contact>,
    ) -> Self {
        StoreResult {
            entities,
            locations,
            failed,
        }
    }

    pub fn entities(&self) -> &[DhtValueEntity] {
        &self.entities
    }

    /// Contacts that stored every entity.
    pub fn locations(&self) -> &[Contact] {
        &self.locations
    }

    /// Contacts that didn't answer, or refused at least one entity.
    pub fn failed(&self) -> &[Contact] {
        &self.failed
    }
}

impl Display for StoreResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} values stored at {} contacts, {} failed",
            self.entities.len(),
            self.locations.len(),
            self.failed.len()
        )?;

        for contact in &self.locations {
            writeln!(f, " {}", contact)?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapResultType {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct BootstrapResult {
    contact: Contact,
    elapsed: Duration,
    result_type: BootstrapResultType,
}

impl BootstrapResult {
    pub(crate) fn new(contact: Contact, elapsed: Duration, result_type: BootstrapResultType) -> Self {
        BootstrapResult {
            contact,
            elapsed,
            result_type,
        }
    }

    /// The contact we bootstrapped from.
    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn result_type(&self) -> BootstrapResultType {
        self.result_type
    }

    pub fn is_success(&self) -> bool {
        self.result_type == BootstrapResultType::Succeeded
    }
}

impl Display for BootstrapResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bootstrap from {} {:?} after {:?}",
            self.contact.address(),
            self.result_type,
            self.elapsed
        )
    }
}
