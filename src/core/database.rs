//! Local store of the values this node is responsible for.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display, Formatter};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::common::{is_private_address, is_valid_address, DhtValueEntity, Kuid};

/// Default maximum number of entities (distinct publishers) per primary key.
pub const MAX_VALUES_PER_KEY: usize = 5;
/// Default maximum number of entities across all keys.
pub const MAX_DATABASE_SIZE: usize = 16384;
/// Default maximum size of a value in bytes.
pub const MAX_VALUE_SIZE: usize = 3072;

const CLASS_C_NETMASK: u32 = 0xFFFF_FF00;

#[derive(Debug, Clone)]
/// Capacity policy of the [Database].
pub struct DatabaseSettings {
    /// Defaults to [MAX_VALUES_PER_KEY]
    pub max_values_per_key: usize,
    /// Maximum number of entities stored, all keys together. Replacing an
    /// entity does not count against it.
    ///
    /// Defaults to [MAX_DATABASE_SIZE]
    pub max_database_size: usize,
    /// Maximum number of remote entities created by the same IP address,
    /// `None` for no limit.
    pub max_values_per_address: Option<usize>,
    /// Maximum number of remote entities created from the same class C network,
    /// `None` for no limit.
    pub max_values_per_network: Option<usize>,
    /// Defaults to [MAX_VALUE_SIZE]
    pub max_value_size: usize,
    /// Reject forwarded entities whose creator has an invalid or private address.
    pub validate_value_creator: bool,
    /// Weight of the latest inter-request rate in the request load average.
    pub request_load_smoothing_factor: f32,
    /// A key not requested for this long has its request load reset.
    pub request_load_nulling_delay: Duration,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            max_values_per_key: MAX_VALUES_PER_KEY,
            max_database_size: MAX_DATABASE_SIZE,
            max_values_per_address: Some(5),
            max_values_per_network: Some(50),
            max_value_size: MAX_VALUE_SIZE,
            validate_value_creator: true,
            request_load_smoothing_factor: 0.25,
            request_load_nulling_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct RequestLoad {
    load: f32,
    last_request: Option<Instant>,
}

impl RequestLoad {
    fn hit(&mut self, now: Instant, smoothing_factor: f32, nulling_delay: Duration) -> f32 {
        let last = self.last_request.replace(now);

        let Some(last) = last else {
            return self.load;
        };

        let delay = now.saturating_duration_since(last);

        if delay >= nulling_delay {
            self.load = 0.0;
            return self.load;
        }

        // Requests per second, bounded for hits within the same millisecond.
        let rate = 1.0 / delay.as_secs_f32().max(0.001);
        self.load = smoothing_factor * rate + (1.0 - smoothing_factor) * self.load;

        self.load
    }
}

#[derive(Debug, Clone, Default)]
struct EntityBag {
    entities: BTreeMap<Kuid, DhtValueEntity>,
    request_load: RequestLoad,
}

#[derive(Debug)]
/// Values keyed by primary key, then by secondary key (the creator's id).
///
/// Every mutation goes through [Database::store] and [Database::remove], which
/// keep the per address and per network counters in sync.
pub struct Database {
    settings: DatabaseSettings,
    local_is_private: bool,
    bags: HashMap<Kuid, EntityBag>,
    values_per_address: HashMap<u32, usize>,
    values_per_network: HashMap<u32, usize>,
}

impl Database {
    pub fn new(settings: DatabaseSettings, local_is_private: bool) -> Self {
        Database {
            settings,
            local_is_private,
            bags: HashMap::new(),
            values_per_address: HashMap::new(),
            values_per_network: HashMap::new(),
        }
    }

    // === Getters ===

    pub fn settings(&self) -> &DatabaseSettings {
        &self.settings
    }

    pub fn get(&self, primary_key: &Kuid) -> Option<&BTreeMap<Kuid, DhtValueEntity>> {
        self.bags.get(primary_key).map(|bag| &bag.entities)
    }

    pub fn get_entity(&self, primary_key: &Kuid, secondary_key: &Kuid) -> Option<&DhtValueEntity> {
        self.bags
            .get(primary_key)
            .and_then(|bag| bag.entities.get(secondary_key))
    }

    pub fn contains(&self, primary_key: &Kuid) -> bool {
        self.bags.contains_key(primary_key)
    }

    /// Snapshot of the primary keys, sorted.
    pub fn keys(&self) -> Vec<Kuid> {
        let mut keys: Vec<Kuid> = self.bags.keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn values(&self) -> impl Iterator<Item = &DhtValueEntity> {
        self.bags.values().flat_map(|bag| bag.entities.values())
    }

    pub fn key_count(&self) -> usize {
        self.bags.len()
    }

    pub fn value_count(&self) -> usize {
        self.bags.values().map(|bag| bag.entities.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bags.is_empty()
    }

    /// Number of remote entities created by the same IP address as `entity`'s creator.
    pub fn values_per_address(&self, entity: &DhtValueEntity) -> usize {
        count(&self.values_per_address, entity, u32::MAX)
    }

    /// Number of remote entities created from the same class C network as `entity`'s creator.
    pub fn values_per_network(&self, entity: &DhtValueEntity) -> usize {
        count(&self.values_per_network, entity, CLASS_C_NETMASK)
    }

    // === Public Methods ===

    /// Stores or replaces `entity` under its primary and secondary key.
    ///
    /// An empty value removes the entity, whether it was stored or not.
    /// Returns `false` without changing anything if the entity is rejected.
    pub fn store(&mut self, entity: DhtValueEntity) -> bool {
        if !self.allow_store(&entity) {
            return false;
        }

        if entity.value().is_empty() {
            let primary_key = *entity.primary_key();
            self.remove(&primary_key, entity.secondary_key());
            return true;
        }

        self.add(entity);
        true
    }

    /// Removes one entity, and the primary key with its last entity.
    pub fn remove(&mut self, primary_key: &Kuid, secondary_key: &Kuid) -> Option<DhtValueEntity> {
        let bag = self.bags.get_mut(primary_key)?;
        let entity = bag.entities.remove(secondary_key)?;

        if bag.entities.is_empty() {
            self.bags.remove(primary_key);
        }

        self.decrement(&entity);

        Some(entity)
    }

    /// Removes every entity under `primary_key`.
    pub fn remove_all(&mut self, primary_key: &Kuid) -> Vec<DhtValueEntity> {
        let Some(bag) = self.bags.remove(primary_key) else {
            return Vec::new();
        };

        let entities: Vec<DhtValueEntity> = bag.entities.into_values().collect();
        for entity in &entities {
            self.decrement(entity);
        }

        entities
    }

    /// Decayed rate of FIND_VALUE requests for `primary_key`, recording one
    /// more request if `record_hit`.
    pub fn request_load(&mut self, primary_key: &Kuid, record_hit: bool) -> f32 {
        self.request_load_at(Instant::now(), primary_key, record_hit)
    }

    pub(crate) fn request_load_at(
        &mut self,
        now: Instant,
        primary_key: &Kuid,
        record_hit: bool,
    ) -> f32 {
        let smoothing_factor = self.settings.request_load_smoothing_factor;
        let nulling_delay = self.settings.request_load_nulling_delay;

        match self.bags.get_mut(primary_key) {
            Some(bag) if record_hit => bag.request_load.hit(now, smoothing_factor, nulling_delay),
            Some(bag) => bag.request_load.load,
            None => 0.0,
        }
    }

    pub fn clear(&mut self) {
        self.bags.clear();
        self.values_per_address.clear();
        self.values_per_network.clear();
    }

    // === Private Methods ===

    fn allow_store(&self, entity: &DhtValueEntity) -> bool {
        if entity.is_local() {
            return true;
        }

        if let Err(error) = entity.value().validate(self.settings.max_value_size) {
            debug!(?error, key = ?entity.primary_key(), "Rejecting invalid value");
            return false;
        }

        if self.settings.validate_value_creator && !entity.is_direct() {
            let address = entity.creator().address();

            if !is_valid_address(&address) || is_private_address(&address, self.local_is_private)
            {
                debug!(?address, "Rejecting value with an unroutable creator");
                return false;
            }
        }

        if !entity.value().is_empty() {
            if let Some(max) = self.settings.max_values_per_address {
                if self.values_per_address(entity) >= max {
                    debug!(creator = ?entity.creator().address(), "Too many values per address");
                    return false;
                }
            }
            if let Some(max) = self.settings.max_values_per_network {
                if self.values_per_network(entity) >= max {
                    debug!(creator = ?entity.creator().address(), "Too many values per network");
                    return false;
                }
            }
        }

        let existing = self
            .bags
            .get(entity.primary_key())
            .and_then(|bag| bag.entities.get(entity.secondary_key()));
        if let Some(existing) = existing {
            return allow_replace(existing, entity);
        }

        if !entity.value().is_empty() && self.value_count() >= self.settings.max_database_size {
            debug!(key = ?entity.primary_key(), "Database is full");
            return false;
        }

        self.bags
            .get(entity.primary_key())
            .map_or(true, |bag| bag.entities.len() < self.settings.max_values_per_key)
    }

    fn add(&mut self, entity: DhtValueEntity) {
        let primary_key = *entity.primary_key();
        let secondary_key = *entity.secondary_key();

        self.increment(&entity);

        let bag = self.bags.entry(primary_key).or_default();
        if let Some(replaced) = bag.entities.insert(secondary_key, entity) {
            self.decrement(&replaced);
        }
    }

    fn increment(&mut self, entity: &DhtValueEntity) {
        if let Some(ip) = remote_ipv4(entity) {
            *self.values_per_address.entry(ip).or_default() += 1;
            *self.values_per_network.entry(ip & CLASS_C_NETMASK).or_default() += 1;
        }
    }

    fn decrement(&mut self, entity: &DhtValueEntity) {
        if let Some(ip) = remote_ipv4(entity) {
            decrement(&mut self.values_per_address, ip);
            decrement(&mut self.values_per_network, ip & CLASS_C_NETMASK);
        }
    }
}

/// Rules for an entity replacing the `existing` one from the same creator.
fn allow_replace(existing: &DhtValueEntity, entity: &DhtValueEntity) -> bool {
    if existing.is_local() && !entity.is_local() {
        return false;
    }

    if existing.is_direct() && !entity.is_direct() {
        return false;
    }

    // Only the creator itself can remove its value.
    if !entity.is_direct() && entity.value().is_empty() {
        return false;
    }

    existing.creator().address().ip() == entity.creator().address().ip()
}

fn remote_ipv4(entity: &DhtValueEntity) -> Option<u32> {
    if entity.is_local() {
        return None;
    }

    match entity.creator().address().ip() {
        IpAddr::V4(ip) => Some(u32::from(ip)),
        IpAddr::V6(_) => None,
    }
}

fn count(map: &HashMap<u32, usize>, entity: &DhtValueEntity, netmask: u32) -> usize {
    remote_ipv4(entity)
        .and_then(|ip| map.get(&(ip & netmask)))
        .copied()
        .unwrap_or(0)
}

fn decrement(map: &mut HashMap<u32, usize>, key: u32) {
    if let Some(count) = map.get_mut(&key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            map.remove(&key);
        }
    }
}

impl Display for Database {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for key in self.keys() {
            if let Some(entities) = self.get(&key) {
                writeln!(f, "{} ({} values)", key, entities.len())?;
                for entity in entities.values() {
                    writeln!(f, " {}", entity)?;
                }
            }
        }

        write!(f, "TOTAL: {}/{}", self.key_count(), self.value_count())
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use super::*;
    use crate::common::{Contact, DhtValue, ValueType, Version};

    fn database() -> Database {
        Database::new(DatabaseSettings::default(), true)
    }

    fn text(value: &str) -> DhtValue {
        DhtValue::new(ValueType::TEXT, Version::new(0, 1), value.as_bytes().to_vec())
    }

    fn creator(ip: [u8; 4]) -> Contact {
        Contact::live(Kuid::random(), SocketAddr::from((ip, 6881)), 0)
    }

    fn direct(creator: &Contact, key: Kuid, value: DhtValue) -> DhtValueEntity {
        DhtValueEntity::remote(creator.clone(), creator.clone(), key, value)
    }

    #[test]
    fn store_then_get() {
        let mut db = database();
        let key = Kuid::random();
        let creator = creator([21, 75, 31, 124]);

        assert!(db.store(direct(&creator, key, text("hello"))));

        let stored = db.get_entity(&key, creator.id()).cloned();
        assert_eq!(stored.map(|e| e.value().clone()), Some(text("hello")));
        assert_eq!(db.key_count(), 1);
        assert_eq!(db.value_count(), 1);
    }

    #[test]
    fn later_store_replaces() {
        let mut db = database();
        let key = Kuid::random();
        let creator = creator([21, 75, 31, 124]);

        db.store(direct(&creator, key, text("first")));
        db.store(direct(&creator, key, text("second")));

        assert_eq!(db.value_count(), 1);
        assert_eq!(
            db.get_entity(&key, creator.id()).map(|e| e.value().clone()),
            Some(text("second"))
        );
        assert_eq!(db.values_per_address(&direct(&creator, key, text("x"))), 1);
    }

    #[test]
    fn remove_last_entity_removes_key() {
        let mut db = database();
        let key = Kuid::random();
        let alice = creator([21, 75, 31, 124]);
        let bob = creator([31, 75, 31, 124]);

        db.store(direct(&alice, key, text("a")));
        db.store(direct(&bob, key, text("b")));

        assert!(db.remove(&key, alice.id()).is_some());
        assert!(db.get_entity(&key, alice.id()).is_none());
        assert!(db.contains(&key));

        assert!(db.remove(&key, bob.id()).is_some());
        assert!(db.get(&key).is_none());
        assert!(db.is_empty());
        assert_eq!(db.values_per_address(&direct(&bob, key, text("b"))), 0);
    }

    #[test]
    fn empty_value_removes() {
        let mut db = database();
        let key = Kuid::random();
        let creator = creator([21, 75, 31, 124]);

        db.store(direct(&creator, key, text("hello")));
        assert!(db.store(direct(&creator, key, DhtValue::empty())));

        assert!(!db.contains(&key));
    }

    #[test]
    fn max_values_per_key() {
        let mut db = database();
        let key = Kuid::random();

        for i in 0..MAX_VALUES_PER_KEY {
            let creator = creator([21, 75, 31 + i as u8, 124]);
            assert!(db.store(direct(&creator, key, text("v"))));
        }

        let extra = creator([99, 75, 31, 124]);
        assert!(!db.store(direct(&extra, key, text("v"))));
        assert_eq!(db.value_count(), MAX_VALUES_PER_KEY);
    }

    #[test]
    fn max_values_per_address() {
        let mut db = database();
        let creator = creator([21, 75, 31, 124]);

        for _ in 0..5 {
            assert!(db.store(direct(&creator, Kuid::random(), text("v"))));
        }

        assert!(!db.store(direct(&creator, Kuid::random(), text("v"))));
    }

    #[test]
    fn local_values_are_unlimited() {
        let mut db = database();
        let local = creator([127, 0, 0, 1]);

        for _ in 0..10 {
            let entity = DhtValueEntity::local(local.clone(), Kuid::random(), text("v"));
            assert!(db.store(entity));
        }

        assert_eq!(db.key_count(), 10);
    }

    #[test]
    fn forwarded_value_needs_public_creator() {
        let mut db = database();
        let sender = creator([21, 75, 31, 124]);
        let private_creator = creator([192, 168, 1, 2]);

        let entity =
            DhtValueEntity::remote(private_creator, sender.clone(), Kuid::random(), text("v"));
        assert!(!db.store(entity));

        let public_creator = creator([31, 75, 31, 124]);
        let entity = DhtValueEntity::remote(public_creator, sender, Kuid::random(), text("v"));
        assert!(db.store(entity));
    }

    #[test]
    fn forwarded_value_does_not_replace_direct() {
        let mut db = database();
        let key = Kuid::random();
        let creator = creator([21, 75, 31, 124]);

        db.store(direct(&creator, key, text("direct")));

        let forwarded =
            DhtValueEntity::remote(creator.clone(), self::creator([31, 1, 1, 1]), key, text("x"));
        assert!(!db.store(forwarded));

        assert_eq!(
            db.get_entity(&key, creator.id()).map(|e| e.value().clone()),
            Some(text("direct"))
        );
    }

    #[test]
    fn oversized_value_is_rejected() {
        let mut db = database();
        let creator = creator([21, 75, 31, 124]);
        let value = DhtValue::new(ValueType::BINARY, Version::default(), vec![0; MAX_VALUE_SIZE + 1]);

        assert!(!db.store(direct(&creator, Kuid::random(), value)));
    }

    #[test]
    fn request_load() {
        let mut db = database();
        let key = Kuid::random();
        let creator = creator([21, 75, 31, 124]);
        db.store(direct(&creator, key, text("v")));

        let start = Instant::now();
        assert_eq!(db.request_load_at(start, &key, true), 0.0);

        // One request per second.
        let load = db.request_load_at(start + Duration::from_secs(1), &key, true);
        assert!((load - 0.25).abs() < f32::EPSILON);

        let load = db.request_load_at(start + Duration::from_secs(2), &key, true);
        assert!((load - (0.25 + 0.75 * 0.25)).abs() < 1e-6);

        // Reading doesn't record a hit.
        assert_eq!(db.request_load_at(start + Duration::from_secs(3), &key, false), load);

        // Idle for longer than the nulling delay.
        let load = db.request_load_at(start + Duration::from_secs(120), &key, true);
        assert_eq!(load, 0.0);

        assert_eq!(db.request_load(&Kuid::random(), true), 0.0);
    }

    #[test]
    fn display_ends_with_totals() {
        let mut db = database();
        let creator = creator([21, 75, 31, 124]);
        db.store(direct(&creator, Kuid::random(), text("v")));

        assert!(db.to_string().ends_with("TOTAL: 1/1"));
    }

    #[test]
    fn size_limit_counts_entities() {
        let mut db = Database::new(
            DatabaseSettings {
                max_database_size: 3,
                ..DatabaseSettings::default()
            },
            true,
        );
        let key = Kuid::random();
        let first = creator([21, 75, 31, 1]);

        assert!(db.store(direct(&first, key, text("a"))));
        assert!(db.store(direct(&creator([21, 75, 32, 2]), key, text("b"))));
        assert!(db.store(direct(&creator([21, 75, 33, 3]), Kuid::random(), text("c"))));
        assert_eq!(db.key_count(), 2);
        assert_eq!(db.value_count(), 3);

        // Full, whether the key is new or not.
        assert!(!db.store(direct(&creator([21, 75, 34, 4]), key, text("d"))));
        assert!(!db.store(direct(&creator([21, 75, 35, 5]), Kuid::random(), text("e"))));

        // Replacing an entity is still allowed.
        assert!(db.store(direct(&first, key, text("a2"))));
        assert_eq!(db.value_count(), 3);

        assert!(db.store(direct(&first, key, DhtValue::empty())));
        assert_eq!(db.value_count(), 2);
    }
}
