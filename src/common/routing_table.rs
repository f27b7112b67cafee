//! Kademlia routing table of k-buckets, split along the local node's id.

use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::bucket::same_class_c;
use crate::common::{most_recently_seen_first, Bucket, Contact, Kuid, KUID_BITS};

/// K = the default maximum size of a k-bucket.
pub const DEFAULT_K: usize = 20;
/// Default maximum size of a bucket's replacement cache.
pub const DEFAULT_MAX_CACHE_SIZE: usize = 16;

#[derive(Debug, Clone)]
/// Tunables of a [RouteTable].
pub struct RoutingSettings {
    /// Maximum number of contacts per bucket, and the size of lookup results.
    pub k: usize,
    /// Failures after which a contact that was alive before is considered dead.
    pub max_alive_node_failures: usize,
    /// Failures after which a contact that never answered is considered dead.
    pub max_unknown_node_failures: usize,
    /// Failures after which a dead contact is evicted altogether.
    pub max_accept_node_failures: usize,
    /// Once this many failures happen without a successful add in between,
    /// further failures are ignored as our own connectivity is likely lost.
    pub max_consecutive_failures: usize,
    /// A contact seen alive within this window is not challenged by a
    /// newcomer claiming the same id.
    pub min_reconnection_time: Duration,
    /// Buckets untouched for this long are due for a refresh lookup.
    pub bucket_refresh_period: Duration,
    /// Minimum interval between two least-recently-seen pings of a full bucket.
    pub bucket_ping_limit: Duration,
    /// Maximum number of contacts kept aside per bucket, to replace the ones
    /// that die.
    ///
    /// Defaults to [DEFAULT_MAX_CACHE_SIZE]
    pub max_cache_size: usize,
    /// Maximum number of contacts of one bucket sharing a class C (/24)
    /// network, `None` for no limit. Contacts over the limit go to the
    /// replacement cache.
    ///
    /// Defaults to `None`
    pub max_contacts_per_class_c: Option<usize>,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        RoutingSettings {
            k: DEFAULT_K,
            max_alive_node_failures: 4,
            max_unknown_node_failures: 2,
            max_accept_node_failures: 20,
            max_consecutive_failures: 100,
            min_reconnection_time: Duration::from_secs(30),
            bucket_refresh_period: Duration::from_secs(30 * 60),
            bucket_ping_limit: Duration::from_secs(30),
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            max_contacts_per_class_c: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// What [RouteTable::add] did with a contact, and what the caller should follow up with.
pub enum AddOutcome {
    /// New contact in a bucket with room.
    Added,
    /// Refreshed an existing entry.
    Updated,
    /// Evicted the given least recently seen contact to make room.
    Replaced(Contact),
    /// The contact went to its bucket's replacement cache. The given least
    /// recently seen contact should be pinged so it can be replaced if it is gone.
    Cached { ping: Option<Contact> },
    /// The bucket and its replacement cache are full. The given least
    /// recently seen contact should be pinged, as for [AddOutcome::Cached].
    Dropped { ping: Option<Contact> },
    /// A contact claims the id of the given, not recently seen, existing one.
    /// Ping the existing contact and [RouteTable::replace] it on timeout.
    SpoofCheck { existing: Contact, candidate: Contact },
    /// Nothing changed.
    Ignored,
    /// Local id or firewalled contact.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Filter applied by [RouteTable::select].
pub enum SelectMode {
    /// Every contact, dead ones and the local node included.
    All,
    /// Alive remote contacts only.
    Alive,
    /// Alive remote contacts and the local node.
    AliveWithLocal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeMode {
    /// Removes dead contacts.
    DropDead,
    /// Forgets the liveness of every remote contact.
    StateToUnknown,
    /// Merges emptied buckets back into the local bucket.
    MergeBuckets,
}

#[derive(Debug, Clone)]
/// Kademlia routing table.
///
/// The local node lives in the table, in the last bucket. That bucket covers
/// every id sharing at least `depth` leading bits with the local id and is the
/// only one that splits; every other bucket `i` covers the ids sharing exactly
/// `i` leading bits with the local id.
pub struct RouteTable {
    local_id: Kuid,
    local: Contact,
    buckets: Vec<Bucket>,
    settings: RoutingSettings,
    consecutive_failures: usize,
}

impl RouteTable {
    /// Create a new [RouteTable] holding only the `local` contact.
    pub fn new(local: Contact, settings: RoutingSettings) -> Self {
        let local_id = *local.id();
        let mut bucket = Bucket::new(local_id, 0, true, settings.k);
        bucket.push(local.clone());

        RouteTable {
            local_id,
            local,
            buckets: vec![bucket],
            settings,
            consecutive_failures: 0,
        }
    }

    // === Getters ===

    /// Returns the [Kuid] of this node, where the distance is measured from.
    pub fn local_id(&self) -> &Kuid {
        &self.local_id
    }

    pub fn local(&self) -> &Contact {
        &self.local
    }

    pub fn settings(&self) -> &RoutingSettings {
        &self.settings
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn get(&self, id: &Kuid) -> Option<&Contact> {
        self.buckets[self.bucket_index(id)].get(id)
    }

    pub fn contains(&self, id: &Kuid) -> bool {
        self.get(id).is_some()
    }

    /// A contact of the replacement caches, see [RoutingSettings::max_cache_size].
    pub fn get_cached(&self, id: &Kuid) -> Option<&Contact> {
        self.buckets[self.bucket_index(id)].get_cached(id)
    }

    /// Iterates over the replacement caches of every bucket.
    pub fn cached_contacts(&self) -> impl Iterator<Item = &Contact> {
        self.buckets.iter().flat_map(|b| b.cached())
    }

    /// Number of contacts, the local node included. Cached contacts don't count.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    /// Returns `true` if the table holds no remote contact.
    pub fn is_empty(&self) -> bool {
        self.size() <= 1
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures
    }

    /// Iterates over every remote contact.
    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        let local_id = self.local_id;
        self.buckets
            .iter()
            .flat_map(|b| b.iter())
            .filter(move |c| *c.id() != local_id)
    }

    /// Remote contacts, most recently seen first.
    pub fn get_contacts(&self) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = self.contacts().cloned().collect();
        contacts.sort_by(most_recently_seen_first);
        contacts
    }

    /// Share of remote contacts known to be alive, `0.0` for an empty table.
    pub fn alive_ratio(&self) -> f32 {
        let (alive, total) = self
            .contacts()
            .fold((0, 0), |(alive, total), c| (alive + c.is_alive() as usize, total + 1));

        if total == 0 {
            0.0
        } else {
            alive as f32 / total as f32
        }
    }

    // === Public Methods ===

    /// Adds or refreshes a contact.
    ///
    /// Splits the local bucket when it is full, otherwise a full bucket only
    /// makes room by evicting a least recently seen contact that isn't alive,
    /// and keeps the newcomer in its replacement cache.
    pub fn add(&mut self, contact: Contact) -> AddOutcome {
        if contact.id() == &self.local_id {
            if contact.address() != self.local().address() {
                debug!(?contact, "Contact claims our id");
            }
            return AddOutcome::Rejected;
        }

        if contact.is_firewalled() {
            trace!(?contact, "Ignoring firewalled contact");
            return AddOutcome::Rejected;
        }

        self.consecutive_failures = 0;

        loop {
            let index = self.bucket_index(contact.id());

            if let Some(position) = self.buckets[index].position(contact.id()) {
                return self.update(index, position, contact);
            }

            if self.buckets[index].get_cached(contact.id()).is_some() {
                return self.update_cached(index, contact);
            }

            let okay = self.is_okay_to_add(index, &contact, None);
            let bucket = &mut self.buckets[index];
            let splittable = bucket.is_local() && bucket.depth() < KUID_BITS;

            if bucket.len() < self.settings.k {
                if okay {
                    bucket.touch(Instant::now());
                    bucket.push(contact);
                    return AddOutcome::Added;
                }

                trace!(?contact, "Too many contacts from the same network");
                if splittable {
                    return AddOutcome::Ignored;
                }
                return self.add_cached(index, contact);
            }

            if splittable {
                self.split();
                continue;
            }

            return self.replace_least_recently_seen(index, contact, okay);
        }
    }

    /// Unconditionally replaces the entry with the same id as `contact`,
    /// after a spoof check timed out.
    pub fn replace(&mut self, contact: Contact) -> bool {
        let index = self.bucket_index(contact.id());
        let bucket = &mut self.buckets[index];

        match bucket.position(contact.id()) {
            Some(position) if contact.id() != &self.local_id => {
                bucket.update(position, contact);
                bucket.touch(Instant::now());
                true
            }
            _ => false,
        }
    }

    /// Records a failed request to `id` at `address`.
    ///
    /// Failures of the local node, of unknown contacts, or of a contact that
    /// moved to another address are ignored.
    pub fn handle_failure(&mut self, id: &Kuid, address: SocketAddr) {
        if id == &self.local_id {
            return;
        }

        if self.consecutive_failures >= self.settings.max_consecutive_failures {
            debug!(
                consecutive_failures = self.consecutive_failures,
                "Ignoring failure, we might be disconnected"
            );
            return;
        }

        let index = self.bucket_index(id);

        if !self.buckets[index].contains(id) {
            self.handle_cached_failure(index, id, address);
            return;
        }

        let bucket = &mut self.buckets[index];
        let Some(contact) = bucket.get_mut(id) else {
            return;
        };

        if contact.address() != address {
            return;
        }

        self.consecutive_failures += 1;

        contact.handle_failure(
            self.settings.max_alive_node_failures,
            self.settings.max_unknown_node_failures,
        );

        if !contact.is_dead() {
            return;
        }

        let dead = contact.clone();

        // Replace the dead contact with the most recently seen cached one
        // that fits.
        while let Some(replacement) = self.buckets[index].take_most_recently_seen_cached() {
            if self.is_okay_to_add(index, &replacement, Some(&dead)) {
                trace!(?id, ?replacement, "Replacing dead contact with a cached one");

                let bucket = &mut self.buckets[index];
                bucket.remove(id);
                bucket.push(replacement);
                return;
            }
        }

        if dead.failures() >= self.settings.max_accept_node_failures {
            trace!(?id, "Evicting dead contact");
            self.buckets[index].remove(id);
        }
    }

    /// Marks the contact `id` as alive without touching its bucket position.
    pub fn set_alive(&mut self, id: &Kuid) {
        if id == &self.local_id {
            return;
        }

        let index = self.bucket_index(id);
        if let Some(contact) = self.buckets[index].get_mut(id) {
            contact.alive();
        }
    }

    /// Removes a contact, or its replacement cache entry.
    pub fn remove(&mut self, id: &Kuid) -> Option<Contact> {
        if id == &self.local_id {
            return None;
        }

        let index = self.bucket_index(id);
        let bucket = &mut self.buckets[index];
        bucket.remove(id).or_else(|| bucket.remove_cached(id))
    }

    /// Up to `count` contacts ordered by ascending xor distance to `target`.
    ///
    /// Contacts that announced their shutdown are always skipped.
    pub fn select(&self, target: &Kuid, count: usize, mode: SelectMode) -> Vec<Contact> {
        let local_id = self.local_id;

        let mut selected: Vec<&Contact> = self
            .buckets
            .iter()
            .flat_map(|b| b.iter())
            .filter(|c| !c.is_shutdown())
            .filter(|c| match mode {
                SelectMode::All => true,
                SelectMode::Alive => c.is_alive() && *c.id() != local_id,
                SelectMode::AliveWithLocal => c.is_alive() || *c.id() == local_id,
            })
            .collect();

        selected.sort_by(|a, b| target.cmp_distance(a.id(), b.id()));

        selected.into_iter().take(count).cloned().collect()
    }

    /// Random ids of the buckets due for a refresh, furthest bucket first.
    ///
    /// When `bootstrapping`, every bucket but the local one is refreshed.
    pub fn refresh_ids(&mut self, bootstrapping: bool) -> Vec<Kuid> {
        self.refresh_ids_at(Instant::now(), bootstrapping)
    }

    pub(crate) fn refresh_ids_at(&mut self, now: Instant, bootstrapping: bool) -> Vec<Kuid> {
        let period = self.settings.bucket_refresh_period;

        self.buckets
            .iter_mut()
            .filter(|b| {
                if bootstrapping {
                    !b.is_local()
                } else {
                    b.is_refresh_required(now, period)
                }
            })
            .map(|b| {
                b.touch(now);
                b.random_id()
            })
            .collect()
    }

    pub fn purge(&mut self, mode: PurgeMode) {
        let local_id = self.local_id;

        match mode {
            PurgeMode::DropDead => {
                for bucket in &mut self.buckets {
                    bucket.retain(|c| !c.is_dead() || *c.id() == local_id);
                    bucket.retain_cached(|c| !c.is_dead());
                }
            }
            PurgeMode::StateToUnknown => {
                for bucket in &mut self.buckets {
                    for contact in bucket.iter_mut().filter(|c| *c.id() != local_id) {
                        contact.unknown();
                    }
                    for contact in bucket.cached_mut() {
                        contact.unknown();
                    }
                }
            }
            PurgeMode::MergeBuckets => {
                while self.buckets.len() > 1 {
                    let last = self.buckets.len() - 1;
                    if self.buckets[last].len() + self.buckets[last - 1].len() > self.settings.k {
                        break;
                    }

                    if let Some(local) = self.buckets.pop() {
                        let far = std::mem::replace(&mut self.buckets[last - 1], local);
                        self.buckets[last - 1].merge(far);
                        self.buckets[last - 1].truncate_cache(self.settings.max_cache_size);
                    }
                }
            }
        }
    }

    /// Rebuilds the table around a new `local` contact, typically after an id
    /// collision, re-adding every remote contact that still fits, then the
    /// cached ones.
    pub fn rebuild(&mut self, local: Contact) {
        let mut contacts: Vec<Contact> = self.contacts().cloned().collect();
        contacts.extend(self.cached_contacts().cloned());

        *self = RouteTable::new(local, self.settings.clone());

        for contact in contacts {
            if let AddOutcome::Dropped { .. } = self.add(contact) {
                trace!("Dropped contact while rebuilding the route table");
            }
        }
    }

    /// Replaces the local contact, keeping its id.
    pub fn update_local(&mut self, local: Contact) {
        if local.id() != &self.local_id {
            return;
        }

        let last = self.buckets.len() - 1;
        if let Some(position) = self.buckets[last].position(&self.local_id) {
            self.buckets[last].update(position, local.clone());
        }
        self.local = local;
    }

    // === Private Methods ===

    fn bucket_index(&self, id: &Kuid) -> usize {
        self.local_id
            .common_prefix_length(id)
            .min(self.buckets.len() - 1)
    }

    fn split(&mut self) {
        let last = self.buckets.len() - 1;
        let far = self.buckets[last].split(&self.local_id, self.settings.k);

        trace!(depth = far.depth(), "Splitting local bucket");

        self.buckets.insert(last, far);
    }

    fn update(&mut self, index: usize, position: usize, mut contact: Contact) -> AddOutcome {
        let min_reconnection_time = self.settings.min_reconnection_time;
        let bucket = &mut self.buckets[index];
        let existing = bucket.iter().nth(position).cloned();
        let Some(existing) = existing else {
            return AddOutcome::Ignored;
        };

        if existing.is_alive() && !contact.is_alive() {
            return AddOutcome::Ignored;
        }

        if !existing.is_alive() || existing.is_same(&contact) {
            contact.update_with_existing(&existing);
            bucket.update(position, contact);
            bucket.touch(Instant::now());
            return AddOutcome::Updated;
        }

        if contact.is_alive() && !existing.has_been_recently_alive(min_reconnection_time) {
            debug!(?existing, new = ?contact, "Contact moved or is being spoofed");
            return AddOutcome::SpoofCheck {
                existing,
                candidate: contact,
            };
        }

        AddOutcome::Ignored
    }

    /// Refreshes the replacement cache entry of `contact`, promoting it if
    /// its bucket has room again.
    fn update_cached(&mut self, index: usize, mut contact: Contact) -> AddOutcome {
        let room = self.buckets[index].len() < self.settings.k;
        let okay = self.is_okay_to_add(index, &contact, None);
        let bucket = &mut self.buckets[index];

        let Some(existing) = bucket.get_cached(contact.id()).cloned() else {
            return AddOutcome::Ignored;
        };

        if existing.is_alive() && !contact.is_alive() {
            return AddOutcome::Ignored;
        }

        contact.update_with_existing(&existing);

        if room && okay {
            bucket.remove_cached(contact.id());
            bucket.touch(Instant::now());
            bucket.push(contact);
            return AddOutcome::Added;
        }

        self.add_cached(index, contact)
    }

    fn add_cached(&mut self, index: usize, contact: Contact) -> AddOutcome {
        let max = self.settings.max_cache_size;
        let min_reconnection_time = self.settings.min_reconnection_time;

        trace!(?contact, "Adding contact to the replacement cache");
        let cached = self.buckets[index].add_cached(contact, max, min_reconnection_time);
        let ping = self.ping_least_recently_seen(index);

        if cached {
            AddOutcome::Cached { ping }
        } else {
            AddOutcome::Dropped { ping }
        }
    }

    fn replace_least_recently_seen(
        &mut self,
        index: usize,
        contact: Contact,
        okay: bool,
    ) -> AddOutcome {
        let local_id = self.local_id;
        let bucket = &mut self.buckets[index];

        let Some(lrs) = bucket.least_recently_seen(&local_id).cloned() else {
            return AddOutcome::Dropped { ping: None };
        };

        if okay && contact.is_alive() && !lrs.is_alive() {
            bucket.remove(lrs.id());
            bucket.push(contact);
            bucket.touch(Instant::now());
            return AddOutcome::Replaced(lrs);
        }

        self.add_cached(index, contact)
    }

    /// The least recently seen contact of a bucket, if it is alive and the
    /// bucket wasn't pinged within [RoutingSettings::bucket_ping_limit].
    fn ping_least_recently_seen(&mut self, index: usize) -> Option<Contact> {
        let ping_limit = self.settings.bucket_ping_limit;
        let local_id = self.local_id;
        let bucket = &mut self.buckets[index];

        let lrs = bucket.least_recently_seen(&local_id).cloned()?;

        if lrs.is_alive() && bucket.should_ping(Instant::now(), ping_limit) {
            Some(lrs)
        } else {
            None
        }
    }

    /// Whether `contact` fits the class C limit of bucket `index`, once
    /// `replacing` is gone.
    fn is_okay_to_add(&self, index: usize, contact: &Contact, replacing: Option<&Contact>) -> bool {
        let Some(max) = self.settings.max_contacts_per_class_c else {
            return true;
        };

        let bucket = &self.buckets[index];
        let address = contact.address();
        let mut count = bucket.class_c_count(&address);

        if let Some(replacing) = replacing {
            let same = bucket.contains(replacing.id())
                && same_class_c(&replacing.address(), &address);
            count -= same as usize;
        }

        count < max
    }

    fn handle_cached_failure(&mut self, index: usize, id: &Kuid, address: SocketAddr) {
        let bucket = &mut self.buckets[index];
        let Some(cached) = bucket.cached_mut().find(|c| c.id() == id) else {
            return;
        };

        if cached.address() != address {
            return;
        }

        self.consecutive_failures += 1;

        cached.handle_failure(
            self.settings.max_alive_node_failures,
            self.settings.max_unknown_node_failures,
        );

        if cached.is_dead() {
            trace!(?id, "Removing dead contact from the replacement cache");
            bucket.remove_cached(id);
        }
    }
}

impl Display for RouteTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Local: {}", self.local())?;

        for bucket in &self.buckets {
            write!(f, "{}", bucket)?;
        }

        let (mut alive, mut unknown, mut dead) = (0, 0, 0);
        for contact in self.contacts() {
            if contact.is_alive() {
                alive += 1;
            } else if contact.is_dead() {
                dead += 1;
            } else {
                unknown += 1;
            }
        }

        write!(
            f,
            "TOTAL: {} buckets, {} contacts (alive: {}, unknown: {}, dead: {})",
            self.buckets.len(),
            alive + unknown + dead,
            alive,
            unknown,
            dead
        )
    }
}
