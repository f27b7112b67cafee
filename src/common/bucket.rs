//! A k-bucket of the [RouteTable](super::RouteTable).

use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::slice::Iter;
use std::time::{Duration, Instant};

use crate::common::{most_recently_seen_first, Contact, Kuid};

#[derive(Debug, Clone)]
/// Contacts sharing the first `depth` bits of `prefix`, bounded to `k` entries.
pub struct Bucket {
    prefix: Kuid,
    depth: usize,
    /// Whether this bucket covers the local node's id.
    local: bool,
    /// Sorted by insertion, the most recently refreshed contacts move to the end.
    contacts: Vec<Contact>,
    /// Replacement cache: contacts that didn't fit, never selected nor counted.
    cache: Vec<Contact>,
    touched: Instant,
    last_ping: Option<Instant>,
}

impl Bucket {
    pub(crate) fn new(prefix: Kuid, depth: usize, local: bool, capacity: usize) -> Self {
        Bucket {
            prefix,
            depth,
            local,
            contacts: Vec::with_capacity(capacity),
            cache: Vec::new(),
            touched: Instant::now(),
            last_ping: None,
        }
    }

    // === Getters ===

    /// The bits every id in this bucket starts with, see [Self::depth].
    pub fn prefix(&self) -> &Kuid {
        &self.prefix
    }

    /// Number of leading bits of [Self::prefix] shared by every id in this bucket.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Returns `true` if this bucket covers the local node's id.
    pub fn is_local(&self) -> bool {
        self.local
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, Contact> {
        self.contacts.iter()
    }

    /// Contacts of the replacement cache, in no particular order.
    pub fn cached(&self) -> Iter<'_, Contact> {
        self.cache.iter()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn get_cached(&self, id: &Kuid) -> Option<&Contact> {
        self.cache.iter().find(|c| c.id() == id)
    }

    /// Number of contacts in the same class C (/24) network as `address`.
    ///
    /// Only IPv4 addresses are counted.
    pub fn class_c_count(&self, address: &SocketAddr) -> usize {
        let Some(network) = class_c(address) else {
            return 0;
        };

        self.contacts
            .iter()
            .filter(|c| class_c(&c.address()) == Some(network))
            .count()
    }

    pub fn touched(&self) -> Instant {
        self.touched
    }

    pub fn get(&self, id: &Kuid) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.id() == id)
    }

    pub fn contains(&self, id: &Kuid) -> bool {
        self.get(id).is_some()
    }

    /// Returns `true` if `id` falls into this bucket's range.
    pub fn covers(&self, id: &Kuid) -> bool {
        id.common_prefix_length(&self.prefix) >= self.depth
    }

    /// The least recently seen contact that isn't `local_id`.
    pub fn least_recently_seen(&self, local_id: &Kuid) -> Option<&Contact> {
        self.contacts
            .iter()
            .filter(|c| c.id() != local_id)
            .min_by_key(|c| c.time_stamp())
    }

    pub fn is_refresh_required(&self, now: Instant, period: Duration) -> bool {
        now.saturating_duration_since(self.touched) >= period
    }

    // === Public Methods ===

    /// A random id inside this bucket's range.
    pub fn random_id(&self) -> Kuid {
        Kuid::random_with_prefix(&self.prefix, self.depth)
    }

    // === Crate Methods ===

    pub(crate) fn position(&self, id: &Kuid) -> Option<usize> {
        self.contacts.iter().position(|c| c.id() == id)
    }

    pub(crate) fn get_mut(&mut self, id: &Kuid) -> Option<&mut Contact> {
        self.contacts.iter_mut().find(|c| c.id() == id)
    }

    pub(crate) fn push(&mut self, contact: Contact) {
        self.contacts.push(contact);
    }

    /// Replaces the contact at `index`, moving it to the most recently seen end
    /// if the new one is alive.
    pub(crate) fn update(&mut self, index: usize, contact: Contact) -> Contact {
        if contact.is_alive() {
            let old = self.contacts.remove(index);
            self.contacts.push(contact);
            old
        } else {
            std::mem::replace(&mut self.contacts[index], contact)
        }
    }

    pub(crate) fn remove(&mut self, id: &Kuid) -> Option<Contact> {
        let index = self.position(id)?;
        Some(self.contacts.remove(index))
    }

    pub(crate) fn retain<F: FnMut(&Contact) -> bool>(&mut self, f: F) {
        self.contacts.retain(f)
    }

    /// Adds `contact` to the replacement cache, or refreshes its entry.
    ///
    /// A full cache evicts its least recently seen contact, only if that one
    /// is not alive, or if it was not recently alive and `contact` is.
    /// Returns `false` if `contact` was not cached.
    pub(crate) fn add_cached(
        &mut self,
        contact: Contact,
        max: usize,
        min_reconnection_time: Duration,
    ) -> bool {
        if let Some(existing) = self.cache.iter_mut().find(|c| c.id() == contact.id()) {
            *existing = contact;
            return true;
        }

        if self.cache.len() < max {
            self.cache.push(contact);
            return true;
        }

        let lrs = self
            .cache
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.time_stamp())
            .map(|(index, c)| {
                let evict = !c.is_alive()
                    || (contact.is_alive() && !c.has_been_recently_alive(min_reconnection_time));
                (index, evict)
            });

        match lrs {
            Some((index, true)) => {
                self.cache[index] = contact;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn remove_cached(&mut self, id: &Kuid) -> Option<Contact> {
        let index = self.cache.iter().position(|c| c.id() == id)?;
        Some(self.cache.remove(index))
    }

    /// Takes the most recently seen contact out of the replacement cache.
    pub(crate) fn take_most_recently_seen_cached(&mut self) -> Option<Contact> {
        let index = self
            .cache
            .iter()
            .enumerate()
            .max_by_key(|(_, c)| c.time_stamp())
            .map(|(index, _)| index)?;
        Some(self.cache.remove(index))
    }

    pub(crate) fn retain_cached<F: FnMut(&Contact) -> bool>(&mut self, f: F) {
        self.cache.retain(f)
    }

    pub(crate) fn cached_mut(&mut self) -> std::slice::IterMut<'_, Contact> {
        self.cache.iter_mut()
    }

    /// Keeps the `max` most recently seen contacts of the replacement cache.
    pub(crate) fn truncate_cache(&mut self, max: usize) {
        if self.cache.len() > max {
            self.cache.sort_by(most_recently_seen_first);
            self.cache.truncate(max);
        }
    }

    pub(crate) fn iter_mut(&mut self) -> std::slice::IterMut<'_, Contact> {
        self.contacts.iter_mut()
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.touched = now;
    }

    /// Returns `true` and records the ping if the bucket wasn't pinged within `limit`.
    pub(crate) fn should_ping(&mut self, now: Instant, limit: Duration) -> bool {
        match self.last_ping {
            Some(last) if now.saturating_duration_since(last) < limit => false,
            _ => {
                self.last_ping = Some(now);
                true
            }
        }
    }

    /// Splits this local bucket one bit deeper.
    ///
    /// Returns the far half (ids whose bit at `depth` differs from the local
    /// id) and leaves the near half in `self`.
    pub(crate) fn split(&mut self, local_id: &Kuid, capacity: usize) -> Bucket {
        let depth = self.depth;
        let mut far = Bucket::new(local_id.flip_bit(depth), depth + 1, false, capacity);
        far.touched = self.touched;

        let (far_contacts, near_contacts): (Vec<Contact>, Vec<Contact>) = self
            .contacts
            .drain(..)
            .partition(|c| c.id().common_prefix_length(local_id) == depth);

        far.contacts = far_contacts;
        self.contacts = near_contacts;

        let (far_cache, near_cache): (Vec<Contact>, Vec<Contact>) = self
            .cache
            .drain(..)
            .partition(|c| c.id().common_prefix_length(local_id) == depth);

        far.cache = far_cache;
        self.cache = near_cache;
        self.depth = depth + 1;

        far
    }

    /// Merges the far half produced by [Self::split] back into this local bucket.
    pub(crate) fn merge(&mut self, far: Bucket) {
        self.depth = far.depth - 1;
        self.contacts.extend(far.contacts);
        self.cache.extend(far.cache);
        self.touched = self.touched.min(far.touched);
    }
}

impl Display for Bucket {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Bucket {} (depth: {}{}), size: {}, cached: {}",
            self.prefix,
            self.depth,
            if self.local { ", local" } else { "" },
            self.contacts.len(),
            self.cache.len()
        )?;

        for contact in &self.contacts {
            writeln!(f, " {}", contact)?;
        }
        for contact in &self.cache {
            writeln!(f, " (cached) {}", contact)?;
        }

        Ok(())
    }
}

/// Returns `true` if both addresses are IPv4 in the same /24 network.
pub(crate) fn same_class_c(a: &SocketAddr, b: &SocketAddr) -> bool {
    match (class_c(a), class_c(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn class_c(address: &SocketAddr) -> Option<[u8; 3]> {
    match address.ip() {
        IpAddr::V4(ip) => {
            let [a, b, c, _] = ip.octets();
            Some([a, b, c])
        }
        IpAddr::V6(_) => None,
    }
}
