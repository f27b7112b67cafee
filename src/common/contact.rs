//! Struct and implementation of the Contact entry in the routing table

use std::{
    cmp::Ordering,
    fmt::{self, Debug, Display, Formatter},
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use crate::common::Kuid;

/// Lower bound of an rtt based request timeout.
const MIN_ADAPTIVE_TIMEOUT: Duration = Duration::from_millis(500);
/// Multiplier applied to the last round trip time.
const ADAPTIVE_TIMEOUT_RTT_FACTOR: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Liveness of a [Contact] as far as we know.
pub enum ContactState {
    /// Learned second hand, never talked to us.
    Unknown,
    /// Sent us a message or answered one of our requests.
    Alive,
    /// Failed too many requests in a row.
    Dead,
}

#[derive(Clone, PartialEq, Eq)]
/// A remote node of the DHT, or this node itself.
pub struct Contact {
    id: Kuid,
    address: SocketAddr,
    instance_id: u8,
    firewalled: bool,
    shutdown: bool,

    state: ContactState,
    /// When this contact was last seen alive.
    time_stamp: Option<Instant>,
    last_failed: Option<Instant>,
    failures: usize,
    round_trip_time: Option<Duration>,
}

impl Contact {
    /// Creates a contact in the [ContactState::Unknown] state, as learned from
    /// another node's FIND_NODE response.
    ///
    /// A contact advertising port `0` can't be reached and is marked firewalled.
    pub fn new(id: Kuid, address: SocketAddr) -> Contact {
        Contact {
            id,
            address,
            instance_id: 0,
            firewalled: address.port() == 0,
            shutdown: false,

            state: ContactState::Unknown,
            time_stamp: None,
            last_failed: None,
            failures: 0,
            round_trip_time: None,
        }
    }

    /// Creates a contact that just sent us a message.
    pub fn live(id: Kuid, address: SocketAddr, instance_id: u8) -> Contact {
        let mut contact = Contact::new(id, address).with_instance_id(instance_id);
        contact.alive();
        contact
    }

    /// Creates a random contact for tests.
    #[cfg(test)]
    pub(crate) fn random() -> Contact {
        let mut rng = rand::thread_rng();
        let ip: [u8; 4] = rand::Rng::gen(&mut rng);
        let port: u16 = rand::Rng::gen_range(&mut rng, 1..u16::MAX);

        Contact::live(Kuid::random(), SocketAddr::from((ip, port)), 0)
    }

    /// Identity used to ping a node that claims our own id.
    ///
    /// The inverted id and the firewalled flag tell the receiver not to
    /// route to this sender.
    pub fn collision_ping_sender(local: &Contact) -> Contact {
        Contact::live(local.id.invert(), local.address, 0).with_firewalled(true)
    }

    /// Returns `true` if `sender` is the collision ping identity of `local_id`.
    pub fn is_collision_ping_sender(local_id: &Kuid, sender: &Contact) -> bool {
        sender.firewalled && sender.id == local_id.invert()
    }

    pub fn with_instance_id(mut self, instance_id: u8) -> Contact {
        self.instance_id = instance_id;
        self
    }

    pub fn with_firewalled(mut self, firewalled: bool) -> Contact {
        self.firewalled = firewalled;
        self
    }

    pub fn with_shutdown(mut self, shutdown: bool) -> Contact {
        self.shutdown = shutdown;
        self
    }

    // === Getters ===

    pub fn id(&self) -> &Kuid {
        &self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Incremented every time the node restarts under the same id.
    pub fn instance_id(&self) -> u8 {
        self.instance_id
    }

    pub fn state(&self) -> ContactState {
        self.state
    }

    pub fn time_stamp(&self) -> Option<Instant> {
        self.time_stamp
    }

    pub fn last_failed(&self) -> Option<Instant> {
        self.last_failed
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn round_trip_time(&self) -> Option<Duration> {
        self.round_trip_time
    }

    pub fn is_firewalled(&self) -> bool {
        self.firewalled
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub fn is_alive(&self) -> bool {
        self.state == ContactState::Alive
    }

    pub fn is_unknown(&self) -> bool {
        self.state == ContactState::Unknown
    }

    pub fn is_dead(&self) -> bool {
        self.state == ContactState::Dead
    }

    pub fn has_failed(&self) -> bool {
        self.failures > 0
    }

    /// Returns `true` if both contacts have the same id and address.
    pub fn is_same(&self, other: &Contact) -> bool {
        self.id == other.id && self.address == other.address
    }

    /// Returns `true` if this contact was alive within the last `min_reconnection_time`.
    pub fn has_been_recently_alive(&self, min_reconnection_time: Duration) -> bool {
        self.has_been_recently_alive_at(Instant::now(), min_reconnection_time)
    }

    pub(crate) fn has_been_recently_alive_at(
        &self,
        now: Instant,
        min_reconnection_time: Duration,
    ) -> bool {
        self.time_stamp
            .map(|t| now.saturating_duration_since(t) < min_reconnection_time)
            .unwrap_or(false)
    }

    /// Request timeout for this contact, derived from its last round trip time
    /// and capped at `default`.
    pub fn adaptive_timeout(&self, default: Duration) -> Duration {
        match self.round_trip_time {
            Some(rtt) if self.is_alive() && !rtt.is_zero() => {
                let adaptive = rtt * (ADAPTIVE_TIMEOUT_RTT_FACTOR + self.failures as u32);
                adaptive.min(default).max(MIN_ADAPTIVE_TIMEOUT.min(default))
            }
            _ => default,
        }
    }

    // === Public Methods ===

    /// Marks this contact as alive now and clears its failures.
    pub fn alive(&mut self) {
        self.state = ContactState::Alive;
        self.failures = 0;
        self.time_stamp = Some(Instant::now());
    }

    /// Forgets everything we know about this contact's liveness.
    pub fn unknown(&mut self) {
        self.state = ContactState::Unknown;
        self.failures = 0;
        self.time_stamp = None;
    }

    pub fn set_shutdown(&mut self, shutdown: bool) {
        self.shutdown = shutdown;
    }

    pub fn set_firewalled(&mut self, firewalled: bool) {
        self.firewalled = firewalled;
    }

    pub fn set_round_trip_time(&mut self, rtt: Duration) {
        self.round_trip_time = Some(rtt);
    }

    /// Records a failed request.
    ///
    /// A contact that was ever alive becomes dead after `max_alive_failures`,
    /// one that was never alive after `max_unknown_failures`. A contact that
    /// announced its shutdown is dead on the first failure.
    pub fn handle_failure(&mut self, max_alive_failures: usize, max_unknown_failures: usize) {
        self.failures += 1;
        self.last_failed = Some(Instant::now());

        if self.shutdown {
            self.state = ContactState::Dead;
        } else if self.time_stamp.is_some() {
            if self.failures >= max_alive_failures {
                self.state = ContactState::Dead;
            }
        } else if self.failures >= max_unknown_failures {
            self.state = ContactState::Dead;
        }
    }

    /// Carries over what we knew about `existing` (same id) into this fresher
    /// observation.
    pub fn update_with_existing(&mut self, existing: &Contact) {
        if self.round_trip_time.is_none() {
            self.round_trip_time = existing.round_trip_time;
        }

        if !self.is_alive() || self.time_stamp < existing.time_stamp {
            self.time_stamp = existing.time_stamp;
            self.last_failed = existing.last_failed;
            self.failures = existing.failures;
        }
    }

    /// Replaces the address with the one the message actually came from.
    pub(crate) fn set_address(&mut self, address: SocketAddr) {
        self.address = address;
        if address.port() == 0 {
            self.firewalled = true;
        }
    }

    pub(crate) fn set_id(&mut self, id: Kuid) {
        self.id = id;
    }
}

/// Orders contacts most recently seen first.
pub fn most_recently_seen_first(a: &Contact, b: &Contact) -> Ordering {
    b.time_stamp.cmp(&a.time_stamp)
}

/// Returns `true` if the address can't be routed on the public internet.
///
/// Loopback and site-local addresses only count as private when
/// `local_is_private` is set, which is the default outside of test networks.
pub fn is_private_address(address: &SocketAddr, local_is_private: bool) -> bool {
    if !local_is_private {
        return false;
    }

    match address.ip() {
        IpAddr::V4(ip) => {
            ip.is_private()
                || ip.is_loopback()
                || ip.is_link_local()
                || ip.is_unspecified()
                || ip.is_broadcast()
                || ip.is_documentation()
        }
        IpAddr::V6(ip) => {
            ip.is_loopback()
                || ip.is_unspecified()
                // Unique local fc00::/7 and link local fe80::/10
                || (ip.segments()[0] & 0xfe00) == 0xfc00
                || (ip.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

/// Returns `true` if the address can be sent to at all.
pub fn is_valid_address(address: &SocketAddr) -> bool {
    address.port() != 0 && !address.ip().is_unspecified()
}

impl Debug for Contact {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contact")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("instance_id", &self.instance_id)
            .field("state", &self.state)
            .field("failures", &self.failures)
            .field("firewalled", &self.firewalled)
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

impl Display for Contact {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}), instance: {}, state: {:?}, failures: {}",
            self.id, self.address, self.instance_id, self.state, self.failures
        )?;

        if self.firewalled {
            write!(f, ", firewalled")?;
        }
        if self.shutdown {
            write!(f, ", shutdown")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn port_zero_is_firewalled() {
        let contact = Contact::new(Kuid::random(), SocketAddr::from(([1, 2, 3, 4], 0)));
        assert!(contact.is_firewalled());
        assert!(contact.is_unknown());
    }

    #[test]
    fn alive_contact_dies_after_max_alive_failures() {
        let mut contact = Contact::random();

        for _ in 0..3 {
            contact.handle_failure(4, 2);
            assert!(contact.is_alive());
        }

        contact.handle_failure(4, 2);
        assert!(contact.is_dead());
        assert_eq!(contact.failures(), 4);
    }

    #[test]
    fn unknown_contact_dies_after_max_unknown_failures() {
        let mut contact = Contact::new(Kuid::random(), SocketAddr::from(([1, 2, 3, 4], 80)));

        contact.handle_failure(4, 2);
        assert!(contact.is_unknown());

        contact.handle_failure(4, 2);
        assert!(contact.is_dead());
    }

    #[test]
    fn shutdown_contact_dies_on_first_failure() {
        let mut contact = Contact::random().with_shutdown(true);

        contact.handle_failure(4, 2);
        assert!(contact.is_dead());
    }

    #[test]
    fn alive_resets_failures() {
        let mut contact = Contact::random();
        contact.handle_failure(4, 2);
        assert!(contact.has_failed());

        contact.alive();
        assert!(!contact.has_failed());
    }

    #[test]
    fn update_with_existing_keeps_history_of_unknown() {
        let existing = Contact::random();

        let mut fresh = Contact::new(*existing.id(), existing.address());
        fresh.update_with_existing(&existing);

        assert_eq!(fresh.time_stamp(), existing.time_stamp());
    }

    #[test]
    fn recently_alive() {
        let contact = Contact::random();
        let now = Instant::now();

        assert!(contact.has_been_recently_alive_at(now, Duration::from_secs(30)));
        assert!(!contact.has_been_recently_alive_at(
            now + Duration::from_secs(31),
            Duration::from_secs(30)
        ));
    }

    #[test]
    fn collision_ping_sender() {
        let local = Contact::random();
        let sender = Contact::collision_ping_sender(&local);

        assert!(Contact::is_collision_ping_sender(local.id(), &sender));
        assert!(!Contact::is_collision_ping_sender(local.id(), &local));
    }

    #[test]
    fn private_addresses() {
        let loopback = SocketAddr::from(([127, 0, 0, 1], 6881));
        let site_local = SocketAddr::from(([192, 168, 1, 2], 6881));
        let public = SocketAddr::from(([21, 75, 31, 124], 6881));

        assert!(is_private_address(&loopback, true));
        assert!(is_private_address(&site_local, true));
        assert!(!is_private_address(&public, true));
        assert!(!is_private_address(&loopback, false));
    }

    #[test]
    fn adaptive_timeout() {
        let mut contact = Contact::random();
        let default = Duration::from_secs(10);

        assert_eq!(contact.adaptive_timeout(default), default);

        contact.set_round_trip_time(Duration::from_secs(1));
        assert_eq!(contact.adaptive_timeout(default), Duration::from_secs(2));

        contact.set_round_trip_time(Duration::from_millis(10));
        assert_eq!(contact.adaptive_timeout(default), MIN_ADAPTIVE_TIMEOUT);
    }
}
