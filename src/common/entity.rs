//! Values stored in the DHT and the keys used to look them up.

use std::{
    fmt::{self, Debug, Display, Formatter},
    time::Instant,
};

use bytes::Bytes;

use crate::common::{Contact, Kuid};
use crate::ValueError;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
/// Four character code describing the content of a value.
pub struct ValueType(pub [u8; 4]);

impl ValueType {
    /// Matches every type in a lookup.
    pub const ANY: ValueType = ValueType(*b"****");
    pub const BINARY: ValueType = ValueType(*b"BINA");
    pub const TEXT: ValueType = ValueType(*b"TEXT");
    pub const TEST: ValueType = ValueType(*b"TEST");

    /// Returns `true` if a value of type `other` satisfies a lookup for this type.
    pub fn matches(&self, other: &ValueType) -> bool {
        *self == ValueType::ANY || self == other
    }
}

impl Display for ValueType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl Debug for ValueType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "ValueType({})", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
/// Version of a value's format, chosen by the publisher.
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8) -> Version {
        Version { major, minor }
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The content of a stored value.
pub struct DhtValue {
    value_type: ValueType,
    version: Version,
    bytes: Bytes,
}

impl DhtValue {
    pub fn new(value_type: ValueType, version: Version, bytes: impl Into<Bytes>) -> DhtValue {
        DhtValue {
            value_type,
            version,
            bytes: bytes.into(),
        }
    }

    /// An empty value, storing it removes the publisher's entity.
    pub fn empty() -> DhtValue {
        DhtValue::new(ValueType::BINARY, Version::default(), Bytes::new())
    }

    /// Returns an error if the value is larger than `max_size` bytes.
    pub fn validate(&self, max_size: usize) -> Result<(), ValueError> {
        if self.bytes.len() > max_size {
            return Err(ValueError::TooLarge {
                size: self.bytes.len(),
                max: max_size,
            });
        }

        if self.value_type == ValueType::ANY {
            return Err(ValueError::Malformed(
                "the ANY type is reserved for lookups".to_string(),
            ));
        }

        Ok(())
    }

    // === Getters ===

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Display for DhtValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.value_type == ValueType::TEXT {
            write!(f, "{}", String::from_utf8_lossy(&self.bytes))
        } else {
            write!(f, "{} bytes of {}", self.bytes.len(), self.value_type)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A value stored under a primary key, published by its creator.
///
/// The secondary key is the creator's id, so a primary key holds at most one
/// entity per publisher.
pub struct DhtValueEntity {
    creator: Contact,
    sender: Contact,
    primary_key: Kuid,
    value: DhtValue,
    creation_time: Instant,
    local: bool,
}

impl DhtValueEntity {
    /// An entity published by this node.
    pub fn local(creator: Contact, primary_key: Kuid, value: DhtValue) -> DhtValueEntity {
        DhtValueEntity {
            sender: creator.clone(),
            creator,
            primary_key,
            value,
            creation_time: Instant::now(),
            local: true,
        }
    }

    /// An entity received from `sender`, which may be forwarding it on behalf
    /// of `creator`.
    pub fn remote(
        creator: Contact,
        sender: Contact,
        primary_key: Kuid,
        value: DhtValue,
    ) -> DhtValueEntity {
        DhtValueEntity {
            creator,
            sender,
            primary_key,
            value,
            creation_time: Instant::now(),
            local: false,
        }
    }

    /// The same entity as received by another node from `sender`.
    pub fn received_from(&self, sender: Contact) -> DhtValueEntity {
        DhtValueEntity {
            creator: self.creator.clone(),
            sender,
            primary_key: self.primary_key,
            value: self.value.clone(),
            creation_time: Instant::now(),
            local: false,
        }
    }

    // === Getters ===

    pub fn creator(&self) -> &Contact {
        &self.creator
    }

    pub fn sender(&self) -> &Contact {
        &self.sender
    }

    pub fn primary_key(&self) -> &Kuid {
        &self.primary_key
    }

    pub fn secondary_key(&self) -> &Kuid {
        self.creator.id()
    }

    pub fn value(&self) -> &DhtValue {
        &self.value
    }

    pub fn creation_time(&self) -> Instant {
        self.creation_time
    }

    /// Returns `true` if this node published the entity.
    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Returns `true` if the creator sent the entity itself.
    pub fn is_direct(&self) -> bool {
        self.creator.id() == self.sender.id()
    }

    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(
            self.primary_key,
            Some(*self.secondary_key()),
            self.value.value_type(),
        )
    }
}

impl Display for DhtValueEntity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} / {}: {} (v{}, {}, from {})",
            self.primary_key,
            self.secondary_key(),
            self.value,
            self.value.version(),
            if self.local { "local" } else { "remote" },
            self.sender.address(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// What a FIND_VALUE lookup asks for.
pub struct EntityKey {
    primary_key: Kuid,
    secondary_key: Option<Kuid>,
    value_type: ValueType,
}

impl EntityKey {
    pub fn new(primary_key: Kuid, secondary_key: Option<Kuid>, value_type: ValueType) -> Self {
        EntityKey {
            primary_key,
            secondary_key,
            value_type,
        }
    }

    /// Every value under `primary_key`, of any type.
    pub fn any(primary_key: Kuid) -> Self {
        EntityKey::new(primary_key, None, ValueType::ANY)
    }

    pub fn primary_key(&self) -> &Kuid {
        &self.primary_key
    }

    pub fn secondary_key(&self) -> Option<&Kuid> {
        self.secondary_key.as_ref()
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }
}

impl Display for EntityKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.secondary_key {
            Some(secondary_key) => write!(
                f,
                "{} / {} ({})",
                self.primary_key, secondary_key, self.value_type
            ),
            None => write!(f, "{} ({})", self.primary_key, self.value_type),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn value_validation() {
        let value = DhtValue::new(ValueType::TEXT, Version::new(0, 1), &b"hello"[..]);

        assert!(value.validate(5).is_ok());
        assert_eq!(
            value.validate(4),
            Err(ValueError::TooLarge { size: 5, max: 4 })
        );

        let any = DhtValue::new(ValueType::ANY, Version::default(), &b"x"[..]);
        assert!(matches!(any.validate(10), Err(ValueError::Malformed(_))));
    }

    #[test]
    fn any_matches_everything() {
        assert!(ValueType::ANY.matches(&ValueType::TEXT));
        assert!(ValueType::TEXT.matches(&ValueType::TEXT));
        assert!(!ValueType::TEXT.matches(&ValueType::BINARY));
    }

    #[test]
    fn secondary_key_is_creator() {
        let creator = Contact::random();
        let entity = DhtValueEntity::local(creator.clone(), Kuid::random(), DhtValue::empty());

        assert_eq!(entity.secondary_key(), creator.id());
        assert!(entity.is_direct());
        assert!(entity.is_local());

        let forwarded = entity.received_from(Contact::random());
        assert!(!forwarded.is_direct());
        assert!(!forwarded.is_local());
        assert_eq!(forwarded.secondary_key(), creator.id());
    }
}
