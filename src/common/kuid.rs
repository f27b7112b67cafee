//! Kademlia node id and lookup key

use rand::Rng;
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{DhtError, Result};

/// The size of a [Kuid] in bytes.
pub const KUID_SIZE: usize = 20;
/// The size of a [Kuid] in bits.
pub const KUID_BITS: usize = KUID_SIZE * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// 160-bit identifier of a node or a value in the DHT keyspace.
///
/// Nearness to a target is measured by XOR distance, compared byte by byte
/// from the most significant end.
pub struct Kuid(pub [u8; KUID_SIZE]);

impl Kuid {
    /// All bits cleared.
    pub const MINIMUM: Kuid = Kuid([0; KUID_SIZE]);
    /// All bits set.
    pub const MAXIMUM: Kuid = Kuid([0xff; KUID_SIZE]);

    pub fn random() -> Kuid {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; KUID_SIZE] = rng.gen();

        Kuid(random_bytes)
    }

    /// Create a new Kuid from some bytes. Returns Err if `bytes` is not of length
    /// [KUID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Kuid> {
        let bytes = bytes.as_ref();
        if bytes.len() != KUID_SIZE {
            return Err(DhtError::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; KUID_SIZE] = [0; KUID_SIZE];
        tmp.copy_from_slice(bytes);

        Ok(Kuid(tmp))
    }

    /// SHA-1 of arbitrary key material, for example a human readable key.
    pub fn from_key_material<T: AsRef<[u8]>>(material: T) -> Kuid {
        let mut hasher = sha1_smol::Sha1::new();
        hasher.update(material.as_ref());

        Kuid(hasher.digest().bytes())
    }

    /// Random id sharing the first `depth` bits with `prefix`.
    ///
    /// Used to pick lookup targets that fall inside a given bucket.
    pub fn random_with_prefix(prefix: &Kuid, depth: usize) -> Kuid {
        let mut id = Kuid::random();
        let depth = depth.min(KUID_BITS);

        let full_bytes = depth / 8;
        id.0[..full_bytes].copy_from_slice(&prefix.0[..full_bytes]);

        let remaining_bits = depth % 8;
        if remaining_bits != 0 {
            // Low order bits stay random.
            let mask = 0xffu8 >> remaining_bits;
            id.0[full_bytes] = (prefix.0[full_bytes] & !mask) | (id.0[full_bytes] & mask);
        }

        id
    }

    // === Getters ===

    pub fn as_bytes(&self) -> &[u8; KUID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    // === Bits ===

    /// Returns whether the bit at `index` (0 is the most significant bit) is set.
    pub fn is_bit_set(&self, index: usize) -> bool {
        let (byte, mask) = bit_position(index);
        self.0[byte] & mask != 0
    }

    pub fn set_bit(&self, index: usize) -> Kuid {
        let (byte, mask) = bit_position(index);
        let mut id = *self;
        id.0[byte] |= mask;
        id
    }

    pub fn unset_bit(&self, index: usize) -> Kuid {
        let (byte, mask) = bit_position(index);
        let mut id = *self;
        id.0[byte] &= !mask;
        id
    }

    pub fn flip_bit(&self, index: usize) -> Kuid {
        let (byte, mask) = bit_position(index);
        let mut id = *self;
        id.0[byte] ^= mask;
        id
    }

    // === Distance ===

    pub fn xor(&self, other: &Kuid) -> Kuid {
        let mut result = [0; KUID_SIZE];
        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Kuid(result)
    }

    pub fn invert(&self) -> Kuid {
        let mut result = self.0;
        for byte in result.iter_mut() {
            *byte = !*byte;
        }
        Kuid(result)
    }

    /// Number of leading bits this id shares with `other`.
    ///
    /// 160 for equal ids.
    pub fn common_prefix_length(&self, other: &Kuid) -> usize {
        for i in 0..KUID_SIZE {
            let xor = self.0[i] ^ other.0[i];

            if xor != 0 {
                return i * 8 + xor.leading_zeros() as usize;
            }
        }

        KUID_BITS
    }

    /// Returns `true` if this id is strictly nearer to `target` than `other` is.
    pub fn is_nearer_to(&self, target: &Kuid, other: &Kuid) -> bool {
        self.xor(target) < other.xor(target)
    }

    /// Compares the distance of `a` and `b` to this target.
    pub fn cmp_distance(&self, a: &Kuid, b: &Kuid) -> std::cmp::Ordering {
        a.xor(self).cmp(&b.xor(self))
    }
}

fn bit_position(index: usize) -> (usize, u8) {
    let index = index.min(KUID_BITS - 1);
    (index / 8, 0x80 >> (index % 8))
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

impl Display for Kuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl Debug for Kuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Kuid({})", self)
    }
}

impl FromStr for Kuid {
    type Err = DhtError;

    fn from_str(s: &str) -> Result<Kuid> {
        let s = s.trim();

        if s.len() != KUID_SIZE * 2 {
            return Err(DhtError::InvalidIdSize(s.len() / 2));
        }

        let mut bytes = [0u8; KUID_SIZE];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let high = hex_value(chunk[0]);
            let low = hex_value(chunk[1]);

            match (high, low) {
                (Some(high), Some(low)) => bytes[i] = (high << 4) | low,
                _ => return Err(DhtError::InvalidInput(format!("{} is not a hex id", s))),
            }
        }

        Ok(Kuid(bytes))
    }
}

impl From<[u8; KUID_SIZE]> for Kuid {
    fn from(bytes: [u8; KUID_SIZE]) -> Self {
        Kuid(bytes)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn id_with_last_byte(byte: u8) -> Kuid {
        let mut bytes = [0; KUID_SIZE];
        bytes[KUID_SIZE - 1] = byte;
        Kuid(bytes)
    }

    #[test]
    fn common_prefix_length() {
        let a = Kuid::MINIMUM;

        assert_eq!(a.common_prefix_length(&a), KUID_BITS);
        assert_eq!(a.common_prefix_length(&Kuid::MAXIMUM), 0);
        assert_eq!(a.common_prefix_length(&id_with_last_byte(1)), KUID_BITS - 1);
        assert_eq!(a.common_prefix_length(&a.set_bit(5)), 5);
    }

    #[test]
    fn nearness_is_strict() {
        let target = Kuid::MINIMUM;
        let near = id_with_last_byte(5);
        let far = id_with_last_byte(10);

        assert!(near.is_nearer_to(&target, &far));
        assert!(!far.is_nearer_to(&target, &near));
        assert!(!near.is_nearer_to(&target, &near));
    }

    #[test]
    fn xor_ordering_is_total() {
        let target = Kuid::random();
        let mut ids: Vec<Kuid> = (0..50).map(|_| Kuid::random()).collect();

        ids.sort_by(|a, b| target.cmp_distance(a, b));

        for pair in ids.windows(2) {
            assert!(pair[0].is_nearer_to(&target, &pair[1]));
        }
    }

    #[test]
    fn bits() {
        let id = Kuid::MINIMUM.set_bit(0).set_bit(159);

        assert!(id.is_bit_set(0));
        assert!(id.is_bit_set(159));
        assert!(!id.is_bit_set(1));
        assert_eq!(id.0[0], 0x80);
        assert_eq!(id.0[19], 0x01);
        assert_eq!(id.flip_bit(0).unset_bit(159), Kuid::MINIMUM);
        assert_eq!(Kuid::MINIMUM.invert(), Kuid::MAXIMUM);
    }

    #[test]
    fn random_with_prefix() {
        let prefix = Kuid::random();

        for depth in [0, 1, 7, 8, 13, 100, 160] {
            let id = Kuid::random_with_prefix(&prefix, depth);
            assert!(id.common_prefix_length(&prefix) >= depth, "depth {depth}");
        }
    }

    #[test]
    fn hex_round_trip() {
        let id = Kuid::from_str("5a3ce9c14e7a08645677bbd1cfe7d8f956d53256").unwrap();

        assert_eq!(id.to_string(), "5A3CE9C14E7A08645677BBD1CFE7D8F956D53256");
        assert_eq!(Kuid::from_str(&id.to_string()).unwrap(), id);
        assert!(Kuid::from_str("xyz").is_err());
    }

    #[test]
    fn from_key_material() {
        let id = Kuid::from_key_material("Hello World!");

        assert_eq!(
            id,
            Kuid::from_str("2ef7bde608ce5404e97d5f042f95f89f1c232871").unwrap()
        );
    }

    #[test]
    fn from_bytes() {
        assert!(Kuid::from_bytes([1; 20]).is_ok());
        assert!(matches!(
            Kuid::from_bytes([1; 19]),
            Err(DhtError::InvalidIdSize(19))
        ));
    }
}
