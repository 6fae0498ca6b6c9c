//! 512-bit overlay addresses and the XOR distance metric.
//!
//! Every node and every message destination is identified by an [`Address`]:
//! a 64-byte opaque value. Distance between two addresses is their bitwise
//! XOR, compared lexicographically as a big unsigned integer. The metric is
//! symmetric and, for a fixed reference point, injective: two distinct
//! addresses are never equidistant from the same target.

use std::cmp::Ordering;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::{Error as DeError, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Width of an overlay address in bytes (512 bits).
pub const ADDRESS_BYTES: usize = 64;

/// Number of distinct bucket indices: one per possible leading-bit match.
pub const BUCKET_COUNT: usize = ADDRESS_BYTES * 8;

/// XOR distance between two addresses, as raw bytes.
pub type Distance = [u8; ADDRESS_BYTES];

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address([u8; ADDRESS_BYTES]);

impl Address {
    /// The all-zero address. Never a valid node identity; used as the
    /// "unset" sentinel in wire messages.
    pub const ZERO: Address = Address([0u8; ADDRESS_BYTES]);

    #[inline]
    pub fn from_bytes(bytes: [u8; ADDRESS_BYTES]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ADDRESS_BYTES] {
        &self.0
    }

    /// Generate a random address from the OS entropy source.
    ///
    /// Used for ephemeral (anonymous) identities and test fixtures.
    pub fn random() -> Self {
        let mut bytes = [0u8; ADDRESS_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    #[inline]
    pub fn xor_distance(&self, other: &Address) -> Distance {
        let mut out = [0u8; ADDRESS_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Number of leading bits this address shares with `other`.
    ///
    /// This is the bucket index: 0 for the most distant half of the address
    /// space, up to [`BUCKET_COUNT`] for an identical address (which never
    /// occurs in a routing table, since the table excludes self).
    pub fn common_leading_bits(&self, other: &Address) -> usize {
        let dist = self.xor_distance(other);
        for (byte_idx, byte) in dist.iter().enumerate() {
            if *byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        BUCKET_COUNT
    }

    /// True iff `self` is closer to `target` than `other` is.
    #[inline]
    pub fn closer_to(&self, other: &Address, target: &Address) -> bool {
        distance_cmp(&self.xor_distance(target), &other.xor_distance(target)) == Ordering::Less
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != ADDRESS_BYTES {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; ADDRESS_BYTES];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

/// Compare two XOR distances lexicographically as big unsigned integers.
#[inline]
pub fn distance_cmp(a: &Distance, b: &Distance) -> Ordering {
    a.iter().cmp(b.iter())
}

/// Bucket index of `peer` relative to `own`: the count of shared leading
/// bits. Callers must not pass `peer == own`.
#[inline]
pub fn bucket_index(own: &Address, peer: &Address) -> usize {
    own.common_leading_bits(peer).min(BUCKET_COUNT - 1)
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({}..)", hex::encode(&self.0[..6]))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..", hex::encode(&self.0[..6]))
    }
}

// serde cannot derive for 64-byte arrays on all supported versions, so the
// address serialises as a plain byte string with a strict length check.
impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct AddressVisitor;

impl<'de> Visitor<'de> for AddressVisitor {
    type Value = Address;

    fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{ADDRESS_BYTES} bytes")
    }

    fn visit_bytes<E: DeError>(self, v: &[u8]) -> Result<Address, E> {
        if v.len() != ADDRESS_BYTES {
            return Err(E::invalid_length(v.len(), &self));
        }
        let mut arr = [0u8; ADDRESS_BYTES];
        arr.copy_from_slice(v);
        Ok(Address(arr))
    }

    fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> Result<Address, A::Error> {
        let mut arr = [0u8; ADDRESS_BYTES];
        for (i, slot) in arr.iter_mut().enumerate() {
            *slot = seq
                .next_element()?
                .ok_or_else(|| A::Error::invalid_length(i, &self))?;
        }
        Ok(Address(arr))
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Address, D::Error> {
        deserializer.deserialize_bytes(AddressVisitor)
    }
}
