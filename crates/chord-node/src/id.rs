use sha1::Digest;
use sha1::Sha1;
use std::fmt;
use std::str::FromStr;

/// Width of the identifier space in bits.
pub const ID_BITS: usize = 160;

const ID_BYTES: usize = 20;

/// An unsigned 160-bit identifier on the ring, stored big-endian.
///
/// Node ids and item ids share the space but are derived with distinct
/// domain-separator bytes, so a collision between the two would require a
/// SHA-1 second preimage across prefixes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id([u8; ID_BYTES]);

/// One-directional distance between two ring ids.
///
/// The distance from an id to itself is the whole ring, not zero: a
/// single-node ring must still route forward. `FullRing` orders above every
/// finite forward distance.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Distance {
    Forward(Id),
    FullRing,
}

impl Id {
    pub const ZERO: Id = Id([0; ID_BYTES]);

    /// The id of the node addressed by `addr` (`HOST:PORT`).
    pub fn for_addr(addr: &str) -> Id {
        Id::digest(0x00, addr.as_bytes())
    }

    /// The id under which an item payload is stored.
    pub fn for_item(payload: &[u8]) -> Id {
        Id::digest(0x01, payload)
    }

    fn digest(domain: u8, data: &[u8]) -> Id {
        let mut hasher = Sha1::new();
        hasher.update([domain]);
        hasher.update(data);
        Id(hasher.finalize().into())
    }

    /// `2^exp`, for building finger targets. `exp` must be below
    /// [`ID_BITS`].
    pub fn pow2(exp: usize) -> Id {
        debug_assert!(exp < ID_BITS);
        let mut bytes = [0u8; ID_BYTES];
        bytes[ID_BYTES - 1 - exp / 8] = 1 << (exp % 8);
        Id(bytes)
    }

    pub fn from_u64(n: u64) -> Id {
        let mut bytes = [0u8; ID_BYTES];
        bytes[ID_BYTES - 8..].copy_from_slice(&n.to_be_bytes());
        Id(bytes)
    }

    /// Addition mod `2^160`.
    pub fn wrapping_add(self, other: Id) -> Id {
        let mut out = [0u8; ID_BYTES];
        let mut carry = 0u16;
        for i in (0..ID_BYTES).rev() {
            let sum = u16::from(self.0[i]) + u16::from(other.0[i]) + carry;
            out[i] = sum as u8;
            carry = sum >> 8;
        }
        Id(out)
    }

    /// Subtraction mod `2^160`.
    pub fn wrapping_sub(self, other: Id) -> Id {
        let mut out = [0u8; ID_BYTES];
        let mut borrow = 0u16;
        for i in (0..ID_BYTES).rev() {
            let (lhs, rhs) = (u16::from(self.0[i]), u16::from(other.0[i]) + borrow);
            if lhs < rhs {
                out[i] = (lhs + 0x100 - rhs) as u8;
                borrow = 1;
            } else {
                out[i] = (lhs - rhs) as u8;
                borrow = 0;
            }
        }
        Id(out)
    }

    /// Circular forward distance from `self` to `other`.
    pub fn distance_to(self, other: Id) -> Distance {
        if self == other {
            Distance::FullRing
        } else {
            Distance::Forward(other.wrapping_sub(self))
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("expected 40 hex digits")]
pub struct ParseIdError;

impl FromStr for Id {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Id, ParseIdError> {
        let mut bytes = [0u8; ID_BYTES];
        if s.len() != 2 * ID_BYTES {
            return Err(ParseIdError);
        }
        hex::decode_to_slice(s, &mut bytes).map_err(|_| ParseIdError)?;
        Ok(Id(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_and_item_ids_match_known_digests() {
        assert_eq!(
            Id::for_addr("127.0.0.1:20000").to_string(),
            "3e9e9237d1e739a6bbd59275f551d88ed638da2e"
        );
        assert_eq!(
            Id::for_item(b"hello").to_string(),
            "6294a9e30c31ca08e83757124040cb83e57d3853"
        );
    }

    #[test]
    fn domain_separation_distinguishes_node_and_item_ids() {
        assert_ne!(Id::for_addr(""), Id::for_item(b""));
        assert_ne!(Id::for_addr("hello"), Id::for_item(b"hello"));
    }

    #[test]
    fn distance_to_self_spans_the_whole_ring() {
        let a = Id::for_addr("127.0.0.1:4000");
        assert_eq!(a.distance_to(a), Distance::FullRing);
        assert!(a.distance_to(Id::for_addr("127.0.0.1:4001")) < Distance::FullRing);
    }

    #[test]
    fn forward_and_backward_distances_complete_the_ring() {
        let a = Id::for_addr("127.0.0.1:4000");
        let b = Id::for_addr("127.0.0.1:4001");
        let (Distance::Forward(ab), Distance::Forward(ba)) = (a.distance_to(b), b.distance_to(a))
        else {
            panic!("distinct ids must have finite distances");
        };
        assert_eq!(ab.wrapping_add(ba), Id::ZERO);
    }

    #[test]
    fn adding_n_moves_the_distance_by_n() {
        let a = Id::for_addr("127.0.0.1:4000");
        let n = Id::pow2(42);
        assert_eq!(a.distance_to(a.wrapping_add(n)), Distance::Forward(n));
    }

    #[test]
    fn add_renders_the_wrapped_value() {
        let max: Id = "ffffffffffffffffffffffffffffffffffffffff".parse().unwrap();
        let wrapped = max.wrapping_add(Id::from_u64(1));
        assert_eq!(wrapped, Id::ZERO);
        assert_eq!(wrapped.to_string(), "0000000000000000000000000000000000000000");
    }

    #[test]
    fn pow2_places_a_single_bit() {
        assert_eq!(Id::pow2(0), Id::from_u64(1));
        assert_eq!(Id::pow2(8), Id::from_u64(256));
        assert_eq!(
            Id::pow2(159).to_string(),
            "8000000000000000000000000000000000000000"
        );
    }

    #[test]
    fn parses_exactly_40_hex_digits() {
        assert!("3e9e9237d1e739a6bbd59275f551d88ed638da2e".parse::<Id>().is_ok());
        assert!("3e9e".parse::<Id>().is_err());
        assert!("zz9e9237d1e739a6bbd59275f551d88ed638da2e".parse::<Id>().is_err());
    }
}
