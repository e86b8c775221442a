//! Bin identifiers.
//!
//! `BinId` is the externally-visible label assigned by configuration
//! (a unicast destination, an interior node, or a hashed multicast group).
//! `BinIndex` is the dense array index a [`crate::binmap::BinMap`] maps it
//! to. The two are intentionally distinct newtypes — indexing an array
//! directly with a `BinId` is a type error, not just a style nit.

use crate::constants::INVALID_BIN_ID;
use std::fmt;

/// A unicast-destination, interior-node, or multicast bin id as assigned
/// by configuration. `255` is reserved as [`BinId::INVALID`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct BinId(pub u8);

impl BinId {
    pub const INVALID: BinId = BinId(INVALID_BIN_ID);

    pub fn is_valid(self) -> bool {
        self.0 != INVALID_BIN_ID
    }
}

impl fmt::Display for BinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bin:{}", self.0)
    }
}

/// A dense index into a `BinMap`'s backing arrays. Not interchangeable
/// with a `BinId` — always go through `BinMap` to convert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BinIndex(pub usize);

impl fmt::Display for BinIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "idx:{}", self.0)
    }
}

/// Which of the three disjoint namespaces a bin belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinKind {
    UnicastDst,
    InteriorNode,
    McastGroup,
}

/// A hashed IPv4 multicast-group identifier. `0` is reserved as
/// [`McastId::INVALID`] — it can never be a valid hash output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct McastId(pub u32);

impl McastId {
    pub const INVALID: McastId = McastId(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Hash an IPv4 multicast address into a `McastId`. FNV-1a avoids a
    /// zero result for any of the reserved 224.0.0.0/4 space by construction
    /// (only the all-zero address would hash to the zero seed, and that
    /// address is never a valid multicast group).
    pub fn from_ipv4(addr: [u8; 4]) -> McastId {
        let mut hash: u32 = 0x811c_9dc5;
        for b in addr {
            hash ^= b as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        if hash == 0 {
            hash = 1;
        }
        McastId(hash)
    }
}

impl fmt::Display for McastId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mcast:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_sentinels() {
        assert!(!BinId::INVALID.is_valid());
        assert!(!McastId::INVALID.is_valid());
        assert!(BinId(3).is_valid());
    }

    #[test]
    fn mcast_hash_never_zero() {
        assert!(McastId::from_ipv4([224, 77, 77, 77]).is_valid());
        assert!(McastId::from_ipv4([0, 0, 0, 0]).is_valid());
    }

    #[test]
    fn mcast_hash_deterministic() {
        let a = McastId::from_ipv4([224, 1, 1, 1]);
        let b = McastId::from_ipv4([224, 1, 1, 1]);
        assert_eq!(a, b);
    }
}
