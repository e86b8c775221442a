//! Identifier mapping: unicast-destination / interior-node / multicast-group
//! bin ids mapped onto dense indices, subnet → destination lookup, and
//! destination-bit-vector algebra.
//!
//! `BinMap` is process-wide shared state in the original (BPF and both
//! proxies observe the same view); here it is an owned, in-process
//! structure guarded by whatever the embedding daemon uses (a mutex is
//! sufficient given the very low write rate, per §9's concurrency note).

use crate::constants::{INVALID_MCAST_ID, MAX_NUM_DSTS, MAX_NUM_INT_NODES, MAX_NUM_MCAST_GROUPS};
use crate::error::{GnatError, GnatResult};
use crate::ids::{BinId, BinIndex, BinKind, McastId};
use std::collections::HashMap;

/// A `u32` bit vector of at most [`MAX_NUM_DSTS`] unicast-destination ids,
/// used to label multicast packets for per-destination progress tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DstVec(u32);

impl DstVec {
    pub const EMPTY: DstVec = DstVec(0);

    pub fn from_bits(bits: u32) -> Self {
        DstVec(bits & Self::mask())
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    fn mask() -> u32 {
        if MAX_NUM_DSTS >= 32 {
            u32::MAX
        } else {
            (1u32 << MAX_NUM_DSTS) - 1
        }
    }

    /// Set-membership test for a unicast-destination bin index.
    pub fn contains(self, dst: BinIndex) -> bool {
        dst.0 < MAX_NUM_DSTS && (self.0 & (1 << dst.0)) != 0
    }

    pub fn with(self, dst: BinIndex) -> Self {
        DstVec(self.0 | (1 << dst.0))
    }

    pub fn union(self, other: DstVec) -> DstVec {
        DstVec(self.0 | other.0)
    }

    /// `self − other`. Fails fatally if `other` is not a subset of `self`,
    /// matching the original's well-formedness requirement.
    pub fn subtract(self, other: DstVec) -> GnatResult<DstVec> {
        if other.0 & !self.0 != 0 {
            return Err(GnatError::fatal(
                "DstVec subtract: subtrahend is not a subset of the original",
            ));
        }
        Ok(DstVec(self.0 & !other.0))
    }

    pub fn popcount(self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = BinIndex> {
        let bits = self.0;
        (0..MAX_NUM_DSTS).filter_map(move |i| {
            if bits & (1 << i) != 0 {
                Some(BinIndex(i))
            } else {
                None
            }
        })
    }
}

/// A disjoint IPv4 subnet (addr/prefix_len), configured to belong to
/// exactly one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    pub addr: [u8; 4],
    pub prefix_len: u8,
}

impl Subnet {
    pub fn contains(&self, addr: [u8; 4]) -> bool {
        let mask = subnet_mask(self.prefix_len);
        to_u32(self.addr) & mask == to_u32(addr) & mask
    }
}

fn to_u32(addr: [u8; 4]) -> u32 {
    u32::from_be_bytes(addr)
}

fn subnet_mask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len.min(32))
    }
}

struct McastGroupEntry {
    id: McastId,
    members: DstVec,
    is_static: bool,
}

/// One allocated `BinIndex`'s payload, tagged by which of the three
/// disjoint namespaces it came from.
enum Slot {
    Unicast(BinId),
    Interior(BinId),
    Mcast(McastGroupEntry),
}

/// Identifier mapping across the three disjoint namespaces.
///
/// `BinIndex` is allocated from a single monotonic counter shared by all
/// three `add_*` methods below, so a unicast destination, an interior node,
/// and a multicast group can never be assigned the same index — they are
/// dense only in the sense of having no gaps across the combined space, not
/// independently 0-based per namespace.
pub struct BinMap {
    /// `BinId -> (kind, dense index)`.
    bin_to_index: HashMap<BinId, (BinKind, BinIndex)>,
    slots: Vec<Slot>,
    unicast_count: usize,
    interior_count: usize,
    mcast_count: usize,
    subnets: Vec<(Subnet, BinIndex)>,
    mcast_addr_to_index: HashMap<McastId, BinIndex>,
}

impl Default for BinMap {
    fn default() -> Self {
        Self::new()
    }
}

impl BinMap {
    pub fn new() -> Self {
        BinMap {
            bin_to_index: HashMap::new(),
            slots: Vec::new(),
            unicast_count: 0,
            interior_count: 0,
            mcast_count: 0,
            subnets: Vec::new(),
            mcast_addr_to_index: HashMap::new(),
        }
    }

    fn next_index(&self) -> BinIndex {
        BinIndex(self.slots.len())
    }

    /// Register a unicast-destination bin id with its subnets. Fails if the
    /// configured maximum is already reached, or the id is a duplicate.
    pub fn add_unicast_dst(&mut self, id: BinId, subnets: &[Subnet]) -> GnatResult<BinIndex> {
        if self.bin_to_index.contains_key(&id) {
            return Err(GnatError::fatal(format!("duplicate bin id {id}")));
        }
        if self.unicast_count >= MAX_NUM_DSTS {
            return Err(GnatError::policy_rejected(
                "unicast destination count exceeds MaxNumDsts",
            ));
        }
        let index = self.next_index();
        self.slots.push(Slot::Unicast(id));
        self.unicast_count += 1;
        self.bin_to_index.insert(id, (BinKind::UnicastDst, index));
        for subnet in subnets {
            self.subnets.push((*subnet, index));
        }
        tracing::debug!(bin_id = id.0, index = index.0, "unicast destination registered");
        Ok(index)
    }

    /// Register an interior-node bin id (no destination subnets).
    pub fn add_interior_node(&mut self, id: BinId) -> GnatResult<BinIndex> {
        if self.bin_to_index.contains_key(&id) {
            return Err(GnatError::fatal(format!("duplicate bin id {id}")));
        }
        if self.interior_count >= MAX_NUM_INT_NODES {
            return Err(GnatError::policy_rejected(
                "interior node count exceeds MaxNumIntNodes",
            ));
        }
        let index = self.next_index();
        self.slots.push(Slot::Interior(id));
        self.interior_count += 1;
        self.bin_to_index
            .insert(id, (BinKind::InteriorNode, index));
        Ok(index)
    }

    /// Register a static or dynamic multicast group, with its initial
    /// membership.
    pub fn add_mcast_group(
        &mut self,
        mcast_id: McastId,
        initial_members: DstVec,
        is_static: bool,
    ) -> GnatResult<BinIndex> {
        if self.mcast_addr_to_index.contains_key(&mcast_id) {
            return Err(GnatError::fatal(format!(
                "duplicate multicast group {mcast_id}"
            )));
        }
        if self.mcast_count >= MAX_NUM_MCAST_GROUPS {
            return Err(GnatError::policy_rejected(
                "multicast group count exceeds MaxNumMcastGroups",
            ));
        }
        let index = self.next_index();
        self.slots.push(Slot::Mcast(McastGroupEntry {
            id: mcast_id,
            members: initial_members,
            is_static,
        }));
        self.mcast_count += 1;
        self.mcast_addr_to_index.insert(mcast_id, index);
        tracing::debug!(mcast_id = %mcast_id, index = index.0, is_static, "multicast group registered");
        Ok(index)
    }

    /// Returns the destination index whose subnet covers `addr`, or the
    /// multicast index for a hashed multicast address. Subnets are assumed
    /// disjoint by configuration, so the first match wins.
    pub fn dst_index_for(&self, addr: [u8; 4]) -> Option<BinIndex> {
        if is_multicast(addr) {
            return self
                .mcast_addr_to_index
                .get(&McastId::from_ipv4(addr))
                .copied();
        }
        self.subnets
            .iter()
            .find(|(subnet, _)| subnet.contains(addr))
            .map(|(_, index)| *index)
    }

    pub fn get_mcast_dsts(&self, mcast_index: BinIndex) -> GnatResult<DstVec> {
        self.mcast_entry(mcast_index).map(|e| e.members)
    }

    pub fn add_dst_to_mcast_group(&mut self, mcast_index: BinIndex, dst: BinIndex) -> GnatResult<()> {
        let entry = self.mcast_entry_mut(mcast_index)?;
        if entry.is_static {
            return Err(GnatError::policy_rejected(
                "cannot mutate a static multicast group",
            ));
        }
        entry.members = entry.members.with(dst);
        Ok(())
    }

    pub fn remove_dst_from_mcast_group(
        &mut self,
        mcast_index: BinIndex,
        dst: BinIndex,
    ) -> GnatResult<()> {
        let entry = self.mcast_entry_mut(mcast_index)?;
        if entry.is_static {
            return Err(GnatError::policy_rejected(
                "cannot mutate a static multicast group",
            ));
        }
        if entry.members.contains(dst) {
            let removal = DstVec::EMPTY.with(dst);
            entry.members = entry.members.subtract(removal)?;
        }
        Ok(())
    }

    /// Purge a destination from every multicast group, including static
    /// ones — the one mutator the original allows on static groups.
    pub fn purge_dst_from_mcast_groups(&mut self, dst: BinIndex) {
        for slot in &mut self.slots {
            if let Slot::Mcast(entry) = slot {
                if entry.members.contains(dst) {
                    let removal = DstVec::EMPTY.with(dst);
                    entry.members = entry
                        .members
                        .subtract(removal)
                        .expect("dst was just observed present");
                }
            }
        }
    }

    fn mcast_entry(&self, index: BinIndex) -> GnatResult<&McastGroupEntry> {
        match self.slots.get(index.0) {
            Some(Slot::Mcast(entry)) => Ok(entry),
            _ => Err(GnatError::policy_rejected("unknown multicast index")),
        }
    }

    fn mcast_entry_mut(&mut self, index: BinIndex) -> GnatResult<&mut McastGroupEntry> {
        match self.slots.get_mut(index.0) {
            Some(Slot::Mcast(entry)) => Ok(entry),
            _ => Err(GnatError::policy_rejected("unknown multicast index")),
        }
    }

    pub fn bin_id_to_index(&self, id: BinId) -> Option<(BinKind, BinIndex)> {
        self.bin_to_index.get(&id).copied()
    }

    /// Reverse of [`Self::bin_id_to_index`] for a unicast destination or
    /// interior node: the externally-visible label a transit wire envelope
    /// carries across a hop, since `BinIndex` is node-local and not
    /// portable between `BinMap`s. Multicast groups have no `BinId` of
    /// their own (they are identified by [`McastId`] — see
    /// [`Self::get_mcast_dsts`]), so this always returns `None` for
    /// [`BinKind::McastGroup`].
    pub fn index_to_bin_id(&self, kind: BinKind, index: BinIndex) -> Option<BinId> {
        match (kind, self.slots.get(index.0)) {
            (BinKind::UnicastDst, Some(Slot::Unicast(id))) => Some(*id),
            (BinKind::InteriorNode, Some(Slot::Interior(id))) => Some(*id),
            _ => None,
        }
    }

    pub fn num_unicast_dsts(&self) -> usize {
        self.unicast_count
    }

    pub fn num_interior_nodes(&self) -> usize {
        self.interior_count
    }

    pub fn num_mcast_groups(&self) -> usize {
        self.mcast_count
    }
}

fn is_multicast(addr: [u8; 4]) -> bool {
    (224..=239).contains(&addr[0])
}

impl McastId {
    /// The invalid sentinel is never a valid hash output (see
    /// [`McastId::from_ipv4`]); exposed here for symmetry with the
    /// constants module.
    pub fn invalid() -> McastId {
        McastId(INVALID_MCAST_ID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dst_vec_membership_and_union() {
        let v = DstVec::EMPTY.with(BinIndex(2)).with(BinIndex(5));
        assert!(v.contains(BinIndex(2)));
        assert!(!v.contains(BinIndex(3)));
        assert_eq!(v.popcount(), 2);

        let other = DstVec::EMPTY.with(BinIndex(7));
        let u = v.union(other);
        assert!(u.contains(BinIndex(2)) && u.contains(BinIndex(5)) && u.contains(BinIndex(7)));
    }

    #[test]
    fn dst_vec_subtract_well_formed() {
        let v = DstVec::EMPTY.with(BinIndex(1)).with(BinIndex(2));
        let sub = DstVec::EMPTY.with(BinIndex(1));
        let rest = v.subtract(sub).unwrap();
        assert!(!rest.contains(BinIndex(1)));
        assert!(rest.contains(BinIndex(2)));
    }

    #[test]
    fn dst_vec_subtract_not_subset_is_fatal() {
        let v = DstVec::EMPTY.with(BinIndex(1));
        let sub = DstVec::EMPTY.with(BinIndex(1)).with(BinIndex(9));
        let err = v.subtract(sub).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn dst_vec_add_then_remove_roundtrips() {
        let base = DstVec::EMPTY.with(BinIndex(3));
        let added = base.with(BinIndex(9));
        let removed = added.subtract(DstVec::EMPTY.with(BinIndex(9))).unwrap();
        assert_eq!(removed, base);
    }

    #[test]
    fn add_unicast_dst_respects_max() {
        let mut map = BinMap::new();
        for i in 0..MAX_NUM_DSTS as u8 {
            map.add_unicast_dst(BinId(i), &[]).unwrap();
        }
        let err = map.add_unicast_dst(BinId(200), &[]).unwrap_err();
        assert!(matches!(err, GnatError::PolicyRejected(_)));
    }

    #[test]
    fn duplicate_bin_id_is_fatal() {
        let mut map = BinMap::new();
        map.add_unicast_dst(BinId(1), &[]).unwrap();
        let err = map.add_interior_node(BinId(1)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn indices_are_unique_across_the_three_namespaces() {
        let mut map = BinMap::new();
        let unicast = map.add_unicast_dst(BinId(10), &[]).unwrap();
        let interior = map.add_interior_node(BinId(20)).unwrap();
        let mcast = map
            .add_mcast_group(McastId(30), DstVec::EMPTY, false)
            .unwrap();

        assert_ne!(unicast, interior);
        assert_ne!(unicast, mcast);
        assert_ne!(interior, mcast);

        assert_eq!(
            map.index_to_bin_id(BinKind::UnicastDst, unicast),
            Some(BinId(10))
        );
        assert_eq!(
            map.index_to_bin_id(BinKind::InteriorNode, interior),
            Some(BinId(20))
        );
        assert_eq!(map.index_to_bin_id(BinKind::UnicastDst, interior), None);
        assert_eq!(map.get_mcast_dsts(mcast).unwrap(), DstVec::EMPTY);
    }

    #[test]
    fn dst_index_for_subnet_lookup() {
        let mut map = BinMap::new();
        let idx = map
            .add_unicast_dst(
                BinId(0),
                &[Subnet {
                    addr: [10, 0, 0, 0],
                    prefix_len: 24,
                }],
            )
            .unwrap();
        assert_eq!(map.dst_index_for([10, 0, 0, 42]), Some(idx));
        assert_eq!(map.dst_index_for([10, 1, 0, 42]), None);
    }

    #[test]
    fn mcast_group_mutators_fail_on_static_except_purge() {
        let mut map = BinMap::new();
        let d0 = map.add_unicast_dst(BinId(0), &[]).unwrap();
        let d1 = map.add_unicast_dst(BinId(1), &[]).unwrap();
        let g = map
            .add_mcast_group(McastId(42), DstVec::EMPTY.with(d0), true)
            .unwrap();

        let err = map.add_dst_to_mcast_group(g, d1).unwrap_err();
        assert!(matches!(err, GnatError::PolicyRejected(_)));

        map.purge_dst_from_mcast_groups(d0);
        assert!(!map.get_mcast_dsts(g).unwrap().contains(d0));
    }

    #[test]
    fn mcast_group_dynamic_mutators_succeed() {
        let mut map = BinMap::new();
        let d0 = map.add_unicast_dst(BinId(0), &[]).unwrap();
        let d1 = map.add_unicast_dst(BinId(1), &[]).unwrap();
        let g = map
            .add_mcast_group(McastId(7), DstVec::EMPTY.with(d0), false)
            .unwrap();

        map.add_dst_to_mcast_group(g, d1).unwrap();
        assert!(map.get_mcast_dsts(g).unwrap().contains(d1));

        map.remove_dst_from_mcast_group(g, d1).unwrap();
        assert!(!map.get_mcast_dsts(g).unwrap().contains(d1));
    }

    #[test]
    fn mcast_group_exceeding_max_is_policy_rejected() {
        let mut map = BinMap::new();
        for i in 0..MAX_NUM_MCAST_GROUPS as u32 {
            map.add_mcast_group(McastId(i + 1), DstVec::EMPTY, false)
                .unwrap();
        }
        let err = map
            .add_mcast_group(McastId(9999), DstVec::EMPTY, false)
            .unwrap_err();
        assert!(matches!(err, GnatError::PolicyRejected(_)));
    }
}
