//! The BPF's view of its neighbors' advertised queue depths, built from
//! accepted QLAMs (§4.3).
//!
//! Reception policy: a QLAM with `seq_num` no greater than the last
//! accepted one from that neighbor is stale and discarded, counted but not
//! acted on. An accepted QLAM replaces the neighbor's view for exactly the
//! destinations it enumerates; destinations it omits keep their prior
//! value until the neighbor times out (`purge_neighbor`, on peer absence).

use gnat_common::BinIndex;
use gnat_wire::qlam::Qlam;
use std::collections::HashMap;

/// Per-neighbor, per-destination queue depths as last advertised by QLAM.
#[derive(Debug, Default)]
pub struct QlamView {
    last_seq: HashMap<BinIndex, u32>,
    depths: HashMap<BinIndex, HashMap<BinIndex, u32>>,
    ls_depths: HashMap<BinIndex, HashMap<BinIndex, u32>>,
    stale_count: u64,
}

impl QlamView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to accept a QLAM from `neighbor`. `bin_id_to_index` resolves a
    /// wire `DstBinId`/group id to the local dense index space. Returns
    /// `true` if accepted, `false` if stale (and the staleness counter is
    /// bumped).
    pub fn accept(
        &mut self,
        neighbor: BinIndex,
        qlam: &Qlam,
        bin_id_to_index: impl Fn(u8) -> Option<BinIndex>,
    ) -> bool {
        if let Some(&last) = self.last_seq.get(&neighbor) {
            if qlam.seq_num <= last {
                self.stale_count += 1;
                return false;
            }
        }
        self.last_seq.insert(neighbor, qlam.seq_num);

        let depths = self.depths.entry(neighbor).or_default();
        let ls_depths = self.ls_depths.entry(neighbor).or_default();
        for group in &qlam.groups {
            for pair in &group.pairs {
                if let Some(dst) = bin_id_to_index(pair.dst_bin_id) {
                    depths.insert(dst, pair.queue_depth_bytes);
                    ls_depths.insert(dst, pair.ls_queue_depth_bytes);
                }
            }
        }
        true
    }

    /// The queue depth `neighbor` last advertised for `dest`, or 0 if
    /// never reported — a fresh neighbor is assumed empty, not infinitely
    /// deep, so the gradient starts unbiased.
    pub fn depth_for(&self, neighbor: BinIndex, dest: BinIndex) -> u32 {
        self.depths
            .get(&neighbor)
            .and_then(|by_dest| by_dest.get(&dest))
            .copied()
            .unwrap_or(0)
    }

    pub fn ls_depth_for(&self, neighbor: BinIndex, dest: BinIndex) -> u32 {
        self.ls_depths
            .get(&neighbor)
            .and_then(|by_dest| by_dest.get(&dest))
            .copied()
            .unwrap_or(0)
    }

    pub fn stale_count(&self) -> u64 {
        self.stale_count
    }

    /// Peer-absence handling: drop a neighbor's view entirely, treating it
    /// as infinitely deep (never selected) until a fresh QLAM arrives.
    pub fn purge_neighbor(&mut self, neighbor: BinIndex) {
        self.last_seq.remove(&neighbor);
        self.depths.remove(&neighbor);
        self.ls_depths.remove(&neighbor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gnat_wire::qlam::{QlamDepthPair, QlamGroup};

    fn qlam(seq: u32, dst: u8, depth: u32) -> Qlam {
        Qlam {
            src_bin_id: 9,
            seq_num: seq,
            groups: vec![QlamGroup {
                group_id: 0,
                pairs: vec![QlamDepthPair {
                    dst_bin_id: dst,
                    queue_depth_bytes: depth,
                    ls_queue_depth_bytes: 0,
                }],
            }],
        }
    }

    fn id_fn(n: u8) -> Option<BinIndex> {
        Some(BinIndex(n as usize))
    }

    #[test]
    fn fresh_neighbor_reads_zero() {
        let view = QlamView::new();
        assert_eq!(view.depth_for(BinIndex(1), BinIndex(2)), 0);
    }

    #[test]
    fn accepts_strictly_increasing_sequence() {
        let mut view = QlamView::new();
        assert!(view.accept(BinIndex(1), &qlam(1, 2, 1000), id_fn));
        assert_eq!(view.depth_for(BinIndex(1), BinIndex(2)), 1000);
        assert!(view.accept(BinIndex(1), &qlam(2, 2, 500), id_fn));
        assert_eq!(view.depth_for(BinIndex(1), BinIndex(2)), 500);
    }

    #[test]
    fn stale_sequence_is_discarded_and_counted() {
        let mut view = QlamView::new();
        view.accept(BinIndex(1), &qlam(5, 2, 1000), id_fn);
        let accepted = view.accept(BinIndex(1), &qlam(5, 2, 9999), id_fn);
        assert!(!accepted);
        assert_eq!(view.depth_for(BinIndex(1), BinIndex(2)), 1000);
        assert_eq!(view.stale_count(), 1);
    }

    #[test]
    fn omitted_destinations_retain_prior_value() {
        let mut view = QlamView::new();
        view.accept(BinIndex(1), &qlam(1, 2, 1000), id_fn);
        // A later QLAM that only mentions destination 3 should not clobber 2.
        let mut q2 = qlam(2, 3, 50);
        q2.groups[0].pairs[0].dst_bin_id = 3;
        view.accept(BinIndex(1), &q2, id_fn);
        assert_eq!(view.depth_for(BinIndex(1), BinIndex(2)), 1000);
        assert_eq!(view.depth_for(BinIndex(1), BinIndex(3)), 50);
    }

    #[test]
    fn purge_neighbor_clears_its_view() {
        let mut view = QlamView::new();
        view.accept(BinIndex(1), &qlam(1, 2, 1000), id_fn);
        view.purge_neighbor(BinIndex(1));
        assert_eq!(view.depth_for(BinIndex(1), BinIndex(2)), 0);
    }
}
