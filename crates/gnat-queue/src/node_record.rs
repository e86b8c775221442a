//! Per-neighbor link state, as populated from received LSAs.
//!
//! One [`NodeRecord`] per remote bin-index: the queue delay the neighbor
//! last advertised for a destination, its mean/variance link latency, and
//! its advertised link capacity. [`NodeRecordTable`] is the BPF's whole
//! view of the network, keyed by [`gnat_common::BinIndex`].

use gnat_common::BinIndex;
use std::collections::HashMap;

/// Everything a BPF instance knows about one neighbor, refreshed on every
/// LSA it receives from that neighbor.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeRecord {
    /// Mean link latency to this neighbor, microseconds.
    pub latency_mean_us: f64,
    /// Link latency standard deviation, microseconds.
    pub latency_stddev_us: f64,
    /// Advertised link capacity, bits/s, if the neighbor includes it.
    pub capacity_bps: Option<f64>,
    /// Last-known queue delay this neighbor reported, per destination —
    /// looked up by destination bin-index in the table, not stored here;
    /// this field holds the most recent single-destination sample used by
    /// callers that track one destination at a time (e.g. a test probe).
    pub last_queue_delay_us: Option<u32>,
}

/// All [`NodeRecord`]s known to a BPF instance, one per remote bin-index,
/// plus the per-destination queue-delay table each neighbor advertises.
#[derive(Debug, Default)]
pub struct NodeRecordTable {
    neighbors: HashMap<BinIndex, NodeRecord>,
    /// neighbor index -> (destination index -> queue delay, us)
    queue_delays: HashMap<BinIndex, HashMap<BinIndex, u32>>,
}

impl NodeRecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an LSA's neighbor-latency fields for `neighbor`.
    pub fn update_neighbor(
        &mut self,
        neighbor: BinIndex,
        latency_mean_us: f64,
        latency_stddev_us: f64,
        capacity_bps: Option<f64>,
    ) {
        let record = self.neighbors.entry(neighbor).or_default();
        record.latency_mean_us = latency_mean_us;
        record.latency_stddev_us = latency_stddev_us;
        if capacity_bps.is_some() {
            record.capacity_bps = capacity_bps;
        }
    }

    /// Record an LSA's queue-delay advertisement: `neighbor` reports
    /// `queue_delay_us` of queueing depth for packets bound to `dest`.
    pub fn update_queue_delay(&mut self, neighbor: BinIndex, dest: BinIndex, queue_delay_us: u32) {
        self.queue_delays
            .entry(neighbor)
            .or_default()
            .insert(dest, queue_delay_us);
        if let Some(record) = self.neighbors.get_mut(&neighbor) {
            record.last_queue_delay_us = Some(queue_delay_us);
        }
    }

    pub fn get(&self, neighbor: BinIndex) -> Option<&NodeRecord> {
        self.neighbors.get(&neighbor)
    }

    /// The queue depth `neighbor` last advertised for `dest`, or 0 if none
    /// has ever been reported (a fresh neighbor is assumed empty, not
    /// infinitely deep, so the forwarding gradient starts unbiased).
    pub fn queue_delay_for(&self, neighbor: BinIndex, dest: BinIndex) -> u32 {
        self.queue_delays
            .get(&neighbor)
            .and_then(|by_dest| by_dest.get(&dest))
            .copied()
            .unwrap_or(0)
    }

    pub fn capacity_bps(&self, neighbor: BinIndex) -> Option<f64> {
        self.neighbors.get(&neighbor).and_then(|r| r.capacity_bps)
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbors.len()
    }

    pub fn neighbors(&self) -> impl Iterator<Item = (&BinIndex, &NodeRecord)> {
        self.neighbors.iter()
    }

    /// Drop all state for a neighbor, e.g. on link-down detection.
    pub fn remove_neighbor(&mut self, neighbor: BinIndex) {
        self.neighbors.remove(&neighbor);
        self.queue_delays.remove(&neighbor);
    }
}
