//! `BpfLoop`: the top-level single-threaded event loop (§4.6) tying FIFOs,
//! path controllers, the forwarding algorithm, and timers together.

use crate::forwarding::{ForwardingAlg, NeighborCandidate};
use crate::path::{PathController, ReliabilityMode, StreamKind};
use crate::qlam_view::QlamView;
use bytes::Bytes;
use gnat_common::{BinIndex, BinMap, GnatError, GnatResult};
use gnat_queue::{BinQueueMgr, LatencyClass, NodeRecordTable, Packet};
use gnat_wire::gram::{Gram, GramAction};
use gnat_wire::lsa::{Lsa, LsaNeighbor, LsaQueueDelay};
use gnat_wire::qlam::Qlam;
use std::collections::HashMap;

/// One packet pulled from a UDP→BPF or TCP→BPF shared-memory FIFO: payload
/// plus enough to classify it by destination. The FIFO itself (shared
/// memory, ring buffer layout) is the external collaborator this crate
/// only consumes through the [`ProxyFifo`] contract.
#[derive(Debug, Clone)]
pub struct FifoPacket {
    pub payload: Bytes,
    pub dst_addr: [u8; 4],
    pub ttg_us: i64,
}

/// A source of application packets admitted by a UDP or TCP proxy.
pub trait ProxyFifo {
    fn recv(&mut self) -> Option<FifoPacket>;
}

/// Where a data packet destined to this node is delivered once the
/// forwarding layer recognizes it as a local destination rather than a
/// transit hop.
pub trait LocalDelivery {
    fn deliver(&mut self, dest: BinIndex, payload: Bytes);
}

/// Per-neighbor and global timer state driving QLAM/LSA emission, stats
/// pushes, and the queue-depth shared-memory copy (§4.6 step 4).
#[derive(Debug, Clone)]
pub struct Timers {
    pub qlam_interval_us: u64,
    pub lsa_holddown_us: u64,
    pub stats_push_interval_us: u64,
    pub qd_update_interval_us: u64,
    last_qlam_send_us: HashMap<BinIndex, u64>,
    last_lsa_send_us: u64,
    last_stats_push_us: u64,
    last_qd_update_us: u64,
    lsa_pending: bool,
}

impl Timers {
    pub fn new(
        qlam_interval_us: u64,
        lsa_holddown_us: u64,
        stats_push_interval_us: u64,
        qd_update_interval_us: u64,
    ) -> Self {
        Timers {
            qlam_interval_us,
            lsa_holddown_us,
            stats_push_interval_us,
            qd_update_interval_us,
            last_qlam_send_us: HashMap::new(),
            last_lsa_send_us: 0,
            last_stats_push_us: 0,
            last_qd_update_us: 0,
            lsa_pending: false,
        }
    }

    /// A neighbor never sent before is always due, so every newly added
    /// neighbor gets its first QLAM on the next tick rather than waiting a
    /// full interval.
    fn qlam_due(&mut self, neighbor: BinIndex, now_us: u64) -> bool {
        match self.last_qlam_send_us.get(&neighbor).copied() {
            Some(last) if now_us.saturating_sub(last) < self.qlam_interval_us => false,
            _ => {
                self.last_qlam_send_us.insert(neighbor, now_us);
                true
            }
        }
    }

    /// Mark that local topology changed and an LSA rebroadcast is owed,
    /// subject to the hold-down interval dampening storms.
    pub fn request_lsa_broadcast(&mut self) {
        self.lsa_pending = true;
    }

    fn lsa_due(&mut self, now_us: u64) -> bool {
        if self.lsa_pending && now_us.saturating_sub(self.last_lsa_send_us) >= self.lsa_holddown_us
        {
            self.last_lsa_send_us = now_us;
            self.lsa_pending = false;
            true
        } else {
            false
        }
    }

    fn stats_push_due(&mut self, now_us: u64) -> bool {
        if now_us.saturating_sub(self.last_stats_push_us) >= self.stats_push_interval_us {
            self.last_stats_push_us = now_us;
            true
        } else {
            false
        }
    }

    fn qd_update_due(&mut self, now_us: u64) -> bool {
        if now_us.saturating_sub(self.last_qd_update_us) >= self.qd_update_interval_us {
            self.last_qd_update_us = now_us;
            true
        } else {
            false
        }
    }
}

/// Summarizes one `tick()` call for the owning harness (log lines, test
/// assertions) without forcing it to re-derive counts from side effects.
#[derive(Debug, Default)]
pub struct TickReport {
    pub packets_enqueued: usize,
    pub packets_forwarded: usize,
    pub packets_delivered_locally: usize,
    pub qlams_sent: usize,
    pub lsas_sent: usize,
    pub stale_qlams: u64,
    pub bytes_dropped: u32,
}

struct Neighbor {
    path: Box<dyn PathController>,
    next_qlam_seq: u32,
}

/// The backpressure forwarder's top-level loop. Owns the per-destination
/// queues, the forwarding algorithm, the neighbor path controllers, and the
/// link-state/queue-advertisement bookkeeping; driven by repeated `tick()`
/// calls rather than an owned thread (§5).
pub struct BpfLoop {
    bin_map: BinMap,
    queues: HashMap<BinIndex, BinQueueMgr>,
    neighbors: HashMap<BinIndex, Neighbor>,
    qlam_view: QlamView,
    node_records: NodeRecordTable,
    alg: ForwardingAlg,
    timers: Timers,
    local_bin: BinIndex,
    max_pkts_per_fifo_recv: usize,
    /// Last-seen LSA sequence number per originating `BinId`, so a flooded
    /// LSA is relayed at most once per freshness step instead of looping
    /// forever around a cycle — the same staleness test `QlamView` applies
    /// per neighbor, applied here per flood originator.
    seen_lsa_seq: HashMap<u8, u16>,
    /// Sequence number stamped on this node's own next LSA broadcast, one
    /// global counter shared by every neighbor rather than per-neighbor —
    /// all neighbors receive the identical LSA content on a given send.
    next_lsa_seq: u16,
}

impl BpfLoop {
    pub fn new(bin_map: BinMap, local_bin: BinIndex, alg: ForwardingAlg, timers: Timers) -> Self {
        BpfLoop {
            bin_map,
            queues: HashMap::new(),
            neighbors: HashMap::new(),
            qlam_view: QlamView::new(),
            node_records: NodeRecordTable::new(),
            alg,
            timers,
            local_bin,
            max_pkts_per_fifo_recv: 256,
            seen_lsa_seq: HashMap::new(),
            next_lsa_seq: 1,
        }
    }

    pub fn set_max_pkts_per_fifo_recv(&mut self, n: usize) {
        self.max_pkts_per_fifo_recv = n;
    }

    pub fn add_neighbor(&mut self, neighbor: BinIndex, path: Box<dyn PathController>) {
        self.neighbors.insert(neighbor, Neighbor { path, next_qlam_seq: 1 });
        self.timers.request_lsa_broadcast();
        tracing::debug!(neighbor = %neighbor, "neighbor added");
    }

    /// Mark local topology as changed, subject to the LSA holddown (§4.6
    /// step 2). Neighbor add/remove already call this; exposed directly
    /// for link-characteristic changes detected elsewhere (e.g. a capacity
    /// estimate update from a path controller).
    pub fn notify_topology_changed(&mut self) {
        self.timers.request_lsa_broadcast();
    }

    /// Reach a neighbor's path controller directly — a sim harness's
    /// "cable" step needs this to drain a `MockPathController`'s outbox and
    /// deliver it to the peer, which is outside the `tick()` contract.
    pub fn neighbor_path_mut(&mut self, neighbor: BinIndex) -> Option<&mut dyn PathController> {
        self.neighbors.get_mut(&neighbor).map(|nbr| nbr.path.as_mut())
    }

    pub fn remove_neighbor(&mut self, neighbor: BinIndex) {
        self.neighbors.remove(&neighbor);
        self.qlam_view.purge_neighbor(neighbor);
        self.node_records.remove_neighbor(neighbor);
        self.timers.request_lsa_broadcast();
        tracing::info!(neighbor = %neighbor, "neighbor removed");
    }

    pub fn bin_map(&self) -> &BinMap {
        &self.bin_map
    }

    pub fn bin_map_mut(&mut self) -> &mut BinMap {
        &mut self.bin_map
    }

    pub fn node_records(&self) -> &NodeRecordTable {
        &self.node_records
    }

    pub fn queue_depth_bytes(&self, dest: BinIndex) -> u64 {
        self.queues.get(&dest).map(|q| q.depth_bytes()).unwrap_or(0)
    }

    /// Run one iteration of the event loop: drain FIFOs, drain path
    /// controllers, run the forwarding algorithm, fire due timers.
    pub fn tick(
        &mut self,
        fifos: &mut [&mut dyn ProxyFifo],
        local: &mut dyn LocalDelivery,
        now_us: u64,
    ) -> GnatResult<TickReport> {
        let mut report = TickReport::default();

        self.drain_fifos(fifos, now_us, &mut report);
        self.drain_path_controllers(local, now_us, &mut report)?;
        self.run_forwarding(now_us, &mut report)?;
        self.fire_timers(now_us, &mut report)?;

        Ok(report)
    }

    fn drain_fifos(
        &mut self,
        fifos: &mut [&mut dyn ProxyFifo],
        now_us: u64,
        report: &mut TickReport,
    ) {
        for fifo in fifos.iter_mut() {
            for _ in 0..self.max_pkts_per_fifo_recv {
                let Some(incoming) = fifo.recv() else {
                    break;
                };
                let Some(dest) = self.bin_map.dst_index_for(incoming.dst_addr) else {
                    continue; // unroutable: no subnet or multicast group match
                };
                let pkt = Packet::new(incoming.payload, now_us, incoming.ttg_us);
                let queue = self.queues.entry(dest).or_insert_with(|| BinQueueMgr::new(16 * 1024 * 1024));
                queue.enqueue(pkt, LatencyClass::HighLatencyNormal, now_us);
                report.packets_enqueued += 1;
            }
        }
    }

    fn drain_path_controllers(
        &mut self,
        local: &mut dyn LocalDelivery,
        now_us: u64,
        report: &mut TickReport,
    ) -> GnatResult<()> {
        let neighbor_ids: Vec<BinIndex> = self.neighbors.keys().copied().collect();
        for neighbor in neighbor_ids {
            loop {
                let received = {
                    let Some(nbr) = self.neighbors.get_mut(&neighbor) else {
                        break;
                    };
                    nbr.path.recv()
                };
                let Some((stream, mut bytes)) = received else {
                    break;
                };
                match stream {
                    StreamKind::Qlam => {
                        let qlam = Qlam::decode(&mut bytes)?;
                        let bin_map = &self.bin_map;
                        let accepted = self.qlam_view.accept(neighbor, &qlam, |id| {
                            bin_map.bin_id_to_index(gnat_common::BinId(id)).map(|(_, idx)| idx)
                        });
                        if !accepted {
                            report.stale_qlams = self.qlam_view.stale_count();
                            tracing::debug!(neighbor = %neighbor, seq = qlam.seq_num, "stale qlam discarded");
                        }
                    }
                    StreamKind::Control => {
                        let mut for_lsa = bytes.clone();
                        if let Ok(lsa) = Lsa::decode(&mut for_lsa) {
                            self.handle_lsa(neighbor, lsa);
                        } else if let Ok(gram) = Gram::decode(&mut bytes) {
                            self.handle_gram(neighbor, gram);
                        }
                    }
                    StreamKind::EfData | StreamKind::NonEfData => {
                        self.handle_data(neighbor, bytes, local, now_us, report);
                    }
                    StreamKind::CapacityEstimate => {}
                }
            }
        }
        Ok(())
    }

    /// Apply a received LSA's link-state fields to [`NodeRecordTable`], then
    /// flood it on to every other neighbor so a change reported anywhere in
    /// the topology reaches every node, not just the immediate sender —
    /// the same cross-neighbor relay [`Self::handle_gram`] already does for
    /// group membership, gated here by sequence number per originator
    /// rather than per hop, so a stale or duplicate flood dies out instead
    /// of looping.
    fn handle_lsa(&mut self, from: BinIndex, lsa: Lsa) {
        if let Some(&last) = self.seen_lsa_seq.get(&lsa.src_bin_id) {
            if lsa.seq_num <= last {
                return;
            }
        }
        self.seen_lsa_seq.insert(lsa.src_bin_id, lsa.seq_num);
        tracing::debug!(src = lsa.src_bin_id, seq = lsa.seq_num, "relaying lsa flood");

        for nbr in &lsa.neighbors {
            let Some((_, idx)) = self.bin_map.bin_id_to_index(gnat_common::BinId(nbr.bin_id)) else {
                continue;
            };
            self.node_records.update_neighbor(
                idx,
                nbr.latency_mean_100us as f64 * 100.0,
                nbr.latency_stddev_100us as f64 * 100.0,
                nbr.capacity_bps,
            );
        }
        for qd in &lsa.queue_delays {
            let Some((_, idx)) = self.bin_map.bin_id_to_index(gnat_common::BinId(qd.bin_id)) else {
                continue;
            };
            self.node_records.update_queue_delay(from, idx, qd.queue_delay_us);
        }
        self.timers.request_lsa_broadcast();

        if let Ok(encoded) = lsa.encode() {
            for (idx, nbr) in self.neighbors.iter_mut() {
                if *idx == from {
                    continue;
                }
                let _ = nbr.path.send(encoded.clone(), StreamKind::Control, ReliabilityMode::BestEffort, None);
            }
        }
    }

    fn handle_gram(&mut self, from: BinIndex, gram: Gram) {
        let addr = gram.mcast_addr.to_be_bytes();
        if let Some(group_idx) = self.bin_map.dst_index_for(addr) {
            match gram.action {
                GramAction::Join => {
                    // Membership at the per-destination granularity is the
                    // source bin reported in the GRAM itself.
                    if let Some((_, src_idx)) =
                        self.bin_map.bin_id_to_index(gnat_common::BinId(gram.src_bin_id))
                    {
                        let _ = self.bin_map.add_dst_to_mcast_group(group_idx, src_idx);
                    }
                }
                GramAction::Leave => {
                    if let Some((_, src_idx)) =
                        self.bin_map.bin_id_to_index(gnat_common::BinId(gram.src_bin_id))
                    {
                        let _ = self.bin_map.remove_dst_from_mcast_group(group_idx, src_idx);
                    }
                }
            }
        }
        // Re-broadcast to every other neighbor (not the sender).
        let encoded = gram.encode();
        for (idx, nbr) in self.neighbors.iter_mut() {
            if *idx == from {
                continue;
            }
            let _ = nbr.path.send(encoded.clone(), StreamKind::Control, ReliabilityMode::BestEffort, None);
        }
    }

    /// `payload`'s first byte is the destination's unicast `BinId` (the
    /// minimal envelope a transit data stream needs — `BinId` rather than
    /// a raw IPv4 address, since it's what QLAM/LSA already use to name a
    /// destination portably across a hop); the remainder is the
    /// application payload handed to the local proxy or re-enqueued as-is.
    /// Multicast transit replication across a hop is out of scope here —
    /// see `gnat-sim`'s multicast scenario, which exercises the queue and
    /// forwarding layers directly instead.
    fn handle_data(
        &mut self,
        _from: BinIndex,
        payload: Bytes,
        local: &mut dyn LocalDelivery,
        now_us: u64,
        report: &mut TickReport,
    ) {
        if payload.is_empty() {
            return;
        }
        let dst_bin_id = gnat_common::BinId(payload[0]);
        let body = payload.slice(1..);
        let Some((gnat_common::BinKind::UnicastDst, dest)) = self.bin_map.bin_id_to_index(dst_bin_id) else {
            tracing::debug!(bin_id = dst_bin_id.0, "unroutable data packet dropped");
            return; // unknown or non-unicast destination: unroutable
        };
        if dest == self.local_bin {
            local.deliver(dest, body);
            report.packets_delivered_locally += 1;
            return;
        }
        let queue = self
            .queues
            .entry(dest)
            .or_insert_with(|| BinQueueMgr::new(16 * 1024 * 1024));
        queue.enqueue(
            Packet::new(body, now_us, gnat_queue::TTG_UNSET),
            LatencyClass::HighLatencyNormal,
            now_us,
        );
        report.packets_enqueued += 1;
    }

    fn run_forwarding(&mut self, _now_us: u64, report: &mut TickReport) -> GnatResult<()> {
        let candidates: Vec<NeighborCandidate> = self
            .neighbors
            .iter()
            .filter(|(_, nbr)| {
                nbr.path.transmit_buffer_depth_bytes() < free_threshold_bytes()
            })
            .map(|(idx, nbr)| {
                let (mean, var) = nbr.path.packet_delivery_delay();
                NeighborCandidate {
                    neighbor: *idx,
                    ttr_mean_us: mean,
                    ttr_stddev_us: var.sqrt(),
                    hop_bias_bytes: 0,
                }
            })
            .collect();

        let solutions = self
            .alg
            .find_next_transmission(&mut self.queues, &candidates, &self.qlam_view);

        for solution in solutions {
            let Some(nbr) = self.neighbors.get_mut(&solution.neighbor) else {
                continue; // neighbor departed mid-tick; packet is simply lost from this cycle
            };
            let stream = if solution.packet.payload.is_empty() {
                StreamKind::NonEfData
            } else {
                StreamKind::EfData
            };
            let ttg = if solution.packet.has_ttg() {
                Some(solution.packet.ttg_us)
            } else {
                None
            };
            // Stamp the destination's portable BinId onto the wire
            // envelope for unicast traffic so the next hop's `handle_data`
            // can route it without a shared BinIndex space. Multicast
            // transit (no BinId of its own) is sent unstamped, matching
            // the existing queue-level-only multicast coverage.
            let wire_payload = match self
                .bin_map
                .index_to_bin_id(gnat_common::BinKind::UnicastDst, solution.destination)
            {
                Some(bin_id) => {
                    let mut buf = bytes::BytesMut::with_capacity(solution.packet.payload.len() + 1);
                    buf.extend_from_slice(&[bin_id.0]);
                    buf.extend_from_slice(&solution.packet.payload);
                    buf.freeze()
                }
                None => solution.packet.payload.clone(),
            };
            match nbr.path.send(wire_payload, stream, ReliabilityMode::Reliable, ttg) {
                Ok(_) => report.packets_forwarded += 1,
                Err(GnatError::Transient(_)) => {
                    tracing::debug!(neighbor = %solution.neighbor, "transient send failure, retrying next tick");
                }
                Err(e) => {
                    tracing::warn!(neighbor = %solution.neighbor, error = %e, "forwarding send failed");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn fire_timers(&mut self, now_us: u64, report: &mut TickReport) -> GnatResult<()> {
        let neighbor_ids: Vec<BinIndex> = self.neighbors.keys().copied().collect();
        for neighbor in neighbor_ids {
            if !self.timers.qlam_due(neighbor, now_us) {
                continue;
            }
            let seq = match self.neighbors.get(&neighbor) {
                Some(nbr) => nbr.next_qlam_seq,
                None => continue,
            };
            let qlam = self.build_qlam(neighbor, seq);
            let encoded = qlam.encode();
            if let Some(nbr) = self.neighbors.get_mut(&neighbor) {
                nbr.next_qlam_seq = nbr.next_qlam_seq.wrapping_add(1);
                let _ = nbr
                    .path
                    .send(encoded, StreamKind::Qlam, ReliabilityMode::BestEffort, None);
                report.qlams_sent += 1;
            }
        }

        if self.timers.lsa_due(now_us) {
            let seq = self.next_lsa_seq;
            self.next_lsa_seq = self.next_lsa_seq.wrapping_add(1);
            self.seen_lsa_seq.insert(self.local_bin.0 as u8, seq);
            let lsa = self.build_lsa(seq);
            let encoded = lsa.encode()?;
            for nbr in self.neighbors.values_mut() {
                let _ = nbr.path.send(
                    encoded.clone(),
                    StreamKind::Control,
                    ReliabilityMode::BestEffort,
                    None,
                );
            }
            report.lsas_sent = self.neighbors.len();
        }

        let _ = self.timers.stats_push_due(now_us);
        let _ = self.timers.qd_update_due(now_us);

        Ok(())
    }

    fn build_qlam(&self, _to: BinIndex, seq_num: u32) -> Qlam {
        let mut pairs = Vec::new();
        for (dest, queue) in &self.queues {
            pairs.push(gnat_wire::qlam::QlamDepthPair {
                dst_bin_id: dest.0 as u8,
                queue_depth_bytes: queue.depth_bytes().min(u32::MAX as u64) as u32,
                ls_queue_depth_bytes: queue.ls_depth_bytes().min(u32::MAX as u64) as u32,
            });
        }
        Qlam {
            src_bin_id: self.local_bin.0 as u8,
            seq_num,
            groups: vec![gnat_wire::qlam::QlamGroup { group_id: 0, pairs }],
        }
    }

    fn build_lsa(&self, seq_num: u16) -> Lsa {
        let neighbors = self
            .neighbors
            .keys()
            .map(|idx| LsaNeighbor {
                bin_id: idx.0 as u8,
                latency_mean_100us: 0,
                latency_stddev_100us: 0,
                capacity_bps: None,
            })
            .collect();
        let queue_delays: Vec<LsaQueueDelay> = self
            .queues
            .iter()
            .map(|(dest, queue)| LsaQueueDelay {
                bin_id: dest.0 as u8,
                queue_delay_us: queue.depth_bytes().min(u32::MAX as u64) as u32,
            })
            .collect();
        Lsa {
            src_bin_id: self.local_bin.0 as u8,
            seq_num,
            neighbors,
            queue_delays,
        }
    }
}

/// Below this many buffered bytes, a path controller is considered eligible
/// to receive another forwarding-algorithm solution this tick.
fn free_threshold_bytes() -> usize {
    256 * 1024
}
