//! Per-flow decoding state (§4.9, flow sink side): reorder buffer, FEC
//! repair, in-sequence release, and the release-record bookkeeping that
//! feeds periodic RRMs back to the source.

use crate::encoding::StampedPacket;
use bytes::Bytes;
use std::collections::BTreeMap;

/// Last 64 packets' reception history, newest bit at position 0. Used to
/// compute the EWMA byte-loss-rate without rescanning the reorder buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceptionHistory(pub u64);

impl ReceptionHistory {
    pub fn record(&mut self, received: bool) {
        self.0 <<= 1;
        if received {
            self.0 |= 1;
        }
    }

    pub fn received_count(&self) -> u32 {
        self.0.count_ones()
    }
}

/// Per-flow release bookkeeping, periodically summarized into an RRM.
#[derive(Debug, Clone, Default)]
pub struct ReleaseRecord {
    pub highest_seq_seen: u64,
    pub highest_seq_released: u64,
    pub highest_bytes_seen: u64,
    pub released_bytes: u64,
    pub packets_released: u64,
    pub history: ReceptionHistory,
    pub ewma_loss_rate: f64,
}

impl ReleaseRecord {
    /// `alpha = DefaultLossRateAlpha / priority` per §4.9.
    pub fn update_loss_rate(&mut self, alpha: f64, instantaneous_loss: f64) {
        self.ewma_loss_rate = alpha * instantaneous_loss + (1.0 - alpha) * self.ewma_loss_rate;
    }
}

struct HeldPacket {
    payload: Bytes,
    arrival_time_us: u64,
    hold_deadline_us: u64,
    fec_group_id: Option<u64>,
    is_fec_repair: bool,
    cumulative_source_bytes: u64,
}

/// Per-flow decoding state: a reorder buffer keyed by sequence number,
/// bounded FEC group tracking, and the release record RRMs are built from.
pub struct DecodingState {
    pub flow_token: u64,
    reorder_max_hold_us: u64,
    next_release_seq: u64,
    buffer: BTreeMap<u64, HeldPacket>,
    fec_groups: BTreeMap<u64, Vec<u64>>, // group id -> seqs buffered so far
    /// Total packets per FEC group *including* the repair packet — one
    /// more than the encoder's source `group_size`.
    fec_group_size: usize,
    loss_alpha: f64,
    pub record: ReleaseRecord,
}

impl DecodingState {
    /// `fec_group_size` is the total packets per group including the
    /// repair packet (encoder source `group_size` + 1).
    pub fn new(flow_token: u64, reorder_max_hold_us: u64, priority: f64, fec_group_size: usize) -> Self {
        DecodingState {
            flow_token,
            reorder_max_hold_us,
            next_release_seq: 0,
            buffer: BTreeMap::new(),
            fec_groups: BTreeMap::new(),
            fec_group_size: fec_group_size.max(2),
            loss_alpha: gnat_common::constants::DEFAULT_LOSS_RATE_ALPHA / priority.max(1e-6),
            record: ReleaseRecord::default(),
        }
    }

    /// Buffer one packet off the wire. `ttg_us` clips the hold time per
    /// §4.9 ("clipped by packet ttg").
    pub fn on_packet_received(&mut self, pkt: StampedPacket, now_us: u64) {
        self.record.highest_seq_seen = self.record.highest_seq_seen.max(pkt.seq);
        self.record.highest_bytes_seen = self.record.highest_bytes_seen.max(pkt.cumulative_source_bytes);

        let hold_us = if pkt.ttg_us > 0 {
            self.reorder_max_hold_us.min(pkt.ttg_us as u64)
        } else {
            self.reorder_max_hold_us
        };

        if let Some(gid) = pkt.fec_group_id {
            self.fec_groups.entry(gid).or_default().push(pkt.seq);
        }

        self.buffer.insert(
            pkt.seq,
            HeldPacket {
                payload: pkt.payload,
                arrival_time_us: now_us,
                hold_deadline_us: now_us + hold_us,
                fec_group_id: pkt.fec_group_id,
                is_fec_repair: pkt.is_fec_repair,
                cumulative_source_bytes: pkt.cumulative_source_bytes,
            },
        );
    }

    /// Release everything ready in sequence order: the next expected
    /// sequence if present, or — once its hold deadline passes — the next
    /// buffered sequence, skipping the gap as a loss. Returns released
    /// payloads in order.
    pub fn release_ready(&mut self, now_us: u64) -> Vec<Bytes> {
        let mut released = Vec::new();
        loop {
            let Some(&next_seq) = self.buffer.keys().find(|&&s| s >= self.next_release_seq) else {
                break;
            };
            if next_seq == self.next_release_seq {
                let pkt = self.buffer.remove(&next_seq).unwrap();
                self.record.history.record(true);
                self.next_release_seq = next_seq + 1;
                if !pkt.is_fec_repair {
                    released.push(pkt.payload);
                    self.record.released_bytes += released.last().unwrap().len() as u64;
                    self.record.packets_released += 1;
                    self.record.highest_seq_released = next_seq;
                }
                continue;
            }

            // Gap: try FEC recovery for the group the next expected
            // sequence would have belonged to before giving up on it.
            if let Some(recovered) = self.try_fec_recover(self.next_release_seq) {
                self.record.history.record(true);
                released.push(recovered);
                self.record.released_bytes += released.last().unwrap().len() as u64;
                self.record.packets_released += 1;
                self.record.highest_seq_released = self.next_release_seq;
                self.next_release_seq += 1;
                continue;
            }

            // Only skip the gap once its hold bound has passed; otherwise
            // wait for the straggler.
            let earliest_deadline = self
                .buffer
                .get(&next_seq)
                .map(|p| p.hold_deadline_us)
                .unwrap_or(now_us);
            if now_us < earliest_deadline {
                break;
            }
            tracing::debug!(flow_token = self.flow_token, seq = self.next_release_seq, "gap skipped past hold deadline");
            self.record.history.record(false);
            self.next_release_seq += 1;
        }
        released
    }

    /// Reconstruct a single missing source packet in a group via XOR
    /// parity, if the group's repair packet and every other member have
    /// already arrived.
    fn try_fec_recover(&mut self, _missing_seq: u64) -> Option<Bytes> {
        // A group is recoverable once exactly one member (of
        // `fec_group_size`) is still missing and the repair packet is
        // among those that arrived — single-erasure XOR parity.
        let gid = self
            .fec_groups
            .iter()
            .find(|(_, seqs)| seqs.len() == self.fec_group_size - 1)
            .map(|(gid, _)| *gid)?;
        let seqs = self.fec_groups.get(&gid)?.clone();
        let members: Vec<&HeldPacket> = seqs.iter().filter_map(|s| self.buffer.get(s)).collect();
        if members.len() != seqs.len() {
            return None; // a referenced packet already released/evicted
        }
        let repair = members.iter().find(|m| m.is_fec_repair)?;
        let sources: Vec<&&HeldPacket> = members.iter().filter(|m| !m.is_fec_repair).collect();
        if sources.len() != self.fec_group_size - 2 {
            return None; // more than one erasure: unrecoverable by parity
        }
        let max_len = repair.payload.len();
        let mut recovered = vec![0u8; max_len];
        for (i, b) in repair.payload.iter().enumerate() {
            recovered[i] = *b;
        }
        for src in &sources {
            for (i, b) in src.payload.iter().enumerate() {
                recovered[i] ^= b;
            }
        }
        let cumulative = sources
            .iter()
            .map(|s| s.cumulative_source_bytes)
            .max()
            .unwrap_or(0);
        self.record.highest_bytes_seen = self.record.highest_bytes_seen.max(cumulative);
        self.fec_groups.remove(&gid);
        Some(Bytes::from(recovered))
    }
}
