//! Per-flow encoding state (§4.9, flow source side): the admission queue
//! a flow's utility function drains at its current admission rate.
//!
//! Application packets accepted by `admit` join the admission queue;
//! `tick` recomputes the admission rate from observed backlog and loss,
//! then drains a rate-proportional byte budget into stamped packets ready
//! for the UDP→BPF FIFO. Flow on/off toggles from AMP gate `admit` but
//! never touch what is already queued — matching the spec's "instantly
//! stop/start enqueueing but do not drop queued bytes."

use crate::utility::{UtilityFn, UtilityInputs};
use bytes::Bytes;
use gnat_common::FiveTuple;
use std::collections::VecDeque;

/// What happens to an admitted packet that would overflow the admission
/// queue's configured byte budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    DropTail,
    DropHead,
}

impl Default for DropPolicy {
    fn default() -> Self {
        DropPolicy::DropTail
    }
}

/// A single FEC group's accumulated source payloads, padded to the
/// longest member, ready to have their parity packet computed.
struct FecGroup {
    id: u64,
    members: Vec<Bytes>,
}

/// Minimal single-parity (XOR) forward error correction: every
/// `group_size` source packets are followed by one repair packet that
/// recovers a single erasure in the group.
pub struct FecContext {
    pub group_size: usize,
    next_group_id: u64,
    current: FecGroup,
}

impl FecContext {
    pub fn new(group_size: usize) -> Self {
        FecContext {
            group_size: group_size.max(1),
            next_group_id: 0,
            current: FecGroup {
                id: 0,
                members: Vec::new(),
            },
        }
    }

    /// Feed one source payload in; returns a repair packet once the group
    /// fills, alongside the group id it protects.
    fn push(&mut self, payload: &Bytes) -> Option<(u64, Bytes)> {
        self.current.members.push(payload.clone());
        if self.current.members.len() < self.group_size {
            return None;
        }
        let max_len = self.current.members.iter().map(|p| p.len()).max().unwrap_or(0);
        let mut parity = vec![0u8; max_len];
        for member in &self.current.members {
            for (i, b) in member.iter().enumerate() {
                parity[i] ^= b;
            }
        }
        let group_id = self.current.id;
        self.next_group_id += 1;
        self.current = FecGroup {
            id: self.next_group_id,
            members: Vec::new(),
        };
        Some((group_id, Bytes::from(parity)))
    }
}

/// A packet drained from the admission queue, stamped and ready for the
/// UDP→BPF FIFO. `fec_repair` is `Some` exactly when this entry is a
/// generated repair packet rather than a source payload.
#[derive(Debug, Clone)]
pub struct StampedPacket {
    pub seq: u64,
    pub payload: Bytes,
    pub enqueue_time_us: u64,
    pub send_time_us: u64,
    pub ttg_us: i64,
    /// Running total of source (non-repair) bytes this flow has admitted,
    /// as of this packet — the field a peer's `DecodingState` uses to
    /// compute `highest_bytes_seen` independent of loss.
    pub cumulative_source_bytes: u64,
    pub fec_group_id: Option<u64>,
    pub is_fec_repair: bool,
}

struct QueuedPacket {
    payload: Bytes,
    enqueue_time_us: u64,
}

/// Per-flow encoding state: utility function, admission queue, optional
/// FEC context.
pub struct EncodingState {
    pub five_tuple: FiveTuple,
    pub flow_token: u64,
    utility: Box<dyn UtilityFn + Send>,
    k_val: f64,
    ttg_us: i64,
    max_queue_bits: u64,
    drop_policy: DropPolicy,
    enabled: bool,
    queue: VecDeque<QueuedPacket>,
    queue_bits: u64,
    fec: Option<FecContext>,
    next_seq: u64,
    cumulative_source_bytes: u64,
    observed_loss_rate: f64,
    pub bytes_admitted: u64,
    pub bytes_dropped: u64,
}

impl EncodingState {
    pub fn new(
        five_tuple: FiveTuple,
        flow_token: u64,
        utility: Box<dyn UtilityFn + Send>,
        k_val: f64,
        ttg_us: i64,
        max_queue_bits: u64,
        drop_policy: DropPolicy,
    ) -> Self {
        EncodingState {
            five_tuple,
            flow_token,
            utility,
            k_val,
            ttg_us,
            max_queue_bits,
            drop_policy,
            enabled: true,
            queue: VecDeque::new(),
            queue_bits: 0,
            fec: None,
            next_seq: 0,
            cumulative_source_bytes: 0,
            observed_loss_rate: 0.0,
            bytes_admitted: 0,
            bytes_dropped: 0,
        }
    }

    pub fn with_fec(mut self, group_size: usize) -> Self {
        self.fec = Some(FecContext::new(group_size));
        self
    }

    /// A flow on/off command from AMP. Queued bytes are untouched.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Feed this flow's RRM-derived loss rate back into the utility
    /// function's next rate computation (STRAP/TRAP triage, FLOG
    /// forgiveness).
    pub fn set_observed_loss_rate(&mut self, rate: f64) {
        self.observed_loss_rate = rate;
    }

    pub fn backlog_bits(&self) -> u64 {
        self.queue_bits
    }

    /// Admit one application packet into the queue, applying the drop
    /// policy if the queue's byte budget is exceeded. A no-op while the
    /// flow is OFF: the packet is dropped, not buffered, since admission
    /// is what's disabled, not the flow's existence.
    pub fn admit(&mut self, payload: Bytes, now_us: u64) {
        if !self.enabled {
            self.bytes_dropped += payload.len() as u64;
            return;
        }
        let bits = payload.len() as u64 * 8;
        if self.queue_bits + bits > self.max_queue_bits {
            match self.drop_policy {
                DropPolicy::DropTail => {
                    self.bytes_dropped += payload.len() as u64;
                    return;
                }
                DropPolicy::DropHead => {
                    while self.queue_bits + bits > self.max_queue_bits {
                        match self.queue.pop_front() {
                            Some(old) => {
                                let old_bits = old.payload.len() as u64 * 8;
                                self.queue_bits -= old_bits;
                                self.bytes_dropped += old.payload.len() as u64;
                            }
                            None => break,
                        }
                    }
                }
            }
        }
        self.queue_bits += bits;
        self.queue.push_back(QueuedPacket {
            payload,
            enqueue_time_us: now_us,
        });
    }

    /// Recompute the admission rate from current backlog/loss, then drain
    /// up to `rate * dt` bytes from the queue into stamped packets bound
    /// for the UDP→BPF FIFO.
    pub fn tick(&mut self, now_us: u64, dt_us: u64) -> Vec<StampedPacket> {
        let inputs = UtilityInputs {
            backlog_bits: self.queue_bits as f64,
            observed_loss_rate: self.observed_loss_rate,
        };
        let rate_bps = self.utility.admission_rate_bps(self.k_val, inputs);
        let mut budget_bytes = (rate_bps * (dt_us as f64 / 1_000_000.0) / 8.0).max(0.0);

        let mut out = Vec::new();
        while budget_bytes > 0.0 {
            let Some(front_len) = self.queue.front().map(|p| p.payload.len()) else {
                break;
            };
            if front_len as f64 > budget_bytes && !out.is_empty() {
                break;
            }
            let pkt = self.queue.pop_front().unwrap();
            self.queue_bits -= pkt.payload.len() as u64 * 8;
            budget_bytes -= pkt.payload.len() as f64;
            self.bytes_admitted += pkt.payload.len() as u64;
            self.cumulative_source_bytes += pkt.payload.len() as u64;

            let seq = self.next_seq;
            self.next_seq += 1;
            let fec_group_id = self.fec.as_ref().map(|f| f.current.id);
            let repair = self.fec.as_mut().and_then(|f| f.push(&pkt.payload));

            out.push(StampedPacket {
                seq,
                payload: pkt.payload,
                enqueue_time_us: pkt.enqueue_time_us,
                send_time_us: now_us,
                ttg_us: self.ttg_us,
                cumulative_source_bytes: self.cumulative_source_bytes,
                fec_group_id,
                is_fec_repair: false,
            });

            if let Some((repair_gid, repair_payload)) = repair {
                let repair_seq = self.next_seq;
                self.next_seq += 1;
                out.push(StampedPacket {
                    seq: repair_seq,
                    payload: repair_payload,
                    enqueue_time_us: now_us,
                    send_time_us: now_us,
                    ttg_us: self.ttg_us,
                    cumulative_source_bytes: self.cumulative_source_bytes,
                    fec_group_id: Some(repair_gid),
                    is_fec_repair: true,
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utility::LogUtility;
    use gnat_common::{FourTuple, ProxyKind};

    fn five_tuple() -> FiveTuple {
        FiveTuple {
            proxy: ProxyKind::Udp,
            four_tuple: FourTuple {
                src_ip: [10, 0, 0, 1],
                dst_ip: [10, 0, 0, 2],
                src_port: 5000,
                dst_port: 6000,
            },
        }
    }

    #[test]
    fn disabled_flow_drops_admitted_packets() {
        let mut enc = EncodingState::new(
            five_tuple(),
            1,
            Box::new(LogUtility { priority: 1.0 }),
            1000.0,
            50_000,
            1_000_000,
            DropPolicy::DropTail,
        );
        enc.set_enabled(false);
        enc.admit(Bytes::from(vec![0u8; 100]), 0);
        assert_eq!(enc.backlog_bits(), 0);
        assert_eq!(enc.bytes_dropped, 100);
    }

    #[test]
    fn drop_tail_rejects_incoming_over_budget() {
        let mut enc = EncodingState::new(
            five_tuple(),
            1,
            Box::new(LogUtility { priority: 1.0 }),
            1000.0,
            50_000,
            800, // 100 bytes
            DropPolicy::DropTail,
        );
        enc.admit(Bytes::from(vec![0u8; 60]), 0);
        enc.admit(Bytes::from(vec![0u8; 60]), 0);
        assert_eq!(enc.backlog_bits(), 480);
        assert_eq!(enc.bytes_dropped, 60);
    }

    #[test]
    fn tick_drains_queue_and_stamps_packets() {
        let mut enc = EncodingState::new(
            five_tuple(),
            1,
            Box::new(LogUtility { priority: 100.0 }),
            1000.0,
            50_000,
            1_000_000,
            DropPolicy::DropTail,
        );
        enc.admit(Bytes::from(vec![0u8; 100]), 0);
        let out = enc.tick(0, 1_000_000);
        assert!(!out.is_empty());
        assert_eq!(out[0].ttg_us, 50_000);
    }

    #[test]
    fn fec_emits_repair_packet_every_group() {
        let mut enc = EncodingState::new(
            five_tuple(),
            1,
            Box::new(LogUtility { priority: 1000.0 }),
            100.0,
            50_000,
            10_000_000,
            DropPolicy::DropTail,
        )
        .with_fec(2);
        enc.admit(Bytes::from(vec![1u8; 50]), 0);
        enc.admit(Bytes::from(vec![2u8; 50]), 0);
        let out = enc.tick(0, 1_000_000);
        assert!(out.iter().any(|p| p.is_fec_repair));
    }
}
