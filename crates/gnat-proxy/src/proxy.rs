//! `UdpProxyCore`: the top-level per-flow admission/release tables (§4.9)
//! tying `EncodingState`/`DecodingState` to classified application packets
//! and to the AMP-driven flow on/off state.

use crate::decoding::DecodingState;
use crate::encoding::{DropPolicy, EncodingState, StampedPacket};
use crate::utility::build_utility_fn;
use bytes::Bytes;
use gnat_common::svc_def::ServiceDef;
use gnat_common::{FiveTuple, GnatError, GnatResult};
use gnat_wire::rrm::Rrm;
use std::collections::HashMap;

/// Where admitted packets go once drained from a flow's admission queue —
/// the UDP→BPF shared-memory FIFO (§6), an external collaborator this
/// crate only consumes through this trait.
pub trait BpfFifo {
    fn send(&mut self, five_tuple: FiveTuple, pkt: StampedPacket);
}

/// Where released application payloads go — the local socket/application
/// hand-off, also external to this crate.
pub trait LocalRelease {
    fn deliver(&mut self, five_tuple: FiveTuple, payload: Bytes);
}

struct EncodingEntry {
    state: EncodingState,
    last_active_us: u64,
}

struct DecodingEntry {
    state: DecodingState,
    last_active_us: u64,
}

/// Per-node UDP proxy admission/release core: one `EncodingState` per
/// locally-sourced flow, one `DecodingState` per locally-sunk flow.
pub struct UdpProxyCore {
    encoding: HashMap<FiveTuple, EncodingEntry>,
    decoding: HashMap<FiveTuple, DecodingEntry>,
    next_flow_token: u64,
    k_val: f64,
    gc_timeout_us: u64,
    reorder_max_hold_us: u64,
}

impl UdpProxyCore {
    pub fn new(k_val: f64, gc_timeout_us: u64, reorder_max_hold_us: u64) -> Self {
        UdpProxyCore {
            encoding: HashMap::new(),
            decoding: HashMap::new(),
            next_flow_token: 1,
            k_val,
            gc_timeout_us,
            reorder_max_hold_us,
        }
    }

    /// Create encoding state for a newly classified source flow, per its
    /// parsed service/flow definition. A flow already known is left alone.
    pub fn admit_flow(&mut self, five_tuple: FiveTuple, def: &ServiceDef, now_us: u64) -> u64 {
        if let Some(entry) = self.encoding.get(&five_tuple) {
            return entry.state.flow_token;
        }
        let token = self.next_flow_token;
        self.next_flow_token += 1;
        let utility = build_utility_fn(&def.utility);
        let max_queue_bits = (def.mtu as u64).saturating_mul(64).saturating_mul(8).max(8_000);
        let state = EncodingState::new(
            five_tuple,
            token,
            utility,
            self.k_val,
            def.ttg_us,
            max_queue_bits,
            DropPolicy::DropTail,
        );
        self.encoding.insert(
            five_tuple,
            EncodingEntry {
                state,
                last_active_us: now_us,
            },
        );
        token
    }

    /// A set-flow-state command from AMP (§4.7 step 3): instantly gates
    /// enqueueing without touching queued bytes.
    pub fn set_flow_enabled(&mut self, five_tuple: FiveTuple, enabled: bool) -> GnatResult<()> {
        let entry = self
            .encoding
            .get_mut(&five_tuple)
            .ok_or_else(|| GnatError::policy_rejected(format!("unknown flow {five_tuple}")))?;
        entry.state.set_enabled(enabled);
        Ok(())
    }

    /// An application packet arriving for a known source flow.
    pub fn on_app_packet(&mut self, five_tuple: FiveTuple, payload: Bytes, now_us: u64) {
        if let Some(entry) = self.encoding.get_mut(&five_tuple) {
            entry.state.admit(payload, now_us);
            entry.last_active_us = now_us;
        }
    }

    /// Drive every known encoding flow's admission tick, handing drained
    /// packets to the FIFO.
    pub fn tick_encoding(&mut self, now_us: u64, dt_us: u64, fifo: &mut impl BpfFifo) {
        for (five_tuple, entry) in self.encoding.iter_mut() {
            let drained = entry.state.tick(now_us, dt_us);
            if !drained.is_empty() {
                entry.last_active_us = now_us;
            }
            for pkt in drained {
                fifo.send(*five_tuple, pkt);
            }
        }
    }

    /// Create decoding state for a newly seen sink flow.
    pub fn ensure_decoding_flow(&mut self, five_tuple: FiveTuple, priority: f64, now_us: u64) {
        self.decoding.entry(five_tuple).or_insert_with(|| DecodingEntry {
            state: DecodingState::new(0, self.reorder_max_hold_us, priority, 1),
            last_active_us: now_us,
        });
    }

    /// A packet arriving over a path controller, destined for the local
    /// application.
    pub fn on_wire_packet(&mut self, five_tuple: FiveTuple, pkt: StampedPacket, now_us: u64) {
        if let Some(entry) = self.decoding.get_mut(&five_tuple) {
            entry.state.on_packet_received(pkt, now_us);
            entry.last_active_us = now_us;
        }
    }

    /// Release everything ready across every sink flow to the application.
    pub fn tick_decoding(&mut self, now_us: u64, release: &mut impl LocalRelease) {
        for (five_tuple, entry) in self.decoding.iter_mut() {
            for payload in entry.state.release_ready(now_us) {
                entry.last_active_us = now_us;
                release.deliver(*five_tuple, payload);
            }
        }
    }

    /// Build the periodic RRM for every sink flow (§4.9), to be sent to
    /// the source BPF's control channel.
    pub fn build_rrms(&self) -> Vec<(FiveTuple, Rrm)> {
        self.decoding
            .iter()
            .map(|(ft, entry)| {
                let r = &entry.state.record;
                (
                    *ft,
                    Rrm {
                        flow_token: entry.state.flow_token,
                        highest_bytes_sourced: r.highest_bytes_seen,
                        highest_packets_sourced: r.highest_seq_seen,
                        total_bytes_released: r.released_bytes,
                        packets_released: r.packets_released,
                        avg_loss_rate: r.ewma_loss_rate,
                    },
                )
            })
            .collect()
    }

    /// Garbage-collect encoding/decoding states inactive past the
    /// configured timeout (§3 lifecycle summary, §5 cancellation: a
    /// 120-second cleanup timer by default).
    pub fn gc(&mut self, now_us: u64) {
        let before = self.encoding.len() + self.decoding.len();
        self.encoding
            .retain(|_, entry| now_us.saturating_sub(entry.last_active_us) < self.gc_timeout_us);
        self.decoding
            .retain(|_, entry| now_us.saturating_sub(entry.last_active_us) < self.gc_timeout_us);
        let evicted = before - (self.encoding.len() + self.decoding.len());
        if evicted > 0 {
            tracing::debug!(evicted, "garbage-collected inactive flow state");
        }
    }

    pub fn encoding_backlog_bits(&self, five_tuple: &FiveTuple) -> Option<u64> {
        self.encoding.get(five_tuple).map(|e| e.state.backlog_bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gnat_common::svc_def::parse_service_def;
    use gnat_common::{FourTuple, ProxyKind};

    struct CollectFifo(Vec<(FiveTuple, StampedPacket)>);
    impl BpfFifo for CollectFifo {
        fn send(&mut self, five_tuple: FiveTuple, pkt: StampedPacket) {
            self.0.push((five_tuple, pkt));
        }
    }

    struct CollectRelease(Vec<(FiveTuple, Bytes)>);
    impl LocalRelease for CollectRelease {
        fn deliver(&mut self, five_tuple: FiveTuple, payload: Bytes) {
            self.0.push((five_tuple, payload));
        }
    }

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
    fn admit_then_tick_drains_to_fifo() {
        let mut core = UdpProxyCore::new(1000.0, 120_000_000, 200_000);
        let def = parse_service_def("5000-5010;1400;0;0;100000;50000;type=LOG:p=100").unwrap();
        let ft = five_tuple();
        core.admit_flow(ft, &def, 0);
        core.on_app_packet(ft, Bytes::from(vec![0u8; 200]), 0);

        let mut fifo = CollectFifo(Vec::new());
        core.tick_encoding(0, 1_000_000, &mut fifo);
        assert!(!fifo.0.is_empty());
    }

    #[test]
    fn disabling_flow_stops_admission_without_dropping_backlog() {
        let mut core = UdpProxyCore::new(1000.0, 120_000_000, 200_000);
        let def = parse_service_def("5000-5010;1400;0;0;100000;50000;type=LOG:p=1").unwrap();
        let ft = five_tuple();
        core.admit_flow(ft, &def, 0);
        core.on_app_packet(ft, Bytes::from(vec![0u8; 100]), 0);
        core.set_flow_enabled(ft, false).unwrap();
        let backlog_before = core.encoding_backlog_bits(&ft).unwrap();
        core.on_app_packet(ft, Bytes::from(vec![0u8; 50]), 0);
        assert_eq!(core.encoding_backlog_bits(&ft).unwrap(), backlog_before);
    }

    #[test]
    fn gc_evicts_inactive_flows() {
        let mut core = UdpProxyCore::new(1000.0, 1_000, 200_000);
        let def = parse_service_def("5000-5010;1400;0;0;100000;50000;type=LOG:p=1").unwrap();
        let ft = five_tuple();
        core.admit_flow(ft, &def, 0);
        core.gc(10_000);
        assert!(core.encoding_backlog_bits(&ft).is_none());
    }

    #[test]
    fn set_flow_enabled_unknown_flow_is_policy_rejected() {
        let mut core = UdpProxyCore::new(1000.0, 120_000_000, 200_000);
        let err = core.set_flow_enabled(five_tuple(), false).unwrap_err();
        assert!(matches!(err, GnatError::PolicyRejected(_)));
    }
}
