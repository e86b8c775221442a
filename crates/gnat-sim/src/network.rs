//! A deterministic, in-process two-node network: two [`BpfLoop`]s linked by
//! a pair of [`MockPathController`]s, with a "cable" step that ferries
//! whatever each side sent since the last pump to the other side's inbox.
//! No sockets, no threads — every scenario test drives time explicitly.

use gnat_bpf::forwarding::{ForwardingAlg, ForwardingConfig};
use gnat_bpf::fwder::{BpfLoop, Timers};
use gnat_bpf::path::MockPathController;
use gnat_common::binmap::Subnet;
use gnat_common::error::GnatResult;
use gnat_common::{BinId, BinIndex, BinMap};

/// One node's identity within a [`TwoNodeNet`]: its own bin id/subnet and
/// the bin id/subnet it uses to reach the other node.
#[derive(Debug, Clone, Copy)]
pub struct NodeAddr {
    pub bin_id: BinId,
    pub subnet: Subnet,
}

/// Two `BpfLoop`s wired together by mock path controllers, standing in for
/// SLIQ/SOND plus the link itself.
pub struct TwoNodeNet {
    pub a: BpfLoop,
    pub b: BpfLoop,
    pub a_bin: BinIndex,
    pub b_bin: BinIndex,
    link_capacity_bps: f64,
}

fn default_timers() -> Timers {
    Timers::new(50_000, 10_000, 1_000_000, 100_000)
}

fn default_alg() -> ForwardingAlg {
    ForwardingAlg::new(ForwardingConfig { hysteresis_bytes: 1, ..ForwardingConfig::default() }, 7)
}

impl TwoNodeNet {
    /// Build a two-node network: `node_a` and `node_b` each get a unicast
    /// destination for themselves and one for their peer, and a mock path
    /// controller back to back over `link_capacity_bps`.
    pub fn new(node_a: NodeAddr, node_b: NodeAddr, link_capacity_bps: f64) -> Self {
        let mut map_a = BinMap::new();
        let a_local = map_a.add_unicast_dst(node_a.bin_id, &[node_a.subnet]).unwrap();
        let a_bin = map_a.add_unicast_dst(node_b.bin_id, &[node_b.subnet]).unwrap();

        let mut map_b = BinMap::new();
        let b_bin = map_b.add_unicast_dst(node_a.bin_id, &[node_a.subnet]).unwrap();
        let b_local = map_b.add_unicast_dst(node_b.bin_id, &[node_b.subnet]).unwrap();

        let mut a = BpfLoop::new(map_a, a_local, default_alg(), default_timers());
        a.add_neighbor(a_bin, Box::new(MockPathController::new(a_bin, link_capacity_bps, 4 * 1024 * 1024)));

        let mut b = BpfLoop::new(map_b, b_local, default_alg(), default_timers());
        b.add_neighbor(b_bin, Box::new(MockPathController::new(b_bin, link_capacity_bps, 4 * 1024 * 1024)));

        TwoNodeNet { a, b, a_bin, b_bin, link_capacity_bps }
    }

    /// Ferry everything each side's path controller sent since the last
    /// pump into the other side's inbox. Models the wire; the mock
    /// controllers otherwise never move bytes between nodes on their own.
    pub fn pump_cable(&mut self) {
        let from_a = self
            .a
            .neighbor_path_mut(self.a_bin)
            .and_then(|p| p.as_any_mut().downcast_mut::<MockPathController>())
            .map(|p| p.drain_outbox())
            .unwrap_or_default();
        let from_b = self
            .b
            .neighbor_path_mut(self.b_bin)
            .and_then(|p| p.as_any_mut().downcast_mut::<MockPathController>())
            .map(|p| p.drain_outbox())
            .unwrap_or_default();

        if let Some(p) = self
            .b
            .neighbor_path_mut(self.b_bin)
            .and_then(|p| p.as_any_mut().downcast_mut::<MockPathController>())
        {
            for (stream, bytes) in from_a {
                p.deliver(stream, bytes);
            }
        }
        if let Some(p) = self
            .a
            .neighbor_path_mut(self.a_bin)
            .and_then(|p| p.as_any_mut().downcast_mut::<MockPathController>())
        {
            for (stream, bytes) in from_b {
                p.deliver(stream, bytes);
            }
        }
    }

    pub fn link_capacity_bps(&self) -> f64 {
        self.link_capacity_bps
    }
}

/// Run both nodes' `tick()` once at `now_us`, then pump the cable — the
/// harness's one full step of simulated time.
pub fn step(
    net: &mut TwoNodeNet,
    a_fifos: &mut [&mut dyn gnat_bpf::fwder::ProxyFifo],
    b_fifos: &mut [&mut dyn gnat_bpf::fwder::ProxyFifo],
    a_local: &mut dyn gnat_bpf::fwder::LocalDelivery,
    b_local: &mut dyn gnat_bpf::fwder::LocalDelivery,
    now_us: u64,
) -> GnatResult<(gnat_bpf::fwder::TickReport, gnat_bpf::fwder::TickReport)> {
    let ra = net.a.tick(a_fifos, a_local, now_us)?;
    let rb = net.b.tick(b_fifos, b_local, now_us)?;
    net.pump_cable();
    Ok((ra, rb))
}
