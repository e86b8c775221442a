//! The Admission Planner: caches service/flow definitions, relays proxy
//! stats to a GUI, and drives the supervisory-control triage timer.
//!
//! `AmpLoop` is a poll-driven structure (a `tick()` method called by an
//! owning harness) rather than something that blocks on its own thread or
//! socket — the transport that actually delivers remote-control messages
//! is the out-of-scope external collaborator described at the wire-types'
//! doc comment in `gnat_wire::rc`.

use std::collections::HashMap;

use gnat_common::svc_def::ServiceDef;
use gnat_common::{BinId, FiveTuple};
use gnat_wire::rc::{RcMessage, Target};

use crate::svcr::{FlowTransition, Svcr};

#[derive(Debug, Clone)]
pub struct TimedCommand {
    pub at_us: u64,
    pub target: Target,
    pub message: RcMessage,
}

#[derive(Debug, Clone)]
pub struct AmpConfig {
    pub triage_interval_us: u64,
    /// Number of consecutive non-beaten maxima before a queue is
    /// considered settled by `is_queue_non_increasing`.
    pub trajectory_settle_count: u32,
}

impl Default for AmpConfig {
    fn default() -> Self {
        AmpConfig {
            triage_interval_us: gnat_common::constants::DEFAULT_TRIAGE_INTERVAL_US,
            trajectory_settle_count: 3,
        }
    }
}

/// Running average/maximum queue depth for one destination, plus a count
/// of how many consecutive observations failed to beat the running max —
/// the signal SVCR uses to decide a loss probe has settled.
#[derive(Debug, Clone, Default)]
struct QueueTrajectory {
    avg_depth_bytes: f64,
    max_depth_bytes: u32,
    unbeaten_count: u32,
}

impl QueueTrajectory {
    fn observe(&mut self, depth_bytes: u32, ewma_alpha: f64) {
        self.avg_depth_bytes =
            (1.0 - ewma_alpha) * self.avg_depth_bytes + ewma_alpha * depth_bytes as f64;
        if depth_bytes > self.max_depth_bytes {
            self.max_depth_bytes = depth_bytes;
            self.unbeaten_count = 0;
        } else {
            self.unbeaten_count += 1;
        }
    }
}

#[derive(Debug, Default)]
pub struct AmpTickReport {
    pub commands_issued: u32,
    pub triage_ran: bool,
    pub flows_toggled: u32,
}

/// Per-node policy daemon sitting between local proxies, the local BPF,
/// and a GUI.
pub struct Amp {
    config: AmpConfig,
    svc_def_cache: HashMap<(Target, u16, u16), ServiceDef>,
    flow_def_cache: HashMap<FiveTuple, ServiceDef>,
    connection_map: HashMap<Target, String>,
    timed_commands: Vec<TimedCommand>,
    next_command: usize,
    next_gui_msgid: u64,
    /// Maps a msgid handed to the GUI back to the originating target and
    /// that target's own msgid, so a later `PushStop` from the GUI can be
    /// relayed back to the right proxy.
    gui_msgid_origin: HashMap<u64, (Target, u64)>,
    queue_trajectories: HashMap<BinId, QueueTrajectory>,
    svcr: Svcr,
    last_triage_us: u64,
    aggregate_outbound_capacity_bps: f64,
}

impl Amp {
    pub fn new(config: AmpConfig, svcr: Svcr) -> Self {
        Amp {
            config,
            svc_def_cache: HashMap::new(),
            flow_def_cache: HashMap::new(),
            connection_map: HashMap::new(),
            timed_commands: Vec::new(),
            next_command: 0,
            next_gui_msgid: 1,
            gui_msgid_origin: HashMap::new(),
            queue_trajectories: HashMap::new(),
            svcr,
            last_triage_us: 0,
            aggregate_outbound_capacity_bps: 0.0,
        }
    }

    pub fn svcr(&self) -> &Svcr {
        &self.svcr
    }

    pub fn svcr_mut(&mut self) -> &mut Svcr {
        &mut self.svcr
    }

    pub fn set_aggregate_outbound_capacity_bps(&mut self, capacity_bps: f64) {
        self.aggregate_outbound_capacity_bps = capacity_bps;
    }

    pub fn cache_service_def(&mut self, target: Target, lo_port: u16, hi_port: u16, def: ServiceDef) {
        self.svc_def_cache.insert((target, lo_port, hi_port), def);
    }

    /// Default utility function for a port, falling back to the widest
    /// range that contains it.
    pub fn service_def_for(&self, target: &Target, port: u16) -> Option<&ServiceDef> {
        self.svc_def_cache
            .iter()
            .find(|((t, lo, hi), _)| t == target && *lo <= port && port <= *hi)
            .map(|(_, def)| def)
    }

    pub fn cache_flow_def(&mut self, five_tuple: FiveTuple, def: ServiceDef) {
        self.flow_def_cache.insert(five_tuple, def);
    }

    /// A flow-specific override, if one was set; otherwise the service
    /// default for its destination port.
    pub fn resolve_def(&self, five_tuple: &FiveTuple, target: &Target) -> Option<&ServiceDef> {
        self.flow_def_cache
            .get(five_tuple)
            .or_else(|| self.service_def_for(target, five_tuple.four_tuple.dst_port))
    }

    pub fn connect(&mut self, target: Target, endpoint_id: impl Into<String>) {
        self.connection_map.insert(target, endpoint_id.into());
    }

    pub fn disconnect(&mut self, target: &Target) {
        self.connection_map.remove(target);
    }

    /// Load a schedule of commands to be issued at their `at_us` deadline.
    /// Replaces any previously loaded schedule.
    pub fn load_command_file(&mut self, mut commands: Vec<TimedCommand>) {
        commands.sort_by_key(|c| c.at_us);
        self.timed_commands = commands;
        self.next_command = 0;
    }

    /// Re-map a stats push arriving from `origin` into a message the GUI
    /// can receive on a single coherent stream, remembering the mapping so
    /// a later `PushStop` from the GUI routes back to the right proxy.
    pub fn relay_push_to_gui(&mut self, origin: Target, push: RcMessage) -> Option<RcMessage> {
        let RcMessage::Push { msgid: orig_msgid, keyvals } = push else {
            return None;
        };
        let gui_msgid = self.next_gui_msgid;
        self.next_gui_msgid += 1;
        self.gui_msgid_origin.insert(gui_msgid, (origin, orig_msgid));
        Some(RcMessage::Push { msgid: gui_msgid, keyvals })
    }

    /// Translate a `PushStop` the GUI sent against a remapped msgid back
    /// into the (target, original-msgid) pair to forward it to.
    pub fn resolve_gui_push_stop(&self, gui_msgid: u64) -> Option<(Target, u64)> {
        self.gui_msgid_origin.get(&gui_msgid).cloned()
    }

    pub fn observe_queue_depth(&mut self, bin: BinId, depth_bytes: u32, ewma_alpha: f64) {
        self.queue_trajectories
            .entry(bin)
            .or_default()
            .observe(depth_bytes, ewma_alpha);
    }

    pub fn average_queue_depth(&self, bin: BinId) -> f64 {
        self.queue_trajectories.get(&bin).map(|t| t.avg_depth_bytes).unwrap_or(0.0)
    }

    pub fn max_queue_depth(&self, bin: BinId) -> u32 {
        self.queue_trajectories.get(&bin).map(|t| t.max_depth_bytes).unwrap_or(0)
    }

    /// True once a destination's queue depth has failed to beat its
    /// running maximum for `trajectory_settle_count` consecutive
    /// observations — the signal SVCR uses to decide a loss probe has run
    /// long enough to judge.
    pub fn is_queue_non_increasing(&self, bin: BinId) -> bool {
        self.queue_trajectories
            .get(&bin)
            .map(|t| t.unbeaten_count >= self.config.trajectory_settle_count)
            .unwrap_or(false)
    }

    /// Advance time: issue due timed commands, and — if the triage
    /// interval has elapsed — run a supervisory-control tick and emit a
    /// set-flow-state message per changed flow. `send` is handed each
    /// outbound message with its destination target; a real build points
    /// it at a `RemoteControlChannel`, tests at a `Vec`-collecting mock.
    pub fn tick(&mut self, now_us: u64, mut send: impl FnMut(Target, RcMessage)) -> AmpTickReport {
        let mut report = AmpTickReport::default();

        while self.next_command < self.timed_commands.len()
            && self.timed_commands[self.next_command].at_us <= now_us
        {
            let cmd = self.timed_commands[self.next_command].clone();
            send(cmd.target, cmd.message);
            self.next_command += 1;
            report.commands_issued += 1;
        }

        if now_us.saturating_sub(self.last_triage_us) >= self.config.triage_interval_us {
            self.last_triage_us = now_us;
            report.triage_ran = true;
            let transitions = self.svcr.compute_fit(self.aggregate_outbound_capacity_bps, now_us);
            for t in &transitions {
                let five_tuple = t.five_tuple();
                let Some(flow) = self.svcr.find_flow_info(&five_tuple) else {
                    continue;
                };
                let target = match flow.five_tuple.proxy {
                    gnat_common::flow::ProxyKind::Udp => Target::UdpProxy,
                    gnat_common::flow::ProxyKind::Tcp => Target::TcpProxy,
                };
                tracing::debug!(flow = %five_tuple, transition = ?t, "relaying flow-state transition");
                send(target, set_flow_state_message(t, five_tuple));
                report.flows_toggled += 1;
            }
        }

        report
    }
}

fn set_flow_state_message(transition: &FlowTransition, five_tuple: FiveTuple) -> RcMessage {
    let state = match transition {
        FlowTransition::TurnOn(_) => "on",
        FlowTransition::TurnOff(_) => "off",
        FlowTransition::Triaged(_) => "triaged",
        FlowTransition::RecoveredFromTriage(_) => "on",
        FlowTransition::LossTriaged(_) => "loss_triaged",
        FlowTransition::RecoveredFromLossTriage(_) => "on",
    };
    let mut keyvals = std::collections::BTreeMap::new();
    keyvals.insert("five_tuple".to_string(), five_tuple.to_string());
    keyvals.insert("state".to_string(), state.to_string());
    RcMessage::Set {
        msgid: 0,
        tgt: five_tuple.proxy.to_string(),
        keyvals,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::svcr::SvcrConfig;
    use gnat_common::flow::{FourTuple, ProxyKind};
    use gnat_common::svc_def::{UtilityDef, UtilityKind};
    use std::collections::BTreeMap;

    fn ft(port: u16) -> FiveTuple {
        FiveTuple {
            proxy: ProxyKind::Udp,
            four_tuple: FourTuple {
                src_ip: [10, 0, 0, 1],
                dst_ip: [10, 0, 0, 2],
                src_port: port,
                dst_port: 7000,
            },
        }
    }

    fn amp() -> Amp {
        Amp::new(AmpConfig::default(), Svcr::new(SvcrConfig::default(), 1000))
    }

    #[test]
    fn timed_commands_issue_in_order_up_to_now() {
        let mut a = amp();
        a.load_command_file(vec![
            TimedCommand { at_us: 500, target: Target::UdpProxy, message: RcMessage::Close },
            TimedCommand { at_us: 100, target: Target::Bpf, message: RcMessage::Close },
        ]);
        let mut issued = Vec::new();
        let report = a.tick(300, |tgt, msg| issued.push((tgt, msg)));
        assert_eq!(report.commands_issued, 1);
        assert_eq!(issued.len(), 1);
        assert_eq!(issued[0].0, Target::Bpf);

        let report2 = a.tick(600, |tgt, msg| issued.push((tgt, msg)));
        assert_eq!(report2.commands_issued, 1);
        assert_eq!(issued.len(), 2);
        assert_eq!(issued[1].0, Target::UdpProxy);
    }

    #[test]
    fn queue_trajectory_settles_after_unbeaten_observations() {
        let mut a = amp();
        let bin = BinId(2);
        a.observe_queue_depth(bin, 1000, 0.5);
        assert!(!a.is_queue_non_increasing(bin));
        a.observe_queue_depth(bin, 900, 0.5);
        a.observe_queue_depth(bin, 800, 0.5);
        a.observe_queue_depth(bin, 700, 0.5);
        assert!(a.is_queue_non_increasing(bin));
    }

    #[test]
    fn resolve_def_prefers_flow_override_over_service_default() {
        let mut a = amp();
        let service = ServiceDef {
            lo_port: 7000,
            hi_port: 7010,
            mtu: 1400,
            reserved: [0, 0],
            period_us: 0,
            ttg_us: 0,
            utility: UtilityDef { kind: UtilityKind::Log, args: BTreeMap::new() },
        };
        a.cache_service_def(Target::UdpProxy, 7000, 7010, service.clone());
        assert_eq!(a.resolve_def(&ft(1), &Target::UdpProxy).unwrap().utility.kind, UtilityKind::Log);

        let mut flow_def = service;
        flow_def.utility.kind = UtilityKind::Strap;
        a.cache_flow_def(ft(1), flow_def);
        assert_eq!(a.resolve_def(&ft(1), &Target::UdpProxy).unwrap().utility.kind, UtilityKind::Strap);
    }

    #[test]
    fn triage_tick_emits_set_messages_for_transitions() {
        let mut a = amp();
        a.svcr_mut().update_flow_info(
            ft(1),
            BinId(0),
            UtilityDef { kind: UtilityKind::Strap, args: BTreeMap::from([("p".to_string(), "1".to_string()), ("m".to_string(), "1000".to_string())]) },
            0,
        );
        a.svcr_mut().report_admission_rate(ft(1), 1000.0);
        a.set_aggregate_outbound_capacity_bps(10_000.0);

        let mut sent = Vec::new();
        let report = a.tick(a.config.triage_interval_us, |tgt, msg| sent.push((tgt, msg)));
        assert!(report.triage_ran);
        assert_eq!(report.flows_toggled, 1);
        assert!(matches!(sent[0].1, RcMessage::Set { .. }));
    }

    #[test]
    fn gui_push_relay_remaps_msgid_and_is_resolvable() {
        let mut a = amp();
        let push = RcMessage::Push { msgid: 42, keyvals: BTreeMap::new() };
        let relayed = a.relay_push_to_gui(Target::UdpProxy, push).unwrap();
        let RcMessage::Push { msgid: gui_msgid, .. } = relayed else { panic!("expected push") };
        assert_ne!(gui_msgid, 42);
        assert_eq!(a.resolve_gui_push_stop(gui_msgid), Some((Target::UdpProxy, 42)));
    }
}
