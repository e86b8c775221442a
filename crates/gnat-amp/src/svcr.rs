//! Supervisory Controller: the max-utility greedy-fit solver inside AMP.
//!
//! Walks the known flow set in priority order, decides which flows fit on
//! the current aggregate outbound capacity, and detects flows that need to
//! be pulled out of rotation — either because they are thrashing on/off or
//! because a loss probe found them exceeding their declared loss tolerance.
//! It does not re-plan from scratch on every tick; see [`Svcr::compute_fit`].

use std::collections::HashMap;

use gnat_common::constants::{
    DEFAULT_LOSS_TRIAGE_INTERVAL_US, DEFAULT_MIN_EGRESS_CAPACITY_BPS, DEFAULT_STABILITY_MULTIPLIER,
    DEFAULT_THRASH_THRESHOLD, DEFAULT_TRIAGE_CYCLES, DEFAULT_TRIAGE_INTERVAL_US,
    LOW_VOL_THRESH_FRAC, PROBING_MAX_LOSS, THRASH_WINDOW_INTERVALS, UNDERDRIVING_THRESH_FRAC,
};
use gnat_common::svc_def::UtilityDef;
use gnat_common::{Arena, BinId, FiveTuple, Handle};
use gnat_wire::rrm::Rrm;

/// A flow's admission state, as seen by AMP and relayed to the owning proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// No stats report has arrived yet.
    Unreachable,
    On,
    Off,
    /// Pulled from rotation for thrashing; held off until stability settles.
    Triaged,
    /// Pulled from rotation after a loss probe found sustained loss > δ.
    LossTriaged,
}

/// A state change SVCR wants relayed to a proxy as a set-flow-state message.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowTransition {
    TurnOn(FiveTuple),
    TurnOff(FiveTuple),
    Triaged(FiveTuple),
    RecoveredFromTriage(FiveTuple),
    LossTriaged(FiveTuple),
    RecoveredFromLossTriage(FiveTuple),
}

impl FlowTransition {
    pub fn five_tuple(&self) -> FiveTuple {
        match self {
            FlowTransition::TurnOn(ft)
            | FlowTransition::TurnOff(ft)
            | FlowTransition::Triaged(ft)
            | FlowTransition::RecoveredFromTriage(ft)
            | FlowTransition::LossTriaged(ft)
            | FlowTransition::RecoveredFromLossTriage(ft) => *ft,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SvcrConfig {
    pub triage_interval_us: u64,
    pub thrash_threshold: u32,
    pub stability_multiplier: f64,
    pub triage_cycles: u32,
    pub loss_triage_interval_us: u64,
    pub probing_max_loss: f64,
    pub min_egress_capacity_bps: f64,
}

impl Default for SvcrConfig {
    fn default() -> Self {
        SvcrConfig {
            triage_interval_us: DEFAULT_TRIAGE_INTERVAL_US,
            thrash_threshold: DEFAULT_THRASH_THRESHOLD,
            stability_multiplier: DEFAULT_STABILITY_MULTIPLIER,
            triage_cycles: DEFAULT_TRIAGE_CYCLES,
            loss_triage_interval_us: DEFAULT_LOSS_TRIAGE_INTERVAL_US,
            probing_max_loss: PROBING_MAX_LOSS,
            min_egress_capacity_bps: DEFAULT_MIN_EGRESS_CAPACITY_BPS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileTransferInfo {
    pub deadline_us: u64,
    pub size_bits: u64,
    pub bits_acked: u64,
    pub priority: u32,
    pub earned_utility: f64,
}

/// Everything SVCR knows about one flow. Coupled-flow links are
/// [`Handle<FlowInfo>`] indices into the owning [`Svcr`]'s arena rather than
/// the flow's own [`FiveTuple`] — per §9's design note on cyclic graphs, a
/// flow deleted out from under a stale link fails a generation check
/// instead of resurrecting a `FiveTuple` a later flow happens to reuse.
#[derive(Debug, Clone)]
pub struct FlowInfo {
    pub five_tuple: FiveTuple,
    pub dest: BinId,
    pub utility: UtilityDef,
    pub ttg_us: i64,
    /// EWMA of the admission rate actually observed from the proxy.
    pub admission_rate_bps: f64,
    pub state: FlowState,
    pub nominal_rate_bps: Option<f64>,
    /// Loss tolerance δ, raised to `probing_max_loss` while this flow is
    /// the active loss probe for its destination.
    pub delta: Option<f64>,
    pub observed_loss_rate: f64,
    pub toggle_count: u32,
    pub last_toggle_us: u64,
    pub triage_hold_until_us: u64,
    pub max_queue_bits: f64,
    /// `Some(primary)` on a non-primary member of a coupled-flow ring.
    pub aggregate_flow: Option<Handle<FlowInfo>>,
    /// Other members of the ring, populated only on the primary.
    pub coupled_members: Vec<Handle<FlowInfo>>,
    pub file_transfer: Option<FileTransferInfo>,
}

impl FlowInfo {
    fn new(five_tuple: FiveTuple, dest: BinId, utility: UtilityDef, ttg_us: i64) -> Self {
        let nominal_rate_bps = utility.nominal_rate_bps();
        let delta = utility.delta();
        FlowInfo {
            five_tuple,
            dest,
            utility,
            ttg_us,
            admission_rate_bps: 0.0,
            state: FlowState::Unreachable,
            nominal_rate_bps,
            delta,
            observed_loss_rate: 0.0,
            toggle_count: 0,
            last_toggle_us: 0,
            triage_hold_until_us: 0,
            max_queue_bits: 0.0,
            aggregate_flow: None,
            coupled_members: Vec::new(),
            file_transfer: None,
        }
    }

    pub fn priority(&self) -> f64 {
        self.utility.priority()
    }

    pub fn is_elastic(&self) -> bool {
        self.utility.kind.is_elastic()
    }
}

#[derive(Debug, Clone, Copy)]
struct LinkChar {
    latency_us: u32,
    capacity_bps: u32,
}

/// Maximizes `Σ U_f(x_f)` subject to `Σ x_f ≤ C` with a priority-sorted
/// greedy fit, plus thrash and loss-triage side channels that pull
/// misbehaving flows out of rotation.
pub struct Svcr {
    config: SvcrConfig,
    k_val: u64,
    /// Flow records live in an arena keyed by [`Handle<FlowInfo>`]; `index`
    /// is the stable `FiveTuple -> Handle` lookup every public method is
    /// keyed by, so callers never see a handle.
    flows: Arena<FlowInfo>,
    index: HashMap<FiveTuple, Handle<FlowInfo>>,
    latency_cache: HashMap<BinId, HashMap<String, LinkChar>>,
    probing_flow: HashMap<BinId, FiveTuple>,
    loss_probing_flow: HashMap<BinId, FiveTuple>,
    loss_probe_started_us: HashMap<BinId, u64>,
    num_flows_toggled_on: HashMap<BinId, u16>,
}

impl Svcr {
    pub fn new(config: SvcrConfig, k_val: u64) -> Self {
        Svcr {
            config,
            k_val,
            flows: Arena::new(),
            index: HashMap::new(),
            latency_cache: HashMap::new(),
            probing_flow: HashMap::new(),
            loss_probing_flow: HashMap::new(),
            loss_probe_started_us: HashMap::new(),
            num_flows_toggled_on: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SvcrConfig {
        &self.config
    }

    fn handle_for(&self, five_tuple: &FiveTuple) -> Option<Handle<FlowInfo>> {
        self.index.get(five_tuple).copied()
    }

    fn get_by_ft(&self, five_tuple: &FiveTuple) -> Option<&FlowInfo> {
        self.flows.get(self.handle_for(five_tuple)?)
    }

    fn get_mut_by_ft(&mut self, five_tuple: &FiveTuple) -> Option<&mut FlowInfo> {
        let h = self.handle_for(five_tuple)?;
        self.flows.get_mut(h)
    }

    /// Create or refresh a flow's utility-function definition. Does not
    /// change its admission state — a flow stays `Unreachable` until its
    /// first stats report arrives.
    pub fn update_flow_info(
        &mut self,
        five_tuple: FiveTuple,
        dest: BinId,
        utility: UtilityDef,
        ttg_us: i64,
    ) {
        if let Some(f) = self.get_mut_by_ft(&five_tuple) {
            f.nominal_rate_bps = utility.nominal_rate_bps();
            f.delta = utility.delta();
            f.utility = utility;
            f.ttg_us = ttg_us;
            return;
        }
        let handle = self.flows.insert(FlowInfo::new(five_tuple, dest, utility, ttg_us));
        self.index.insert(five_tuple, handle);
    }

    pub fn update_ft_flow_info(
        &mut self,
        five_tuple: FiveTuple,
        deadline_us: u64,
        size_bits: u64,
        priority: u32,
    ) {
        if let Some(flow) = self.get_mut_by_ft(&five_tuple) {
            flow.file_transfer = Some(FileTransferInfo {
                deadline_us,
                size_bits,
                bits_acked: 0,
                priority,
                earned_utility: 0.0,
            });
        }
    }

    /// Record a stats report from a proxy: the flow's first report moves it
    /// from `Unreachable` to `Off` (it becomes eligible for the next triage
    /// tick, but is not admitted until `compute_fit` accepts it).
    pub fn report_admission_rate(&mut self, five_tuple: FiveTuple, rate_bps: f64) {
        if let Some(flow) = self.get_mut_by_ft(&five_tuple) {
            flow.admission_rate_bps = rate_bps;
            if flow.state == FlowState::Unreachable {
                flow.state = FlowState::Off;
            }
        }
    }

    pub fn record_rrm(&mut self, five_tuple: FiveTuple, rrm: &Rrm) {
        let priority = self.get_by_ft(&five_tuple).map(|f| f.priority());
        if let Some(priority) = priority {
            let alpha = (gnat_common::constants::DEFAULT_LOSS_RATE_ALPHA / priority.max(1e-6)).clamp(0.0, 1.0);
            if let Some(flow) = self.get_mut_by_ft(&five_tuple) {
                flow.observed_loss_rate = (1.0 - alpha) * flow.observed_loss_rate + alpha * rrm.avg_loss_rate;
            }
        }
    }

    pub fn delete_flow_info(&mut self, five_tuple: &FiveTuple) {
        self.uncouple_flow(five_tuple);
        if let Some(handle) = self.index.remove(five_tuple) {
            self.flows.remove(handle);
        }
    }

    pub fn find_flow_info(&self, five_tuple: &FiveTuple) -> Option<&FlowInfo> {
        self.get_by_ft(five_tuple)
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn update_link_char(&mut self, next_hop: &str, bin: BinId, latency_us: u32, capacity_bps: u32) {
        self.latency_cache
            .entry(bin)
            .or_default()
            .insert(next_hop.to_string(), LinkChar { latency_us, capacity_bps });
    }

    /// Aggregate bandwidth of every next hop to `dest` whose latency meets
    /// `deadline_us`. Zero if the destination is unknown.
    pub fn get_constrained_bw(&self, dest: BinId, deadline_us: u32) -> u32 {
        self.latency_cache
            .get(&dest)
            .map(|hops| {
                hops.values()
                    .filter(|l| l.latency_us <= deadline_us)
                    .map(|l| l.capacity_bps)
                    .sum()
            })
            .unwrap_or(0)
    }

    pub fn compute_utility(priority: f64, rate_bps: f64) -> f64 {
        priority * (rate_bps + 1.0).ln()
    }

    /// An elastic flow that is underdriving relative to both its nominal
    /// rate and the destination's capacity won't use a fair share even if
    /// offered one — treat it as low-volume rather than forcing a cut.
    pub fn is_low_vol_flow(rate_bps: f64, nominal_rate_bps: f64, capacity_bps: f64) -> bool {
        rate_bps < nominal_rate_bps * UNDERDRIVING_THRESH_FRAC
            && rate_bps < capacity_bps * LOW_VOL_THRESH_FRAC
    }

    /// Links flows into a coupled-flow ring. The first tuple becomes the
    /// ring's primary and is the only member `compute_fit` schedules
    /// directly; the rest inherit its admission decisions. Fails (no state
    /// mutated) if fewer than two tuples are given or any is unknown.
    pub fn add_flow_coupling(&mut self, five_tuples: &[FiveTuple]) -> bool {
        if five_tuples.len() < 2 {
            return false;
        }
        let Some(handles) = five_tuples
            .iter()
            .map(|ft| self.handle_for(ft))
            .collect::<Option<Vec<_>>>()
        else {
            return false;
        };
        let primary = handles[0];
        for &h in &handles[1..] {
            if let Some(f) = self.flows.get_mut(h) {
                f.aggregate_flow = Some(primary);
                f.coupled_members.clear();
            }
        }
        if let Some(p) = self.flows.get_mut(primary) {
            p.aggregate_flow = None;
            p.coupled_members = handles[1..].to_vec();
        }
        true
    }

    /// Removes `five_tuple` from whatever coupling ring it belongs to. If
    /// it was the primary, the next member is promoted; a ring with one
    /// member left is fully dissolved.
    pub fn uncouple_flow(&mut self, five_tuple: &FiveTuple) {
        let Some(handle) = self.handle_for(five_tuple) else {
            return;
        };
        let Some(info) = self.flows.get(handle).cloned() else {
            return;
        };
        if let Some(primary) = info.aggregate_flow {
            if let Some(p) = self.flows.get_mut(primary) {
                p.coupled_members.retain(|&m| m != handle);
            }
            if let Some(f) = self.flows.get_mut(handle) {
                f.aggregate_flow = None;
            }
            return;
        }
        if info.coupled_members.is_empty() {
            return;
        }
        let mut members = info.coupled_members.clone();
        if members.len() == 1 {
            if let Some(f) = self.flows.get_mut(members[0]) {
                f.aggregate_flow = None;
                f.coupled_members.clear();
            }
        } else {
            let new_primary = members.remove(0);
            for &m in &members {
                if let Some(f) = self.flows.get_mut(m) {
                    f.aggregate_flow = Some(new_primary);
                }
            }
            if let Some(f) = self.flows.get_mut(new_primary) {
                f.aggregate_flow = None;
                f.coupled_members = members;
            }
        }
        if let Some(f) = self.flows.get_mut(handle) {
            f.coupled_members.clear();
        }
    }

    fn aggregate_rate(&self, primary: &FlowInfo) -> f64 {
        primary.admission_rate_bps
            + primary
                .coupled_members
                .iter()
                .filter_map(|&h| self.flows.get(h))
                .map(|f| f.admission_rate_bps)
                .sum::<f64>()
    }

    fn aggregate_priority(&self, primary: &FlowInfo) -> f64 {
        primary
            .coupled_members
            .iter()
            .filter_map(|&h| self.flows.get(h))
            .fold(primary.priority(), |acc, f| acc.max(f.priority()))
    }

    fn apply_transition(
        &mut self,
        primary: Handle<FlowInfo>,
        members: &[Handle<FlowInfo>],
        now_us: u64,
        new_state: FlowState,
        out: &mut Vec<FlowTransition>,
    ) {
        for h in std::iter::once(primary).chain(members.iter().copied()) {
            self.record_transition(h, now_us, new_state, out);
        }
    }

    fn record_transition(
        &mut self,
        handle: Handle<FlowInfo>,
        now_us: u64,
        new_state: FlowState,
        out: &mut Vec<FlowTransition>,
    ) {
        let Some(flow) = self.flows.get_mut(handle) else {
            return;
        };
        if flow.state == new_state {
            return;
        }
        let five_tuple = flow.five_tuple;
        let old_state = flow.state;
        flow.state = new_state;
        flow.toggle_count += 1;
        let within_window = now_us.saturating_sub(flow.last_toggle_us)
            < (self.config.triage_interval_us as f64 * THRASH_WINDOW_INTERVALS) as u64;
        flow.last_toggle_us = now_us;

        if matches!(old_state, FlowState::On | FlowState::Off)
            && within_window
            && flow.toggle_count > self.config.thrash_threshold
        {
            flow.state = FlowState::Triaged;
            flow.triage_hold_until_us =
                now_us + (self.config.stability_multiplier * flow.ttg_us.max(0) as f64) as u64;
            tracing::info!(
                flow = %five_tuple,
                toggle_count = flow.toggle_count,
                hold_until_us = flow.triage_hold_until_us,
                "flow triaged for thrashing"
            );
            out.push(FlowTransition::Triaged(five_tuple));
            return;
        }

        match new_state {
            FlowState::On => out.push(FlowTransition::TurnOn(five_tuple)),
            FlowState::Off => out.push(FlowTransition::TurnOff(five_tuple)),
            _ => {}
        }
    }

    /// Greedy-fit the known flow set onto `total_capacity_bps`. Returns the
    /// state transitions AMP must relay to proxies. A no-op (empty result)
    /// when capacity is below the configured minimum.
    pub fn compute_fit(&mut self, total_capacity_bps: f64, now_us: u64) -> Vec<FlowTransition> {
        if total_capacity_bps < self.config.min_egress_capacity_bps {
            return Vec::new();
        }
        let mut transitions = Vec::new();

        // Recover flows whose triage/loss-triage hold has elapsed so they
        // re-enter the ranking below as ordinary OFF candidates.
        let recoverable: Vec<Handle<FlowInfo>> = self
            .flows
            .iter()
            .filter(|(_, f)| {
                f.aggregate_flow.is_none()
                    && ((f.state == FlowState::Triaged && now_us >= f.triage_hold_until_us)
                        || (f.state == FlowState::LossTriaged && now_us >= f.triage_hold_until_us))
            })
            .map(|(h, _)| h)
            .collect();
        for h in recoverable {
            if let Some(f) = self.flows.get_mut(h) {
                let was_loss = f.state == FlowState::LossTriaged;
                f.state = FlowState::Off;
                let ft = f.five_tuple;
                transitions.push(if was_loss {
                    FlowTransition::RecoveredFromLossTriage(ft)
                } else {
                    FlowTransition::RecoveredFromTriage(ft)
                });
            }
        }

        struct Unit {
            primary: Handle<FlowInfo>,
            members: Vec<Handle<FlowInfo>>,
            priority: f64,
            rate_bps: f64,
            elastic: bool,
            nominal_rate_bps: Option<f64>,
        }

        let units: Vec<Unit> = self
            .flows
            .iter()
            .filter(|(_, f)| {
                f.aggregate_flow.is_none()
                    && !matches!(f.state, FlowState::Unreachable | FlowState::Triaged | FlowState::LossTriaged)
            })
            .map(|(h, f)| Unit {
                primary: h,
                members: f.coupled_members.clone(),
                priority: self.aggregate_priority(f),
                rate_bps: self.aggregate_rate(f),
                elastic: f.is_elastic(),
                nominal_rate_bps: f.nominal_rate_bps,
            })
            .collect();

        let (mut elastic_units, mut inelastic_units): (Vec<Unit>, Vec<Unit>) =
            units.into_iter().partition(|u| u.elastic);

        inelastic_units.sort_by(|a, b| {
            let na = a.priority / a.nominal_rate_bps.unwrap_or(1.0).max(1.0);
            let nb = b.priority / b.nominal_rate_bps.unwrap_or(1.0).max(1.0);
            nb.partial_cmp(&na).unwrap_or(std::cmp::Ordering::Equal)
        });
        elastic_units.sort_by(|a, b| b.priority.partial_cmp(&a.priority).unwrap_or(std::cmp::Ordering::Equal));

        let mut allocated = 0.0;
        for unit in &inelastic_units {
            let need = unit.nominal_rate_bps.unwrap_or(0.0);
            let new_state = if allocated + need <= total_capacity_bps {
                allocated += need;
                FlowState::On
            } else {
                FlowState::Off
            };
            self.apply_transition(unit.primary, &unit.members, now_us, new_state, &mut transitions);
        }

        let capacity_elastic = (total_capacity_bps - allocated).max(0.0);
        let mut low_vol = Vec::new();
        let mut fair_share = Vec::new();
        for unit in &elastic_units {
            if Self::is_low_vol_flow(unit.rate_bps, unit.nominal_rate_bps.unwrap_or(unit.rate_bps.max(1.0)), total_capacity_bps) {
                low_vol.push(unit);
            } else {
                fair_share.push(unit);
            }
        }
        for unit in &low_vol {
            self.apply_transition(unit.primary, &unit.members, now_us, FlowState::On, &mut transitions);
        }
        let sum_priority: f64 = fair_share.iter().map(|u| u.priority).sum();
        for unit in &fair_share {
            let new_state = if capacity_elastic > 0.0 && sum_priority > 0.0 {
                if let Some(flow) = self.flows.get_mut(unit.primary) {
                    let k = self.k_val as f64;
                    flow.max_queue_bits = k * sum_priority / capacity_elastic;
                }
                FlowState::On
            } else {
                FlowState::Off
            };
            self.apply_transition(unit.primary, &unit.members, now_us, new_state, &mut transitions);
        }

        let mut toggled_on_by_dest: HashMap<BinId, u16> = HashMap::new();
        for t in &transitions {
            if matches!(t, FlowTransition::TurnOn(_)) {
                if let Some(f) = self.get_by_ft(&t.five_tuple()) {
                    *toggled_on_by_dest.entry(f.dest).or_insert(0) += 1;
                }
            }
        }
        self.num_flows_toggled_on = toggled_on_by_dest;

        transitions
    }

    /// Elect (or keep) one loss probe per destination among its ON flows,
    /// raising that flow's tolerated loss rate to `probing_max_loss`. A
    /// probe that has run `triage_cycles` ticks and exceeded its true delta
    /// is loss-triaged; otherwise the probe rotates to the next ON flow.
    pub fn run_loss_probe_cycle(&mut self, dest: BinId, now_us: u64) -> Vec<FlowTransition> {
        let mut transitions = Vec::new();
        let cycle_span_us = self.config.triage_interval_us * self.config.triage_cycles as u64;

        if let Some(&probe_ft) = self.loss_probing_flow.get(&dest) {
            let started = *self.loss_probe_started_us.get(&dest).unwrap_or(&now_us);
            let elapsed = now_us.saturating_sub(started);
            let still_on = self
                .get_by_ft(&probe_ft)
                .map(|f| f.state == FlowState::On)
                .unwrap_or(false);

            if !still_on {
                self.loss_probing_flow.remove(&dest);
                self.loss_probe_started_us.remove(&dest);
            } else if elapsed >= cycle_span_us {
                let true_delta = self.get_by_ft(&probe_ft).and_then(|f| f.delta).unwrap_or(1.0);
                let observed = self.get_by_ft(&probe_ft).map(|f| f.observed_loss_rate).unwrap_or(0.0);
                if observed > true_delta {
                    if let Some(f) = self.get_mut_by_ft(&probe_ft) {
                        f.state = FlowState::LossTriaged;
                        f.triage_hold_until_us = now_us + self.config.loss_triage_interval_us;
                    }
                    tracing::info!(flow = %probe_ft, dest = %dest, observed, true_delta, "flow loss-triaged");
                    transitions.push(FlowTransition::LossTriaged(probe_ft));
                    self.loss_probing_flow.remove(&dest);
                    self.loss_probe_started_us.remove(&dest);
                } else {
                    self.loss_probing_flow.remove(&dest);
                    self.loss_probe_started_us.remove(&dest);
                }
                return transitions;
            } else {
                return transitions;
            }
        }

        let candidate = self
            .flows
            .iter()
            .find(|(_, f)| f.dest == dest && f.state == FlowState::On && f.aggregate_flow.is_none())
            .map(|(_, f)| f.five_tuple);

        if let Some(ft) = candidate {
            self.loss_probing_flow.insert(dest, ft);
            self.loss_probe_started_us.insert(dest, now_us);
        }

        transitions
    }

    pub fn num_flows_toggled_on(&self, dest: BinId) -> u16 {
        *self.num_flows_toggled_on.get(&dest).unwrap_or(&0)
    }
}
