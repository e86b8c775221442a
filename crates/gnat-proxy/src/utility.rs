//! Per-flow utility-function shapes (§4.9): turn an observed admission-queue
//! backlog into a target admission rate. Grounded on the formulas named in
//! the service/flow-definition grammar (`gnat_common::svc_def`) — LOG and
//! FLOG use the classic drift-plus-penalty backpressure law (the rate that
//! balances marginal utility against queue pressure scaled by `K`), STRAP
//! steps between a configured nominal rate, and TRAP targets a rate/loss
//! pair with a triangular utility peak.

use gnat_common::svc_def::UtilityDef;

/// Backlog/loss observations fed to a utility function each recompute.
#[derive(Debug, Clone, Copy, Default)]
pub struct UtilityInputs {
    pub backlog_bits: f64,
    pub observed_loss_rate: f64,
}

/// A utility function's admission-rate law.
pub trait UtilityFn: std::fmt::Debug {
    fn priority(&self) -> f64;
    fn is_elastic(&self) -> bool;
    /// The rate this flow should be admitted at, in bits/sec.
    fn admission_rate_bps(&mut self, k_val: f64, inputs: UtilityInputs) -> f64;
    fn nominal_rate_bps(&self) -> Option<f64>;
    fn delta(&self) -> Option<f64>;
    /// True once this flow's loss or backlog history exceeds what its
    /// shape tolerates — STRAP/TRAP use this to flag δ-triage.
    fn is_triaged(&self) -> bool {
        false
    }
}

/// `p * ln(r + 1)`. The backpressure-optimal rate for this shape is the
/// one where marginal utility `p / (r + 1)` matches queue pressure
/// `backlog_bits / k_val`.
#[derive(Debug, Clone)]
pub struct LogUtility {
    pub priority: f64,
}

impl UtilityFn for LogUtility {
    fn priority(&self) -> f64 {
        self.priority
    }
    fn is_elastic(&self) -> bool {
        true
    }
    fn admission_rate_bps(&mut self, k_val: f64, inputs: UtilityInputs) -> f64 {
        let pressure = (inputs.backlog_bits / k_val.max(1.0)).max(1e-9);
        (self.priority / pressure - 1.0).max(0.0)
    }
    fn nominal_rate_bps(&self) -> Option<f64> {
        None
    }
    fn delta(&self) -> Option<f64> {
        None
    }
}

/// Same backpressure law as [`LogUtility`], with finite-loss forgiveness:
/// a flow already experiencing loss is granted a higher admission rate
/// than its raw backlog would imply, since some of that backlog will
/// never need retransmission.
#[derive(Debug, Clone)]
pub struct FlogUtility {
    pub priority: f64,
    pub forgiveness_frac: f64,
}

impl UtilityFn for FlogUtility {
    fn priority(&self) -> f64 {
        self.priority
    }
    fn is_elastic(&self) -> bool {
        true
    }
    fn admission_rate_bps(&mut self, k_val: f64, inputs: UtilityInputs) -> f64 {
        let forgiven = inputs.backlog_bits * (1.0 - (self.forgiveness_frac * inputs.observed_loss_rate).min(0.9));
        let pressure = (forgiven / k_val.max(1.0)).max(1e-9);
        (self.priority / pressure - 1.0).max(0.0)
    }
    fn nominal_rate_bps(&self) -> Option<f64> {
        None
    }
    fn delta(&self) -> Option<f64> {
        None
    }
}

/// A stepped nominal-rate utility: the admitted rate moves toward
/// `nominal_rate_bps` in `n_steps` increments, backing off a step whenever
/// backlog is growing, and is δ-triaged once observed loss exceeds delta.
#[derive(Debug, Clone)]
pub struct StrapUtility {
    pub priority: f64,
    pub nominal_rate_bps: f64,
    pub delta: f64,
    pub n_steps: u32,
    current_step: u32,
    last_backlog_bits: f64,
    triaged: bool,
}

impl StrapUtility {
    pub fn new(priority: f64, nominal_rate_bps: f64, delta: f64, n_steps: u32) -> Self {
        StrapUtility {
            priority,
            nominal_rate_bps,
            delta,
            n_steps: n_steps.max(1),
            current_step: 0,
            last_backlog_bits: 0.0,
            triaged: false,
        }
    }
}

impl UtilityFn for StrapUtility {
    fn priority(&self) -> f64 {
        self.priority
    }
    fn is_elastic(&self) -> bool {
        false
    }
    fn admission_rate_bps(&mut self, _k_val: f64, inputs: UtilityInputs) -> f64 {
        if inputs.observed_loss_rate > self.delta {
            self.triaged = true;
            return 0.0;
        }
        self.triaged = false;
        if inputs.backlog_bits > self.last_backlog_bits && self.current_step > 0 {
            self.current_step -= 1;
        } else if inputs.backlog_bits <= self.last_backlog_bits && self.current_step < self.n_steps {
            self.current_step += 1;
        }
        self.last_backlog_bits = inputs.backlog_bits;
        self.nominal_rate_bps * (self.current_step as f64 / self.n_steps as f64)
    }
    fn nominal_rate_bps(&self) -> Option<f64> {
        Some(self.nominal_rate_bps)
    }
    fn delta(&self) -> Option<f64> {
        Some(self.delta)
    }
    fn is_triaged(&self) -> bool {
        self.triaged
    }
}

/// A triangular utility peaking at `target_rate_bps`, tolerant of loss up
/// to `delta` before the rate is scaled back proportionally.
#[derive(Debug, Clone)]
pub struct TrapUtility {
    pub priority: f64,
    pub target_rate_bps: f64,
    pub delta: f64,
}

impl UtilityFn for TrapUtility {
    fn priority(&self) -> f64 {
        self.priority
    }
    fn is_elastic(&self) -> bool {
        false
    }
    fn admission_rate_bps(&mut self, _k_val: f64, inputs: UtilityInputs) -> f64 {
        if self.delta <= 0.0 {
            return self.target_rate_bps;
        }
        let loss_frac = (inputs.observed_loss_rate / self.delta).clamp(0.0, 1.0);
        self.target_rate_bps * (1.0 - loss_frac)
    }
    fn nominal_rate_bps(&self) -> Option<f64> {
        Some(self.target_rate_bps)
    }
    fn delta(&self) -> Option<f64> {
        Some(self.delta)
    }
}

/// Build the right [`UtilityFn`] implementation from a parsed service/flow
/// definition.
pub fn build_utility_fn(def: &UtilityDef) -> Box<dyn UtilityFn + Send> {
    use gnat_common::svc_def::UtilityKind;
    match def.kind {
        UtilityKind::Log => Box::new(LogUtility { priority: def.priority() }),
        UtilityKind::Flog => Box::new(FlogUtility {
            priority: def.priority(),
            forgiveness_frac: 0.5,
        }),
        UtilityKind::Strap => Box::new(StrapUtility::new(
            def.priority(),
            def.nominal_rate_bps().unwrap_or(0.0),
            def.delta().unwrap_or(0.05),
            8,
        )),
        UtilityKind::Trap => Box::new(TrapUtility {
            priority: def.priority(),
            target_rate_bps: def.nominal_rate_bps().unwrap_or(0.0),
            delta: def.delta().unwrap_or(0.05),
        }),
    }
}
