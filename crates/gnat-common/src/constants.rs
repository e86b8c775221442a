//! Process-wide sizing limits and sentinel values.
//!
//! Mirrors the fixed-size-array discipline of the original: these bounds
//! size every per-kind array up front so the steady-state loop never
//! allocates.

/// Maximum number of unicast-destination bin IDs (also the DstVec width).
pub const MAX_NUM_DSTS: usize = 24;
/// Maximum number of interior-node bin IDs.
pub const MAX_NUM_INT_NODES: usize = 24;
/// Maximum number of simultaneously active multicast groups.
pub const MAX_NUM_MCAST_GROUPS: usize = 16;

/// Largest valid unicast bin ID.
pub const MAX_UCAST_BIN_ID: u8 = 23;
/// Largest valid bin ID of any kind (`u8::MAX - 1`).
pub const MAX_BIN_ID: u8 = u8::MAX - 1;
/// Sentinel for "no bin" (`u8::MAX`).
pub const INVALID_BIN_ID: u8 = u8::MAX;
/// Sentinel for "no multicast id" — 0 is not a valid hashed group id.
pub const INVALID_MCAST_ID: u32 = 0;

/// Default anti-circulation mode name, matching the original's default.
pub const DEFAULT_ANTI_CIRCULATION: &str = "HeuristicDAG";
/// Default forwarding-algorithm variant name.
pub const DEFAULT_BPFWDER_ALG: &str = "LatencyAware";

/// Default hysteresis floor below which a gradient is not actionable.
pub const DEFAULT_HYSTERESIS_BYTES: i64 = 150;

/// `IsLowVolFlow` thresholds (fraction of nominal rate / capacity).
pub const UNDERDRIVING_THRESH_FRAC: f64 = 0.25;
pub const LOW_VOL_THRESH_FRAC: f64 = 0.01;

/// Loss-probe ceiling used during SVCR's loss-triage cycle.
pub const PROBING_MAX_LOSS: f64 = 0.98;

/// Default GRAM multicast group/port, per the external-interfaces section.
pub const DEFAULT_GRAM_PORT: u16 = 48901;
pub const DEFAULT_GRAM_GROUP: [u8; 4] = [224, 77, 77, 77];

/// Inactivity timeout (seconds) after which encoding/decoding state is
/// garbage-collected.
pub const ENCODING_STATE_GC_SECS: u64 = 120;

/// Base EWMA coefficient for a release record's loss-rate estimate; the
/// per-flow alpha is this divided by the flow's priority.
pub const DEFAULT_LOSS_RATE_ALPHA: f64 = 0.1;

/// Default SVCR triage cadence.
pub const DEFAULT_TRIAGE_INTERVAL_US: u64 = 500_000;
/// Default number of `triage_interval`s a thrash window spans.
pub const THRASH_WINDOW_INTERVALS: f64 = 1.5;
/// Default toggles-within-window before a flow is judged thrashing.
pub const DEFAULT_THRASH_THRESHOLD: u32 = 4;
/// Default multiplier applied to a flow's ttg to compute its triage hold.
pub const DEFAULT_STABILITY_MULTIPLIER: f64 = 3.0;
/// Default number of triage cycles a loss probe runs before judging.
pub const DEFAULT_TRIAGE_CYCLES: u32 = 3;
/// Default hold-off after a flow is loss-triaged, in microseconds.
pub const DEFAULT_LOSS_TRIAGE_INTERVAL_US: u64 = 5_000_000;
/// Default minimum egress capacity below which a triage tick is skipped.
pub const DEFAULT_MIN_EGRESS_CAPACITY_BPS: f64 = 1_000.0;
