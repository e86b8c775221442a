//! The admission planner: service/flow-definition caches, GUI relay, queue
//! trajectory tracking, and the supervisory-control greedy-fit solver.

pub mod planner;
pub mod svcr;

pub use planner::{Amp, AmpConfig, AmpTickReport, TimedCommand};
pub use svcr::{FlowInfo, FlowState, FlowTransition, Svcr, SvcrConfig};
