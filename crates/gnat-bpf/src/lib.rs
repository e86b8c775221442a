//! The backpressure forwarder: the path-controller contract, the
//! queue-differential forwarding algorithm, and the top-level event loop
//! that ties FIFOs, path controllers, and timers together.

pub mod forwarding;
pub mod fwder;
pub mod path;
pub mod qlam_view;

pub use forwarding::{
    AntiCirculationMode, ForwardingAlg, ForwardingConfig, NeighborCandidate, Solution,
};
pub use fwder::{BpfLoop, FifoPacket, Timers};
pub use path::{PathController, ReliabilityMode, StreamKind};
pub use qlam_view::QlamView;
