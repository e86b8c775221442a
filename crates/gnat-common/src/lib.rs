//! Shared identifiers, bin-map, arena handles, and the error taxonomy used
//! by every GNAT crate: the backpressure forwarder, the admission planner,
//! and the UDP proxy admission/release stages.

pub mod arena;
pub mod binmap;
pub mod constants;
pub mod error;
pub mod flow;
pub mod ids;
pub mod svc_def;

pub use arena::{Arena, Handle};
pub use binmap::{BinMap, DstVec};
pub use error::GnatError;
pub use flow::{FiveTuple, FourTuple, ProxyKind};
pub use ids::{BinId, BinIndex, BinKind, McastId};
