//! The UDP proxy's admission/release core (§4.9): per-flow utility-driven
//! encoding on the source side, reorder/FEC/RRM-feedback decoding on the
//! sink side, tied together by [`proxy::UdpProxyCore`].

pub mod decoding;
pub mod encoding;
pub mod proxy;
pub mod utility;

pub use decoding::{DecodingState, ReceptionHistory, ReleaseRecord};
pub use encoding::{DropPolicy, EncodingState, FecContext, StampedPacket};
pub use proxy::{BpfFifo, LocalRelease, UdpProxyCore};
pub use utility::{build_utility_fn, FlogUtility, LogUtility, StrapUtility, TrapUtility, UtilityFn, UtilityInputs};
