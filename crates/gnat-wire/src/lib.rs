//! On-wire codecs for the neighbor-advertisement protocols (QLAM, LSA,
//! GRAM) and the `serde`-derived remote-control message types.
//!
//! The codecs here are bit-exact encode/decode, matching §4.3; the
//! transport that frames them onto sockets or shared-memory FIFOs is an
//! external collaborator (see `gnat-bpf::path::PathController` and
//! `gnat-wire::rc::RemoteControlChannel`).

pub mod gram;
pub mod lsa;
pub mod qlam;
pub mod rc;
pub mod rrm;

use thiserror::Error;

/// Errors raised while decoding a wire packet. All map to
/// [`gnat_common::GnatError::Malformed`] at the component boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer truncated: needed {needed} bytes, had {available}")]
    Truncated { needed: usize, available: usize },
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl From<WireError> for gnat_common::GnatError {
    fn from(e: WireError) -> Self {
        gnat_common::GnatError::malformed(e.to_string())
    }
}

pub type WireResult<T> = Result<T, WireError>;
