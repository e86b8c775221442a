//! End-to-end scenario harness for the GNAT fabric: deterministic, in-
//! process two-node networks built from real `gnat-bpf`/`gnat-amp`/
//! `gnat-proxy` components, driven by explicit simulated time rather than
//! wall-clock or real sockets.

pub mod network;

pub use network::{step, NodeAddr, TwoNodeNet};
