//! Receiver Report Message codec.
//!
//! Emitted by a flow's `DecodingState` to the source BPF's control channel
//! every `periodic_rrm_interval_ms`, carrying the loss/delivery counters the
//! source-side SVCR uses to drive loss triage (§4.9, §4.8 step 5).
//!
//! ```text
//! Type(1) | FlowToken(8) | HighestBytesSourced(8) | HighestPacketsSourced(8)
//!   | TotalBytesReleased(8) | PacketsReleased(8) | AvgLossRatePpm(4)
//! ```
//!
//! The average loss rate is carried as parts-per-million (`u32`) rather
//! than a float, so the wire form stays bit-exact across encode/decode.

use crate::{WireError, WireResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const RRM_TYPE: u8 = 0x04;

/// A fully parsed RRM for one flow.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rrm {
    /// Identifies the flow this report is about — assigned by the source
    /// proxy at flow creation and echoed back so the BPF's control channel
    /// can route it without looking up a five-tuple.
    pub flow_token: u64,
    pub highest_bytes_sourced: u64,
    pub highest_packets_sourced: u64,
    pub total_bytes_released: u64,
    pub packets_released: u64,
    pub avg_loss_rate: f64,
}

impl Rrm {
    pub const ENCODED_LEN: usize = 1 + 8 + 8 + 8 + 8 + 8 + 4;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_LEN);
        buf.put_u8(RRM_TYPE);
        buf.put_u64(self.flow_token);
        buf.put_u64(self.highest_bytes_sourced);
        buf.put_u64(self.highest_packets_sourced);
        buf.put_u64(self.total_bytes_released);
        buf.put_u64(self.packets_released);
        buf.put_u32(loss_rate_to_ppm(self.avg_loss_rate));
        buf.freeze()
    }

    pub fn decode(buf: &mut Bytes) -> WireResult<Rrm> {
        if buf.remaining() < Self::ENCODED_LEN {
            return Err(WireError::Truncated {
                needed: Self::ENCODED_LEN,
                available: buf.remaining(),
            });
        }
        let ty = buf.get_u8();
        if ty != RRM_TYPE {
            return Err(WireError::InvalidField {
                field: "type",
                reason: format!("expected {RRM_TYPE}, got {ty}"),
            });
        }
        Ok(Rrm {
            flow_token: buf.get_u64(),
            highest_bytes_sourced: buf.get_u64(),
            highest_packets_sourced: buf.get_u64(),
            total_bytes_released: buf.get_u64(),
            packets_released: buf.get_u64(),
            avg_loss_rate: ppm_to_loss_rate(buf.get_u32()),
        })
    }
}

fn loss_rate_to_ppm(rate: f64) -> u32 {
    (rate.clamp(0.0, 1.0) * 1_000_000.0).round() as u32
}

fn ppm_to_loss_rate(ppm: u32) -> f64 {
    ppm as f64 / 1_000_000.0
}
