//! Link-State Advertisement codec.
//!
//! ```text
//! Type(1) | SrcBinId(1) | SeqNum(2) | NumNbrs(1) | NumBins(1) | Flags(1) | Pad(1)
//!   for each neighbor:
//!     BinId(1) | LatencyMean100us(2) | LatencyStdDev100us(1)
//!     [ EncodedCapacity(2) if C=1 ]
//!   for each bin queue-delay pair: BinId(1) | QueueDelayUs(4)
//! ```
//!
//! Per §9's fix to the original's ambiguous field reuse: when the `C` flag
//! is set, every neighbor entry carries an encoded capacity; the trailing
//! queue-delay pairs are an independent, always-additional payload gated
//! purely by `NumBins > 0`, never conflated with the capacity flag.

use crate::{WireError, WireResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const LSA_TYPE: u8 = 0x02;

const FLAG_CAPACITY: u8 = 0x01;

/// `Δ` in the encoded-capacity formula `C = (i + d·Δ)·10^e`.
const CAPACITY_DELTA: f64 = 4e-3;

/// One neighbor edge originating at `SrcBinId`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LsaNeighbor {
    pub bin_id: u8,
    pub latency_mean_100us: u16,
    pub latency_stddev_100us: u8,
    /// `Some(bps)` iff the LSA's capacity flag is set.
    pub capacity_bps: Option<f64>,
}

/// A `BinId -> queue-delay(µs)` pair appended after the neighbor list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LsaQueueDelay {
    pub bin_id: u8,
    pub queue_delay_us: u32,
}

/// A fully parsed LSA.
#[derive(Debug, Clone, PartialEq)]
pub struct Lsa {
    pub src_bin_id: u8,
    pub seq_num: u16,
    pub neighbors: Vec<LsaNeighbor>,
    pub queue_delays: Vec<LsaQueueDelay>,
}

impl Lsa {
    fn carries_capacity(&self) -> bool {
        self.neighbors.iter().any(|n| n.capacity_bps.is_some())
    }

    pub fn encoded_len(&self) -> usize {
        let per_nbr = if self.carries_capacity() { 1 + 2 + 1 + 2 } else { 1 + 2 + 1 };
        1 + 1 + 2 + 1 + 1 + 1 + 1
            + self.neighbors.len() * per_nbr
            + self.queue_delays.len() * (1 + 4)
    }

    pub fn encode(&self) -> WireResult<Bytes> {
        let carries_capacity = self.carries_capacity();
        if carries_capacity && self.neighbors.iter().any(|n| n.capacity_bps.is_none()) {
            return Err(WireError::InvalidField {
                field: "neighbors",
                reason: "capacity flag requires every neighbor to carry a capacity".into(),
            });
        }

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(LSA_TYPE);
        buf.put_u8(self.src_bin_id);
        buf.put_u16(self.seq_num);
        buf.put_u8(self.neighbors.len() as u8);
        buf.put_u8(self.queue_delays.len() as u8);
        buf.put_u8(if carries_capacity { FLAG_CAPACITY } else { 0 });
        buf.put_u8(0); // Pad

        for nbr in &self.neighbors {
            buf.put_u8(nbr.bin_id);
            buf.put_u16(nbr.latency_mean_100us);
            buf.put_u8(nbr.latency_stddev_100us);
            if carries_capacity {
                let bps = nbr.capacity_bps.expect("checked above");
                let (b0, b1) = encode_capacity(bps)?;
                buf.put_u8(b0);
                buf.put_u8(b1);
            }
        }

        for qd in &self.queue_delays {
            buf.put_u8(qd.bin_id);
            buf.put_u32(qd.queue_delay_us);
        }

        Ok(buf.freeze())
    }

    pub fn decode(buf: &mut Bytes) -> WireResult<Lsa> {
        need(buf, 1 + 1 + 2 + 1 + 1 + 1 + 1)?;
        let ty = buf.get_u8();
        if ty != LSA_TYPE {
            return Err(WireError::InvalidField {
                field: "type",
                reason: format!("expected {LSA_TYPE}, got {ty}"),
            });
        }
        let src_bin_id = buf.get_u8();
        let seq_num = buf.get_u16();
        let num_nbrs = buf.get_u8();
        let num_bins = buf.get_u8();
        let flags = buf.get_u8();
        let _pad = buf.get_u8();
        let carries_capacity = flags & FLAG_CAPACITY != 0;

        let mut neighbors = Vec::with_capacity(num_nbrs as usize);
        for _ in 0..num_nbrs {
            need(buf, 1 + 2 + 1)?;
            let bin_id = buf.get_u8();
            let latency_mean_100us = buf.get_u16();
            let latency_stddev_100us = buf.get_u8();
            let capacity_bps = if carries_capacity {
                need(buf, 2)?;
                let b0 = buf.get_u8();
                let b1 = buf.get_u8();
                Some(decode_capacity(b0, b1)?)
            } else {
                None
            };
            neighbors.push(LsaNeighbor {
                bin_id,
                latency_mean_100us,
                latency_stddev_100us,
                capacity_bps,
            });
        }

        let mut queue_delays = Vec::with_capacity(num_bins as usize);
        for _ in 0..num_bins {
            need(buf, 1 + 4)?;
            queue_delays.push(LsaQueueDelay {
                bin_id: buf.get_u8(),
                queue_delay_us: buf.get_u32(),
            });
        }

        Ok(Lsa {
            src_bin_id,
            seq_num,
            neighbors,
            queue_delays,
        })
    }
}

/// `C = (i + d·Δ)·10^e`, `i∈1..9`, `d∈0..255`, `e∈1..16`.
fn encode_capacity(bps: f64) -> WireResult<(u8, u8)> {
    if bps <= 0.0 || !bps.is_finite() {
        return Err(WireError::InvalidField {
            field: "capacity_bps",
            reason: format!("capacity must be positive and finite, got {bps}"),
        });
    }
    for e in 1..=16u32 {
        let scale = 10f64.powi(e as i32);
        let scaled = bps / scale;
        if (1.0..10.0).contains(&scaled) {
            let i = scaled.floor() as u8;
            let i = i.clamp(1, 9);
            let frac = scaled - i as f64;
            let d = (frac / CAPACITY_DELTA).round().clamp(0.0, 255.0) as u8;
            let byte0 = (i << 4) | (e as u8 - 1);
            return Ok((byte0, d));
        }
    }
    Err(WireError::InvalidField {
        field: "capacity_bps",
        reason: format!("{bps} is out of the representable exponent range"),
    })
}

fn decode_capacity(byte0: u8, d: u8) -> WireResult<f64> {
    let i = byte0 >> 4;
    let e = (byte0 & 0x0F) as u32 + 1;
    if !(1..=9).contains(&i) {
        return Err(WireError::InvalidField {
            field: "encoded_capacity",
            reason: format!("mantissa digit {i} out of range 1..9"),
        });
    }
    let value = (i as f64 + d as f64 * CAPACITY_DELTA) * 10f64.powi(e as i32);
    Ok(value)
}

fn need(buf: &Bytes, n: usize) -> WireResult<()> {
    if buf.remaining() < n {
        Err(WireError::Truncated {
            needed: n,
            available: buf.remaining(),
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_round_trips_bit_exact() {
        for bps in [1_000_000.0, 1_500_000.0, 987_654_321.0, 1.5e9, 42.0] {
            let (b0, b1) = encode_capacity(bps).unwrap();
            let decoded = decode_capacity(b0, b1).unwrap();
            let relative_err = (decoded - bps).abs() / bps;
            assert!(
                relative_err < 0.005,
                "bps={bps} decoded={decoded} err={relative_err}"
            );
        }
    }

    #[test]
    fn lsa_round_trips_without_capacity() {
        let lsa = Lsa {
            src_bin_id: 1,
            seq_num: 9,
            neighbors: vec![LsaNeighbor {
                bin_id: 2,
                latency_mean_100us: 500,
                latency_stddev_100us: 10,
                capacity_bps: None,
            }],
            queue_delays: vec![LsaQueueDelay {
                bin_id: 2,
                queue_delay_us: 1200,
            }],
        };
        let mut encoded = lsa.encode().unwrap();
        let decoded = Lsa::decode(&mut encoded).unwrap();
        assert_eq!(decoded.neighbors[0].capacity_bps, None);
        assert_eq!(decoded.queue_delays, lsa.queue_delays);
    }

    #[test]
    fn lsa_round_trips_with_capacity() {
        let lsa = Lsa {
            src_bin_id: 1,
            seq_num: 9,
            neighbors: vec![LsaNeighbor {
                bin_id: 2,
                latency_mean_100us: 500,
                latency_stddev_100us: 10,
                capacity_bps: Some(10_000_000.0),
            }],
            queue_delays: vec![],
        };
        let mut encoded = lsa.encode().unwrap();
        let decoded = Lsa::decode(&mut encoded).unwrap();
        let cap = decoded.neighbors[0].capacity_bps.unwrap();
        assert!((cap - 10_000_000.0).abs() / 10_000_000.0 < 0.005);
    }

    #[test]
    fn mixed_capacity_presence_rejected_at_encode() {
        let lsa = Lsa {
            src_bin_id: 1,
            seq_num: 1,
            neighbors: vec![
                LsaNeighbor {
                    bin_id: 2,
                    latency_mean_100us: 0,
                    latency_stddev_100us: 0,
                    capacity_bps: Some(1.0e6),
                },
                LsaNeighbor {
                    bin_id: 3,
                    latency_mean_100us: 0,
                    latency_stddev_100us: 0,
                    capacity_bps: None,
                },
            ],
            queue_delays: vec![],
        };
        assert!(lsa.encode().is_err());
    }
}
