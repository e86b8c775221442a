//! Queue-Length Advertisement Message codec.
//!
//! ```text
//! Type(1) | SrcBinId(1) | SeqNum(4) | NumGroups(2)
//!   for each group:
//!     GroupId(4) | NumPairs(1)
//!     for each pair:
//!       DstBinId(1) | QueueDepthBytes(4) | LSQueueDepthBytes(4)
//! ```
//!
//! Group 0 carries all unicast pairs; each subsequent group carries a
//! multicast group's per-destination depths.

use crate::{WireError, WireResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const QLAM_TYPE: u8 = 0x01;

/// One destination's depth pair within a QLAM group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QlamDepthPair {
    pub dst_bin_id: u8,
    pub queue_depth_bytes: u32,
    pub ls_queue_depth_bytes: u32,
}

/// A group within a QLAM: group 0 is unicast, others are multicast groups
/// keyed by their hashed group id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QlamGroup {
    pub group_id: u32,
    pub pairs: Vec<QlamDepthPair>,
}

/// A fully parsed QLAM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Qlam {
    pub src_bin_id: u8,
    pub seq_num: u32,
    pub groups: Vec<QlamGroup>,
}

impl Qlam {
    pub fn encoded_len(&self) -> usize {
        let mut len = 1 + 1 + 4 + 2;
        for group in &self.groups {
            len += 4 + 1 + group.pairs.len() * (1 + 4 + 4);
        }
        len
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(QLAM_TYPE);
        buf.put_u8(self.src_bin_id);
        buf.put_u32(self.seq_num);
        buf.put_u16(self.groups.len() as u16);
        for group in &self.groups {
            buf.put_u32(group.group_id);
            buf.put_u8(group.pairs.len() as u8);
            for pair in &group.pairs {
                buf.put_u8(pair.dst_bin_id);
                buf.put_u32(pair.queue_depth_bytes);
                buf.put_u32(pair.ls_queue_depth_bytes);
            }
        }
        buf.freeze()
    }

    pub fn decode(buf: &mut Bytes) -> WireResult<Qlam> {
        need(buf, 1 + 1 + 4 + 2)?;
        let ty = buf.get_u8();
        if ty != QLAM_TYPE {
            return Err(WireError::InvalidField {
                field: "type",
                reason: format!("expected {QLAM_TYPE}, got {ty}"),
            });
        }
        let src_bin_id = buf.get_u8();
        let seq_num = buf.get_u32();
        let num_groups = buf.get_u16();

        let mut groups = Vec::with_capacity(num_groups as usize);
        for _ in 0..num_groups {
            need(buf, 4 + 1)?;
            let group_id = buf.get_u32();
            let num_pairs = buf.get_u8();
            let mut pairs = Vec::with_capacity(num_pairs as usize);
            for _ in 0..num_pairs {
                need(buf, 1 + 4 + 4)?;
                pairs.push(QlamDepthPair {
                    dst_bin_id: buf.get_u8(),
                    queue_depth_bytes: buf.get_u32(),
                    ls_queue_depth_bytes: buf.get_u32(),
                });
            }
            groups.push(QlamGroup { group_id, pairs });
        }

        Ok(Qlam {
            src_bin_id,
            seq_num,
            groups,
        })
    }
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

    fn sample() -> Qlam {
        Qlam {
            src_bin_id: 3,
            seq_num: 77,
            groups: vec![
                QlamGroup {
                    group_id: 0,
                    pairs: vec![
                        QlamDepthPair {
                            dst_bin_id: 1,
                            queue_depth_bytes: 1000,
                            ls_queue_depth_bytes: 50,
                        },
                        QlamDepthPair {
                            dst_bin_id: 2,
                            queue_depth_bytes: 2000,
                            ls_queue_depth_bytes: 0,
                        },
                    ],
                },
                QlamGroup {
                    group_id: 0xC0A8_0001,
                    pairs: vec![QlamDepthPair {
                        dst_bin_id: 4,
                        queue_depth_bytes: 500,
                        ls_queue_depth_bytes: 10,
                    }],
                },
            ],
        }
    }

    #[test]
    fn round_trips() {
        let q = sample();
        let encoded = q.encode();
        assert_eq!(encoded.len(), q.encoded_len());
        let mut buf = encoded;
        let decoded = Qlam::decode(&mut buf).unwrap();
        assert_eq!(decoded, q);
    }

    #[test]
    fn num_groups_zero_is_well_formed_noop() {
        let q = Qlam {
            src_bin_id: 1,
            seq_num: 1,
            groups: vec![],
        };
        let mut encoded = q.encode();
        let decoded = Qlam::decode(&mut encoded).unwrap();
        assert!(decoded.groups.is_empty());
    }

    #[test]
    fn truncated_buffer_errors() {
        let q = sample();
        let encoded = q.encode();
        let mut truncated = encoded.slice(0..encoded.len() - 2);
        assert!(Qlam::decode(&mut truncated).is_err());
    }

    #[test]
    fn wrong_type_byte_errors() {
        let mut bad = BytesMut::new();
        bad.put_u8(0xFF);
        bad.put_u8(0);
        bad.put_u32(0);
        bad.put_u16(0);
        let mut bad = bad.freeze();
        let err = Qlam::decode(&mut bad).unwrap_err();
        assert!(matches!(err, WireError::InvalidField { .. }));
    }
}
