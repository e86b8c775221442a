//! Group Advertisement Message codec.
//!
//! GRAM's wire shape is not specified by the neighbor-advertisement section
//! directly; this follows the multicast model's own shape: a length-framed
//! sibling of QLAM/LSA carrying only what the BPF needs to mutate
//! multicast bin-map membership (the group-management sniffing logic that
//! produces these on a real deployment is out of scope).
//!
//! ```text
//! Type(1) | SrcBinId(1) | SeqNum(2) | McastAddr(4) | Action(1)
//! ```

use crate::{WireError, WireResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const GRAM_TYPE: u8 = 0x03;

/// Default GRAM port/group, per the external-interfaces section.
pub const DEFAULT_GRAM_PORT: u16 = 48901;
pub const DEFAULT_GRAM_GROUP: [u8; 4] = [224, 77, 77, 77];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GramAction {
    Join,
    Leave,
}

impl GramAction {
    fn to_byte(self) -> u8 {
        match self {
            GramAction::Join => 0,
            GramAction::Leave => 1,
        }
    }

    fn from_byte(b: u8) -> WireResult<Self> {
        match b {
            0 => Ok(GramAction::Join),
            1 => Ok(GramAction::Leave),
            other => Err(WireError::InvalidField {
                field: "action",
                reason: format!("unknown GRAM action byte {other}"),
            }),
        }
    }
}

/// A fully parsed GRAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gram {
    pub src_bin_id: u8,
    pub seq_num: u16,
    pub mcast_addr: u32,
    pub action: GramAction,
}

impl Gram {
    pub const ENCODED_LEN: usize = 1 + 1 + 2 + 4 + 1;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_LEN);
        buf.put_u8(GRAM_TYPE);
        buf.put_u8(self.src_bin_id);
        buf.put_u16(self.seq_num);
        buf.put_u32(self.mcast_addr);
        buf.put_u8(self.action.to_byte());
        buf.freeze()
    }

    pub fn decode(buf: &mut Bytes) -> WireResult<Gram> {
        if buf.remaining() < Self::ENCODED_LEN {
            return Err(WireError::Truncated {
                needed: Self::ENCODED_LEN,
                available: buf.remaining(),
            });
        }
        let ty = buf.get_u8();
        if ty != GRAM_TYPE {
            return Err(WireError::InvalidField {
                field: "type",
                reason: format!("expected {GRAM_TYPE}, got {ty}"),
            });
        }
        Ok(Gram {
            src_bin_id: buf.get_u8(),
            seq_num: buf.get_u16(),
            mcast_addr: buf.get_u32(),
            action: GramAction::from_byte(buf.get_u8())?,
        })
    }
}
