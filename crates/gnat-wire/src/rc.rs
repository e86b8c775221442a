//! Remote-control message types.
//!
//! §6 specifies the wire transport as length-delimited JSON over a live TCP
//! socket — that framing and the JSON-RPC dispatch loop are the explicitly
//! out-of-scope "external collaborator". What belongs here are the message
//! *types* themselves (needed by `gnat-amp` to express its proxy-relay
//! responsibilities) and a request/reply-by-value `RemoteControlChannel`
//! trait seam, mirroring the role `LinkSender` plays for the scheduler:
//! callers talk to the trait, never to a socket, so AMP and the proxies
//! stay unit-testable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Known remote-control targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Bpf,
    UdpProxy,
    TcpProxy,
    /// `pc:<n>` — the n'th path controller.
    PathController(u32),
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Bpf => write!(f, "bpf"),
            Target::UdpProxy => write!(f, "udp_proxy"),
            Target::TcpProxy => write!(f, "tcp_proxy"),
            Target::PathController(n) => write!(f, "pc:{n}"),
        }
    }
}

impl std::str::FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bpf" => Ok(Target::Bpf),
            "udp_proxy" => Ok(Target::UdpProxy),
            "tcp_proxy" => Ok(Target::TcpProxy),
            other => other
                .strip_prefix("pc:")
                .and_then(|n| n.parse().ok())
                .map(Target::PathController)
                .ok_or_else(|| format!("unknown remote-control target '{other}'")),
        }
    }
}

/// Every remote-control message kind, tagged by its `msg` field exactly as
/// specified in §6's schema table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum RcMessage {
    Set {
        msgid: u64,
        tgt: String,
        keyvals: BTreeMap<String, String>,
    },
    SetReply {
        msgid: u64,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        errmsg: Option<String>,
    },
    Get {
        msgid: u64,
        tgt: String,
        keys: Vec<String>,
    },
    GetReply {
        msgid: u64,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        keyvals: Option<BTreeMap<String, String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        errmsg: Option<String>,
    },
    PushReq {
        msgid: u64,
        tgt: String,
        intv: u64,
        keys: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        options: Option<BTreeMap<String, String>>,
    },
    Push {
        msgid: u64,
        keyvals: BTreeMap<String, String>,
    },
    PushError {
        msgid: u64,
        errmsg: String,
    },
    PushStop {
        msgid: u64,
        tgt: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        to_stop: Option<Vec<u64>>,
    },
    Close,
}

impl RcMessage {
    /// `Some(msgid)` for every kind except `close`, which carries none.
    pub fn msgid(&self) -> Option<u64> {
        match self {
            RcMessage::Set { msgid, .. }
            | RcMessage::SetReply { msgid, .. }
            | RcMessage::Get { msgid, .. }
            | RcMessage::GetReply { msgid, .. }
            | RcMessage::PushReq { msgid, .. }
            | RcMessage::Push { msgid, .. }
            | RcMessage::PushError { msgid, .. }
            | RcMessage::PushStop { msgid, .. } => Some(*msgid),
            RcMessage::Close => None,
        }
    }
}

/// A request/reply-by-value seam standing in for a live remote-control
/// socket. Implementors may be an in-memory mock (tests, `gnat-sim`) or a
/// real length-delimited-JSON TCP client — the latter lives outside this
/// crate's scope.
pub trait RemoteControlChannel {
    /// Send a message and, for request kinds that expect one, return the
    /// peer's reply synchronously. `Close` and one-way pushes return `None`.
    fn send(&mut self, msg: RcMessage) -> Option<RcMessage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_round_trips_through_json() {
        let msg = RcMessage::Set {
            msgid: 7,
            tgt: "bpf".into(),
            keyvals: BTreeMap::from([("flow_state".to_string(), "on".to_string())]),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"msg\":\"set\""));
        let back: RcMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn close_has_no_msgid() {
        assert_eq!(RcMessage::Close.msgid(), None);
        let json = serde_json::to_string(&RcMessage::Close).unwrap();
        assert!(json.contains("\"msg\":\"close\""));
    }

    #[test]
    fn target_round_trips_via_display_and_fromstr() {
        for target in [
            Target::Bpf,
            Target::UdpProxy,
            Target::TcpProxy,
            Target::PathController(3),
        ] {
            let s = target.to_string();
            let parsed: Target = s.parse().unwrap();
            assert_eq!(parsed, target);
        }
    }

    struct EchoChannel;
    impl RemoteControlChannel for EchoChannel {
        fn send(&mut self, msg: RcMessage) -> Option<RcMessage> {
            match msg {
                RcMessage::Get { msgid, .. } => Some(RcMessage::GetReply {
                    msgid,
                    success: true,
                    keyvals: Some(BTreeMap::new()),
                    errmsg: None,
                }),
                _ => None,
            }
        }
    }

    #[test]
    fn channel_seam_is_object_safe_and_usable() {
        let mut chan: Box<dyn RemoteControlChannel> = Box::new(EchoChannel);
        let reply = chan.send(RcMessage::Get {
            msgid: 1,
            tgt: "bpf".into(),
            keys: vec![],
        });
        assert!(matches!(reply, Some(RcMessage::GetReply { success: true, .. })));
    }
}
