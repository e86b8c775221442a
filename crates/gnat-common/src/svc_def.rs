//! Parser for the service/flow-definition string carried in `set` messages:
//!
//! ```text
//! <lo_port>-<hi_port>;<mtu>;<reserved>;<reserved>;<period>;<ttg>;type=<KIND>[:<arg>=<val>]*
//! ```
//!
//! where `KIND ∈ {LOG, FLOG, TRAP, STRAP}` and common args include `a`, `m`,
//! `p`, `label`, and for STRAP, `delta`.

use crate::error::{GnatError, GnatResult};
use std::collections::BTreeMap;
use std::fmt;

/// The parsed utility-function kind, with its keyword arguments kept
/// unparsed-but-typed as strings/floats for the admission controller to
/// interpret per §4.9.
#[derive(Debug, Clone, PartialEq)]
pub enum UtilityKind {
    Log,
    Flog,
    Trap,
    Strap,
}

impl fmt::Display for UtilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UtilityKind::Log => "LOG",
            UtilityKind::Flog => "FLOG",
            UtilityKind::Trap => "TRAP",
            UtilityKind::Strap => "STRAP",
        };
        write!(f, "{s}")
    }
}

impl UtilityKind {
    /// Elastic flows share capacity proportionally to priority; inelastic
    /// flows get their nominal rate or nothing. Both LOG and FLOG are
    /// elastic — see the fixed `IsElastic` note in the design notes: the
    /// original's second disjunct was always true due to a `.compare()`
    /// misuse, but the intended behavior (both LOG and FLOG elastic) is
    /// exactly what this implements.
    pub fn is_elastic(&self) -> bool {
        matches!(self, UtilityKind::Log | UtilityKind::Flog)
    }

    fn parse(s: &str) -> GnatResult<Self> {
        match s {
            "LOG" => Ok(UtilityKind::Log),
            "FLOG" => Ok(UtilityKind::Flog),
            "TRAP" => Ok(UtilityKind::Trap),
            "STRAP" => Ok(UtilityKind::Strap),
            other => Err(GnatError::malformed(format!("unknown utility kind {other}"))),
        }
    }
}

/// A parsed utility-function definition: kind plus its keyword arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct UtilityDef {
    pub kind: UtilityKind,
    pub args: BTreeMap<String, String>,
}

impl UtilityDef {
    pub fn arg_f64(&self, key: &str) -> Option<f64> {
        self.args.get(key).and_then(|v| v.parse().ok())
    }

    pub fn priority(&self) -> f64 {
        self.arg_f64("p").unwrap_or(1.0)
    }

    pub fn nominal_rate_bps(&self) -> Option<f64> {
        self.arg_f64("m")
    }

    pub fn delta(&self) -> Option<f64> {
        self.arg_f64("delta")
    }

    pub fn label(&self) -> Option<&str> {
        self.args.get("label").map(|s| s.as_str())
    }
}

/// A fully parsed service- or flow-definition string.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDef {
    pub lo_port: u16,
    pub hi_port: u16,
    pub mtu: u32,
    pub reserved: [u32; 2],
    pub period_us: u32,
    pub ttg_us: i64,
    pub utility: UtilityDef,
}

/// Parse a service/flow-definition string per §6.
pub fn parse_service_def(s: &str) -> GnatResult<ServiceDef> {
    let fields: Vec<&str> = s.split(';').collect();
    if fields.len() != 7 {
        return Err(GnatError::malformed(format!(
            "expected 7 ';'-separated fields, got {}",
            fields.len()
        )));
    }

    let (lo_port, hi_port) = parse_port_range(fields[0])?;
    let mtu = parse_u32(fields[1], "mtu")?;
    let reserved0 = parse_u32(fields[2], "reserved[0]")?;
    let reserved1 = parse_u32(fields[3], "reserved[1]")?;
    let period_us = parse_u32(fields[4], "period")?;
    let ttg_us: i64 = fields[5]
        .parse()
        .map_err(|_| GnatError::malformed(format!("invalid ttg '{}'", fields[5])))?;
    let utility = parse_utility(fields[6])?;

    Ok(ServiceDef {
        lo_port,
        hi_port,
        mtu,
        reserved: [reserved0, reserved1],
        period_us,
        ttg_us,
        utility,
    })
}

fn parse_port_range(s: &str) -> GnatResult<(u16, u16)> {
    let (lo, hi) = s
        .split_once('-')
        .ok_or_else(|| GnatError::malformed(format!("invalid port range '{s}'")))?;
    let lo: u16 = lo
        .parse()
        .map_err(|_| GnatError::malformed(format!("invalid lo_port '{lo}'")))?;
    let hi: u16 = hi
        .parse()
        .map_err(|_| GnatError::malformed(format!("invalid hi_port '{hi}'")))?;
    if lo > hi {
        return Err(GnatError::malformed(format!(
            "lo_port {lo} exceeds hi_port {hi}"
        )));
    }
    Ok((lo, hi))
}

fn parse_u32(s: &str, field: &str) -> GnatResult<u32> {
    s.parse()
        .map_err(|_| GnatError::malformed(format!("invalid {field} '{s}'")))
}

fn parse_utility(s: &str) -> GnatResult<UtilityDef> {
    let s = s
        .strip_prefix("type=")
        .ok_or_else(|| GnatError::malformed(format!("utility field must start with 'type=': {s}")))?;
    let mut parts = s.split(':');
    let kind_str = parts
        .next()
        .ok_or_else(|| GnatError::malformed("missing utility kind"))?;
    let kind = UtilityKind::parse(kind_str)?;

    let mut args = BTreeMap::new();
    for part in parts {
        let (k, v) = part
            .split_once('=')
            .ok_or_else(|| GnatError::malformed(format!("invalid utility arg '{part}'")))?;
        args.insert(k.to_string(), v.to_string());
    }

    Ok(UtilityDef { kind, args })
}
