//! The five-kind error taxonomy shared by every GNAT component.
//!
//! Component-internal errors are translated to one of these kinds at the
//! component boundary; only [`GnatError::Fatal`] is meant to propagate past
//! a top-level event loop (as `anyhow::Error` there).

use thiserror::Error;

/// Errors that can cross a GNAT component boundary.
#[derive(Debug, Error)]
pub enum GnatError {
    /// Invalid JSON, unknown message kind, or an unparsable service/flow
    /// definition string. No state is mutated.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// Valid input that would violate an invariant (mutating a static
    /// multicast group, exceeding a configured maximum, an overlapping
    /// flow coupling). No state is mutated.
    #[error("policy rejected: {0}")]
    PolicyRejected(String),

    /// A transient transport condition: a path controller's transmit
    /// buffer is full, or a remote-control write would block. Callers
    /// should retry on the next tick; backlog is preserved by the
    /// gradient, not dropped.
    #[error("transient: {0}")]
    Transient(String),

    /// A neighbor has gone silent past the stale threshold, or a remote
    /// endpoint disconnected. Callers purge that peer's view and continue.
    #[error("peer absent: {0}")]
    PeerAbsent(String),

    /// Unrecoverable configuration or environment failure (shared-memory
    /// attach failed, duplicate bin ID, oversubscribed subnets). Callers
    /// log and exit with a non-zero status.
    #[error("fatal configuration: {0}")]
    Fatal(String),
}

impl GnatError {
    /// True only for [`GnatError::Fatal`] — the one kind allowed to cross
    /// the main-loop boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(self, GnatError::Fatal(_))
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        GnatError::Malformed(msg.into())
    }

    pub fn policy_rejected(msg: impl Into<String>) -> Self {
        GnatError::PolicyRejected(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        GnatError::Transient(msg.into())
    }

    pub fn peer_absent(msg: impl Into<String>) -> Self {
        GnatError::PeerAbsent(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        GnatError::Fatal(msg.into())
    }
}

pub type GnatResult<T> = Result<T, GnatError>;
