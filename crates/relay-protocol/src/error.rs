//! The closed set of error kinds that cross a process or transport boundary.
//!
//! Every fallible boundary operation in the system (identity verification,
//! registry lookup, stream open, reconciliation) resolves to one of these
//! kinds rather than an ad-hoc string or downstream library error type, so
//! that HTTP status codes, stdio close codes and log fields stay consistent
//! across components.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("forbidden")]
    Forbidden,
    #[error("agent offline")]
    AgentOffline,
    #[error("stream open timed out")]
    StreamOpenTimeout,
    #[error("transport lost")]
    TransportLost,
    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("upstream dial failed")]
    UpstreamFailed,
    #[error("transient reconcile error")]
    ReconcileTransient,
    #[error("fatal reconcile error")]
    ReconcileFatal,
}

impl ErrorKind {
    /// The HTTP status the User Gateway's HTTP surface maps this kind to.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Unauthenticated => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::AgentOffline => 502,
            ErrorKind::StreamOpenTimeout => 504,
            ErrorKind::QuotaExceeded => 503,
            ErrorKind::UpstreamFailed => 502,
            ErrorKind::TransportLost => 502,
            ErrorKind::ReconcileTransient | ErrorKind::ReconcileFatal => 500,
        }
    }

    /// The close code sent on the stdio surface.
    pub fn close_code(self) -> &'static str {
        match self {
            ErrorKind::Unauthenticated => "UNAUTHENTICATED",
            ErrorKind::Forbidden => "FORBIDDEN",
            ErrorKind::AgentOffline => "AGENT_OFFLINE",
            ErrorKind::StreamOpenTimeout => "STREAM_OPEN_TIMEOUT",
            ErrorKind::TransportLost => "TRANSPORT_LOST",
            ErrorKind::QuotaExceeded => "QUOTA_EXCEEDED",
            ErrorKind::UpstreamFailed => "UPSTREAM_FAILED",
            ErrorKind::ReconcileTransient => "RECONCILE_TRANSIENT",
            ErrorKind::ReconcileFatal => "RECONCILE_FATAL",
        }
    }
}

/// Body returned alongside an `ErrorKind` on the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_spec_table() {
        assert_eq!(ErrorKind::Unauthenticated.http_status(), 401);
        assert_eq!(ErrorKind::Forbidden.http_status(), 403);
        assert_eq!(ErrorKind::AgentOffline.http_status(), 502);
        assert_eq!(ErrorKind::StreamOpenTimeout.http_status(), 504);
        assert_eq!(ErrorKind::QuotaExceeded.http_status(), 503);
    }

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::AgentOffline).unwrap();
        assert_eq!(json, "\"agent_offline\"");
    }
}
