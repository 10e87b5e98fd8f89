//! Failures raised while crawling a single target.
//!
//! Every variant is local to one target or one subtree: the walker and the
//! worker pool record them and move on, nothing here aborts a run.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CrawlError {
    /// Network unreachable, connection refused, or the server hung up.
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    /// Anonymous login rejected.
    #[error("anonymous login rejected: {reason}")]
    Auth { reason: String },

    /// Directory listing failed at the protocol level.
    #[error("failed to list '{path}': {reason}")]
    List { path: String, reason: String },

    /// CWD rejected.
    #[error("failed to change directory to '{path}': {reason}")]
    Navigation { path: String, reason: String },

    /// An operation exceeded the configured timeout.
    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: String, millis: u64 },
}

/// Serializable tag of a [`CrawlError`], used in run reports.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Connect,
    Auth,
    List,
    Navigation,
    Timeout,
    /// Per-target deadline, not a single operation.
    Deadline,
}

impl CrawlError {
    pub fn kind(&self) -> FailureKind {
        match self {
            CrawlError::Connect { .. } => FailureKind::Connect,
            CrawlError::Auth { .. } => FailureKind::Auth,
            CrawlError::List { .. } => FailureKind::List,
            CrawlError::Navigation { .. } => FailureKind::Navigation,
            CrawlError::Timeout { .. } => FailureKind::Timeout,
        }
    }

    /// The session can no longer be used for this target.
    pub fn is_session_lost(&self) -> bool {
        matches!(self, CrawlError::Connect { .. } | CrawlError::Auth { .. })
    }
}

pub type CrawlResult<T> = std::result::Result<T, CrawlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connect_and_auth_lose_the_session() {
        let connect = CrawlError::Connect {
            addr: "h:21".into(),
            reason: "refused".into(),
        };
        let list = CrawlError::List {
            path: "/x".into(),
            reason: "550".into(),
        };
        let timeout = CrawlError::Timeout {
            operation: "LIST /x".into(),
            millis: 5000,
        };
        assert!(connect.is_session_lost());
        assert!(!list.is_session_lost());
        assert!(!timeout.is_session_lost());
        assert_eq!(timeout.kind(), FailureKind::Timeout);
        assert_eq!(timeout.to_string(), "LIST /x timed out after 5000ms");
    }
}
