use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::FailureKind;
use crate::wire;

pub const DEFAULT_FTP_PORT: u16 = 21;

/// One FTP server to crawl.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub host: String,
    pub port: u16,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        authority(&self.host, self.port)
    }
}

fn authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// A file found on a server, identified by its absolute remote path as
/// the server spells it (see [`wire`]).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveredFile {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl DiscoveredFile {
    pub fn new(target: &Target, path: impl Into<String>) -> Self {
        Self {
            host: target.host.clone(),
            port: target.port,
            path: path.into(),
        }
    }

    pub fn authority(&self) -> String {
        authority(&self.host, self.port)
    }

    /// Path as readable text.
    pub fn display_path(&self) -> Cow<'_, str> {
        wire::to_display(&self.path)
    }

    /// Extension of the file name, lower-cased, without the dot.
    pub fn extension(&self) -> Option<String> {
        let path = self.display_path();
        let name = path.rsplit('/').next().unwrap_or_default();
        match name.rfind('.') {
            Some(0) | None => None,
            Some(idx) if idx + 1 < name.len() => Some(name[idx + 1..].to_ascii_lowercase()),
            Some(_) => None,
        }
    }
}

/// A subtree (or a whole target) that could not be walked.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub path: Option<String>,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    /// Walk finished; individual subtrees may still have failed.
    Completed,
    /// Connect or login failed, or the session was lost mid-walk.
    Failed,
    /// The per-target deadline expired.
    TimedOut,
    /// The run was cancelled while this target was in flight or queued.
    Interrupted,
}

/// What happened to one target.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TargetOutcome {
    pub host: String,
    pub port: u16,
    pub status: TargetStatus,
    pub files: u64,
    pub directories: u64,
    pub failures: Vec<FailureRecord>,
    pub elapsed_ms: u64,
}

/// Aggregate results of one crawl run.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CrawlReport {
    pub started_at: String,
    pub elapsed_ms: u64,
    pub targets_total: u64,
    pub targets_completed: u64,
    pub targets_failed: u64,
    pub files_written: u64,
    /// File counts per extension; files without one are keyed by `""`.
    pub extensions: BTreeMap<String, u64>,
    pub outcomes: Vec<TargetOutcome>,
}

impl CrawlReport {
    pub fn failure_count(&self) -> usize {
        self.outcomes.iter().map(|o| o.failures.len()).sum()
    }
}
