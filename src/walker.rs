//! Depth-first walk of one server's directory tree.
//!
//! The walk uses an explicit stack instead of recursion. Children of a
//! directory are pushed in reverse listing order, so popping yields exactly
//! the order a recursive walk would produce: each entry in the order the
//! server listed it, a directory's whole subtree before its next sibling.
//!
//! Emitted files are named by the path the walk took to reach them, but
//! directories are deduplicated by where the server says they are (`PWD`
//! after `CWD`). Through symlinks one directory has endlessly many
//! spellings; its resolved location has one.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{CrawlError, FailureKind};
use crate::listing::{parse_listing, EntryKind};
use crate::session::Session;
use crate::types::{DiscoveredFile, FailureRecord, Target};
use crate::visited::{clean_path, join_path, VisitedSet};
use crate::wire;

/// Counters and failures of one walk. Filled in place so a caller that
/// abandons the walk (deadline, cancellation) still sees partial progress.
#[derive(Debug, Default)]
pub struct WalkSummary {
    pub files: u64,
    pub directories: u64,
    pub failures: Vec<FailureRecord>,
    /// The session died and could not be re-established.
    pub session_lost: bool,
    /// Stopped early by cancellation or because the result channel closed.
    pub interrupted: bool,
}

impl WalkSummary {
    fn record(&mut self, target: &Target, path: &str, err: CrawlError) {
        warn!(server = %target, path, error = %err, "subtree skipped");
        if err.is_session_lost() {
            self.session_lost = true;
        }
        self.failures.push(FailureRecord {
            path: Some(wire::to_display(path).into_owned()),
            kind: err.kind(),
            message: wire::to_display(&err.to_string()).into_owned(),
        });
    }

    pub fn failures_of(&self, kind: FailureKind) -> usize {
        self.failures.iter().filter(|f| f.kind == kind).count()
    }
}

enum Step {
    Visit(String),
    Emit(String),
    /// Entry of unknown type, told apart with `CWD`.
    Probe(String),
}

pub struct TreeWalker<'a, S: Session + ?Sized> {
    session: &'a mut S,
    visited: VisitedSet,
    cancel: CancellationToken,
}

impl<'a, S: Session + ?Sized> TreeWalker<'a, S> {
    pub fn new(session: &'a mut S, cancel: CancellationToken) -> Self {
        Self {
            session,
            visited: VisitedSet::new(),
            cancel,
        }
    }

    /// `/` when the server lets us change into it, otherwise the login
    /// directory.
    pub async fn start_directory(&mut self) -> String {
        match self.session.change_directory("/").await {
            Ok(()) => "/".to_string(),
            Err(e) => {
                debug!(server = %self.session.target(), error = %e, "root not accessible, using login directory");
                self.session
                    .current_directory()
                    .await
                    .map(|p| clean_path(&p))
                    .unwrap_or_else(|_| "/".to_string())
            }
        }
    }

    /// Walk the whole tree, sending every file to `out`.
    pub async fn walk(&mut self, out: &mpsc::Sender<DiscoveredFile>, summary: &mut WalkSummary) {
        let root = self.start_directory().await;
        self.walk_from(&root, out, summary).await;
    }

    pub async fn walk_from(
        &mut self,
        root: &str,
        out: &mpsc::Sender<DiscoveredFile>,
        summary: &mut WalkSummary,
    ) {
        let target = self.session.target().clone();
        let mut stack = vec![Step::Visit(clean_path(root))];

        while let Some(step) = stack.pop() {
            if self.cancel.is_cancelled() {
                summary.interrupted = true;
                return;
            }

            match step {
                Step::Emit(path) => {
                    if out.send(DiscoveredFile::new(&target, path)).await.is_err() {
                        summary.interrupted = true;
                        return;
                    }
                    summary.files += 1;
                }
                Step::Visit(path) => {
                    if self.visited.contains(&path) {
                        trace!(server = %target, path = %path, "already visited");
                        continue;
                    }
                    let resolved = match self.enter(&path).await {
                        Ok(resolved) => resolved,
                        Err(e) => {
                            summary.record(&target, &path, e);
                            if summary.session_lost {
                                return;
                            }
                            continue;
                        }
                    };
                    let fresh = self.visited.insert(&resolved);
                    self.visited.insert(&path);
                    if !fresh {
                        trace!(server = %target, path = %path, resolved = %resolved, "directory reached again through a link");
                        continue;
                    }
                    debug!(
                        server = %target,
                        path = %path,
                        pending = stack.len(),
                        files = summary.files,
                        "listing directory"
                    );
                    let lines = match self.session.list(&path).await {
                        Ok(lines) => lines,
                        Err(e) => {
                            summary.record(&target, &path, e);
                            if summary.session_lost {
                                return;
                            }
                            continue;
                        }
                    };
                    summary.directories += 1;
                    let children = self.children(&path, &lines);
                    stack.extend(children.into_iter().rev());
                }
                Step::Probe(path) => match self.session.change_directory(&path).await {
                    Ok(()) => stack.push(Step::Visit(path)),
                    Err(CrawlError::Navigation { .. }) => stack.push(Step::Emit(path)),
                    Err(e) => {
                        summary.record(&target, &path, e);
                        if summary.session_lost {
                            return;
                        }
                    }
                },
            }
        }
    }

    /// Change into `path` and return the directory the server reports for
    /// it. Falls back to `path` itself when `PWD` is unusable.
    async fn enter(&mut self, path: &str) -> Result<String, CrawlError> {
        match self.session.change_directory(path).await {
            Ok(()) => {}
            Err(CrawlError::Navigation { path, reason }) => {
                return Err(CrawlError::List { path, reason })
            }
            Err(e) => return Err(e),
        }
        match self.session.current_directory().await {
            Ok(resolved) => Ok(clean_path(&resolved)),
            Err(e) if e.is_session_lost() => Err(e),
            Err(e) => {
                debug!(server = %self.session.target(), path, error = %e, "PWD failed, keying on the walked path");
                Ok(clean_path(path))
            }
        }
    }

    /// Steps for the entries of `dir`, in listing order.
    fn children(&self, dir: &str, lines: &[String]) -> Vec<Step> {
        let mut steps = Vec::with_capacity(lines.len());
        for entry in parse_listing(lines) {
            if entry.is_dot() {
                continue;
            }
            let path = join_path(dir, &entry.name);
            match entry.kind {
                EntryKind::Directory => steps.push(Step::Visit(path)),
                EntryKind::File => steps.push(Step::Emit(path)),
                EntryKind::Unknown => {
                    if let Some(link) = entry.link_target.as_deref() {
                        let resolved = join_path(dir, link);
                        if self.visited.contains(&resolved) {
                            trace!(path = %path, link, "link back into visited tree");
                            continue;
                        }
                    }
                    steps.push(Step::Probe(path));
                }
            }
        }
        steps
    }
}
