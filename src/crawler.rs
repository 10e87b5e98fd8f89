use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ::time::{format_description::well_known, OffsetDateTime};
use anyhow::{Context, Result};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::FailureKind;
use crate::session::{Connector, Session};
use crate::sink::ResultSink;
use crate::types::{CrawlReport, DiscoveredFile, FailureRecord, Target, TargetOutcome, TargetStatus};
use crate::walker::{TreeWalker, WalkSummary};

pub const DEFAULT_THREADS: usize = 8;
const MAX_THREADS: usize = 1_024;

/// Knobs of the worker pool. Per-operation timeouts live in the connector.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Number of concurrent workers, each crawling one server at a time.
    pub threads: usize,
    /// Upper bound on the whole walk of one server.
    pub target_timeout: Option<Duration>,
    /// Files buffered between the workers and the sink.
    pub channel_capacity: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            target_timeout: None,
            channel_capacity: 4_096,
        }
    }
}

/// Crawl every target and write discovered files through `sink`.
///
/// - `config.threads` workers share one target queue; each opens a session,
///   walks the server and closes the session before taking the next target.
/// - Discovered files flow over one channel to the sink, the only writer.
/// - Per-target failures are recorded in the report, never returned.
pub async fn crawl_targets<C, W>(
    connector: C,
    targets: Vec<Target>,
    sink: ResultSink<W>,
    config: &CrawlConfig,
) -> Result<CrawlReport>
where
    C: Connector,
    W: AsyncWrite + Unpin + Send + 'static,
{
    crawl_targets_with_cancel(connector, targets, sink, config, CancellationToken::new()).await
}

/// Variant that accepts a `CancellationToken` to allow external cancellation.
/// In-flight sessions are dropped on cancellation; files already sent to
/// the sink are still written.
pub async fn crawl_targets_with_cancel<C, W>(
    connector: C,
    targets: Vec<Target>,
    sink: ResultSink<W>,
    config: &CrawlConfig,
    cancel: CancellationToken,
) -> Result<CrawlReport>
where
    C: Connector,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let started_at = now_iso_like();
    let start = Instant::now();
    let total = targets.len();
    let workers = config.threads.clamp(1, MAX_THREADS).min(total.max(1));
    info!(targets = total, workers, "starting crawl");

    let (target_tx, target_rx) = async_channel::bounded::<Target>(workers * 2);
    let (file_tx, file_rx) = mpsc::channel::<DiscoveredFile>(config.channel_capacity.max(1));

    let sink_task = tokio::spawn(sink.run(file_rx));

    let producer = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut never_sent = Vec::new();
            let mut pending = targets.into_iter();
            for target in pending.by_ref() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        never_sent.push(target);
                        break;
                    }
                    sent = target_tx.send(target.clone()) => {
                        if sent.is_err() {
                            never_sent.push(target);
                            break;
                        }
                    }
                }
            }
            never_sent.extend(pending);
            never_sent
        })
    };

    let connector = Arc::new(connector);
    let mut set = JoinSet::new();
    for id in 0..workers {
        set.spawn(worker_loop(
            id,
            connector.clone(),
            target_rx.clone(),
            file_tx.clone(),
            config.target_timeout,
            cancel.clone(),
        ));
    }
    drop(file_tx);

    let mut outcomes = Vec::with_capacity(total);
    while let Some(res) = set.join_next().await {
        outcomes.extend(res.context("crawl worker panicked")?);
    }

    // Whatever is left was never picked up because the run was cancelled
    // or the sink went away. Closing unblocks a producer still sending.
    target_rx.close();
    let mut unvisited = producer.await.context("target producer panicked")?;
    while let Ok(target) = target_rx.try_recv() {
        unvisited.push(target);
    }
    for target in unvisited {
        outcomes.push(TargetOutcome {
            host: target.host,
            port: target.port,
            status: TargetStatus::Interrupted,
            files: 0,
            directories: 0,
            failures: Vec::new(),
            elapsed_ms: 0,
        });
    }

    let stats = sink_task
        .await
        .context("result sink panicked")?
        .context("failed to write output")?;

    let completed = outcomes
        .iter()
        .filter(|o| o.status == TargetStatus::Completed)
        .count() as u64;
    let failed = outcomes
        .iter()
        .filter(|o| matches!(o.status, TargetStatus::Failed | TargetStatus::TimedOut))
        .count() as u64;

    let report = CrawlReport {
        started_at,
        elapsed_ms: start.elapsed().as_millis() as u64,
        targets_total: total as u64,
        targets_completed: completed,
        targets_failed: failed,
        files_written: stats.lines,
        extensions: stats.extensions,
        outcomes,
    };
    info!(
        files = report.files_written,
        completed = report.targets_completed,
        failed = report.targets_failed,
        "crawl finished"
    );
    Ok(report)
}

async fn worker_loop<C: Connector>(
    id: usize,
    connector: Arc<C>,
    queue: async_channel::Receiver<Target>,
    files: mpsc::Sender<DiscoveredFile>,
    target_timeout: Option<Duration>,
    cancel: CancellationToken,
) -> Vec<TargetOutcome> {
    let mut outcomes = Vec::new();
    loop {
        if files.is_closed() {
            warn!(worker = id, "result sink gone, worker stopping");
            break;
        }
        let target = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = queue.recv() => match next {
                Ok(target) => target,
                Err(_) => break,
            },
        };
        outcomes.push(crawl_one(&*connector, target, &files, target_timeout, &cancel).await);
    }
    debug!(worker = id, crawled = outcomes.len(), "worker exited");
    outcomes
}

/// Full session lifecycle for one target: open, walk, close.
pub async fn crawl_one<C: Connector>(
    connector: &C,
    target: Target,
    files: &mpsc::Sender<DiscoveredFile>,
    target_timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> TargetOutcome {
    let start = Instant::now();
    debug!(server = %target, "connecting");

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        res = connector.open(&target) => Some(res),
    };
    let mut session = match opened {
        None => {
            info!(server = %target, "stopped working with server");
            return outcome(&target, TargetStatus::Interrupted, WalkSummary::default(), start);
        }
        Some(Err(e)) => {
            warn!(server = %target, error = %e, "error on server");
            let summary = WalkSummary {
                failures: vec![FailureRecord {
                    path: None,
                    kind: e.kind(),
                    message: e.to_string(),
                }],
                ..WalkSummary::default()
            };
            return outcome(&target, TargetStatus::Failed, summary, start);
        }
        Some(Ok(session)) => session,
    };

    let mut summary = WalkSummary::default();
    let status = {
        let mut walker = TreeWalker::new(&mut session, cancel.clone());
        let walk = with_deadline(target_timeout, walker.walk(files, &mut summary));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => TargetStatus::Interrupted,
            finished = walk => match finished {
                Some(()) => TargetStatus::Completed,
                None => TargetStatus::TimedOut,
            },
        }
    };
    session.close().await;

    let status = match status {
        TargetStatus::Completed if summary.session_lost => TargetStatus::Failed,
        TargetStatus::Completed if summary.interrupted => TargetStatus::Interrupted,
        TargetStatus::TimedOut => {
            let limit = target_timeout.unwrap_or_default();
            summary.failures.push(FailureRecord {
                path: None,
                kind: FailureKind::Deadline,
                message: format!("walk exceeded {}ms", limit.as_millis()),
            });
            TargetStatus::TimedOut
        }
        other => other,
    };

    match status {
        TargetStatus::Completed => info!(
            server = %target,
            files = summary.files,
            failures = summary.failures.len(),
            "done with server"
        ),
        TargetStatus::Interrupted => info!(server = %target, files = summary.files, "stopped working with server"),
        _ => warn!(server = %target, files = summary.files, status = ?status, "server walk incomplete"),
    }
    outcome(&target, status, summary, start)
}

async fn with_deadline<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

fn outcome(target: &Target, status: TargetStatus, summary: WalkSummary, start: Instant) -> TargetOutcome {
    TargetOutcome {
        host: target.host.clone(),
        port: target.port,
        status,
        files: summary.files,
        directories: summary.directories,
        failures: summary.failures,
        elapsed_ms: start.elapsed().as_millis() as u64,
    }
}

fn now_iso_like() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
