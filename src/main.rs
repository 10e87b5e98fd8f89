use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ftp_crawl_rs::crawler::{self, CrawlConfig, DEFAULT_THREADS};
use ftp_crawl_rs::session::{FtpConnector, ListingMode};
use ftp_crawl_rs::sink::{OutputFormat, ResultSink};
use ftp_crawl_rs::targets;
use ftp_crawl_rs::types::{CrawlReport, Target, TargetStatus, DEFAULT_FTP_PORT};

/// How the positional input is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum InputMode {
    /// A single host, `host:port`, `[v6]:port` or an IPv4 CIDR.
    Host,
    /// A file with one host per line.
    File,
    /// An nmap XML report; open ports named `ftp` are crawled.
    Nmap,
}

/// ftp-crawl-rs: concurrent crawler that lists every file reachable on anonymous FTP servers.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "ftp-crawl-rs",
    version,
    about = "Concurrent crawler that lists every file reachable on anonymous FTP servers.",
    long_about = None
)]
struct Cli {
    /// Host, host-list file or nmap XML report, depending on --mode.
    input: String,

    /// File that receives one line per discovered file.
    output: PathBuf,

    /// How to interpret the input.
    #[arg(short, long, value_enum, default_value_t = InputMode::Host)]
    mode: InputMode,

    /// Port for targets that do not name one.
    #[arg(short, long, default_value_t = DEFAULT_FTP_PORT)]
    port: u16,

    /// Number of servers crawled at the same time.
    #[arg(short, long, default_value_t = DEFAULT_THREADS)]
    threads: usize,

    /// Timeout for each FTP operation, in seconds.
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    /// Give up on a server after this many seconds (unbounded if omitted).
    #[arg(long = "target-timeout")]
    target_timeout: Option<u64>,

    /// Listing command used to read directories.
    #[arg(long, value_enum, default_value_t = ListingMode::Auto)]
    listing: ListingMode,

    /// Output line format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Plain)]
    format: OutputFormat,

    /// Write the run report as pretty JSON to this path.
    #[arg(long)]
    report: Option<PathBuf>,

    /// Debug logging.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    if cli.threads == 0 {
        bail!("--threads must be at least 1");
    }
    if cli.timeout == 0 {
        bail!("--timeout must be at least 1 second");
    }

    eprintln!("ftp-crawl-rs configuration:");
    eprintln!("  input        : {} ({:?})", cli.input, cli.mode);
    eprintln!("  output       : {}", cli.output.display());
    eprintln!("  port         : {}", cli.port);
    eprintln!("  threads      : {}", cli.threads);
    eprintln!("  timeout      : {}s", cli.timeout);
    eprintln!(
        "  target limit : {}",
        cli.target_timeout
            .map(|s| format!("{s}s"))
            .unwrap_or_else(|| "<none>".to_string())
    );
    eprintln!("  listing      : {:?}", cli.listing);
    eprintln!("  format       : {:?}", cli.format);
    eprintln!(
        "  report       : {}",
        cli.report
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<none>".to_string())
    );

    let targets = load_targets(&cli)?;
    if targets.is_empty() {
        bail!("no targets to crawl in {}", cli.input);
    }
    info!(targets = targets.len(), "targets loaded");

    let out = tokio::fs::File::create(&cli.output)
        .await
        .with_context(|| format!("failed to create output file: {}", cli.output.display()))?;
    let sink = ResultSink::new(out, cli.format);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping crawl");
                cancel.cancel();
            }
        });
    }

    let connector = FtpConnector::new(Duration::from_secs(cli.timeout), cli.listing);
    let config = CrawlConfig {
        threads: cli.threads,
        target_timeout: cli.target_timeout.map(Duration::from_secs),
        ..CrawlConfig::default()
    };
    let report = crawler::crawl_targets_with_cancel(connector, targets, sink, &config, cancel).await?;

    print_summary(&report);
    if let Some(path) = cli.report.as_deref() {
        write_report_json(path, &report)?;
        eprintln!("Wrote JSON report to {}", path.display());
    }
    Ok(())
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) if verbose => EnvFilter::new("ftp_crawl_rs=debug,warn"),
        Err(_) => EnvFilter::new("ftp_crawl_rs=info,warn"),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}

fn load_targets(cli: &Cli) -> Result<Vec<Target>> {
    match cli.mode {
        InputMode::Host => targets::parse_target_str(&cli.input, cli.port)
            .with_context(|| format!("invalid host: {}", cli.input)),
        InputMode::File => targets::load_host_list(&cli.input, cli.port),
        InputMode::Nmap => targets::load_nmap_report(&cli.input),
    }
}

fn print_summary(report: &CrawlReport) {
    let interrupted = report
        .outcomes
        .iter()
        .filter(|o| o.status == TargetStatus::Interrupted)
        .count();

    println!(
        "\nServers: {} total, {} completed, {} failed, {} interrupted",
        report.targets_total, report.targets_completed, report.targets_failed, interrupted
    );
    println!("Files found: {}", report.files_written);

    let name_w = report
        .extensions
        .keys()
        .map(|k| k.len())
        .max()
        .unwrap_or(0)
        .max("extension".len())
        .max("<none>".len());
    if !report.extensions.is_empty() {
        println!("{:<name_w$}  {:>8}", "extension", "files", name_w = name_w);
        println!("{:-<name_w$}  {:->8}", "", "", name_w = name_w);
    }
    let mut by_count: Vec<(&String, &u64)> = report.extensions.iter().collect();
    by_count.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    for (ext, count) in by_count {
        let label = if ext.is_empty() { "<none>" } else { ext.as_str() };
        println!("{:<name_w$}  {:>8}", label, count, name_w = name_w);
    }

    let failures = report.failure_count();
    if failures > 0 {
        println!("Failures recorded: {failures} (see log or --report)");
    }
    println!("Elapsed: {:.1}s", report.elapsed_ms as f64 / 1000.0);
}

fn write_report_json(path: &Path, report: &CrawlReport) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create report file: {}", path.display()))?;
    serde_json::to_writer_pretty(file, report)
        .with_context(|| format!("failed to write report: {}", path.display()))?;
    Ok(())
}
