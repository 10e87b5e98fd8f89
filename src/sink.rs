use std::collections::BTreeMap;
use std::io;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::{DiscoveredFile, DEFAULT_FTP_PORT};

/// Characters left as-is in `url` lines, matching the usual path quoting
/// (`/` and the RFC 3986 unreserved set).
const PATH_SAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// How each discovered file is rendered as one output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// `host /path`, or `host:port /path` off the default port.
    #[default]
    Plain,
    /// `ftp://host:port/percent-encoded/path`.
    Url,
}

impl OutputFormat {
    pub fn format_line(self, file: &DiscoveredFile) -> String {
        match self {
            OutputFormat::Plain => {
                let path = file.display_path().replace('\n', "\\n").replace('\r', "\\r");
                if file.port == DEFAULT_FTP_PORT {
                    format!("{} {}", file.host, path)
                } else {
                    format!("{} {}", file.authority(), path)
                }
            }
            OutputFormat::Url => format!(
                "ftp://{}{}",
                file.authority(),
                utf8_percent_encode(&file.display_path(), PATH_SAFE)
            ),
        }
    }
}

/// What the sink wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub lines: u64,
    /// Per-extension counts; files without an extension are keyed by `""`.
    pub extensions: BTreeMap<String, u64>,
}

impl SinkStats {
    fn record(&mut self, file: &DiscoveredFile) {
        self.lines += 1;
        let ext = file.extension().unwrap_or_default();
        *self.extensions.entry(ext).or_insert(0) += 1;
    }
}

/// The single consumer of discovered files. Lines are written whole and in
/// arrival order, so concurrent workers can never interleave output.
pub struct ResultSink<W> {
    writer: BufWriter<W>,
    format: OutputFormat,
}

impl<W: AsyncWrite + Unpin> ResultSink<W> {
    pub fn new(writer: W, format: OutputFormat) -> Self {
        Self {
            writer: BufWriter::new(writer),
            format,
        }
    }

    /// Drain `files` until every sender is gone, then flush.
    pub async fn run(mut self, mut files: mpsc::Receiver<DiscoveredFile>) -> io::Result<SinkStats> {
        let mut stats = SinkStats::default();
        while let Some(file) = files.recv().await {
            let mut line = self.format.format_line(&file);
            line.push('\n');
            self.writer.write_all(line.as_bytes()).await?;
            stats.record(&file);
        }
        self.writer.flush().await?;
        self.writer.shutdown().await?;
        debug!(lines = stats.lines, "result sink drained");
        Ok(stats)
    }
}
