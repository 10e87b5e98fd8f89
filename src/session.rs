//! Anonymous FTP sessions.
//!
//! A [`Session`] is one control connection owned by one worker. The crawler
//! only needs four operations from it, so the protocol surface is small:
//! greeting, `USER`/`PASS`, `CWD`, `PWD`, passive (`EPSV`, then `PASV`)
//! listings and `QUIT`.
//!
//! Every operation runs under the configured timeout. When an operation
//! times out or the socket errors, the control connection can no longer be
//! trusted to be in sync with the server, so it is dropped and the next
//! operation logs in again from scratch.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{self, error::Elapsed};
use tracing::{debug, trace};

use crate::error::{CrawlError, CrawlResult};
use crate::types::Target;
use crate::wire;

pub const ANONYMOUS_USER: &str = "anonymous";
pub const ANONYMOUS_PASS: &str = "anonymous@";

/// Upper bound on waiting for the `QUIT` reply.
const QUIT_GRACE: Duration = Duration::from_secs(2);
/// Multi-line replies longer than this are treated as garbage.
const MAX_REPLY_LINES: usize = 512;

/// Which command produces directory listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ListingMode {
    /// MLSD, switching to LIST for the rest of the session if the server
    /// does not implement it.
    #[default]
    Auto,
    Mlsd,
    List,
    Nlst,
}

/// One live connection to one server.
#[async_trait]
pub trait Session: Send {
    fn target(&self) -> &Target;

    /// Raw listing lines of `path`. An empty vector is an empty directory.
    async fn list(&mut self, path: &str) -> CrawlResult<Vec<String>>;

    async fn change_directory(&mut self, path: &str) -> CrawlResult<()>;

    async fn current_directory(&mut self) -> CrawlResult<String>;

    /// Release the connection. Safe to call more than once and after errors.
    async fn close(&mut self);
}

/// Opens sessions for targets. The worker pool is generic over this so it
/// can be driven without a network.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: Session + 'static;

    async fn open(&self, target: &Target) -> CrawlResult<Self::Session>;
}

#[derive(Debug, Clone)]
pub struct FtpConnector {
    pub timeout: Duration,
    pub listing: ListingMode,
}

impl FtpConnector {
    pub fn new(timeout: Duration, listing: ListingMode) -> Self {
        Self { timeout, listing }
    }
}

#[async_trait]
impl Connector for FtpConnector {
    type Session = FtpSession;

    async fn open(&self, target: &Target) -> CrawlResult<FtpSession> {
        FtpSession::open(target.clone(), self.timeout, self.listing).await
    }
}

/// A parsed control-channel reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    pub fn is_completion(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Text of the final line.
    pub fn text(&self) -> &str {
        self.lines.last().map(String::as_str).unwrap_or("")
    }

    /// `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`, with or without the
    /// parentheses.
    pub fn pasv_addr(&self) -> Option<SocketAddr> {
        let text = self.text();
        let start = text.find(|c: char| c.is_ascii_digit())?;
        let nums: Vec<u8> = text[start..]
            .split(|c: char| !(c.is_ascii_digit() || c == ','))
            .next()?
            .split(',')
            .map(|n| n.parse::<u8>().ok())
            .collect::<Option<Vec<u8>>>()?;
        if nums.len() != 6 {
            return None;
        }
        let ip = std::net::Ipv4Addr::new(nums[0], nums[1], nums[2], nums[3]);
        let port = (u16::from(nums[4]) << 8) | u16::from(nums[5]);
        Some(SocketAddr::new(ip.into(), port))
    }

    /// `229 Entering Extended Passive Mode (|||6446|)`.
    pub fn epsv_port(&self) -> Option<u16> {
        let text = self.text();
        let open = text.find('(')?;
        let close = open + text[open..].find(')')?;
        let inner = &text[open + 1..close];
        let delim = inner.chars().next()?;
        let parts: Vec<&str> = inner.split(delim).collect();
        if parts.len() != 5 {
            return None;
        }
        parts[3].parse().ok()
    }

    /// `257 "/some ""quoted"" dir" is current directory`.
    pub fn quoted_path(&self) -> Option<String> {
        let text = self.text();
        let open = text.find('"')?;
        let mut out = String::new();
        let mut chars = text[open + 1..].chars().peekable();
        while let Some(c) = chars.next() {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    out.push('"');
                } else {
                    return Some(out);
                }
            } else {
                out.push(c);
            }
        }
        None
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text())
    }
}

/// Why a single control-channel exchange failed.
#[derive(Debug)]
enum OpError {
    /// The server answered, but not with what we wanted. The connection is
    /// still in sync.
    Reply(Reply),
    Io(io::Error),
}

impl From<io::Error> for OpError {
    fn from(e: io::Error) -> Self {
        OpError::Io(e)
    }
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpError::Reply(r) => write!(f, "{r}"),
            OpError::Io(e) => write!(f, "{e}"),
        }
    }
}

fn invalid_data(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn parse_code(line: &str) -> Option<u16> {
    let digits = line.get(..3)?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let code: u16 = digits.parse().ok()?;
    (100..600).contains(&code).then_some(code)
}

/// Split a data-channel payload into lines without assuming a trailing
/// newline or CRLF endings. Names keep their original bytes (see [`wire`]).
pub fn split_listing(payload: &[u8]) -> Vec<String> {
    wire::decode(payload)
        .split('\n')
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.trim_ascii().is_empty())
        .map(str::to_string)
        .collect()
}

struct Control {
    stream: BufReader<TcpStream>,
    peer: SocketAddr,
    epsv: bool,
}

impl Control {
    /// Connect, read the greeting and log in anonymously.
    async fn establish(target: &Target, timeout: Duration) -> CrawlResult<Control> {
        let addr = target.authority();
        let stream = match time::timeout(
            timeout,
            TcpStream::connect((target.host.as_str(), target.port)),
        )
        .await
        {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                return Err(CrawlError::Connect {
                    addr,
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(timeout_error("connect", timeout)),
        };
        let peer = stream.peer_addr().map_err(|e| CrawlError::Connect {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;
        let mut control = Control {
            stream: BufReader::new(stream),
            peer,
            epsv: true,
        };

        let outcome = time::timeout(timeout, control.handshake(&addr)).await;
        match outcome {
            Ok(res) => res.map(|_| control),
            Err(_) => Err(timeout_error("login", timeout)),
        }
    }

    async fn handshake(&mut self, addr: &str) -> CrawlResult<()> {
        let connect_err = |e: OpError| CrawlError::Connect {
            addr: addr.to_string(),
            reason: e.to_string(),
        };

        let mut greeting = self.read_reply().await.map_err(|e| connect_err(e.into()))?;
        while greeting.is_preliminary() {
            greeting = self.read_reply().await.map_err(|e| connect_err(e.into()))?;
        }
        if !greeting.is_completion() {
            return Err(connect_err(OpError::Reply(greeting)));
        }
        trace!(addr, greeting = %greeting, "server greeting");

        let user = self
            .command(&format!("USER {ANONYMOUS_USER}"))
            .await
            .map_err(|e| connect_err(e.into()))?;
        let reply = match user.code {
            230 => return Ok(()),
            331 => self
                .command(&format!("PASS {ANONYMOUS_PASS}"))
                .await
                .map_err(|e| connect_err(e.into()))?,
            _ => {
                return Err(CrawlError::Auth {
                    reason: user.to_string(),
                })
            }
        };
        match reply.code {
            230 | 202 => Ok(()),
            _ => Err(CrawlError::Auth {
                reason: reply.to_string(),
            }),
        }
    }

    async fn read_reply(&mut self) -> io::Result<Reply> {
        let first = self.read_line().await?;
        let code = parse_code(&first).ok_or_else(|| invalid_data(format!("bad reply line: {first}")))?;
        let multi = first.as_bytes().get(3) == Some(&b'-');
        let mut lines = vec![first.get(4..).unwrap_or("").to_string()];

        if multi {
            let end = format!("{code} ");
            loop {
                if lines.len() > MAX_REPLY_LINES {
                    return Err(invalid_data(format!("reply {code} has too many lines")));
                }
                let line = self.read_line().await?;
                if line.starts_with(&end) || line == end.trim_end() {
                    lines.push(line.get(4..).unwrap_or("").to_string());
                    break;
                }
                lines.push(line);
            }
        }
        Ok(Reply { code, lines })
    }

    async fn read_line(&mut self) -> io::Result<String> {
        let mut buf = Vec::new();
        let n = self.stream.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "control connection closed by server",
            ));
        }
        let line = wire::decode(&buf);
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn command(&mut self, cmd: &str) -> io::Result<Reply> {
        trace!(cmd, "-->");
        let stream = self.stream.get_mut();
        stream.write_all(&wire::encode(cmd)).await?;
        stream.write_all(b"\r\n").await?;
        stream.flush().await?;
        let reply = self.read_reply().await?;
        trace!(code = reply.code, text = reply.text(), "<--");
        Ok(reply)
    }

    async fn cwd(&mut self, path: &str) -> Result<(), OpError> {
        let reply = self.command(&format!("CWD {path}")).await?;
        if reply.is_completion() {
            Ok(())
        } else {
            Err(OpError::Reply(reply))
        }
    }

    async fn pwd(&mut self) -> Result<String, OpError> {
        let reply = self.command("PWD").await?;
        match (reply.code, reply.quoted_path()) {
            (257, Some(path)) => Ok(path),
            _ => Err(OpError::Reply(reply)),
        }
    }

    /// Open a passive data connection. The address in a PASV reply is
    /// ignored in favour of the control peer, since servers behind NAT
    /// routinely advertise private addresses.
    async fn open_data(&mut self) -> Result<TcpStream, OpError> {
        if self.epsv {
            let reply = self.command("EPSV").await?;
            match (reply.code, reply.epsv_port()) {
                (229, Some(port)) => {
                    match TcpStream::connect(SocketAddr::new(self.peer.ip(), port)).await {
                        Ok(stream) => return Ok(stream),
                        Err(e) => debug!(port, error = %e, "EPSV data port unreachable, using PASV"),
                    }
                }
                _ => debug!(reply = %reply, "EPSV unavailable, using PASV"),
            }
            self.epsv = false;
        }

        let reply = self.command("PASV").await?;
        let advertised = match (reply.code, reply.pasv_addr()) {
            (227, Some(addr)) => addr,
            _ => return Err(OpError::Reply(reply)),
        };
        let stream = TcpStream::connect(SocketAddr::new(self.peer.ip(), advertised.port())).await?;
        Ok(stream)
    }

    /// Change into `path` and run a listing command there.
    async fn list_dir(&mut self, path: &str, command: &str) -> Result<Vec<String>, OpError> {
        self.cwd(path).await?;
        let mut data = self.open_data().await?;

        let reply = self.command(command).await?;
        if !(reply.is_preliminary() || reply.is_completion()) {
            return Err(OpError::Reply(reply));
        }

        let mut payload = Vec::new();
        data.read_to_end(&mut payload).await?;
        drop(data);

        if reply.is_preliminary() {
            let done = self.read_reply().await?;
            if !done.is_completion() {
                return Err(OpError::Reply(done));
            }
        }
        Ok(split_listing(&payload))
    }

    async fn quit(&mut self) -> io::Result<()> {
        self.command("QUIT").await.map(|_| ())
    }
}

fn timeout_error(operation: &str, timeout: Duration) -> CrawlError {
    CrawlError::Timeout {
        operation: operation.to_string(),
        millis: timeout.as_millis() as u64,
    }
}

/// Anonymous FTP session over a plain TCP control connection.
pub struct FtpSession {
    target: Target,
    timeout: Duration,
    listing: ListingMode,
    mlsd_supported: bool,
    control: Option<Control>,
    /// An exchange was started and never settled, so the control
    /// connection may be mid-reply.
    in_flight: bool,
}

impl FtpSession {
    pub async fn open(target: Target, timeout: Duration, listing: ListingMode) -> CrawlResult<Self> {
        let control = Control::establish(&target, timeout).await?;
        debug!(server = %target, "logged in anonymously");
        Ok(Self {
            target,
            timeout,
            listing,
            mlsd_supported: true,
            control: Some(control),
            in_flight: false,
        })
    }

    fn listing_command(&self) -> &'static str {
        match self.listing {
            ListingMode::Auto if self.mlsd_supported => "MLSD",
            ListingMode::Auto | ListingMode::List => "LIST",
            ListingMode::Mlsd => "MLSD",
            ListingMode::Nlst => "NLST",
        }
    }

    /// The live control connection, logging in again if the previous one was
    /// dropped. A failed re-login loses the session.
    async fn control(&mut self) -> CrawlResult<&mut Control> {
        let control = match self.control.take() {
            Some(c) => c,
            None => {
                debug!(server = %self.target, "re-establishing control connection");
                Control::establish(&self.target, self.timeout)
                    .await
                    .map_err(|e| match e {
                        CrawlError::Auth { .. } => e,
                        other => CrawlError::Connect {
                            addr: self.target.authority(),
                            reason: format!("reconnect failed: {other}"),
                        },
                    })?
            }
        };
        self.in_flight = true;
        Ok(self.control.insert(control))
    }

    /// Turn the outcome of one bounded exchange into a crawl result,
    /// dropping the control connection when it may be out of sync.
    fn settle<T>(
        &mut self,
        outcome: Result<Result<T, OpError>, Elapsed>,
        operation: &str,
        fail: impl FnOnce(String) -> CrawlError,
    ) -> CrawlResult<T> {
        self.in_flight = false;
        match outcome {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(OpError::Reply(reply))) => Err(fail(reply.to_string())),
            Ok(Err(OpError::Io(e))) => {
                self.control = None;
                Err(fail(e.to_string()))
            }
            Err(_) => {
                self.control = None;
                Err(timeout_error(operation, self.timeout))
            }
        }
    }
}

#[async_trait]
impl Session for FtpSession {
    fn target(&self) -> &Target {
        &self.target
    }

    async fn list(&mut self, path: &str) -> CrawlResult<Vec<String>> {
        let timeout = self.timeout;
        let mut command = self.listing_command();
        loop {
            let control = self.control().await?;
            let outcome = time::timeout(timeout, control.list_dir(path, command)).await;

            if let Ok(Err(OpError::Reply(reply))) = &outcome {
                let unsupported = matches!(reply.code, 500 | 502 | 504);
                if unsupported && command == "MLSD" && self.listing == ListingMode::Auto {
                    debug!(server = %self.target, reply = %reply, "MLSD not supported, falling back to LIST");
                    self.mlsd_supported = false;
                    command = "LIST";
                    continue;
                }
            }

            let operation = format!("{command} {path}");
            let lines = self.settle(outcome, &operation, |reason| CrawlError::List {
                path: path.to_string(),
                reason,
            })?;
            return Ok(lines);
        }
    }

    async fn change_directory(&mut self, path: &str) -> CrawlResult<()> {
        let timeout = self.timeout;
        let control = self.control().await?;
        let outcome = time::timeout(timeout, control.cwd(path)).await;
        self.settle(outcome, &format!("CWD {path}"), |reason| {
            CrawlError::Navigation {
                path: path.to_string(),
                reason,
            }
        })?;
        Ok(())
    }

    async fn current_directory(&mut self) -> CrawlResult<String> {
        let timeout = self.timeout;
        let control = self.control().await?;
        let outcome = time::timeout(timeout, control.pwd()).await;
        self.settle(outcome, "PWD", |reason| CrawlError::Navigation {
            path: ".".to_string(),
            reason,
        })
    }

    async fn close(&mut self) {
        if self.in_flight {
            trace!(server = %self.target, "dropping control connection with an unfinished exchange");
            self.control = None;
            self.in_flight = false;
        }
        if let Some(mut control) = self.control.take() {
            let grace = QUIT_GRACE.min(self.timeout);
            if let Err(e) = time::timeout(grace, control.quit()).await {
                trace!(server = %self.target, error = %e, "QUIT not acknowledged");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(code: u16, text: &str) -> Reply {
        Reply {
            code,
            lines: vec![text.to_string()],
        }
    }

    #[test]
    fn pasv_reply_variants() {
        let r = reply(227, "Entering Passive Mode (192,168,1,20,19,137).");
        assert_eq!(r.pasv_addr(), Some("192.168.1.20:5001".parse().unwrap()));
        let r = reply(227, "Entering Passive Mode 10,0,0,1,0,21");
        assert_eq!(r.pasv_addr(), Some("10.0.0.1:21".parse().unwrap()));
        assert_eq!(reply(227, "Entering Passive Mode (1,2,3)").pasv_addr(), None);
    }

    #[test]
    fn epsv_reply() {
        assert_eq!(reply(229, "Entering Extended Passive Mode (|||6446|)").epsv_port(), Some(6446));
        assert_eq!(reply(229, "Entering Extended Passive Mode (!!!21!)").epsv_port(), Some(21));
        assert_eq!(reply(229, "Entering Extended Passive Mode").epsv_port(), None);
    }

    #[test]
    fn pwd_reply_unquotes() {
        assert_eq!(reply(257, "\"/pub\" is current directory").quoted_path().as_deref(), Some("/pub"));
        assert_eq!(reply(257, "\"/a \"\"b\"\"\"").quoted_path().as_deref(), Some("/a \"b\""));
        assert_eq!(reply(257, "no quotes").quoted_path(), None);
    }

    #[test]
    fn reply_codes() {
        assert_eq!(parse_code("220 ready"), Some(220));
        assert_eq!(parse_code("230-welcome"), Some(230));
        assert_eq!(parse_code("hello"), None);
        assert_eq!(parse_code("999 nope"), None);
    }

    #[test]
    fn split_listing_tolerates_line_endings() {
        assert!(split_listing(b"").is_empty());
        assert_eq!(split_listing(b"a\r\nb\r\n"), vec!["a", "b"]);
        assert_eq!(split_listing(b"a\nb"), vec!["a", "b"]);
        assert_eq!(split_listing(b"a\n\n\r\nb\n"), vec!["a", "b"]);
    }

    #[test]
    fn listing_command_follows_mode() {
        let mk = |listing, mlsd_supported| FtpSession {
            target: Target::new("h", 21),
            timeout: Duration::from_secs(1),
            listing,
            mlsd_supported,
            control: None,
            in_flight: false,
        };
        assert_eq!(mk(ListingMode::Auto, true).listing_command(), "MLSD");
        assert_eq!(mk(ListingMode::Auto, false).listing_command(), "LIST");
        assert_eq!(mk(ListingMode::List, true).listing_command(), "LIST");
        assert_eq!(mk(ListingMode::Nlst, true).listing_command(), "NLST");
    }
}
