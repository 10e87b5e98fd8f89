use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use ipnet::{IpNet, Ipv4Net};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::warn;

use crate::types::Target;

/// Largest IPv4 range accepted as a single input (a /16).
const MIN_PREFIX_LEN: u8 = 16;

/// Parse one host specification into targets.
///
/// Supported forms:
/// - `host`, `host:port` (names made of letters, digits, `.`, `-`, `_`)
/// - `192.0.2.7`, `192.0.2.7:2121`
/// - `2001:db8::1`, `[2001:db8::1]:2121`
/// - IPv4 CIDR `192.0.2.0/24`, expanded to its host addresses
pub fn parse_target_str(s: &str, default_port: u16) -> Result<Vec<Target>> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty host");
    }

    if s.contains('/') {
        let net: IpNet = s.parse().map_err(|e| anyhow!("invalid CIDR {s}: {e}"))?;
        return Ok(expand_cidr_to_ips(net)?
            .into_iter()
            .map(|ip| Target::new(ip.to_string(), default_port))
            .collect());
    }

    if let Some(rest) = s.strip_prefix('[') {
        let (addr, tail) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("unterminated IPv6 literal: {s}"))?;
        let ip: IpAddr = addr.parse().map_err(|e| anyhow!("invalid IPv6 address {addr}: {e}"))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => parse_port_str(p)?,
            None if tail.is_empty() => default_port,
            None => bail!("unexpected text after IPv6 literal: {tail}"),
        };
        return Ok(vec![Target::new(ip.to_string(), port)]);
    }

    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(vec![Target::new(ip.to_string(), default_port)]);
    }

    let (host, port) = match s.rsplit_once(':') {
        Some((h, p)) => (h, parse_port_str(p)?),
        None => (s, default_port),
    };
    if host.is_empty()
        || !host
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        bail!("invalid host: {host}");
    }
    Ok(vec![Target::new(host, port)])
}

/// Parse host-list content, one host per line.
///
/// Everything after `#` is ignored, blank lines are skipped, and lines that
/// do not parse are skipped with a warning. An explicit `:port` wins over
/// `default_port`.
pub fn parse_host_list_str(s: &str, default_port: u16) -> Vec<Target> {
    let mut out = Vec::new();
    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }
        match parse_target_str(line, default_port) {
            Ok(targets) => out.extend(targets),
            Err(e) => warn!(line = line_no, error = %e, "skipping host list entry"),
        }
    }
    out
}

pub fn load_host_list(path: impl AsRef<Path>, default_port: u16) -> Result<Vec<Target>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read host list: {}", path.as_ref().display()))?;
    Ok(parse_host_list_str(&content, default_port))
}

/// Extract FTP services from an nmap XML report (`nmap -oX`).
///
/// Only ports whose state is `open` and whose service name is `ftp` are
/// kept. Hosts are identified by their first IP address; MAC addresses are
/// ignored.
pub fn parse_nmap_xml_str(xml: &str) -> Result<Vec<Target>> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut out = Vec::new();
    let mut seen_root = false;
    let mut host_addr: Option<String> = None;
    let mut host_ports: Vec<u16> = Vec::new();
    let mut port: Option<u16> = None;
    let mut open = false;
    let mut ftp = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| anyhow!("malformed nmap report at byte {}: {e}", reader.buffer_position()))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => match e.name().as_ref() {
                b"nmaprun" => seen_root = true,
                b"host" => {
                    host_addr = None;
                    host_ports.clear();
                }
                b"address" => {
                    let kind = attr(e, "addrtype")?.unwrap_or_default();
                    if host_addr.is_none() && kind != "mac" {
                        host_addr = attr(e, "addr")?;
                    }
                }
                b"port" => {
                    port = attr(e, "portid")?.and_then(|p| p.parse().ok());
                    open = false;
                    ftp = false;
                }
                b"state" => open = attr(e, "state")?.as_deref() == Some("open"),
                b"service" => ftp = attr(e, "name")?.as_deref() == Some("ftp"),
                _ => {}
            },
            Event::End(ref e) => match e.name().as_ref() {
                b"port" => {
                    if let (Some(p), true, true) = (port.take(), open, ftp) {
                        host_ports.push(p);
                    }
                }
                b"host" => {
                    if let Some(addr) = host_addr.take() {
                        out.extend(host_ports.drain(..).map(|p| Target::new(addr.clone(), p)));
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if !seen_root {
        bail!("not an nmap XML report (no <nmaprun> element)");
    }
    Ok(out)
}

pub fn load_nmap_report(path: impl AsRef<Path>) -> Result<Vec<Target>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read nmap report: {}", path.as_ref().display()))?;
    parse_nmap_xml_str(&content)
        .with_context(|| format!("failed to parse nmap report: {}", path.as_ref().display()))
}

/// Expand an IPv4 CIDR into its host addresses, excluding the network and
/// broadcast addresses for prefixes shorter than /31.
pub fn expand_cidr_to_ips(cidr: IpNet) -> Result<Vec<IpAddr>> {
    match cidr {
        IpNet::V4(n4) => {
            if n4.prefix_len() < MIN_PREFIX_LEN {
                bail!("CIDR {n4} is too large (limit is /{MIN_PREFIX_LEN})");
            }
            Ok(expand_ipv4net_hosts(n4).into_iter().map(IpAddr::V4).collect())
        }
        IpNet::V6(n6) => bail!("IPv6 ranges are not supported: {n6}"),
    }
}

fn expand_ipv4net_hosts(net: Ipv4Net) -> Vec<Ipv4Addr> {
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    if net.prefix_len() >= 31 {
        return (start..=end).map(Ipv4Addr::from).collect();
    }
    (start + 1..end).map(Ipv4Addr::from).collect()
}

fn attr(e: &BytesStart<'_>, name: &str) -> Result<Option<String>> {
    match e.try_get_attribute(name)? {
        Some(a) => Ok(Some(a.unescape_value()?.into_owned())),
        None => Ok(None),
    }
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow!("invalid port {s}: {e}"))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}
