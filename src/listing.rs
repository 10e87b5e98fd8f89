//! Directory listing line parser.
//!
//! Servers answer listing commands in a handful of dialects. Every line is
//! classified on its own, so mixed or partially garbled replies still yield
//! whatever entries can be recognised:
//!
//! - MLSD facts: `type=dir;modify=20240101000000; pub`
//! - Unix `ls -l`: `drwxr-xr-x 2 ftp ftp 4096 Jan 01 2024 pub`
//! - DOS/IIS: `01-15-24  10:30AM       <DIR>          pub`
//! - bare names as returned by NLST: `pub`

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    /// Type could not be told from the line; the walker probes it with CWD.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub name: String,
    pub kind: EntryKind,
    /// Symlink destination, when the line carries one.
    pub link_target: Option<String>,
}

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

impl DirectoryEntry {
    pub fn new(name: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            kind,
            link_target: None,
        }
    }

    /// `.` or `..`, which the walker never follows.
    pub fn is_dot(&self) -> bool {
        self.name == "." || self.name == ".."
    }

    /// Parse one raw listing line. Returns `None` for blank lines, `total N`
    /// headers, MLSD `cdir`/`pdir` entries and lines whose name cannot be
    /// located.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim_ascii().is_empty() {
            return None;
        }
        if let Some(parsed) = parse_mlsd(line) {
            return parsed;
        }
        if is_total_header(line) {
            return None;
        }
        if looks_like_unix(line) {
            return parse_unix(line);
        }
        if let Some(entry) = parse_dos(line) {
            return Some(entry);
        }
        // name-list style
        Some(DirectoryEntry::new(line.trim_ascii(), EntryKind::Unknown))
    }
}

/// Parse a whole listing reply, dropping lines that carry no entry.
pub fn parse_listing<S: AsRef<str>>(lines: &[S]) -> Vec<DirectoryEntry> {
    lines
        .iter()
        .filter_map(|l| DirectoryEntry::parse(l.as_ref()))
        .collect()
}

/// `Some(None)` means the line is MLSD but should be skipped.
fn parse_mlsd(line: &str) -> Option<Option<DirectoryEntry>> {
    let (facts, name) = line.split_once(' ')?;
    if !facts.contains('=') || !facts.ends_with(';') {
        return None;
    }

    let mut kind = None;
    let mut link_target = None;
    for fact in facts.split(';').filter(|f| !f.is_empty()) {
        let Some((key, value)) = fact.split_once('=') else {
            continue;
        };
        if !key.eq_ignore_ascii_case("type") {
            continue;
        }
        let lower = value.to_ascii_lowercase();
        kind = Some(match lower.as_str() {
            "file" => EntryKind::File,
            "dir" => EntryKind::Directory,
            "cdir" | "pdir" => return Some(None),
            _ => {
                // OS.unix=slink:/target, OS.unix=symlink
                if let Some((_, target)) = value.split_once(':') {
                    if !target.is_empty() {
                        link_target = Some(target.to_string());
                    }
                }
                EntryKind::Unknown
            }
        });
    }

    let kind = kind?;
    if name.is_empty() {
        return Some(None);
    }
    Some(Some(DirectoryEntry {
        name: name.to_string(),
        kind,
        link_target,
    }))
}

fn is_total_header(line: &str) -> bool {
    let mut it = line.split_ascii_whitespace();
    matches!(
        (it.next(), it.next(), it.next()),
        (Some(t), Some(n), None) if t.eq_ignore_ascii_case("total") && n.chars().all(|c| c.is_ascii_digit())
    )
}

fn looks_like_unix(line: &str) -> bool {
    let Some(mode) = line.split_ascii_whitespace().next() else {
        return false;
    };
    let bytes = mode.as_bytes();
    if bytes.len() < 10 || !b"-dlbcps".contains(&bytes[0]) {
        return false;
    }
    bytes[1..10]
        .iter()
        .all(|b| b"rwxsStT-".contains(b))
}

/// Whitespace-separated tokens with their byte offsets, so the name can be
/// sliced out of the original line with inner spaces intact.
fn tokens(line: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut start = None;
    for (idx, ch) in line.char_indices() {
        if ch.is_ascii_whitespace() {
            if let Some(s) = start.take() {
                out.push((s, &line[s..idx]));
            }
        } else if start.is_none() {
            start = Some(idx);
        }
    }
    if let Some(s) = start {
        out.push((s, &line[s..]));
    }
    out
}

fn is_month(tok: &str) -> bool {
    MONTHS.iter().any(|m| tok.eq_ignore_ascii_case(m))
}

fn is_day(tok: &str) -> bool {
    !tok.is_empty() && tok.len() <= 2 && tok.chars().all(|c| c.is_ascii_digit())
}

fn is_time_or_year(tok: &str) -> bool {
    match tok.split_once(':') {
        Some((h, m)) => {
            !h.is_empty() && !m.is_empty() && h.chars().chain(m.chars()).all(|c| c.is_ascii_digit())
        }
        None => tok.len() == 4 && tok.chars().all(|c| c.is_ascii_digit()),
    }
}

fn parse_unix(line: &str) -> Option<DirectoryEntry> {
    let toks = tokens(line);

    // Locate `Mon DD HH:MM|YYYY`; owner/group columns vary between servers.
    let name_at = (1..toks.len().saturating_sub(3))
        .find(|&i| is_month(toks[i].1) && is_day(toks[i + 1].1) && is_time_or_year(toks[i + 2].1))
        .map(|i| toks[i + 3].0)
        .or_else(|| toks.get(8).map(|t| t.0))?;

    let rest = &line[name_at..];
    let kind_char = toks.first()?.1.bytes().next()?;
    let (name, link_target, kind) = match kind_char {
        b'd' => (rest, None, EntryKind::Directory),
        b'l' => match rest.split_once(" -> ") {
            Some((name, target)) => (name, Some(target.to_string()), EntryKind::Unknown),
            None => (rest, None, EntryKind::Unknown),
        },
        _ => (rest, None, EntryKind::File),
    };

    if name.is_empty() {
        return None;
    }
    Some(DirectoryEntry {
        name: name.to_string(),
        kind,
        link_target,
    })
}

fn is_dos_date(tok: &str) -> bool {
    let parts: Vec<&str> = tok.split(['-', '/']).collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.len() <= 4 && p.chars().all(|c| c.is_ascii_digit()))
}

fn is_dos_time(tok: &str) -> bool {
    let upper = tok.to_ascii_uppercase();
    let clock = upper
        .strip_suffix("AM")
        .or_else(|| upper.strip_suffix("PM"))
        .unwrap_or(&upper);
    is_time_or_year(clock) && clock.contains(':')
}

fn parse_dos(line: &str) -> Option<DirectoryEntry> {
    let toks = tokens(line);
    if toks.len() < 4 || !is_dos_date(toks[0].1) || !is_dos_time(toks[1].1) {
        return None;
    }
    let size_or_dir = toks[2].1;
    let kind = if size_or_dir.eq_ignore_ascii_case("<DIR>") {
        EntryKind::Directory
    } else if size_or_dir.chars().all(|c| c.is_ascii_digit() || c == ',') {
        EntryKind::File
    } else {
        return None;
    };
    Some(DirectoryEntry::new(&line[toks[3].0..], kind))
}
