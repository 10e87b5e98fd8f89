use std::collections::HashSet;

/// Directories already walked during one session.
///
/// Keys are normalized with [`VisitedSet::normalize`], so `/Pub/`, `/pub`
/// and `/pub/./x/..` all collide. Only ASCII letters are folded; other
/// characters are raw server bytes (see [`crate::wire`]).
#[derive(Debug, Default)]
pub struct VisitedSet {
    seen: HashSet<String>,
}

impl VisitedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn normalize(path: &str) -> String {
        clean_path(path).to_ascii_lowercase()
    }

    /// Marks `path` visited. Returns `false` if it already was.
    pub fn insert(&mut self, path: &str) -> bool {
        self.seen.insert(Self::normalize(path))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.seen.contains(&Self::normalize(path))
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Make `path` absolute, drop empty and `.` segments, apply `..`, strip the
/// trailing slash. `..` above the root stays at the root.
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// Resolve a listing name (or a symlink target) against the directory it
/// was listed in. Absolute names replace the directory.
pub fn join_path(dir: &str, name: &str) -> String {
    if name.starts_with('/') {
        return clean_path(name);
    }
    let mut joined = String::with_capacity(dir.len() + name.len() + 1);
    joined.push_str(dir.trim_end_matches('/'));
    joined.push('/');
    joined.push_str(name);
    clean_path(&joined)
}
