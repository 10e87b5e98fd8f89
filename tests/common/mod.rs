//! Scripted in-process FTP server for integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

use ftp_crawl_rs::types::Target;

#[derive(Debug, Clone)]
pub enum Node {
    Dir(String),
    File(String),
    Link(String, String),
}

/// Directory tree and quirks served by [`MockServer`].
///
/// Names are byte strings: each char stands for the byte with the same
/// value, so `"caf\u{e9}"` is a Latin-1 name and `"caf\u{c3}\u{a9}"` its
/// UTF-8 spelling.
#[derive(Debug, Clone)]
pub struct MockTree {
    dirs: HashMap<String, Vec<Node>>,
    pub reject_login: bool,
    pub mlsd: bool,
    pub epsv: bool,
    /// Answer EPSV with a port nobody listens on.
    pub epsv_unreachable: bool,
    pub root_denied: bool,
    pub login_dir: String,
    /// Directories whose listing never completes.
    pub hang_on: HashSet<String>,
}

impl Default for MockTree {
    fn default() -> Self {
        Self {
            dirs: HashMap::new(),
            reject_login: false,
            mlsd: false,
            epsv: true,
            epsv_unreachable: false,
            root_denied: false,
            login_dir: "/".to_string(),
            hang_on: HashSet::new(),
        }
    }
}

impl MockTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a directory. Entries use `"d name"`, `"f name"` and
    /// `"l name -> target"` shorthand, in listing order.
    pub fn dir(mut self, path: &str, entries: &[&str]) -> Self {
        let nodes = entries
            .iter()
            .map(|e| {
                let (kind, rest) = e.split_once(' ').expect("entry shorthand");
                match kind {
                    "d" => Node::Dir(rest.to_string()),
                    "f" => Node::File(rest.to_string()),
                    "l" => {
                        let (name, target) = rest.split_once(" -> ").expect("link shorthand");
                        Node::Link(name.to_string(), target.to_string())
                    }
                    other => panic!("unknown entry kind {other}"),
                }
            })
            .collect();
        self.dirs.insert(path.to_string(), nodes);
        self
    }

    pub fn hang(mut self, path: &str) -> Self {
        self.hang_on.insert(path.to_string());
        self
    }

    fn list_lines(&self, path: &str) -> Vec<String> {
        self.dirs[path]
            .iter()
            .map(|n| match n {
                Node::Dir(name) => format!("drwxr-xr-x 2 ftp ftp 4096 Jan 01 2024 {name}"),
                Node::File(name) => format!("-rw-r--r-- 1 ftp ftp 12 Jan 01 2024 {name}"),
                Node::Link(name, target) => {
                    format!("lrwxrwxrwx 1 ftp ftp 1 Jan 01 2024 {name} -> {target}")
                }
            })
            .collect()
    }

    fn mlsd_lines(&self, path: &str) -> Vec<String> {
        let mut lines = vec!["type=cdir;perm=el; .".to_string()];
        lines.extend(self.dirs[path].iter().map(|n| match n {
            Node::Dir(name) => format!("type=dir;perm=el; {name}"),
            Node::File(name) => format!("type=file;size=12; {name}"),
            Node::Link(name, target) => format!("type=OS.unix=slink:{target}; {name}"),
        }));
        lines
    }

    fn nlst_lines(&self, path: &str) -> Vec<String> {
        self.dirs[path]
            .iter()
            .map(|n| match n {
                Node::Dir(name) | Node::File(name) | Node::Link(name, _) => name.clone(),
            })
            .collect()
    }

    fn resolve(&self, cwd: &str, arg: &str) -> String {
        let joined = if arg.starts_with('/') {
            arg.to_string()
        } else if cwd == "/" {
            format!("/{arg}")
        } else {
            format!("{cwd}/{arg}")
        };
        let trimmed = joined.trim_end_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            trimmed.to_string()
        }
    }
}

/// Handle to a running mock server.
pub struct MockServer {
    pub addr: SocketAddr,
    logins: Arc<AtomicUsize>,
    commands: Arc<std::sync::Mutex<Vec<String>>>,
}

impl MockServer {
    pub async fn start(tree: MockTree) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let tree = Arc::new(tree);
        let logins = Arc::new(AtomicUsize::new(0));
        let commands = Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let logins = logins.clone();
            let commands = commands.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(stream, tree.clone(), logins.clone(), commands.clone()));
                }
            });
        }
        Self {
            addr,
            logins,
            commands,
        }
    }

    pub fn target(&self) -> Target {
        Target::new("127.0.0.1", self.addr.port())
    }

    /// Successful anonymous logins so far.
    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    /// Every command verb received, across connections.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

fn to_bytes(s: &str) -> Vec<u8> {
    s.chars().map(|c| c as u8).collect()
}

fn from_bytes(b: &[u8]) -> String {
    b.iter().map(|&b| b as char).collect()
}

async fn reply(w: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    w.write_all(&to_bytes(line)).await?;
    w.write_all(b"\r\n").await
}

async fn serve(
    stream: TcpStream,
    tree: Arc<MockTree>,
    logins: Arc<AtomicUsize>,
    commands: Arc<std::sync::Mutex<Vec<String>>>,
) -> std::io::Result<()> {
    let (r, mut w) = stream.into_split();
    let mut reader = BufReader::new(r);
    let mut cwd = tree.login_dir.clone();
    let mut logged_in = false;
    let mut data: Option<TcpListener> = None;

    reply(&mut w, "220-Welcome to the mock server").await?;
    reply(&mut w, "220 Ready").await?;

    loop {
        let mut buf = Vec::new();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        let raw = from_bytes(&buf);
        let line = raw.trim_end_matches(['\r', '\n']);
        let (verb, arg) = match line.split_once(' ') {
            Some((v, a)) => (v.to_ascii_uppercase(), a.to_string()),
            None => (line.to_ascii_uppercase(), String::new()),
        };
        commands.lock().unwrap().push(verb.clone());

        match verb.as_str() {
            "USER" => reply(&mut w, "331 Please specify the password.").await?,
            "PASS" => {
                if tree.reject_login {
                    reply(&mut w, "530 Login incorrect.").await?;
                } else {
                    logged_in = true;
                    logins.fetch_add(1, Ordering::SeqCst);
                    reply(&mut w, "230 Login successful.").await?;
                }
            }
            "QUIT" => {
                reply(&mut w, "221 Goodbye.").await?;
                return Ok(());
            }
            _ if !logged_in => reply(&mut w, "530 Please login with USER and PASS.").await?,
            "PWD" => reply(&mut w, &format!("257 \"{cwd}\" is the current directory")).await?,
            "CWD" => {
                let path = tree.resolve(&cwd, &arg);
                let denied = path == "/" && tree.root_denied;
                if tree.dirs.contains_key(&path) && !denied {
                    cwd = path;
                    reply(&mut w, "250 Directory successfully changed.").await?;
                } else {
                    reply(&mut w, "550 Failed to change directory.").await?;
                }
            }
            "EPSV" if tree.epsv => {
                let listener = TcpListener::bind("127.0.0.1:0").await?;
                let port = listener.local_addr()?.port();
                if tree.epsv_unreachable {
                    drop(listener);
                } else {
                    data = Some(listener);
                }
                reply(&mut w, &format!("229 Entering Extended Passive Mode (|||{port}|)")).await?;
            }
            "PASV" => {
                let listener = TcpListener::bind("127.0.0.1:0").await?;
                let port = listener.local_addr()?.port();
                data = Some(listener);
                // advertise an unroutable address; clients must use the control peer
                reply(
                    &mut w,
                    &format!("227 Entering Passive Mode (10,255,255,1,{},{}).", port >> 8, port & 0xff),
                )
                .await?;
            }
            "LIST" | "MLSD" | "NLST" => {
                if verb == "MLSD" && !tree.mlsd {
                    data = None;
                    reply(&mut w, "500 Unknown command.").await?;
                    continue;
                }
                let path = if arg.is_empty() || arg.starts_with('-') {
                    cwd.clone()
                } else {
                    tree.resolve(&cwd, &arg)
                };
                let Some(listener) = data.take() else {
                    reply(&mut w, "425 Use PASV or EPSV first.").await?;
                    continue;
                };
                if tree.hang_on.contains(&path) {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    return Ok(());
                }
                if !tree.dirs.contains_key(&path) {
                    reply(&mut w, "550 Failed to open directory.").await?;
                    continue;
                }
                let body = match verb.as_str() {
                    "MLSD" => tree.mlsd_lines(&path),
                    "NLST" => tree.nlst_lines(&path),
                    _ => tree.list_lines(&path),
                };
                reply(&mut w, "150 Here comes the directory listing.").await?;
                let (mut conn, _) = listener.accept().await?;
                for l in body {
                    conn.write_all(&to_bytes(&l)).await?;
                    conn.write_all(b"\r\n").await?;
                }
                conn.shutdown().await?;
                drop(conn);
                reply(&mut w, "226 Directory send OK.").await?;
            }
            _ => reply(&mut w, "502 Command not implemented.").await?,
        }
    }
    Ok(())
}
