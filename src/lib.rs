//! Library crate for ftp-crawl-rs: concurrent anonymous FTP tree crawler.
pub mod crawler;
pub mod error;
pub mod listing;
pub mod session;
pub mod sink;
pub mod targets;
pub mod types;
pub mod visited;
pub mod walker;
pub mod wire;
