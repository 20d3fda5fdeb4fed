//! Hash event intake: newline-delimited `<hex info-hash> [ip:port]` lines,
//! read from a tailed feed file or from stdin.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::model::{HashEvent, InfoHash};

pub async fn run(cfg: Arc<Config>, events: mpsc::Sender<HashEvent>) {
    if let Some(path) = cfg.ingest_file.clone() {
        return tail_file(&path, events).await;
    }
    let fallback = cfg.data_dir.join("hashes.txt");
    if fallback.exists() {
        return tail_file(&fallback, events).await;
    }
    tracing::info!("reading hash events from stdin");
    consume(tokio::io::stdin(), events).await;
}

/// Follows a feed file forever: waits for it to appear, then keeps polling
/// for appended lines after reaching the current end.
async fn tail_file(path: &Path, events: mpsc::Sender<HashEvent>) {
    let file = loop {
        match File::open(path).await {
            Ok(file) => break file,
            Err(err) => {
                tracing::warn!(%err, path = %path.display(), "ingest file not readable yet");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
    };
    tracing::info!(path = %path.display(), "tailing hash events");
    let mut lines = BufReader::new(file).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(event) = parse_line(&line) {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Ok(None) => tokio::time::sleep(Duration::from_secs(1)).await,
            Err(err) => {
                tracing::warn!(%err, "ingest read failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Drains a finite reader such as stdin, then returns.
async fn consume<R: AsyncRead + Unpin>(reader: R, events: mpsc::Sender<HashEvent>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(event) = parse_line(&line) {
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(%err, "ingest read failed");
                return;
            }
        }
    }
}

fn parse_line(line: &str) -> Option<HashEvent> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut parts = line.split_whitespace();
    let hash_token = parts.next()?;
    let Some(hash) = InfoHash::from_hex(hash_token) else {
        tracing::debug!(value = %hash_token, "skipping line without a valid info-hash");
        return None;
    };
    let peer = parts.next().and_then(|token| match token.parse::<SocketAddr>() {
        Ok(addr) => Some(addr),
        Err(_) => {
            tracing::debug!(value = %token, "ignoring unparseable peer hint");
            None
        }
    });
    Some(HashEvent { hash, peer })
}
