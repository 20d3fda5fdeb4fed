//! Downstream publishing: one JSONL line per terminal result, successes and
//! failures in separate files under the data dir. Duplicates publish nothing.

use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::Serialize;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::model::{AcquireStatus, FileEntry, MetadataResult};

pub const METADATA_FILE: &str = "metadata.jsonl";
pub const FAILURES_FILE: &str = "failures.jsonl";

pub struct Publisher {
    metadata: Mutex<File>,
    failures: Mutex<File>,
}

#[derive(Serialize)]
struct MetadataLine<'a> {
    info_hash: String,
    name: String,
    total_size: u64,
    files: &'a [FileEntry],
    strategy: &'a str,
    elapsed_ms: u64,
    fetched_at: u64,
    info_b64: String,
}

#[derive(Serialize)]
struct FailureLine<'a> {
    info_hash: String,
    status: &'a str,
    reason: &'a str,
    elapsed_ms: u64,
    failed_at: u64,
}

impl Publisher {
    pub async fn open(data_dir: &Path) -> io::Result<Publisher> {
        tokio::fs::create_dir_all(data_dir).await?;
        let metadata = append_file(&data_dir.join(METADATA_FILE)).await?;
        let failures = append_file(&data_dir.join(FAILURES_FILE)).await?;
        Ok(Publisher {
            metadata: Mutex::new(metadata),
            failures: Mutex::new(failures),
        })
    }

    pub async fn publish(&self, result: &MetadataResult) -> io::Result<()> {
        match result.status {
            AcquireStatus::Duplicate => Ok(()),
            AcquireStatus::Success => {
                let info_b64 = result
                    .raw_info
                    .as_ref()
                    .map(|raw| B64.encode(raw))
                    .unwrap_or_default();
                let line = MetadataLine {
                    info_hash: result.hash.to_string(),
                    name: result.name_or_hash(),
                    total_size: result.total_size,
                    files: &result.files,
                    strategy: result.strategy.unwrap_or("unknown"),
                    elapsed_ms: result.elapsed.as_millis() as u64,
                    fetched_at: unix_now(),
                    info_b64,
                };
                write_line(&self.metadata, &line).await
            }
            _ => {
                let line = FailureLine {
                    info_hash: result.hash.to_string(),
                    status: result.status.as_str(),
                    reason: result.reason.as_deref().unwrap_or(""),
                    elapsed_ms: result.elapsed.as_millis() as u64,
                    failed_at: unix_now(),
                };
                write_line(&self.failures, &line).await
            }
        }
    }
}

async fn write_line<T: Serialize>(sink: &Mutex<File>, line: &T) -> io::Result<()> {
    let mut body = serde_json::to_vec(line).map_err(io::Error::other)?;
    body.push(b'\n');
    let mut file = sink.lock().await;
    file.write_all(&body).await?;
    file.flush().await
}

async fn append_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
