use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use sha1::{Digest, Sha1};

/// 20-byte torrent identifier (SHA-1 of the bencoded `info` dictionary).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    /// Parses a 40-character hex string. Case-insensitive, anything else is rejected.
    pub fn from_hex(s: &str) -> Option<InfoHash> {
        let s = s.trim();
        if s.len() != 40 {
            return None;
        }
        let mut out = [0u8; 20];
        hex::decode_to_slice(s, &mut out).ok()?;
        Some(InfoHash(out))
    }

    /// SHA-1 of a byte slice, used to check assembled metadata against the
    /// hash it was requested for.
    pub fn for_bytes(data: &[u8]) -> InfoHash {
        let digest = Sha1::digest(data);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest);
        InfoHash(out)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// XOR distance to a DHT node id, comparable lexicographically.
    pub fn xor(&self, id: &[u8; 20]) -> [u8; 20] {
        let mut d = [0u8; 20];
        for (i, b) in d.iter_mut().enumerate() {
            *b = self.0[i] ^ id[i];
        }
        d
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", hex::encode(self.0))
    }
}

/// One discovered hash from the upstream feed, with the announcing peer when
/// the feed had one.
#[derive(Debug, Clone)]
pub struct HashEvent {
    pub hash: InfoHash,
    pub peer: Option<SocketAddr>,
}

/// Terminal outcome of one acquisition. `Duplicate` means the dedup check
/// short-circuited before any network work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AcquireStatus {
    Success,
    Duplicate,
    Timeout,
    PeerMismatch,
    NoPeers,
    RejectedAdmission,
    DecodeError,
    Error,
}

impl AcquireStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcquireStatus::Success => "SUCCESS",
            AcquireStatus::Duplicate => "DUPLICATE",
            AcquireStatus::Timeout => "TIMEOUT",
            AcquireStatus::PeerMismatch => "PEER_MISMATCH",
            AcquireStatus::NoPeers => "NO_PEERS",
            AcquireStatus::RejectedAdmission => "REJECTED_ADMISSION",
            AcquireStatus::DecodeError => "DECODE_ERROR",
            AcquireStatus::Error => "ERROR",
        }
    }
}

impl fmt::Display for AcquireStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub path: String,
    pub length: u64,
}

/// What `acquire` hands back for every call, success or not.
#[derive(Debug, Clone)]
pub struct MetadataResult {
    pub hash: InfoHash,
    pub status: AcquireStatus,
    pub strategy: Option<&'static str>,
    pub name: Option<String>,
    pub total_size: u64,
    pub files: Vec<FileEntry>,
    pub raw_info: Option<Bytes>,
    pub reason: Option<String>,
    pub elapsed: Duration,
}

impl MetadataResult {
    pub fn duplicate(hash: InfoHash, elapsed: Duration) -> Self {
        MetadataResult {
            hash,
            status: AcquireStatus::Duplicate,
            strategy: None,
            name: None,
            total_size: 0,
            files: Vec::new(),
            raw_info: None,
            reason: None,
            elapsed,
        }
    }

    pub fn failure(
        hash: InfoHash,
        status: AcquireStatus,
        reason: String,
        elapsed: Duration,
    ) -> Self {
        MetadataResult {
            hash,
            status,
            strategy: None,
            name: None,
            total_size: 0,
            files: Vec::new(),
            raw_info: None,
            reason: Some(reason),
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == AcquireStatus::Success
    }

    /// Torrent name with the hex info-hash as fallback.
    pub fn name_or_hash(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => self.hash.to_string(),
        }
    }
}
