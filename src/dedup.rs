//! Probabilistic membership used for dedup decisions. Possibly-present
//! semantics, no false negatives. Lookups never fail: a missing or degraded
//! backend reads as "not present" so the pipeline keeps moving.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};

pub trait Membership: Send + Sync {
    fn exists(&self, namespace: &str, key: &str) -> bool;
    fn add(&self, namespace: &str, key: &str);
}

/// Namespaced Bloom filters behind one mutex. Filters are created lazily on
/// first insert into a namespace.
pub struct BloomMembership {
    enabled: bool,
    bits_pow2: u32,
    k: u8,
    filters: Mutex<HashMap<String, BloomFilter>>,
}

#[derive(Serialize, Deserialize)]
struct FilterSnapshot {
    bits_pow2: u32,
    k: u8,
    words: String,
}

impl BloomMembership {
    pub fn new(enabled: bool, bits_pow2: u32, k: u8) -> Self {
        BloomMembership {
            enabled,
            bits_pow2,
            k,
            filters: Mutex::new(HashMap::new()),
        }
    }

    /// Restores filters from an earlier `save` so marks survive a restart.
    /// A missing or unreadable snapshot starts empty.
    pub fn load(path: &Path, enabled: bool, bits_pow2: u32, k: u8) -> Self {
        let me = BloomMembership::new(enabled, bits_pow2, k);
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(_) => return me,
        };
        let snaps: HashMap<String, FilterSnapshot> = match serde_json::from_slice(&raw) {
            Ok(s) => s,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "dedup: snapshot unreadable, starting empty");
                return me;
            }
        };
        let mut filters = me.filters.lock().unwrap_or_else(|p| p.into_inner());
        for (ns, snap) in snaps {
            if let Some(filter) = BloomFilter::from_snapshot(&snap) {
                filters.insert(ns, filter);
            } else {
                tracing::warn!(namespace = %ns, "dedup: snapshot filter malformed, dropped");
            }
        }
        drop(filters);
        me
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let filters = self.filters.lock().unwrap_or_else(|p| p.into_inner());
        let mut snaps: HashMap<String, FilterSnapshot> = HashMap::new();
        for (ns, filter) in filters.iter() {
            let mut bytes = Vec::with_capacity(filter.bits.len() * 8);
            for word in &filter.bits {
                bytes.extend_from_slice(&word.to_le_bytes());
            }
            snaps.insert(
                ns.clone(),
                FilterSnapshot {
                    bits_pow2: filter.bits_pow2,
                    k: filter.k,
                    words: B64.encode(&bytes),
                },
            );
        }
        drop(filters);
        let body = serde_json::to_vec(&snaps).map_err(io::Error::other)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, body)
    }
}

impl Membership for BloomMembership {
    fn exists(&self, namespace: &str, key: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let filters = self.filters.lock().unwrap_or_else(|p| p.into_inner());
        filters
            .get(namespace)
            .is_some_and(|f| f.probably_contains(key.as_bytes()))
    }

    fn add(&self, namespace: &str, key: &str) {
        if !self.enabled {
            return;
        }
        let mut filters = self.filters.lock().unwrap_or_else(|p| p.into_inner());
        filters
            .entry(namespace.to_string())
            .or_insert_with(|| BloomFilter::new_pow2(self.bits_pow2, self.k))
            .insert(key.as_bytes());
    }
}

struct BloomFilter {
    bits: Vec<u64>,
    bits_pow2: u32,
    mask: u64,
    k: u8,
}

impl BloomFilter {
    fn new_pow2(bits_pow2: u32, k: u8) -> Self {
        // m = 2^bits_pow2 bits; clamped so the word vector stays sane
        let pow = bits_pow2.clamp(10, 30);
        let m_bits = 1usize << pow;
        BloomFilter {
            bits: vec![0u64; m_bits / 64],
            bits_pow2: pow,
            mask: (m_bits as u64) - 1,
            k: k.max(1),
        }
    }

    fn from_snapshot(snap: &FilterSnapshot) -> Option<Self> {
        if !(10..=30).contains(&snap.bits_pow2) {
            return None;
        }
        let bytes = B64.decode(&snap.words).ok()?;
        let m_bits = 1usize << snap.bits_pow2;
        if bytes.len() != m_bits / 8 {
            return None;
        }
        let bits = bytes
            .chunks_exact(8)
            .map(|c| {
                let mut w = [0u8; 8];
                w.copy_from_slice(c);
                u64::from_le_bytes(w)
            })
            .collect();
        Some(BloomFilter {
            bits,
            bits_pow2: snap.bits_pow2,
            mask: (m_bits as u64) - 1,
            k: snap.k.max(1),
        })
    }

    #[inline]
    fn probably_contains(&self, item: &[u8]) -> bool {
        let (h1, h2) = bloom_hashes(item);
        for i in 0..self.k {
            let bit_index = h1.wrapping_add((i as u64).wrapping_mul(h2)) & self.mask;
            let word = (bit_index >> 6) as usize;
            let bit = (bit_index & 63) as u32;
            if self.bits[word] & (1u64 << bit) == 0 {
                return false;
            }
        }
        true
    }

    #[inline]
    fn insert(&mut self, item: &[u8]) {
        let (h1, h2) = bloom_hashes(item);
        for i in 0..self.k {
            let bit_index = h1.wrapping_add((i as u64).wrapping_mul(h2)) & self.mask;
            let word = (bit_index >> 6) as usize;
            let bit = (bit_index & 63) as u32;
            self.bits[word] |= 1u64 << bit;
        }
    }
}

#[inline]
fn bloom_hashes(item: &[u8]) -> (u64, u64) {
    // Double-hashing scheme: h_i = h1 + i*h2, h2 forced odd.
    let h1 = xxhash_rust::xxh3::xxh3_64(item);
    let h2 = xxhash_rust::xxh3::xxh3_64_with_seed(item, 0x9E37_79B9_7F4A_7C15) | 1;
    (h1, h2)
}
