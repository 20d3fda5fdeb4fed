use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Clone, Debug)]
pub struct Config {
    pub data_dir: PathBuf,

    // Web
    pub http_addr: SocketAddr,

    // Ingest
    pub ingest_file: Option<PathBuf>,
    pub queue_depth: usize,

    // Direct probe
    pub direct_enabled: bool,
    pub direct_pool_size: usize,
    pub direct_connect_timeout_ms: u64,
    pub direct_read_timeout_ms: u64,
    pub direct_attempt_timeout_secs: u64,

    // Swarm fallback
    pub swarm_enabled: bool,
    pub swarm_pool_size: usize,
    pub swarm_attempt_timeout_secs: u64,
    pub swarm_bootstrap: Vec<String>,
    pub swarm_max_peers: usize,
    pub swarm_fetch_inflight: usize,
    pub swarm_peer_timeout_secs: u64,

    // DHT lookup
    pub dht_query_timeout_ms: u64,
    pub dht_max_queries_per_hash: usize,
    pub dht_inflight: usize,
    pub dht_lookup_timeout_secs: u64,
    pub dht_recv_timeout_ms: u64,

    // Dedup
    pub dedup_enabled: bool,
    pub dedup_bits_pow2: u32,
    pub dedup_k: u8,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // If a .env file exists, load it. If not, keep going.
        // Precedence: process env > .env > code defaults.
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    fn from_env() -> anyhow::Result<Self> {
        let data_dir = env_pathbuf("MAGPIE_DATA_DIR", "data");

        let http_addr = env_opt_string("MAGPIE_ADDR").unwrap_or_else(|| "127.0.0.1:3000".into());
        let http_addr = SocketAddr::from_str(&http_addr)
            .map_err(|e| anyhow::anyhow!("parse MAGPIE_ADDR: {e}"))?;

        let ingest_file = env_opt_string("MAGPIE_INGEST_FILE").map(PathBuf::from);
        let queue_depth = env_usize("MAGPIE_QUEUE_DEPTH", 1024);

        let direct_enabled = env_enabled("MAGPIE_DIRECT", true);
        let direct_pool_size = env_usize("MAGPIE_DIRECT_POOL", 64);
        let direct_connect_timeout_ms = env_u64("MAGPIE_DIRECT_CONNECT_TIMEOUT_MS", 1_000);
        let direct_read_timeout_ms = env_u64("MAGPIE_DIRECT_READ_TIMEOUT_MS", 2_000);
        let direct_attempt_timeout_secs = env_u64("MAGPIE_DIRECT_ATTEMPT_TIMEOUT_SECS", 8);

        let swarm_enabled = env_enabled("MAGPIE_SWARM", true);
        let swarm_pool_size = env_usize("MAGPIE_SWARM_POOL", 100);
        let swarm_attempt_timeout_secs = env_u64("MAGPIE_SWARM_ATTEMPT_TIMEOUT_SECS", 60);
        let swarm_bootstrap = env_csv_strings(
            "MAGPIE_SWARM_BOOTSTRAP",
            &[
                "router.bittorrent.com:6881",
                "dht.transmissionbt.com:6881",
                "router.utorrent.com:6881",
            ],
        );
        let swarm_max_peers = env_usize("MAGPIE_SWARM_MAX_PEERS", 64);
        let swarm_fetch_inflight = env_usize("MAGPIE_SWARM_FETCH_INFLIGHT", 8);
        let swarm_peer_timeout_secs = env_u64("MAGPIE_SWARM_PEER_TIMEOUT_SECS", 16);

        let dht_query_timeout_ms = env_u64("MAGPIE_DHT_QUERY_TIMEOUT_MS", 900);
        let dht_max_queries_per_hash = env_usize("MAGPIE_DHT_MAX_QUERIES_PER_HASH", 128);
        let dht_inflight = env_usize("MAGPIE_DHT_INFLIGHT", 16);
        let dht_lookup_timeout_secs = env_u64("MAGPIE_DHT_LOOKUP_TIMEOUT_SECS", 10);
        let dht_recv_timeout_ms = env_u64("MAGPIE_DHT_RECV_TIMEOUT_MS", 250);

        let dedup_enabled = env_enabled("MAGPIE_DEDUP", true);
        let dedup_bits_pow2 = env_u32("MAGPIE_DEDUP_BITS_POW2", 26);
        let dedup_k = env_u8("MAGPIE_DEDUP_K", 12);

        Ok(Self {
            data_dir,

            http_addr,

            ingest_file,
            queue_depth,

            direct_enabled,
            direct_pool_size,
            direct_connect_timeout_ms,
            direct_read_timeout_ms,
            direct_attempt_timeout_secs,

            swarm_enabled,
            swarm_pool_size,
            swarm_attempt_timeout_secs,
            swarm_bootstrap,
            swarm_max_peers,
            swarm_fetch_inflight,
            swarm_peer_timeout_secs,

            dht_query_timeout_ms,
            dht_max_queries_per_hash,
            dht_inflight,
            dht_lookup_timeout_secs,
            dht_recv_timeout_ms,

            dedup_enabled,
            dedup_bits_pow2,
            dedup_k,
        })
    }
}

#[cfg(test)]
impl Config {
    pub(crate) fn test() -> Self {
        Self {
            data_dir: PathBuf::from("data"),

            http_addr: SocketAddr::from(([127, 0, 0, 1], 0)),

            ingest_file: None,
            queue_depth: 16,

            direct_enabled: true,
            direct_pool_size: 4,
            direct_connect_timeout_ms: 200,
            direct_read_timeout_ms: 200,
            direct_attempt_timeout_secs: 2,

            swarm_enabled: true,
            swarm_pool_size: 4,
            swarm_attempt_timeout_secs: 2,
            swarm_bootstrap: Vec::new(),
            swarm_max_peers: 8,
            swarm_fetch_inflight: 2,
            swarm_peer_timeout_secs: 1,

            dht_query_timeout_ms: 100,
            dht_max_queries_per_hash: 8,
            dht_inflight: 2,
            dht_lookup_timeout_secs: 1,
            dht_recv_timeout_ms: 50,

            dedup_enabled: true,
            dedup_bits_pow2: 16,
            dedup_k: 12,
        }
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_string(name: &str, default: &str) -> String {
    env_opt_string(name).unwrap_or_else(|| default.to_string())
}

fn env_pathbuf(name: &str, default: &str) -> PathBuf {
    PathBuf::from(env_string(name, default))
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u8(name: &str, default: u8) -> u8 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u8>().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_csv_strings(name: &str, defaults: &[&str]) -> Vec<String> {
    if let Some(s) = env_opt_string(name) {
        let v: Vec<String> = s
            .split(',')
            .map(|x| x.trim().to_string())
            .filter(|x| !x.is_empty())
            .collect();
        if !v.is_empty() {
            return v;
        }
    }
    defaults.iter().map(|s| s.to_string()).collect()
}

fn env_enabled(name: &str, default: bool) -> bool {
    match env_opt_string(name) {
        None => default,
        Some(v) => {
            let v = v.to_ascii_lowercase();
            if matches!(v.as_str(), "0" | "false" | "off" | "no") {
                return false;
            }
            if matches!(v.as_str(), "1" | "true" | "on" | "yes") {
                return true;
            }
            default
        }
    }
}
