//! Swarm fallback: iterative DHT `get_peers` lookup over UDP, then the wire
//! exchange raced across the discovered peers until one yields the metadata.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio::time::{Duration, Instant, timeout};

use crate::acquire::AcquireStrategy;
use crate::bencode::{self, Value};
use crate::config::Config;
use crate::fetch::{self, FetchError, FetchTimeouts};
use crate::model::InfoHash;

pub struct SwarmFetch {
    cfg: Arc<Config>,
}

impl SwarmFetch {
    pub fn new(cfg: Arc<Config>) -> Self {
        SwarmFetch { cfg }
    }
}

impl AcquireStrategy for SwarmFetch {
    fn name(&self) -> &'static str {
        "swarm"
    }

    fn attempt(
        &self,
        hash: InfoHash,
        _peer: Option<SocketAddr>,
    ) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send {
        let cfg = self.cfg.clone();
        async move {
            let peers = lookup_peers(&cfg, hash).await?;
            tracing::debug!(hash = %hash, peers = peers.len(), "swarm: dht lookup done");
            if peers.is_empty() {
                return Err(FetchError::NoPeers);
            }
            race_peers(&cfg, hash, peers).await
        }
    }
}

/// Iterative KRPC `get_peers` walk toward the target hash. Nodes are visited
/// in XOR-distance order; the walk stops at the lookup deadline, the query
/// cap, or once enough peers are collected.
async fn lookup_peers(cfg: &Config, hash: InfoHash) -> Result<Vec<SocketAddr>, FetchError> {
    // Separate IPv4 + (optional) IPv6 UDP sockets so we can talk to both
    // families regardless of OS dual-stack settings.
    let socket_v4 = UdpSocket::bind("0.0.0.0:0").await?;
    let socket_v6 = match UdpSocket::bind("[::]:0").await {
        Ok(s) => Some(s),
        Err(err) => {
            tracing::debug!(error = %err, "swarm: ipv6 udp bind failed; continuing with ipv4 only");
            None
        }
    };

    let mut node_id = [0u8; 20];
    rand::rng().fill(&mut node_id[..]);

    let bootstrap = resolve_bootstrap(cfg).await;
    if bootstrap.is_empty() {
        tracing::debug!(hash = %hash, "swarm: no bootstrap nodes resolved");
        return Err(FetchError::NoPeers);
    }

    // Min-heap by XOR distance to the target, via Reverse.
    let mut q: BinaryHeap<(Reverse<[u8; 20]>, SocketAddr)> = BinaryHeap::new();
    let mut seen_nodes: HashSet<SocketAddr> = HashSet::new();
    for addr in bootstrap {
        push_seed(addr, &mut q, &mut seen_nodes);
    }

    let mut peers: Vec<SocketAddr> = Vec::new();
    let mut seen_peers: HashSet<SocketAddr> = HashSet::new();
    let mut tx: u16 = 0;
    let mut buf4 = vec![0u8; 4096];
    let mut buf6 = vec![0u8; 4096];
    let mut queries = 0usize;

    // Window of in-flight queries so responses are not missed to timing.
    // key=txid, value=(addr, sent_at)
    let mut inflight: HashMap<[u8; 2], (SocketAddr, Instant)> = HashMap::new();
    let query_timeout = Duration::from_millis(cfg.dht_query_timeout_ms);
    let deadline = Instant::now() + Duration::from_secs(cfg.dht_lookup_timeout_secs);

    while Instant::now() < deadline {
        if peers.len() >= cfg.swarm_max_peers {
            break;
        }
        if queries >= cfg.dht_max_queries_per_hash {
            break;
        }

        // Reap timed-out queries.
        let now = Instant::now();
        inflight.retain(|_, (_, sent_at)| now.saturating_duration_since(*sent_at) <= query_timeout);

        // Fill the window with the closest unvisited nodes.
        while inflight.len() < cfg.dht_inflight.max(1)
            && queries < cfg.dht_max_queries_per_hash
            && peers.len() < cfg.swarm_max_peers
        {
            let Some((_, addr)) = q.pop() else { break };
            tx = tx.wrapping_add(1);
            let txid = tx.to_be_bytes();
            let msg = build_get_peers(txid, &node_id, &hash);
            let _ = send_query(&socket_v4, socket_v6.as_ref(), &msg, addr).await;
            inflight.insert(txid, (addr, Instant::now()));
            queries += 1;
        }

        if inflight.is_empty() && q.is_empty() {
            break;
        }

        // Short receive timeout keeps the loop responsive near the deadline.
        let recv = recv_any(
            &socket_v4,
            socket_v6.as_ref(),
            &mut buf4,
            &mut buf6,
            Duration::from_millis(cfg.dht_recv_timeout_ms),
        );
        let Some((n_res, fam)) = recv.await else {
            continue;
        };
        let Ok(n) = n_res else {
            continue;
        };
        if n == 0 {
            continue;
        }

        let raw = if fam == 4 { &buf4[..n] } else { &buf6[..n] };
        let Some(reply) = GetPeersReply::decode(raw) else {
            continue;
        };

        // Only accept responses to txids we actually sent.
        if inflight.remove(&reply.tx).is_none() {
            continue;
        }

        for node in reply.nodes {
            push_node(node, hash, &mut q, &mut seen_nodes);
        }
        for peer in reply.peers {
            if usable_addr(peer) && seen_peers.insert(peer) {
                peers.push(peer);
                if peers.len() >= cfg.swarm_max_peers {
                    break;
                }
            }
        }
    }

    Ok(peers)
}

/// Races the metadata exchange across peers, a bounded window at a time,
/// aborting the rest on the first success.
async fn race_peers(
    cfg: &Config,
    hash: InfoHash,
    peers: Vec<SocketAddr>,
) -> Result<Vec<u8>, FetchError> {
    let timeouts = FetchTimeouts {
        connect: Duration::from_millis(cfg.direct_connect_timeout_ms),
        read: Duration::from_millis(cfg.direct_read_timeout_ms),
    };
    let per_peer = Duration::from_secs(cfg.swarm_peer_timeout_secs);

    let mut join_set = JoinSet::new();
    let mut peer_iter = peers.into_iter().take(cfg.swarm_max_peers);
    for _ in 0..cfg.swarm_fetch_inflight.max(1) {
        if let Some(peer) = peer_iter.next() {
            join_set.spawn(async move {
                let r = timeout(per_peer, fetch::fetch_from_peer(peer, hash, timeouts)).await;
                (peer, r)
            });
        }
    }

    let mut last_err: Option<FetchError> = None;
    while let Some(joined) = join_set.join_next().await {
        let (peer, result) = match joined {
            Ok(v) => v,
            Err(_) => continue,
        };

        match result {
            Ok(Ok(bytes)) => {
                tracing::debug!(hash = %hash, peer = %peer, bytes = bytes.len(), "swarm: got metadata");
                join_set.abort_all();
                return Ok(bytes);
            }
            Ok(Err(err)) => {
                tracing::trace!(hash = %hash, peer = %peer, error = %err, "swarm: peer failed");
                last_err = Some(err);
            }
            Err(_elapsed) => {
                last_err = Some(FetchError::Timeout("swarm peer"));
            }
        }

        if let Some(next_peer) = peer_iter.next() {
            join_set.spawn(async move {
                let r = timeout(per_peer, fetch::fetch_from_peer(next_peer, hash, timeouts)).await;
                (next_peer, r)
            });
        } else if join_set.is_empty() {
            break;
        }
    }

    Err(last_err.unwrap_or(FetchError::NoPeers))
}

async fn send_query(
    socket_v4: &UdpSocket,
    socket_v6: Option<&UdpSocket>,
    msg: &[u8],
    addr: SocketAddr,
) -> std::io::Result<usize> {
    match addr.ip() {
        IpAddr::V4(_) => socket_v4.send_to(msg, addr).await,
        IpAddr::V6(_) => match socket_v6 {
            Some(sock) => sock.send_to(msg, addr).await,
            None => Ok(0),
        },
    }
}

async fn recv_any(
    socket_v4: &UdpSocket,
    socket_v6: Option<&UdpSocket>,
    buf4: &mut [u8],
    buf6: &mut [u8],
    per_recv_timeout: Duration,
) -> Option<(std::io::Result<usize>, u8)> {
    let sleep = tokio::time::sleep(per_recv_timeout);
    tokio::pin!(sleep);

    tokio::select! {
        _ = &mut sleep => None,
        r = socket_v4.recv_from(buf4) => Some((r.map(|(n, _)| n), 4u8)),
        r = async {
            match socket_v6 {
                Some(sock) => sock.recv_from(buf6).await.map(|(n, _)| n),
                // never resolves without an IPv6 socket
                None => std::future::pending::<std::io::Result<usize>>().await,
            }
        } => Some((r, 6u8)),
    }
}

async fn resolve_bootstrap(cfg: &Config) -> Vec<SocketAddr> {
    let mut out = Vec::new();
    for host in cfg.swarm_bootstrap.iter() {
        match tokio::net::lookup_host(host).await {
            Ok(iter) => out.extend(iter),
            Err(err) => {
                tracing::debug!(host = %host, error = %err, "swarm: bootstrap resolve failed");
            }
        }
    }
    out
}

#[derive(Clone, Copy)]
struct DhtNode {
    id: [u8; 20],
    addr: SocketAddr,
}

fn push_seed(
    addr: SocketAddr,
    q: &mut BinaryHeap<(Reverse<[u8; 20]>, SocketAddr)>,
    seen: &mut HashSet<SocketAddr>,
) {
    // Seeds carry no node id; give them top priority.
    if !usable_addr(addr) {
        return;
    }
    if seen.insert(addr) {
        q.push((Reverse([0u8; 20]), addr));
    }
}

fn push_node(
    node: DhtNode,
    target: InfoHash,
    q: &mut BinaryHeap<(Reverse<[u8; 20]>, SocketAddr)>,
    seen: &mut HashSet<SocketAddr>,
) {
    if !usable_addr(node.addr) {
        return;
    }
    if seen.insert(node.addr) {
        q.push((Reverse(target.xor(&node.id)), node.addr));
    }
}

fn usable_addr(addr: SocketAddr) -> bool {
    if addr.port() == 0 {
        return false;
    }
    match addr.ip() {
        IpAddr::V4(v4) => !(v4.is_private() || v4.is_loopback() || v4.is_unspecified()),
        IpAddr::V6(v6) => !(v6.is_loopback() || v6.is_unspecified() || v6.is_unique_local()),
    }
}

fn build_get_peers(tx: [u8; 2], node_id: &[u8; 20], hash: &InfoHash) -> Vec<u8> {
    let mut args = BTreeMap::new();
    args.insert(
        Bytes::from_static(b"id"),
        Value::Bytes(Bytes::copy_from_slice(node_id)),
    );
    args.insert(
        Bytes::from_static(b"info_hash"),
        Value::Bytes(Bytes::copy_from_slice(hash.as_bytes())),
    );
    let mut root = BTreeMap::new();
    root.insert(Bytes::from_static(b"a"), Value::Dict(args));
    root.insert(
        Bytes::from_static(b"q"),
        Value::Bytes(Bytes::from_static(b"get_peers")),
    );
    root.insert(
        Bytes::from_static(b"t"),
        Value::Bytes(Bytes::copy_from_slice(&tx)),
    );
    root.insert(
        Bytes::from_static(b"y"),
        Value::Bytes(Bytes::from_static(b"q")),
    );
    bencode::encode(&Value::Dict(root))
}

struct GetPeersReply {
    tx: [u8; 2],
    nodes: Vec<DhtNode>,
    peers: Vec<SocketAddr>,
}

impl GetPeersReply {
    fn decode(raw: &[u8]) -> Option<Self> {
        let value = bencode::decode(raw).ok()?;
        let y = value.get(b"y").and_then(Value::as_bytes)?;
        if y.as_ref() != b"r" {
            return None;
        }
        let t = value.get(b"t").and_then(Value::as_bytes)?;
        if t.len() != 2 {
            return None;
        }
        let mut tx = [0u8; 2];
        tx.copy_from_slice(t);

        let reply = value.get(b"r")?;
        let mut nodes = Vec::new();
        if let Some(compact) = reply.get(b"nodes").and_then(Value::as_bytes) {
            parse_compact_nodes_v4(compact, &mut nodes);
        }
        if let Some(compact) = reply.get(b"nodes6").and_then(Value::as_bytes) {
            parse_compact_nodes_v6(compact, &mut nodes);
        }
        let mut peers = Vec::new();
        for key in [b"values".as_slice(), b"values6".as_slice()] {
            if let Some(values) = reply.get(key).and_then(Value::as_list) {
                for v in values {
                    if let Some(peer) = v.as_bytes().and_then(|b| parse_compact_peer(b)) {
                        peers.push(peer);
                    }
                }
            }
        }

        Some(GetPeersReply { tx, nodes, peers })
    }
}

// Compact peer info: 4-byte IPv4 + 2-byte port, or 16-byte IPv6 + 2-byte port.
fn parse_compact_peer(bytes: &[u8]) -> Option<SocketAddr> {
    match bytes.len() {
        6 => {
            let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
            let port = u16::from_be_bytes([bytes[4], bytes[5]]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        18 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[..16]);
            let port = u16::from_be_bytes([bytes[16], bytes[17]]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

// Compact node info: 20-byte node id + 4-byte IPv4 + 2-byte port.
fn parse_compact_nodes_v4(compact: &[u8], out: &mut Vec<DhtNode>) {
    let mut i = 0;
    while i + 26 <= compact.len() {
        let mut id = [0u8; 20];
        id.copy_from_slice(&compact[i..i + 20]);
        let ip = Ipv4Addr::new(compact[i + 20], compact[i + 21], compact[i + 22], compact[i + 23]);
        let port = u16::from_be_bytes([compact[i + 24], compact[i + 25]]);
        out.push(DhtNode {
            id,
            addr: SocketAddr::new(IpAddr::V4(ip), port),
        });
        i += 26;
    }
}

// nodes6: 20-byte node id + 16-byte IPv6 + 2-byte port.
fn parse_compact_nodes_v6(compact: &[u8], out: &mut Vec<DhtNode>) {
    let mut i = 0;
    while i + 38 <= compact.len() {
        let mut id = [0u8; 20];
        id.copy_from_slice(&compact[i..i + 20]);
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&compact[i + 20..i + 36]);
        let port = u16::from_be_bytes([compact[i + 36], compact[i + 37]]);
        out.push(DhtNode {
            id,
            addr: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port),
        });
        i += 38;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_peers_query_is_canonical() {
        let msg = build_get_peers(*b"01", &[b'A'; 20], &InfoHash([b'B'; 20]));
        assert_eq!(
            msg,
            b"d1:ad2:id20:AAAAAAAAAAAAAAAAAAAA9:info_hash20:BBBBBBBBBBBBBBBBBBBBe1:q9:get_peers1:t2:011:y1:qe"
        );
    }

    #[test]
    fn reply_decodes_nodes_and_peers() {
        let mut nodes = Vec::new();
        nodes.extend_from_slice(&[1u8; 20]);
        nodes.extend_from_slice(&[85, 1, 2, 3]);
        nodes.extend_from_slice(&0x1A2Bu16.to_be_bytes());

        let mut r = BTreeMap::new();
        r.insert(
            Bytes::from_static(b"nodes"),
            Value::Bytes(Bytes::from(nodes)),
        );
        r.insert(
            Bytes::from_static(b"values"),
            Value::List(vec![
                Value::Bytes(Bytes::from_static(&[85, 9, 9, 9, 0x1A, 0xE1])),
                Value::Bytes(Bytes::from_static(&[1, 2, 3])),
            ]),
        );
        let mut root = BTreeMap::new();
        root.insert(Bytes::from_static(b"r"), Value::Dict(r));
        root.insert(Bytes::from_static(b"t"), Value::Bytes(Bytes::from_static(b"ab")));
        root.insert(Bytes::from_static(b"y"), Value::Bytes(Bytes::from_static(b"r")));
        let raw = bencode::encode(&Value::Dict(root));

        let reply = GetPeersReply::decode(&raw).unwrap();
        assert_eq!(reply.tx, *b"ab");
        assert_eq!(reply.nodes.len(), 1);
        assert_eq!(reply.nodes[0].id, [1u8; 20]);
        assert_eq!(reply.nodes[0].addr, "85.1.2.3:6699".parse().unwrap());
        // the 3-byte value is dropped, the 6-byte one survives
        assert_eq!(reply.peers, vec!["85.9.9.9:6881".parse().unwrap()]);
    }

    #[test]
    fn reply_rejects_queries_and_bad_txids() {
        let mut root = BTreeMap::new();
        root.insert(Bytes::from_static(b"t"), Value::Bytes(Bytes::from_static(b"ab")));
        root.insert(Bytes::from_static(b"y"), Value::Bytes(Bytes::from_static(b"q")));
        let raw = bencode::encode(&Value::Dict(root));
        assert!(GetPeersReply::decode(&raw).is_none());

        let mut root = BTreeMap::new();
        root.insert(Bytes::from_static(b"t"), Value::Bytes(Bytes::from_static(b"abc")));
        root.insert(Bytes::from_static(b"y"), Value::Bytes(Bytes::from_static(b"r")));
        let raw = bencode::encode(&Value::Dict(root));
        assert!(GetPeersReply::decode(&raw).is_none());

        assert!(GetPeersReply::decode(b"garbage").is_none());
    }

    #[test]
    fn compact_peers_parse_both_families() {
        assert_eq!(
            parse_compact_peer(&[1, 2, 3, 4, 0x00, 0x50]),
            Some("1.2.3.4:80".parse().unwrap())
        );
        let mut v6 = vec![0u8; 18];
        v6[15] = 1;
        v6[16] = 0x1A;
        v6[17] = 0xE1;
        assert_eq!(parse_compact_peer(&v6), Some("[::1]:6881".parse().unwrap()));
        assert_eq!(parse_compact_peer(&[1, 2, 3]), None);
    }

    #[test]
    fn unusable_addresses_are_filtered() {
        assert!(!usable_addr("10.0.0.1:6881".parse().unwrap()));
        assert!(!usable_addr("127.0.0.1:6881".parse().unwrap()));
        assert!(!usable_addr("0.0.0.0:6881".parse().unwrap()));
        assert!(!usable_addr("85.1.2.3:0".parse().unwrap()));
        assert!(usable_addr("85.1.2.3:6881".parse().unwrap()));
    }

    #[test]
    fn closer_nodes_pop_first() {
        let target = InfoHash([0xFF; 20]);
        let mut q = BinaryHeap::new();
        let mut seen = HashSet::new();
        push_node(
            DhtNode {
                id: [0x00; 20],
                addr: "85.0.0.1:1000".parse().unwrap(),
            },
            target,
            &mut q,
            &mut seen,
        );
        push_node(
            DhtNode {
                id: [0xFF; 20],
                addr: "85.0.0.2:1000".parse().unwrap(),
            },
            target,
            &mut q,
            &mut seen,
        );

        let (_, first) = q.pop().unwrap();
        assert_eq!(first, "85.0.0.2:1000".parse().unwrap());
    }

    #[test]
    fn duplicate_nodes_are_not_requeued() {
        let target = InfoHash([0xFF; 20]);
        let mut q = BinaryHeap::new();
        let mut seen = HashSet::new();
        let node = DhtNode {
            id: [0x01; 20],
            addr: "85.0.0.1:1000".parse().unwrap(),
        };
        push_node(node, target, &mut q, &mut seen);
        push_node(node, target, &mut q, &mut seen);
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn race_with_no_peers_reports_no_peers() {
        let cfg = Config::test();
        let err = race_peers(&cfg, InfoHash([7u8; 20]), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NoPeers));
    }

    #[tokio::test]
    async fn race_surfaces_the_last_peer_error() {
        // discard ports refuse quickly; both peers fail, no metadata
        let cfg = Config::test();
        let peers = vec![
            "127.0.0.1:9".parse().unwrap(),
            "127.0.0.1:19".parse().unwrap(),
        ];
        let err = race_peers(&cfg, InfoHash([7u8; 20]), peers).await.unwrap_err();
        assert!(!matches!(err, FetchError::NoPeers));
    }
}
