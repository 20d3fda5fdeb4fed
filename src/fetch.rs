//! Direct-peer metadata fetch: one TCP connection driven through connect,
//! handshake, extension handshake and a strictly sequential piece loop.
//! One call is one attempt; the socket is dropped on every exit path.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};

use crate::acquire::AcquireStrategy;
use crate::model::{AcquireStatus, InfoHash};
use crate::wire::{self, MAX_METADATA_SIZE, METADATA_PIECE_SIZE};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("timed out during {0}")]
    Timeout(&'static str),
    #[error("no data for piece {0} before the deadline")]
    PieceTimeout(u32),
    #[error("handshake rejected: {0}")]
    Handshake(#[from] wire::HandshakeError),
    #[error("no usable metadata exchange: {0}")]
    NoMetadata(&'static str),
    #[error("declared metadata size {0} over the {MAX_METADATA_SIZE} ceiling")]
    OversizeMetadata(i64),
    #[error("assembled {got} of {want} metadata bytes")]
    ShortMetadata { got: usize, want: usize },
    #[error("no reachable peers")]
    NoPeers,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FetchError {
    pub fn status(&self) -> AcquireStatus {
        match self {
            FetchError::ConnectTimeout | FetchError::Timeout(_) | FetchError::PieceTimeout(_) => {
                AcquireStatus::Timeout
            }
            FetchError::Handshake(_) => AcquireStatus::PeerMismatch,
            FetchError::NoPeers => AcquireStatus::NoPeers,
            _ => AcquireStatus::Error,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FetchTimeouts {
    pub connect: Duration,
    pub read: Duration,
}

/// Fetches the raw info dictionary from a single peer.
pub async fn fetch_from_peer(
    addr: SocketAddr,
    hash: InfoHash,
    timeouts: FetchTimeouts,
) -> Result<Vec<u8>, FetchError> {
    let mut stream = match timeout(timeouts.connect, TcpStream::connect(addr)).await {
        Ok(s) => s?,
        Err(_) => return Err(FetchError::ConnectTimeout),
    };
    let _ = stream.set_nodelay(true);
    exchange(&mut stream, hash, timeouts).await
}

/// The whole exchange over an already-connected stream, separated from the
/// socket so each stage is drivable with an in-memory stream.
async fn exchange<S>(
    stream: &mut S,
    hash: InfoHash,
    timeouts: FetchTimeouts,
) -> Result<Vec<u8>, FetchError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let peer_id = wire::generate_peer_id();
    let hello = wire::build_handshake(&hash, &peer_id, wire::extension_reserved());
    write_timed(stream, &hello, timeouts.read, "handshake send").await?;

    let mut reply = [0u8; wire::HANDSHAKE_LEN];
    read_exact_timed(stream, &mut reply, timeouts.read, "handshake").await?;
    let peer = wire::parse_handshake(&reply, &hash)?;
    if !peer.supports_extensions() {
        return Err(FetchError::NoMetadata("no extension protocol bit"));
    }

    write_timed(
        stream,
        &wire::build_extension_handshake(),
        timeouts.read,
        "extension handshake send",
    )
    .await?;
    let ext = match timeout(timeouts.read, wire::read_extended_handshake(stream)).await {
        Ok(read) => read?,
        Err(_) => return Err(FetchError::Timeout("extension handshake")),
    };
    let Some(ext) = ext else {
        return Err(FetchError::NoMetadata("no extension handshake"));
    };
    if ext.ut_metadata_id <= 0 || ext.ut_metadata_id > u8::MAX as i64 {
        return Err(FetchError::NoMetadata("ut_metadata not offered"));
    }
    if ext.metadata_size > MAX_METADATA_SIZE {
        return Err(FetchError::OversizeMetadata(ext.metadata_size));
    }
    if ext.metadata_size <= 0 {
        return Err(FetchError::NoMetadata("no metadata_size"));
    }

    let ut_id = ext.ut_metadata_id as u8;
    let size = ext.metadata_size as usize;
    let piece_count = size.div_ceil(METADATA_PIECE_SIZE);
    let mut metadata = vec![0u8; size];
    let mut written = 0usize;

    for piece in 0..piece_count as u32 {
        write_timed(
            stream,
            &wire::build_piece_request(ut_id, piece),
            timeouts.read,
            "piece request send",
        )
        .await?;
        let data = await_piece(stream, ut_id, piece, timeouts.read).await?;
        let offset = piece as usize * METADATA_PIECE_SIZE;
        let n = data.len().min(size - offset);
        metadata[offset..offset + n].copy_from_slice(&data[..n]);
        written += n;
    }

    if written != size {
        return Err(FetchError::ShortMetadata {
            got: written,
            want: size,
        });
    }
    Ok(metadata)
}

/// Polls until the requested piece arrives or the deadline passes. Unrelated
/// traffic (keep-alives, rejects, other pieces) is consumed and skipped.
async fn await_piece<S: AsyncRead + Unpin>(
    stream: &mut S,
    ut_id: u8,
    piece: u32,
    read_timeout: Duration,
) -> Result<Bytes, FetchError> {
    let deadline = Instant::now() + read_timeout;
    loop {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            return Err(FetchError::PieceTimeout(piece));
        };
        let candidate = match timeout(remaining, wire::read_metadata_piece(stream, ut_id)).await {
            Ok(read) => read?,
            Err(_) => return Err(FetchError::PieceTimeout(piece)),
        };
        match candidate {
            Some(p) if p.piece == piece as i64 => return Ok(p.data),
            Some(p) => {
                tracing::trace!(want = piece, got = p.piece, "fetch: unmatched piece index")
            }
            None => {}
        }
    }
}

async fn write_timed<S: AsyncWrite + Unpin>(
    stream: &mut S,
    buf: &[u8],
    dur: Duration,
    stage: &'static str,
) -> Result<(), FetchError> {
    match timeout(dur, stream.write_all(buf)).await {
        Ok(r) => {
            r?;
            Ok(())
        }
        Err(_) => Err(FetchError::Timeout(stage)),
    }
}

async fn read_exact_timed<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut [u8],
    dur: Duration,
    stage: &'static str,
) -> Result<(), FetchError> {
    match timeout(dur, stream.read_exact(buf)).await {
        Ok(r) => {
            r?;
            Ok(())
        }
        Err(_) => Err(FetchError::Timeout(stage)),
    }
}

/// Strategy wrapper: one attempt against the announcing peer.
pub struct DirectProbe {
    timeouts: FetchTimeouts,
}

impl DirectProbe {
    pub fn new(timeouts: FetchTimeouts) -> Self {
        DirectProbe { timeouts }
    }
}

impl AcquireStrategy for DirectProbe {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn attempt(
        &self,
        hash: InfoHash,
        peer: Option<SocketAddr>,
    ) -> impl Future<Output = Result<Vec<u8>, FetchError>> + Send {
        let timeouts = self.timeouts;
        async move {
            let Some(addr) = peer else {
                return Err(FetchError::NoPeers);
            };
            tracing::debug!(hash = %hash, peer = %addr, "direct: probing");
            fetch_from_peer(addr, hash, timeouts).await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::bencode::{self, Value};

    fn timeouts() -> FetchTimeouts {
        FetchTimeouts {
            connect: Duration::from_secs(1),
            read: Duration::from_secs(2),
        }
    }

    fn ext_payload(ut_metadata: i64, metadata_size: i64) -> Vec<u8> {
        let mut m = BTreeMap::new();
        m.insert(
            Bytes::from_static(b"ut_metadata"),
            Value::Integer(ut_metadata),
        );
        let mut root = BTreeMap::new();
        root.insert(Bytes::from_static(b"m"), Value::Dict(m));
        root.insert(
            Bytes::from_static(b"metadata_size"),
            Value::Integer(metadata_size),
        );
        bencode::encode(&Value::Dict(root))
    }

    fn data_frame(ext_id: u8, piece: i64, data: &[u8]) -> Bytes {
        let mut d = BTreeMap::new();
        d.insert(Bytes::from_static(b"msg_type"), Value::Integer(1));
        d.insert(Bytes::from_static(b"piece"), Value::Integer(piece));
        let mut payload = bencode::encode(&Value::Dict(d));
        payload.extend_from_slice(data);
        wire::build_extended(ext_id, &payload)
    }

    fn reject_frame(ext_id: u8, piece: i64) -> Bytes {
        let mut d = BTreeMap::new();
        d.insert(Bytes::from_static(b"msg_type"), Value::Integer(2));
        d.insert(Bytes::from_static(b"piece"), Value::Integer(piece));
        wire::build_extended(ext_id, &bencode::encode(&Value::Dict(d)))
    }

    async fn read_frame_raw<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
        stream.read_exact(&mut body).await.unwrap();
        body
    }

    async fn accept_handshake<S: AsyncRead + AsyncWrite + Unpin>(
        stream: &mut S,
        hash: InfoHash,
    ) {
        let mut hs = [0u8; wire::HANDSHAKE_LEN];
        stream.read_exact(&mut hs).await.unwrap();
        assert_eq!(hs[0], 19);
        assert_eq!(&hs[1..20], wire::PROTOCOL);
        assert_eq!(&hs[28..48], hash.as_bytes());
        let reply = wire::build_handshake(&hash, &wire::generate_peer_id(), wire::extension_reserved());
        stream.write_all(&reply).await.unwrap();
    }

    #[tokio::test]
    async fn full_exchange_against_scripted_peer() {
        let (mut client, mut server) = tokio::io::duplex(1 << 20);
        let hash = InfoHash([7u8; 20]);
        let metadata: Vec<u8> = (0..20000).map(|i| (i % 251) as u8).collect();
        let served = metadata.clone();

        let peer = tokio::spawn(async move {
            accept_handshake(&mut server, hash).await;

            let frame = read_frame_raw(&mut server).await;
            assert_eq!(frame[0], wire::EXTENSION_MESSAGE_ID);
            assert_eq!(frame[1], wire::EXT_HANDSHAKE_ID);

            let payload = ext_payload(3, served.len() as i64);
            server
                .write_all(&wire::build_extended(wire::EXT_HANDSHAKE_ID, &payload))
                .await
                .unwrap();

            for expect in 0..2i64 {
                let frame = read_frame_raw(&mut server).await;
                assert_eq!(frame[1], 3);
                let req = bencode::decode(&frame[2..]).unwrap();
                assert_eq!(req.get(b"msg_type").and_then(Value::as_int), Some(0));
                assert_eq!(req.get(b"piece").and_then(Value::as_int), Some(expect));

                // keep-alive in between; the poller must skip it
                server.write_all(&[0, 0, 0, 0]).await.unwrap();

                let start = expect as usize * METADATA_PIECE_SIZE;
                let end = (start + METADATA_PIECE_SIZE).min(served.len());
                server
                    .write_all(&data_frame(3, expect, &served[start..end]))
                    .await
                    .unwrap();
            }
        });

        let got = exchange(&mut client, hash, timeouts()).await.unwrap();
        assert_eq!(got, metadata);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn oversize_declaration_aborts_without_piece_requests() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let hash = InfoHash([9u8; 20]);

        let peer = tokio::spawn(async move {
            accept_handshake(&mut server, hash).await;
            let _ = read_frame_raw(&mut server).await;
            server
                .write_all(&wire::build_extended(
                    wire::EXT_HANDSHAKE_ID,
                    &ext_payload(1, 5_000_000),
                ))
                .await
                .unwrap();
            // no piece request may follow, only the hangup
            let mut probe = [0u8; 1];
            assert_eq!(server.read(&mut probe).await.unwrap(), 0);
        });

        let err = exchange(&mut client, hash, timeouts()).await.unwrap_err();
        assert!(matches!(err, FetchError::OversizeMetadata(5_000_000)));
        drop(client);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn mismatched_info_hash_is_peer_mismatch() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let peer = tokio::spawn(async move {
            let mut hs = [0u8; wire::HANDSHAKE_LEN];
            server.read_exact(&mut hs).await.unwrap();
            let reply = wire::build_handshake(
                &InfoHash([1u8; 20]),
                &wire::generate_peer_id(),
                wire::extension_reserved(),
            );
            server.write_all(&reply).await.unwrap();
        });

        let err = exchange(&mut client, InfoHash([2u8; 20]), timeouts())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FetchError::Handshake(wire::HandshakeError::InfoHashMismatch(_))
        ));
        assert_eq!(err.status(), AcquireStatus::PeerMismatch);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn peer_without_ut_metadata_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let hash = InfoHash([3u8; 20]);

        let peer = tokio::spawn(async move {
            accept_handshake(&mut server, hash).await;
            let _ = read_frame_raw(&mut server).await;
            // m dict present but empty: ut_metadata defaults to -1
            let mut root = BTreeMap::new();
            root.insert(Bytes::from_static(b"m"), Value::Dict(BTreeMap::new()));
            server
                .write_all(&wire::build_extended(
                    wire::EXT_HANDSHAKE_ID,
                    &bencode::encode(&Value::Dict(root)),
                ))
                .await
                .unwrap();
        });

        let err = exchange(&mut client, hash, timeouts()).await.unwrap_err();
        assert!(matches!(err, FetchError::NoMetadata(_)));
        assert_eq!(err.status(), AcquireStatus::Error);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn reject_message_runs_out_the_piece_deadline() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let hash = InfoHash([4u8; 20]);
        let short = FetchTimeouts {
            connect: Duration::from_secs(1),
            read: Duration::from_millis(200),
        };

        let peer = tokio::spawn(async move {
            accept_handshake(&mut server, hash).await;
            let _ = read_frame_raw(&mut server).await;
            server
                .write_all(&wire::build_extended(
                    wire::EXT_HANDSHAKE_ID,
                    &ext_payload(3, 10),
                ))
                .await
                .unwrap();
            let _ = read_frame_raw(&mut server).await;
            server.write_all(&reject_frame(3, 0)).await.unwrap();
            // hold the connection open so the poller times out rather than EOFs
            tokio::time::sleep(Duration::from_millis(600)).await;
        });

        let err = exchange(&mut client, hash, short).await.unwrap_err();
        assert!(matches!(err, FetchError::PieceTimeout(0)));
        assert_eq!(err.status(), AcquireStatus::Timeout);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn handshake_without_extension_bit_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let hash = InfoHash([5u8; 20]);

        let peer = tokio::spawn(async move {
            let mut hs = [0u8; wire::HANDSHAKE_LEN];
            server.read_exact(&mut hs).await.unwrap();
            let reply = wire::build_handshake(&hash, &wire::generate_peer_id(), [0u8; 8]);
            server.write_all(&reply).await.unwrap();
        });

        let err = exchange(&mut client, hash, timeouts()).await.unwrap_err();
        assert!(matches!(err, FetchError::NoMetadata("no extension protocol bit")));
        peer.await.unwrap();
    }

    #[test]
    fn statuses_map_to_terminal_vocabulary() {
        assert_eq!(FetchError::ConnectTimeout.status(), AcquireStatus::Timeout);
        assert_eq!(
            FetchError::Timeout("handshake").status(),
            AcquireStatus::Timeout
        );
        assert_eq!(FetchError::PieceTimeout(3).status(), AcquireStatus::Timeout);
        assert_eq!(
            FetchError::Handshake(wire::HandshakeError::Short).status(),
            AcquireStatus::PeerMismatch
        );
        assert_eq!(FetchError::NoPeers.status(), AcquireStatus::NoPeers);
        assert_eq!(
            FetchError::OversizeMetadata(5_000_000).status(),
            AcquireStatus::Error
        );
        assert_eq!(
            FetchError::ShortMetadata { got: 1, want: 2 }.status(),
            AcquireStatus::Error
        );
    }
}
