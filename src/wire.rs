//! Peer wire codec: the 68-byte BitTorrent handshake, BEP-10 extension
//! framing and the BEP-9 `ut_metadata` messages carried inside it. Builders
//! are pure; readers work on any [`AsyncRead`] so they are testable without
//! sockets.

use std::collections::BTreeMap;
use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::bencode::{self, Value};
use crate::model::InfoHash;

pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;
/// BEP-10 envelope message id.
pub const EXTENSION_MESSAGE_ID: u8 = 20;
/// Sub-id of the extension handshake itself.
pub const EXT_HANDSHAKE_ID: u8 = 0;
/// The `ut_metadata` id this side advertises in its extension handshake.
pub const LOCAL_UT_METADATA_ID: u8 = 1;
/// BEP-9 metadata piece size.
pub const METADATA_PIECE_SIZE: usize = 16384;
/// Declared metadata sizes above this are treated as hostile and never
/// allocated.
pub const MAX_METADATA_SIZE: i64 = 2_000_000;
/// Cap on a single length-prefixed message while waiting for extension
/// traffic; nothing legitimate on a metadata-only connection comes close.
const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("shorter than {HANDSHAKE_LEN} bytes")]
    Short,
    #[error("bad protocol string length {0}")]
    BadLength(u8),
    #[error("protocol string mismatch")]
    BadProtocol,
    #[error("info-hash mismatch at byte {0}")]
    InfoHashMismatch(usize),
}

/// The peer's half of a completed handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerHandshake {
    pub reserved: [u8; 8],
    pub peer_id: [u8; 20],
}

impl PeerHandshake {
    /// BEP-10 support: bit 0x10 of reserved byte 5.
    pub fn supports_extensions(&self) -> bool {
        self.reserved[5] & 0x10 != 0
    }
}

/// Decoded BEP-10 extension handshake. -1 marks a missing field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedHandshake {
    pub ut_metadata_id: i64,
    pub metadata_size: i64,
}

/// One `ut_metadata` data message: dict header stripped, raw piece payload.
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataPiece {
    pub piece: i64,
    pub data: Bytes,
}

pub fn generate_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(b"-MG0001-");
    rand::rng().fill(&mut id[8..]);
    id
}

/// Reserved bytes for outgoing handshakes: only the extension-protocol bit.
pub fn extension_reserved() -> [u8; 8] {
    let mut reserved = [0u8; 8];
    reserved[5] |= 0x10;
    reserved
}

pub fn build_handshake(hash: &InfoHash, peer_id: &[u8; 20], reserved: [u8; 8]) -> [u8; 68] {
    let mut out = [0u8; HANDSHAKE_LEN];
    out[0] = PROTOCOL.len() as u8;
    out[1..20].copy_from_slice(PROTOCOL);
    out[20..28].copy_from_slice(&reserved);
    out[28..48].copy_from_slice(hash.as_bytes());
    out[48..68].copy_from_slice(peer_id);
    out
}

/// Validates a peer's handshake against the hash we asked for. Any single
/// differing info-hash byte rejects the connection.
pub fn parse_handshake(buf: &[u8], expected: &InfoHash) -> Result<PeerHandshake, HandshakeError> {
    if buf.len() < HANDSHAKE_LEN {
        return Err(HandshakeError::Short);
    }
    if buf[0] as usize != PROTOCOL.len() {
        return Err(HandshakeError::BadLength(buf[0]));
    }
    if &buf[1..20] != PROTOCOL {
        return Err(HandshakeError::BadProtocol);
    }
    let want = expected.as_bytes();
    for i in 0..20 {
        if buf[28 + i] != want[i] {
            return Err(HandshakeError::InfoHashMismatch(i));
        }
    }
    let mut reserved = [0u8; 8];
    reserved.copy_from_slice(&buf[20..28]);
    let mut peer_id = [0u8; 20];
    peer_id.copy_from_slice(&buf[48..68]);
    Ok(PeerHandshake { reserved, peer_id })
}

/// Wraps a payload in the BEP-10 envelope:
/// `u32 length | 20 | ext id | payload`, length covering everything after
/// the length field itself.
pub fn build_extended(ext_id: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(6 + payload.len());
    buf.put_u32((2 + payload.len()) as u32);
    buf.put_u8(EXTENSION_MESSAGE_ID);
    buf.put_u8(ext_id);
    buf.put_slice(payload);
    buf.freeze()
}

/// Our extension handshake: `{"m":{"ut_metadata":1}}`.
pub fn build_extension_handshake() -> Bytes {
    let mut m = BTreeMap::new();
    m.insert(
        Bytes::from_static(b"ut_metadata"),
        Value::Integer(LOCAL_UT_METADATA_ID as i64),
    );
    let mut root = BTreeMap::new();
    root.insert(Bytes::from_static(b"m"), Value::Dict(m));
    build_extended(EXT_HANDSHAKE_ID, &bencode::encode(&Value::Dict(root)))
}

/// `{"msg_type":0,"piece":n}` addressed to the peer's ut_metadata id.
pub fn build_piece_request(ut_metadata_id: u8, piece: u32) -> Bytes {
    let mut d = BTreeMap::new();
    d.insert(Bytes::from_static(b"msg_type"), Value::Integer(0));
    d.insert(Bytes::from_static(b"piece"), Value::Integer(piece as i64));
    build_extended(ut_metadata_id, &bencode::encode(&Value::Dict(d)))
}

/// Reads one length-prefixed message body (possibly empty for keep-alives).
/// A length claim over [`MAX_FRAME_LEN`] poisons the stream and surfaces as
/// `InvalidData`.
async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{len} byte message"),
        ));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    Ok(body)
}

/// Reads one message and interprets it as the peer's extension handshake.
/// `Ok(None)` means the message was consumed but is not a usable extension
/// handshake; transport failures (including EOF mid-message) are `Err`.
pub async fn read_extended_handshake<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> io::Result<Option<ExtendedHandshake>> {
    let body = read_frame(stream).await?;
    if body.len() <= 2 || body[0] != EXTENSION_MESSAGE_ID || body[1] != EXT_HANDSHAKE_ID {
        return Ok(None);
    }
    let Ok(root) = bencode::decode(&body[2..]) else {
        return Ok(None);
    };
    if root.as_dict().is_none() {
        return Ok(None);
    }
    let ut_metadata_id = root
        .get(b"m")
        .and_then(|m| m.get(b"ut_metadata"))
        .and_then(Value::as_int)
        .unwrap_or(-1);
    let metadata_size = root
        .get(b"metadata_size")
        .and_then(Value::as_int)
        .unwrap_or(-1);
    Ok(Some(ExtendedHandshake {
        ut_metadata_id,
        metadata_size,
    }))
}

/// Reads one message and interprets it as a `ut_metadata` data piece for
/// `ut_metadata_id`. Anything else (other peer-wire traffic, keep-alives,
/// requests, rejects with `msg_type` 2, malformed headers) is consumed and
/// reported as `Ok(None)` so pollers can keep going. The piece payload is
/// everything after the header dict, located with the element scanner.
pub async fn read_metadata_piece<R: AsyncRead + Unpin>(
    stream: &mut R,
    ut_metadata_id: u8,
) -> io::Result<Option<MetadataPiece>> {
    let body = read_frame(stream).await?;
    if body.len() <= 2 || body[0] != EXTENSION_MESSAGE_ID || body[1] != ut_metadata_id {
        return Ok(None);
    }
    let Some(dict_end) = bencode::find_element_end(&body, 2) else {
        return Ok(None);
    };
    let Ok(header) = bencode::decode(&body[2..=dict_end]) else {
        return Ok(None);
    };
    let msg_type = header.get(b"msg_type").and_then(Value::as_int).unwrap_or(-1);
    let piece = header.get(b"piece").and_then(Value::as_int).unwrap_or(-1);
    if msg_type != 1 || piece < 0 {
        return Ok(None);
    }
    Ok(Some(MetadataPiece {
        piece,
        data: Bytes::copy_from_slice(&body[dict_end + 1..]),
    }))
}
