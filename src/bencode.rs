//! Bencode: the element scanner used to split wire messages, plus a small
//! value decoder/encoder for everything that needs structured access.

use std::collections::BTreeMap;

use bytes::Bytes;
use thiserror::Error;

/// Nesting cap for the decoder; real torrent structures stay far below it.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unexpected byte {byte:#04x} at offset {offset}")]
    UnexpectedByte { byte: u8, offset: usize },
    #[error("invalid integer")]
    InvalidInteger,
    #[error("invalid string length")]
    InvalidLength,
    #[error("nesting deeper than {MAX_DEPTH}")]
    TooDeep,
    #[error("trailing bytes after value")]
    TrailingData,
}

/// Returns the offset of the final byte of the element starting at `offset`:
/// the matching `e` of a dict/list/integer, or the last data byte of a
/// string (the `:` itself for an empty string). `None` means the buffer is
/// truncated or not bencode at all; callers decide whether that means "wait
/// for more bytes" or "corrupt, abort".
pub fn find_element_end(buf: &[u8], offset: usize) -> Option<usize> {
    let mut i = offset;
    let mut depth = 0usize;
    loop {
        match *buf.get(i)? {
            b'd' | b'l' => {
                depth += 1;
                i += 1;
            }
            b'e' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
                i += 1;
            }
            b'i' => {
                let mut j = i + 1;
                while *buf.get(j)? != b'e' {
                    j += 1;
                }
                if depth == 0 {
                    return Some(j);
                }
                i = j + 1;
            }
            c @ b'0'..=b'9' => {
                let mut len = (c - b'0') as usize;
                let mut j = i + 1;
                loop {
                    match *buf.get(j)? {
                        d @ b'0'..=b'9' => {
                            len = len.checked_mul(10)?.checked_add((d - b'0') as usize)?;
                            j += 1;
                        }
                        b':' => break,
                        _ => return None,
                    }
                }
                let last = j.checked_add(len)?;
                if last >= buf.len() {
                    return None;
                }
                if depth == 0 {
                    return Some(last);
                }
                i = last + 1;
            }
            _ => return None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Bytes(Bytes),
    List(Vec<Value>),
    Dict(BTreeMap<Bytes, Value>),
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Bytes, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Dict lookup; `None` when `self` is not a dict or the key is absent.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }
}

/// Decodes a complete bencoded value. Trailing bytes are an error; use
/// [`find_element_end`] first when the buffer carries more than one element.
pub fn decode(buf: &[u8]) -> Result<Value, BencodeError> {
    let mut dec = Decoder { buf, pos: 0 };
    let value = dec.value(0)?;
    if dec.pos != buf.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Decoder<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::UnexpectedEof)
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::TooDeep);
        }
        match self.peek()? {
            b'i' => self.integer(),
            b'0'..=b'9' => Ok(Value::Bytes(self.string()?)),
            b'l' => {
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.value(depth + 1)?);
                }
                self.pos += 1;
                Ok(Value::List(items))
            }
            b'd' => {
                self.pos += 1;
                let mut map = BTreeMap::new();
                while self.peek()? != b'e' {
                    let key = self.string()?;
                    let val = self.value(depth + 1)?;
                    map.insert(key, val);
                }
                self.pos += 1;
                Ok(Value::Dict(map))
            }
            byte => Err(BencodeError::UnexpectedByte {
                byte,
                offset: self.pos,
            }),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1;
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let digits = &self.buf[start..self.pos];
        self.pos += 1;
        let s = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidInteger)?;
        // bencode forbids empty, "-0" and leading zeros
        let body = s.strip_prefix('-').unwrap_or(s);
        if body.is_empty()
            || (body.len() > 1 && body.starts_with('0'))
            || (s.starts_with('-') && body == "0")
        {
            return Err(BencodeError::InvalidInteger);
        }
        s.parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| BencodeError::InvalidInteger)
    }

    fn string(&mut self) -> Result<Bytes, BencodeError> {
        let start = self.pos;
        while self.peek()? != b':' {
            self.pos += 1;
        }
        let len_digits = &self.buf[start..self.pos];
        if len_digits.is_empty() || !len_digits.iter().all(u8::is_ascii_digit) {
            return Err(BencodeError::InvalidLength);
        }
        let len: usize = std::str::from_utf8(len_digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::InvalidLength)?;
        self.pos += 1;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&e| e <= self.buf.len())
            .ok_or(BencodeError::UnexpectedEof)?;
        let bytes = Bytes::copy_from_slice(&self.buf[self.pos..end]);
        self.pos = end;
        Ok(bytes)
    }
}

/// Encodes a value; dictionary keys come out in sorted (canonical) order
/// because the map is ordered.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Integer(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(map) => {
            out.push(b'd');
            for (key, val) in map {
                out.extend_from_slice(key.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(key);
                encode_into(val, out);
            }
            out.push(b'e');
        }
    }
}
