//! RESP (Redis Serialization Protocol) codec
//!
//! Commands are always sent as an array of bulk strings. Replies are decoded
//! into the recursive [`Reply`] type and projected with fallible accessors.

use bytes::{BufMut, Bytes, BytesMut};
use std::str;

use crate::error::{Result, StoreError};

const MAX_BULK_STRING_SIZE: i64 = 512 * 1024 * 1024; // 512MB max
const MAX_ARRAY_SIZE: i64 = 1024 * 1024; // 1M elements max
const MAX_ARRAY_DEPTH: usize = 128; // Max nesting depth

/// A single decoded reply
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Simple string: +OK\r\n
    Status(String),
    /// Error: -ERR message\r\n
    Error(String),
    /// Integer: :42\r\n
    Integer(i64),
    /// Bulk string: $6\r\nfoobar\r\n or $-1\r\n (null)
    Bulk(Option<Bytes>),
    /// Array: *2\r\n:1\r\n:2\r\n (a null array decodes as empty)
    Array(Vec<Reply>),
}

impl Reply {
    /// Borrow the elements of an array reply
    pub fn as_array(&self) -> Result<&[Reply]> {
        match self {
            Reply::Array(items) => Ok(items),
            other => Err(StoreError::protocol(format!(
                "expected array reply, got {}",
                other.kind()
            ))),
        }
    }

    /// Read the reply as a non-negative integer
    ///
    /// Integer replies and bulk/status replies holding decimal digits are
    /// accepted.
    pub fn as_u64(&self) -> Result<u64> {
        match self {
            Reply::Integer(n) => u64::try_from(*n)
                .map_err(|_| StoreError::protocol(format!("negative integer reply: {n}"))),
            Reply::Bulk(Some(_)) | Reply::Status(_) => {
                let s = self.as_str()?;
                s.parse()
                    .map_err(|_| StoreError::protocol(format!("non-numeric reply: {s:?}")))
            }
            other => Err(StoreError::protocol(format!(
                "expected integer reply, got {}",
                other.kind()
            ))),
        }
    }

    /// Read a status or bulk reply as UTF-8 text
    pub fn as_str(&self) -> Result<&str> {
        match self {
            Reply::Status(s) => Ok(s),
            Reply::Bulk(Some(b)) => {
                str::from_utf8(b).map_err(|e| StoreError::protocol(format!("invalid UTF-8: {e}")))
            }
            other => Err(StoreError::protocol(format!(
                "expected string reply, got {}",
                other.kind()
            ))),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Reply::Status(_) => "status",
            Reply::Error(_) => "error",
            Reply::Integer(_) => "integer",
            Reply::Bulk(Some(_)) => "bulk string",
            Reply::Bulk(None) => "null",
            Reply::Array(_) => "array",
        }
    }

    /// Serialize this reply in wire form
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Reply::Status(s) => put_line(buf, b'+', s.as_bytes()),
            Reply::Error(s) => put_line(buf, b'-', s.as_bytes()),
            Reply::Integer(n) => put_line(buf, b':', n.to_string().as_bytes()),
            Reply::Bulk(Some(b)) => put_bulk(buf, b),
            Reply::Bulk(None) => buf.put_slice(b"$-1\r\n"),
            Reply::Array(items) => {
                put_line(buf, b'*', items.len().to_string().as_bytes());
                for item in items {
                    item.encode(buf);
                }
            }
        }
    }
}

fn put_line(buf: &mut BytesMut, marker: u8, body: &[u8]) {
    buf.reserve(body.len() + 3);
    buf.put_u8(marker);
    buf.put_slice(body);
    buf.put_slice(b"\r\n");
}

fn put_bulk(buf: &mut BytesMut, data: &[u8]) {
    put_line(buf, b'$', data.len().to_string().as_bytes());
    buf.reserve(data.len() + 2);
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
}

/// Append a command to `buf` as an array of bulk strings
pub fn encode_command<A: AsRef<[u8]>>(args: &[A], buf: &mut BytesMut) -> Result<()> {
    if args.is_empty() {
        return Err(StoreError::protocol("cannot encode an empty command"));
    }

    put_line(buf, b'*', args.len().to_string().as_bytes());
    for arg in args {
        put_bulk(buf, arg.as_ref());
    }
    Ok(())
}

/// Encode a command into a fresh buffer
pub fn encode<A: AsRef<[u8]>>(args: &[A]) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    encode_command(args, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode exactly one reply from a complete buffer
///
/// Fails if the buffer ends before the reply does.
pub fn decode(data: &[u8]) -> Result<Reply> {
    match ReplyParser::new().parse(data)? {
        Some((reply, _)) => Ok(reply),
        None => Err(StoreError::protocol("truncated reply")),
    }
}

/// Incremental reply parser
pub struct ReplyParser {
    depth: usize,
}

impl ReplyParser {
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Parse a reply from the front of `data`
    ///
    /// Returns `Some((reply, bytes_consumed))` if a complete reply is found,
    /// `None` if more data is needed.
    pub fn parse(&mut self, data: &[u8]) -> Result<Option<(Reply, usize)>> {
        if data.is_empty() {
            return Ok(None);
        }

        match data[0] {
            b'+' => Ok(read_line(data).map(|(line, n)| (Reply::Status(lossy(line)), n))),
            b'-' => Ok(read_line(data).map(|(line, n)| (Reply::Error(lossy(line)), n))),
            b':' => self.parse_integer(data),
            b'$' => self.parse_bulk(data),
            b'*' => self.parse_array(data),
            marker => Err(StoreError::protocol(format!(
                "invalid reply type marker: {:?}",
                marker as char
            ))),
        }
    }

    fn parse_integer(&self, data: &[u8]) -> Result<Option<(Reply, usize)>> {
        match read_line(data) {
            Some((line, consumed)) => Ok(Some((Reply::Integer(parse_i64(line)?), consumed))),
            None => Ok(None),
        }
    }

    fn parse_bulk(&self, data: &[u8]) -> Result<Option<(Reply, usize)>> {
        let (length_line, consumed) = match read_line(data) {
            Some(v) => v,
            None => return Ok(None),
        };

        let length = parse_i64(length_line)?;
        if length == -1 {
            return Ok(Some((Reply::Bulk(None), consumed)));
        }

        if !(0..=MAX_BULK_STRING_SIZE).contains(&length) {
            return Err(StoreError::protocol(format!(
                "invalid bulk string length: {length}"
            )));
        }

        let length = length as usize;
        if data.len() < consumed + length + 2 {
            return Ok(None);
        }

        if &data[consumed + length..consumed + length + 2] != b"\r\n" {
            return Err(StoreError::protocol("bulk string missing CRLF terminator"));
        }

        let payload = Bytes::copy_from_slice(&data[consumed..consumed + length]);
        Ok(Some((Reply::Bulk(Some(payload)), consumed + length + 2)))
    }

    fn parse_array(&mut self, data: &[u8]) -> Result<Option<(Reply, usize)>> {
        if self.depth >= MAX_ARRAY_DEPTH {
            return Err(StoreError::protocol("maximum array nesting depth exceeded"));
        }

        let (count_line, mut consumed) = match read_line(data) {
            Some(v) => v,
            None => return Ok(None),
        };

        let count = parse_i64(count_line)?;
        if count == -1 {
            return Ok(Some((Reply::Array(Vec::new()), consumed)));
        }

        if !(0..=MAX_ARRAY_SIZE).contains(&count) {
            return Err(StoreError::protocol(format!("invalid array size: {count}")));
        }

        let count = count as usize;
        let mut elements = Vec::with_capacity(count.min(64));

        self.depth += 1;
        for _ in 0..count {
            let parsed = self.parse(&data[consumed..]);
            match parsed {
                Ok(Some((value, n))) => {
                    elements.push(value);
                    consumed += n;
                }
                Ok(None) => {
                    self.depth -= 1;
                    return Ok(None);
                }
                Err(e) => {
                    self.depth -= 1;
                    return Err(e);
                }
            }
        }
        self.depth -= 1;

        Ok(Some((Reply::Array(elements), consumed)))
    }
}

impl Default for ReplyParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Split off a CRLF-terminated line, dropping the type marker
///
/// Returns `(line_body, total_bytes_consumed)` or `None` if incomplete.
fn read_line(data: &[u8]) -> Option<(&[u8], usize)> {
    data.windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| (&data[1..i], i + 2))
}

fn parse_i64(line: &[u8]) -> Result<i64> {
    str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            StoreError::protocol(format!(
                "invalid integer: {:?}",
                String::from_utf8_lossy(line)
            ))
        })
}

fn lossy(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}
