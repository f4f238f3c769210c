/*!
 * RESP Protocol Implementation
 *
 * Incremental decoding and deterministic encoding of the Redis Serialization
 * Protocol. The decoder always works on an accumulating buffer: it tries to
 * read exactly one frame from offset 0 and reports how many bytes that frame
 * used, or that more bytes are needed, without ever consuming a partial frame.
 */

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, Read};

/// Largest bulk payload accepted from a client (512 MiB)
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Largest element count accepted for an array header
pub const MAX_ARRAY_LEN: i64 = 1024 * 1024;

/// Arrays nested deeper than this are rejected
pub const MAX_DEPTH: usize = 32;

/// Longest simple/error/integer line scanned before giving up on a CRLF
pub const MAX_LINE_LEN: usize = 64 * 1024;

/// A single RESP element, used both as decoder output and encoder input
///
/// `Bulk(None)` and `Array(None)` are the protocol's null bulk string and
/// null array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// `+<text>\r\n`
    Simple(String),
    /// `-<text>\r\n`
    Error(String),
    /// `:<n>\r\n`
    Integer(i64),
    /// `$<len>\r\n<bytes>\r\n`, binary safe
    Bulk(Option<Bytes>),
    /// `*<count>\r\n` followed by each element
    Array(Option<Vec<Value>>),
}

impl Value {
    pub fn ok() -> Self {
        Value::Simple("OK".into())
    }

    pub fn simple(s: impl Into<String>) -> Self {
        Value::Simple(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        Value::Error(s.into())
    }

    pub fn bulk(b: impl Into<Bytes>) -> Self {
        Value::Bulk(Some(b.into()))
    }

    pub fn null() -> Self {
        Value::Bulk(None)
    }

    /// Encode into a freshly allocated buffer
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = BytesMut::new();
        write_value(self, &mut out);
        out.to_vec()
    }
}

/// A client request: argv[0] is the command name, the rest are its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    argv: Vec<Bytes>,
}

impl Command {
    /// Build a command from its argument vector, `None` if it is empty
    pub fn new(argv: Vec<Bytes>) -> Option<Self> {
        if argv.is_empty() {
            None
        } else {
            Some(Self { argv })
        }
    }

    /// Convenience constructor copying each argument
    pub fn from_args<I, T>(args: I) -> Option<Self>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        Self::new(
            args.into_iter()
                .map(|a| Bytes::copy_from_slice(a.as_ref()))
                .collect(),
        )
    }

    #[inline]
    pub fn name(&self) -> &[u8] {
        &self.argv[0]
    }

    /// Arguments after the command name
    #[inline]
    pub fn args(&self) -> &[Bytes] {
        &self.argv[1..]
    }

    #[inline]
    pub fn argv(&self) -> &[Bytes] {
        &self.argv
    }

    /// Convert a decoded frame into a command
    ///
    /// Empty and null arrays carry no command and yield `Ok(None)`. Anything
    /// that is not an array of non-null bulk strings is rejected.
    pub fn from_frame(frame: Value) -> Result<Option<Self>, ProtocolError> {
        let items = match frame {
            Value::Array(Some(items)) => items,
            Value::Array(None) => return Ok(None),
            _ => return Err(ProtocolError::NotACommand),
        };
        let argv = items
            .into_iter()
            .map(|item| match item {
                Value::Bulk(Some(b)) => Ok(b),
                _ => Err(ProtocolError::NotACommand),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(argv))
    }
}

/// Unwrap an `Ok(Some(..))` or return `Ok(None)` from the enclosing parser
macro_rules! ready {
    ($e:expr) => {
        match $e? {
            Some(x) => x,
            None => return Ok(None),
        }
    };
}

/// Parse a single RESP frame from the start of `data`
///
/// # Returns
/// * `Ok(Some((consumed_bytes, value)))` - one complete frame
/// * `Ok(None)` - incomplete frame, retry from the same offset with more bytes
/// * `Err(...)` - the stream is malformed
pub fn parse_one(data: &[u8]) -> Result<Option<(usize, Value)>, ProtocolError> {
    parse_value(data, 0)
}

/// Parse the next client frame from the start of `data` as a command
///
/// Empty and null arrays carry no command: they are reported as
/// `Ok(Some((consumed, None)))` so the caller still drops their bytes.
pub fn parse_command(data: &[u8]) -> Result<Option<(usize, Option<Command>)>, ProtocolError> {
    let (used, frame) = ready!(parse_one(data));
    Ok(Some((used, Command::from_frame(frame)?)))
}

/// Blocking read of one complete frame, for clients of the server
///
/// Bytes past the frame stay in `buf` for the next call, so replies that
/// arrive split or batched are returned one at a time.
pub fn read_frame<R: Read>(r: &mut R, buf: &mut BytesMut) -> io::Result<Value> {
    let mut chunk = [0u8; 512];
    loop {
        if let Some((n, v)) =
            parse_one(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?
        {
            buf.advance(n);
            return Ok(v);
        }
        match r.read(&mut chunk) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

fn parse_value(data: &[u8], depth: usize) -> Result<Option<(usize, Value)>, ProtocolError> {
    let Some(&tag) = data.first() else {
        return Ok(None);
    };
    let body = &data[1..];

    let (used, value) = match tag {
        b'+' => {
            let (n, line) = ready!(read_line(body));
            (n, Value::Simple(utf8(line)?))
        }
        b'-' => {
            let (n, line) = ready!(read_line(body));
            (n, Value::Error(utf8(line)?))
        }
        b':' => {
            let (n, i) = ready!(read_decimal_line(body));
            (n, Value::Integer(i))
        }
        b'$' => {
            let (n, len) = ready!(read_decimal_line(body));
            match len {
                -1 => (n, Value::Bulk(None)),
                l if !(0..=MAX_BULK_LEN).contains(&l) => {
                    return Err(ProtocolError::InvalidBulkLength(l))
                }
                l => {
                    // The payload length comes from the header only; payloads
                    // may contain CRLF themselves.
                    let end = n + l as usize;
                    if body.len() < end + 2 {
                        return Ok(None);
                    }
                    if &body[end..end + 2] != b"\r\n" {
                        return Err(ProtocolError::MissingTerminator);
                    }
                    let payload = Bytes::copy_from_slice(&body[n..end]);
                    (end + 2, Value::Bulk(Some(payload)))
                }
            }
        }
        b'*' => {
            let (mut cursor, len) = ready!(read_decimal_line(body));
            match len {
                -1 => (cursor, Value::Array(None)),
                l if !(0..=MAX_ARRAY_LEN).contains(&l) => {
                    return Err(ProtocolError::InvalidArrayLength(l))
                }
                l => {
                    if depth >= MAX_DEPTH {
                        return Err(ProtocolError::TooDeep(MAX_DEPTH));
                    }
                    // Don't trust the header for the allocation size
                    let mut items = Vec::with_capacity((l as usize).min(64));
                    for _ in 0..l {
                        let (n, item) = ready!(parse_value(&body[cursor..], depth + 1));
                        cursor += n;
                        items.push(item);
                    }
                    (cursor, Value::Array(Some(items)))
                }
            }
        }
        other => return Err(ProtocolError::InvalidType(other)),
    };

    Ok(Some((1 + used, value)))
}

/// Read bytes up to CRLF, returning the line without its terminator
fn read_line(s: &[u8]) -> Result<Option<(usize, &[u8])>, ProtocolError> {
    match s.iter().position(|&c| c == b'\r') {
        Some(i) if i + 1 == s.len() => Ok(None),
        Some(i) if s[i + 1] == b'\n' => Ok(Some((i + 2, &s[..i]))),
        Some(_) => Err(ProtocolError::MissingTerminator),
        None if s.len() > MAX_LINE_LEN => Err(ProtocolError::LineTooLong(MAX_LINE_LEN)),
        None => Ok(None),
    }
}

/// Read a signed decimal number followed by CRLF
///
/// Used for integers as well as bulk and array length headers.
fn read_decimal_line(s: &[u8]) -> Result<Option<(usize, i64)>, ProtocolError> {
    let neg = s.first() == Some(&b'-');
    let start = neg as usize;
    let mut i = start;
    // Accumulate towards the sign so i64::MIN stays representable
    let mut num: i64 = 0;

    while i < s.len() && s[i].is_ascii_digit() {
        let digit = (s[i] - b'0') as i64;
        num = num
            .checked_mul(10)
            .and_then(|n| if neg { n.checked_sub(digit) } else { n.checked_add(digit) })
            .ok_or(ProtocolError::InvalidInteger)?;
        i += 1;
    }

    if i == s.len() {
        return Ok(None);
    }
    if i == start || s[i] != b'\r' {
        return Err(ProtocolError::InvalidInteger);
    }
    if i + 1 == s.len() {
        return Ok(None);
    }
    if s[i + 1] != b'\n' {
        return Err(ProtocolError::MissingTerminator);
    }

    Ok(Some((i + 2, num)))
}

fn utf8(line: &[u8]) -> Result<String, ProtocolError> {
    std::str::from_utf8(line)
        .map(str::to_owned)
        .map_err(|_| ProtocolError::InvalidUtf8)
}

//
// RESP Encoders
//
// Replies are appended to the connection's output buffer. `Simple` and
// `Error` text must not contain CR or LF.
//

/// Append the encoding of `v` (recursively for arrays) to `out`
pub fn write_value(v: &Value, out: &mut BytesMut) {
    match v {
        Value::Simple(s) => write_simple(s, out),
        Value::Error(s) => write_error(s, out),
        Value::Integer(i) => write_integer(*i, out),
        Value::Bulk(Some(b)) => write_bulk(b, out),
        Value::Bulk(None) => write_null(out),
        Value::Array(Some(items)) => {
            write_array_len(items.len(), out);
            for item in items {
                write_value(item, out);
            }
        }
        Value::Array(None) => out.extend_from_slice(b"*-1\r\n"),
    }
}

/// Encode a value into a new byte vector
pub fn encode(v: &Value) -> Vec<u8> {
    v.to_bytes()
}

/// `+<s>\r\n`
#[inline]
pub fn write_simple(s: &str, out: &mut BytesMut) {
    out.reserve(s.len() + 3);
    out.put_u8(b'+');
    out.extend_from_slice(s.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// `-<s>\r\n`
#[inline]
pub fn write_error(s: &str, out: &mut BytesMut) {
    out.reserve(s.len() + 3);
    out.put_u8(b'-');
    out.extend_from_slice(s.as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// `:<i>\r\n`
#[inline]
pub fn write_integer(i: i64, out: &mut BytesMut) {
    out.put_u8(b':');
    out.extend_from_slice(i.to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
}

/// `$<len>\r\n<b>\r\n`
#[inline]
pub fn write_bulk(b: &[u8], out: &mut BytesMut) {
    let len_str = b.len().to_string();
    out.reserve(1 + len_str.len() + 2 + b.len() + 2);
    out.put_u8(b'$');
    out.extend_from_slice(len_str.as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(b);
    out.extend_from_slice(b"\r\n");
}

/// `$-1\r\n`
#[inline]
pub fn write_null(out: &mut BytesMut) {
    out.extend_from_slice(b"$-1\r\n");
}

/// `*<n>\r\n`, the elements follow separately
#[inline]
pub fn write_array_len(n: usize, out: &mut BytesMut) {
    out.put_u8(b'*');
    out.extend_from_slice(n.to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
}
