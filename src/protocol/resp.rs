/// Redis RESP (Redis Serialization Protocol) parsing and generation

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::str;

/// Largest bulk string accepted from a peer (same limit as Redis)
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;
/// Largest multi-bulk element count accepted from a peer
pub const MAX_ARRAY_LEN: usize = 1024 * 1024;
/// Longest inline command line accepted before giving up on framing
pub const MAX_INLINE_LEN: usize = 64 * 1024;
/// Deepest array nesting accepted in a reply
pub const MAX_NESTING: usize = 64;

/// RESP data types
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple String (+OK\r\n)
    SimpleString(String),
    /// Error (-ERR message\r\n)
    Error(String),
    /// Integer (:123\r\n)
    Integer(i64),
    /// Bulk String ($5\r\nhello\r\n)
    BulkString(Option<Bytes>), // None represents NULL
    /// Array (*2\r\n$5\r\nhello\r\n$5\r\nworld\r\n)
    Array(Option<Vec<RespValue>>), // None represents NULL array
}

impl RespValue {
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    pub fn error<S: Into<String>>(message: S) -> Self {
        RespValue::Error(message.into())
    }

    pub fn bulk<B: Into<Bytes>>(data: B) -> Self {
        RespValue::BulkString(Some(data.into()))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }

    /// Bytes of a bulk or simple string, if this value is one
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::BulkString(Some(data)) => Some(data.as_ref()),
            RespValue::SimpleString(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

/// RESP parser for reading Redis protocol messages
pub struct RespParser;

/// RESP encoder for writing Redis protocol messages
pub struct RespEncoder;

/// Parse error types
#[derive(Debug, thiserror::Error)]
pub enum RespParseError {
    #[error("Invalid RESP format: {0}")]
    InvalidFormat(String),
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(#[from] str::Utf8Error),
    #[error("Invalid integer: {0}")]
    InvalidInteger(String),
}

type ParseStep = Result<Option<(RespValue, usize)>, RespParseError>;

impl RespParser {
    /// Parse one RESP value from the front of `buf`
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched when the value is not
    /// complete yet; on success the consumed bytes are removed.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<RespValue>, RespParseError> {
        Self::parse_with_depth(buf, MAX_NESTING)
    }

    fn parse_with_depth(
        buf: &mut BytesMut,
        depth: usize,
    ) -> Result<Option<RespValue>, RespParseError> {
        match Self::parse_at(buf, 0, depth)? {
            Some((value, consumed)) => {
                buf.advance(consumed);
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Parse a client request, accepting inline commands (`PING\r\n`) as well
    /// as multi-bulk arrays
    ///
    /// Requests are flat: an array element that is itself an array is a
    /// protocol error.
    pub fn parse_request(buf: &mut BytesMut) -> Result<Option<RespValue>, RespParseError> {
        match buf.first() {
            None => Ok(None),
            Some(b'*') => Self::parse_with_depth(buf, 1),
            Some(_) => Self::parse_inline(buf),
        }
    }

    /// Parse as many complete requests as the buffer holds
    pub fn parse_requests(buf: &mut BytesMut) -> Result<Vec<RespValue>, RespParseError> {
        let mut requests = Vec::new();
        while let Some(request) = Self::parse_request(buf)? {
            requests.push(request);
        }
        Ok(requests)
    }

    fn parse_at(buf: &[u8], pos: usize, depth: usize) -> ParseStep {
        if pos >= buf.len() {
            return Ok(None);
        }

        match buf[pos] {
            b'+' => Ok(Self::read_line(buf, pos + 1)?.map(|(line, next)| {
                (
                    RespValue::SimpleString(String::from_utf8_lossy(line).into_owned()),
                    next,
                )
            })),
            b'-' => Ok(Self::read_line(buf, pos + 1)?.map(|(line, next)| {
                (
                    RespValue::Error(String::from_utf8_lossy(line).into_owned()),
                    next,
                )
            })),
            b':' => match Self::read_line(buf, pos + 1)? {
                Some((line, next)) => Ok(Some((RespValue::Integer(Self::to_int(line)?), next))),
                None => Ok(None),
            },
            b'$' => Self::parse_bulk_string(buf, pos + 1),
            b'*' if depth == 0 => Err(RespParseError::InvalidFormat(
                "array nested too deeply".to_string(),
            )),
            b'*' => Self::parse_array(buf, pos + 1, depth - 1),
            other => Err(RespParseError::InvalidFormat(format!(
                "Unknown RESP type: {}",
                other as char
            ))),
        }
    }

    fn parse_bulk_string(buf: &[u8], pos: usize) -> ParseStep {
        let (size_line, start) = match Self::read_line(buf, pos)? {
            Some(found) => found,
            None => return Ok(None),
        };
        let size = Self::to_int(size_line)?;

        if size == -1 {
            return Ok(Some((RespValue::BulkString(None), start)));
        }
        if size < 0 || size as usize > MAX_BULK_LEN {
            return Err(RespParseError::InvalidFormat(
                "Invalid bulk string size".to_string(),
            ));
        }

        let end = start + size as usize;
        if buf.len() < end + 2 {
            return Ok(None);
        }
        if &buf[end..end + 2] != b"\r\n" {
            return Err(RespParseError::InvalidFormat(
                "Missing \\r\\n after bulk string".to_string(),
            ));
        }

        let content = Bytes::copy_from_slice(&buf[start..end]);
        Ok(Some((RespValue::BulkString(Some(content)), end + 2)))
    }

    fn parse_array(buf: &[u8], pos: usize, depth: usize) -> ParseStep {
        let (size_line, mut next) = match Self::read_line(buf, pos)? {
            Some(found) => found,
            None => return Ok(None),
        };
        let size = Self::to_int(size_line)?;

        if size == -1 {
            return Ok(Some((RespValue::Array(None), next)));
        }
        if size < 0 || size as usize > MAX_ARRAY_LEN {
            return Err(RespParseError::InvalidFormat(
                "Invalid array size".to_string(),
            ));
        }

        let mut elements = Vec::with_capacity((size as usize).min(64));
        for _ in 0..size {
            match Self::parse_at(buf, next, depth)? {
                Some((element, after)) => {
                    elements.push(element);
                    next = after;
                }
                None => return Ok(None),
            }
        }

        Ok(Some((RespValue::Array(Some(elements)), next)))
    }

    fn parse_inline(buf: &mut BytesMut) -> Result<Option<RespValue>, RespParseError> {
        let (line, consumed) = match Self::read_line(buf, 0).map_err(|_| {
            RespParseError::InvalidFormat("too big inline request".to_string())
        })? {
            Some((line, next)) => (line.to_vec(), next),
            None => return Ok(None),
        };
        buf.advance(consumed);

        let text = str::from_utf8(&line)?;
        let parts: Vec<RespValue> = text
            .split_whitespace()
            .map(|part| RespValue::bulk(Bytes::copy_from_slice(part.as_bytes())))
            .collect();
        Ok(Some(RespValue::Array(Some(parts))))
    }

    /// Find a line ending with \r\n starting at `pos`
    ///
    /// Returns the line content (without terminator) and the offset just past it.
    /// Lines longer than `MAX_INLINE_LEN` are rejected rather than buffered.
    fn read_line(buf: &[u8], pos: usize) -> Result<Option<(&[u8], usize)>, RespParseError> {
        if pos >= buf.len() {
            return Ok(None);
        }
        let window = &buf[pos..buf.len().min(pos + MAX_INLINE_LEN + 2)];
        match window.windows(2).position(|w| w == b"\r\n") {
            Some(offset) => Ok(Some((&buf[pos..pos + offset], pos + offset + 2))),
            None if buf.len() - pos > MAX_INLINE_LEN => Err(RespParseError::InvalidFormat(
                "too big mbulk/bulk header".to_string(),
            )),
            None => Ok(None),
        }
    }

    fn to_int(line: &[u8]) -> Result<i64, RespParseError> {
        btoi::btoi::<i64>(line).map_err(|_| {
            RespParseError::InvalidInteger(String::from_utf8_lossy(line).into_owned())
        })
    }
}

impl RespEncoder {
    /// Encode a RESP value to bytes
    pub fn encode(value: &RespValue) -> Bytes {
        let mut buf = BytesMut::new();
        Self::encode_into(&mut buf, value);
        buf.freeze()
    }

    /// Encode a RESP value into an existing buffer
    pub fn encode_into(buf: &mut BytesMut, value: &RespValue) {
        match value {
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.extend_from_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::Error(s) => {
                buf.put_u8(b'-');
                buf.extend_from_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::Integer(n) => {
                buf.put_u8(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.put_slice(b"\r\n");
            }
            RespValue::BulkString(Some(data)) => {
                buf.put_u8(b'$');
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                buf.extend_from_slice(data);
                buf.put_slice(b"\r\n");
            }
            RespValue::BulkString(None) => {
                buf.extend_from_slice(b"$-1\r\n");
            }
            RespValue::Array(Some(elements)) => {
                buf.put_u8(b'*');
                buf.extend_from_slice(elements.len().to_string().as_bytes());
                buf.put_slice(b"\r\n");
                for element in elements {
                    Self::encode_into(buf, element);
                }
            }
            RespValue::Array(None) => {
                buf.extend_from_slice(b"*-1\r\n");
            }
        }
    }

    /// Create a Redis command from command name and arguments
    pub fn create_command(command: &str, args: &[&[u8]]) -> RespValue {
        let mut elements = Vec::with_capacity(args.len() + 1);
        elements.push(RespValue::bulk(Bytes::copy_from_slice(command.as_bytes())));
        for arg in args {
            elements.push(RespValue::bulk(Bytes::copy_from_slice(arg)));
        }
        RespValue::Array(Some(elements))
    }
}
