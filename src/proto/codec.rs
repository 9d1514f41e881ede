//! Incremental RESP encoder and decoder.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::proto::error::{Error, Result};
use crate::proto::frame::Frame;

const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Encodes [`Frame`]s into an internal buffer.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: BytesMut,
}

impl Encoder {
    /// Creates an encoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the RESP encoding of `frame` to the buffer.
    pub fn encode(&mut self, frame: &Frame) {
        match frame {
            Frame::SimpleString(s) => self.line(b'+', s),
            Frame::Error(e) => self.line(b'-', e),
            Frame::Integer(n) => self.line(b':', n.to_string().as_bytes()),
            Frame::BulkString(Some(data)) => {
                self.line(b'$', data.len().to_string().as_bytes());
                self.buf.extend_from_slice(data);
                self.buf.extend_from_slice(b"\r\n");
            }
            Frame::BulkString(None) => self.buf.extend_from_slice(b"$-1\r\n"),
            Frame::Array(items) => {
                self.line(b'*', items.len().to_string().as_bytes());
                for item in items {
                    self.encode(item);
                }
            }
            Frame::Null => self.buf.extend_from_slice(b"*-1\r\n"),
        }
    }

    /// Takes everything encoded so far, leaving the encoder reusable.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    fn line(&mut self, prefix: u8, body: &[u8]) {
        self.buf.put_u8(prefix);
        self.buf.extend_from_slice(body);
        self.buf.extend_from_slice(b"\r\n");
    }
}

/// Decodes [`Frame`]s from a stream of bytes.
///
/// Feed data with [`append`](Decoder::append) and call
/// [`decode`](Decoder::decode) until it returns `Ok(None)`. Input is only
/// consumed once a whole frame is available, so partial reads are safe.
#[derive(Debug)]
pub struct Decoder {
    buf: BytesMut,
    max_frame_size: usize,
}

impl Decoder {
    /// Creates a decoder with the default 512 MB frame limit.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates a decoder with a custom frame limit.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_size,
        }
    }

    /// Appends bytes received from the network.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Decodes the next complete frame, or `Ok(None)` if more input is needed.
    pub fn decode(&mut self) -> Result<Option<Frame>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        if self.buf.len() > self.max_frame_size {
            return Err(protocol("buffer exceeds maximum frame size"));
        }
        match self.parse(0)? {
            Some((frame, consumed)) => {
                self.buf.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Parses one frame starting at `pos` without consuming input.
    fn parse(&self, pos: usize) -> Result<Option<(Frame, usize)>> {
        let Some(&kind) = self.buf.get(pos) else {
            return Ok(None);
        };
        let Some(end) = self.find_crlf(pos + 1) else {
            return Ok(None);
        };
        let line = &self.buf[pos + 1..end];
        let next = end + 2;

        match kind {
            b'+' => Ok(Some((Frame::SimpleString(Bytes::copy_from_slice(line)), next))),
            b'-' => Ok(Some((Frame::Error(Bytes::copy_from_slice(line)), next))),
            b':' => Ok(Some((Frame::Integer(parse_int(line)?), next))),
            b'$' => {
                let len = parse_int(line)?;
                if len < 0 {
                    return Ok(Some((Frame::BulkString(None), next)));
                }
                let len = len as usize;
                if len > self.max_frame_size {
                    return Err(protocol("bulk string length exceeds maximum frame size"));
                }
                if self.buf.len() < next + len + 2 {
                    return Ok(None);
                }
                let data = Bytes::copy_from_slice(&self.buf[next..next + len]);
                Ok(Some((Frame::BulkString(Some(data)), next + len + 2)))
            }
            b'*' => {
                let len = parse_int(line)?;
                if len < 0 {
                    return Ok(Some((Frame::Null, next)));
                }
                let len = len as usize;
                if len > self.max_frame_size / 16 {
                    return Err(protocol("array length exceeds reasonable maximum"));
                }
                let mut items = Vec::with_capacity(len);
                let mut cursor = next;
                for _ in 0..len {
                    match self.parse(cursor)? {
                        Some((item, after)) => {
                            items.push(item);
                            cursor = after;
                        }
                        None => return Ok(None),
                    }
                }
                Ok(Some((Frame::Array(items), cursor)))
            }
            other => Err(protocol(format!("unknown frame type: {}", other as char))),
        }
    }

    fn find_crlf(&self, from: usize) -> Option<usize> {
        self.buf
            .get(from..)?
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|i| from + i)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_int(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| protocol("invalid integer in frame header"))
}

fn protocol(message: impl Into<String>) -> Error {
    Error::Protocol {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command() {
        let mut encoder = Encoder::new();
        encoder.encode(&Frame::Array(vec![Frame::bulk("GET"), Frame::bulk("A")]));
        assert_eq!(encoder.take().as_ref(), b"*2\r\n$3\r\nGET\r\n$1\r\nA\r\n");
        assert!(encoder.take().is_empty());
    }

    #[test]
    fn test_encode_scalars() {
        let mut encoder = Encoder::new();
        encoder.encode(&Frame::simple("OK"));
        encoder.encode(&Frame::error("ERR x"));
        encoder.encode(&Frame::Integer(-3));
        encoder.encode(&Frame::BulkString(None));
        assert_eq!(encoder.take().as_ref(), b"+OK\r\n-ERR x\r\n:-3\r\n$-1\r\n");
    }

    #[test]
    fn test_decode_error_reply() {
        let mut decoder = Decoder::new();
        decoder.append(b"-MOVED 6373 127.0.0.1:7001\r\n");
        let frame = decoder.decode().unwrap().unwrap();
        assert_eq!(frame, Frame::error("MOVED 6373 127.0.0.1:7001"));
    }

    #[test]
    fn test_decode_nested_array() {
        let mut decoder = Decoder::new();
        decoder.append(b"*2\r\n:1\r\n*1\r\n$3\r\nfoo\r\n");
        let frame = decoder.decode().unwrap().unwrap();
        assert_eq!(
            frame,
            Frame::Array(vec![
                Frame::Integer(1),
                Frame::Array(vec![Frame::bulk("foo")])
            ])
        );
    }

    #[test]
    fn test_decode_partial_array_keeps_input() {
        let mut decoder = Decoder::new();
        decoder.append(b"*2\r\n$3\r\nfoo\r\n$3\r\nba");
        assert!(decoder.decode().unwrap().is_none());
        decoder.append(b"r\r\n+OK\r\n");
        assert_eq!(
            decoder.decode().unwrap().unwrap(),
            Frame::Array(vec![Frame::bulk("foo"), Frame::bulk("bar")])
        );
        assert_eq!(decoder.decode().unwrap().unwrap(), Frame::simple("OK"));
        assert!(decoder.decode().unwrap().is_none());
    }

    #[test]
    fn test_decode_nulls() {
        let mut decoder = Decoder::new();
        decoder.append(b"$-1\r\n*-1\r\n");
        assert_eq!(decoder.decode().unwrap().unwrap(), Frame::BulkString(None));
        assert_eq!(decoder.decode().unwrap().unwrap(), Frame::Null);
    }

    #[test]
    fn test_decode_bulk_exceeds_limit() {
        let mut decoder = Decoder::with_max_frame_size(10);
        decoder.append(b"$100\r\n");
        assert!(matches!(decoder.decode(), Err(Error::Protocol { .. })));
    }

    #[test]
    fn test_decode_unknown_type() {
        let mut decoder = Decoder::new();
        decoder.append(b"?what\r\n");
        assert!(decoder.decode().is_err());
    }
}
