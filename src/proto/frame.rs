//! RESP frame type.

use bytes::Bytes;

/// A RESP2 frame.
///
/// Commands travel as arrays of bulk strings; replies can be any variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Simple string (`+OK`).
    SimpleString(Bytes),
    /// Error reply (`-ERR ...`).
    Error(Bytes),
    /// Integer (`:1000`).
    Integer(i64),
    /// Bulk string (`$6\r\nfoobar`), `None` for the null bulk string.
    BulkString(Option<Bytes>),
    /// Array (`*2\r\n...`).
    Array(Vec<Frame>),
    /// Null array (`*-1`).
    Null,
}

impl Frame {
    /// Builds a simple string frame.
    pub fn simple(s: impl Into<Bytes>) -> Self {
        Frame::SimpleString(s.into())
    }

    /// Builds an error frame.
    pub fn error(s: impl Into<Bytes>) -> Self {
        Frame::Error(s.into())
    }

    /// Builds a non-null bulk string frame.
    pub fn bulk(s: impl Into<Bytes>) -> Self {
        Frame::BulkString(Some(s.into()))
    }

    /// Returns the error text if this is an error reply.
    pub fn as_error(&self) -> Option<&[u8]> {
        match self {
            Frame::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Returns the payload of a simple or bulk string.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Frame::SimpleString(s) | Frame::BulkString(Some(s)) => Some(s),
            _ => None,
        }
    }

    /// Returns the value of an integer frame.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Frame::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// True for `Null` and the null bulk string.
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null | Frame::BulkString(None))
    }
}
