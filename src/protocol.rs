//! Wire format for the prime service.
//!
//! - Request: one inbound chunk holding a little-endian unsigned integer of
//!   1 to 8 bytes.
//! - A chunk is whatever a single socket read returns. There is no framing,
//!   so a request must arrive in one read: an 8-byte request split across
//!   two reads is decoded as two separate requests, each answered on its own
//!   (e.g. `17` then `0` for the zero tail). Clients should write one request
//!   at a time and wait for its answer before sending the next.
//! - Response: `prime\n` or `composite\n`.
//!
//! The same two words are the values stored in the cache under
//! `primecache:<n>`.

use bytes::Bytes;
use std::str::FromStr;

/// Namespace prefix for cache keys
pub const CACHE_KEY_PREFIX: &str = "primecache:";

/// Widest integer a single request may carry
pub const MAX_REQUEST_BYTES: usize = 8;

/// Answer to a primality request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Prime,
    Composite,
}

impl Answer {
    pub fn from_is_prime(is_prime: bool) -> Self {
        if is_prime {
            Answer::Prime
        } else {
            Answer::Composite
        }
    }

    /// Sentinel string used both on the wire and in the cache
    pub fn as_str(&self) -> &'static str {
        match self {
            Answer::Prime => "prime",
            Answer::Composite => "composite",
        }
    }

    /// Response line written back to the client
    pub fn response_line(&self) -> Bytes {
        match self {
            Answer::Prime => Bytes::from_static(b"prime\n"),
            Answer::Composite => Bytes::from_static(b"composite\n"),
        }
    }
}

impl std::fmt::Display for Answer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cached value that is neither sentinel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownAnswer(pub String);

impl std::fmt::Display for UnknownAnswer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Unknown answer: {:?}", self.0)
    }
}

impl std::error::Error for UnknownAnswer {}

impl FromStr for Answer {
    type Err = UnknownAnswer;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prime" => Ok(Answer::Prime),
            "composite" => Ok(Answer::Composite),
            other => Err(UnknownAnswer(other.to_string())),
        }
    }
}

/// Request decoding errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Chunk carried no bytes
    Empty,
    /// Chunk is wider than a u64
    TooLong(usize),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Empty => write!(f, "Empty request"),
            DecodeError::TooLong(len) => write!(
                f,
                "Request too long: {} bytes (max {})",
                len, MAX_REQUEST_BYTES
            ),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decode one request chunk into an integer.
///
/// Bytes are read least significant first, so a 1-byte chunk `[17]` and an
/// 8-byte chunk `17u64.to_le_bytes()` decode to the same value.
pub fn decode(chunk: &[u8]) -> Result<u64, DecodeError> {
    if chunk.is_empty() {
        return Err(DecodeError::Empty);
    }
    if chunk.len() > MAX_REQUEST_BYTES {
        return Err(DecodeError::TooLong(chunk.len()));
    }

    let mut raw = [0u8; MAX_REQUEST_BYTES];
    raw[..chunk.len()].copy_from_slice(chunk);
    Ok(u64::from_le_bytes(raw))
}

/// Encode an integer the way clients send it
pub fn encode(n: u64) -> [u8; MAX_REQUEST_BYTES] {
    n.to_le_bytes()
}

/// Cache key for an integer
pub fn cache_key(n: u64) -> String {
    format!("{}{}", CACHE_KEY_PREFIX, n)
}
