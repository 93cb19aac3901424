//! The seam between the protocol engine and the embedding host.
//!
//! The server never touches a filesystem: every read request is satisfied by
//! pulling blocks from a caller-supplied [`Source`] and every write request
//! pushes blocks into a caller-supplied [`Sink`]. A [`Backend`] is the
//! factory pair invoked once per incoming request.
//!
//! All of this runs on the dispatcher's single thread, so none of the traits
//! require `Send`. A source or sink gets no explicit shutdown call; it is
//! dropped when its transfer ends, whether that is success, a protocol
//! abort, or retry exhaustion.

use crate::packet::ErrorCode;

/// One pull from a [`Source`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pull {
    /// Up to `max_len` bytes of payload. A chunk strictly shorter than the
    /// negotiated block size (including an empty one) is the terminal frame
    /// of the transfer, standard TFTP short-frame semantics.
    Chunk(Vec<u8>),
    /// No data available yet; the transfer yields and asks again. This is
    /// cooperative back-pressure, not an error.
    Pending,
    /// The stream is exhausted. The transfer closes with an empty terminal
    /// frame if the previous chunk filled its block.
    Eof,
}

/// Pull side of a read transfer. Invoked with the negotiated block size;
/// each call produces at most one DATA frame's payload.
pub trait Source {
    fn pull(&mut self, max_len: usize) -> anyhow::Result<Pull>;
}

/// Push side of a write transfer. `last` marks the final frame (payload
/// shorter than the negotiated block size).
pub trait Sink {
    fn push(&mut self, data: &[u8], last: bool) -> anyhow::Result<()>;
}

/// What a read factory hands back: the block source plus the total size, if
/// known, used to answer the RFC 2349 `tsize` option.
pub struct ReadStream {
    pub source: Box<dyn Source>,
    pub size: Option<u64>,
}

/// Factory failure, mapped to the wire ERROR sent to the requester.
#[derive(Debug, Clone)]
pub struct OpenError {
    pub code: ErrorCode,
    pub message: String,
}

impl OpenError {
    pub fn not_found() -> Self {
        Self {
            code: ErrorCode::FileNotFound,
            message: ErrorCode::FileNotFound.as_str().to_string(),
        }
    }

    pub fn access_violation(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::AccessViolation,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for OpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "error {}: {}", self.code as u16, self.message)
    }
}

impl std::error::Error for OpenError {}

/// The user-supplied factory pair, invoked once per accepted request.
pub trait Backend {
    /// Open the named object for reading. Called for every RRQ whose
    /// request parses and whose mode is `octet`.
    fn open_read(&mut self, filename: &str) -> Result<ReadStream, OpenError>;

    /// Open the named object for writing. Called for every such WRQ.
    fn open_write(&mut self, filename: &str) -> Result<Box<dyn Sink>, OpenError>;
}
