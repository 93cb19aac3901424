//! Event-driven TFTP server (RFC 1350) with option negotiation (RFC 2347,
//! RFC 2348, RFC 2349) for memory-constrained network appliances.
//!
//! Payload bytes are never materialized in server memory: the embedding host
//! supplies a [`Backend`] whose factories hand out a pull-style [`Source`]
//! per read request and a push-style [`Sink`] per write request, so a
//! transfer can be satisfied from a filesystem, an HTTP origin, or
//! programmatic generation with a bounded working set.
//!
//! All transfers are multiplexed cooperatively on a single thread. Each
//! transfer owns its own ephemeral UDP socket (its TID, RFC 1350 §4) and is
//! driven as a task on a current-thread runtime; suspension points are
//! socket readiness and retransmit deadlines. There are no locks on the
//! data path and no shared mutable state beyond the dispatcher's own
//! bookkeeping.
//!
//! The crate is not a file server: it has no notion of a filesystem,
//! permissions, or content types. The `kestrel-tftpd` binary shows one
//! possible backend (a read-mostly directory tree); the library only speaks
//! the protocol.

pub mod audit;
mod buffer_pool;
pub mod config;
mod endpoint;
pub mod error;
pub mod options;
pub mod packet;
pub mod server;
pub mod stream;
mod transfer;

pub use config::ServerConfig;
pub use error::{Result, TftpError};
pub use server::{Server, listen};
pub use stream::{Backend, OpenError, Pull, ReadStream, Sink, Source};

/// RFC 1350 well-known TFTP port.
pub const DEFAULT_PORT: u16 = 69;

/// RFC 1350 standard DATA payload size, used when the client negotiates
/// nothing else.
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// RFC 2348 block size bounds.
pub const MIN_BLOCK_SIZE: usize = 8;
pub const MAX_BLOCK_SIZE: usize = 65464;

/// Largest datagram the server ever has to receive: max block size plus the
/// 4-byte DATA header.
pub const MAX_PACKET_SIZE: usize = MAX_BLOCK_SIZE + 4;

/// Default per-packet retransmit interval (RFC 1350 leaves this to the
/// implementation). Overridable via config and per transfer via the RFC 2349
/// `timeout` option.
pub const DEFAULT_RETRANSMIT_TIMEOUT_MS: u64 = 5_000;

/// Retransmissions of one packet before the transfer is abandoned.
pub const DEFAULT_MAX_RETRIES: u32 = 10;
