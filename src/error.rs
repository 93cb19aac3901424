use thiserror::Error;

#[derive(Error, Debug)]
pub enum TftpError {
    /// A datagram that does not parse as the packet the protocol calls for
    /// at this point, or a request that violates the TFTP grammar.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The remote end sent a wire ERROR packet; the transfer is over.
    #[error("peer aborted: error {code}: {message}")]
    Peer { code: u16, message: String },

    /// The packet in flight was retransmitted `0..=retries` times without an
    /// answer from the peer.
    #[error("no response after {retries} retransmissions")]
    RetryExhausted { retries: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TftpError>;
