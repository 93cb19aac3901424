//! Per-transfer state machines.
//!
//! One `Transfer` owns one ephemeral endpoint (the server-side TID) and one
//! peer address (the client TID) for its whole life. Progress is strict
//! lock-step: at most one DATA frame is in flight, and block N+1 is not
//! emitted until ACK(N) arrives from the correct TID. Suspension points are
//! socket readiness, the retransmit deadline, and source deferral; at each
//! one the task yields back to the dispatcher's single thread.

use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::audit::AuditLogger;
use crate::buffer_pool::BufferPool;
use crate::endpoint::UdpEndpoint;
use crate::error::{Result, TftpError};
use crate::options::TransferOptions;
use crate::packet::{ErrorCode, Packet, encode_ack, encode_data, encode_error, encode_oack};
use crate::stream::{Pull, Sink, Source};

/// How long a transfer sleeps before asking a deferring source again.
const PULL_RETRY_TICK: Duration = Duration::from_millis(5);

pub(crate) struct Transfer {
    pub endpoint: UdpEndpoint,
    pub peer: SocketAddr,
    pub options: TransferOptions,
    /// Accepted option subset to echo; empty means no OACK handshake.
    pub oack: Vec<(String, String)>,
    pub max_retries: u32,
    pub pool: Rc<BufferPool>,
    pub audit: bool,
}

/// Bytes moved and blocks exchanged, for the completion record.
pub(crate) struct TransferStats {
    pub bytes: u64,
    pub blocks: u16,
}

impl Transfer {
    /// Serve a read request: optional OACK handshake, then the lock-step
    /// DATA/ACK loop pulling payloads from the source.
    pub async fn serve_read(mut self, mut source: Box<dyn Source>) -> Result<TransferStats> {
        let mut buf = self.pool.acquire();
        let result = self.read_loop(source.as_mut(), &mut buf).await;
        self.pool.release(buf);
        result
    }

    /// Serve a write request: OACK or ACK(0) opener, then receive DATA
    /// frames in order and push them into the sink.
    pub async fn serve_write(mut self, mut sink: Box<dyn Sink>) -> Result<TransferStats> {
        let mut buf = self.pool.acquire();
        let result = self.write_loop(sink.as_mut(), &mut buf).await;
        self.pool.release(buf);
        result
    }

    async fn read_loop(
        &mut self,
        source: &mut dyn Source,
        buf: &mut BytesMut,
    ) -> Result<TransferStats> {
        // RFC 2347: no DATA until the client acknowledges the OACK with
        // ACK(0).
        if !self.oack.is_empty() {
            let oack = encode_oack(&self.oack)?;
            self.send_and_await_ack(&oack, 0, "OACK timeout", buf)
                .await?;
        }

        let block_size = self.options.block_size;
        let mut block: u16 = 1;
        let mut bytes: u64 = 0;

        loop {
            let payload = loop {
                match source.pull(block_size) {
                    Ok(Pull::Chunk(data)) if data.len() <= block_size => break data,
                    Ok(Pull::Chunk(data)) => {
                        let _ = self
                            .endpoint
                            .send_to(&encode_error("An unknown error occurred"), self.peer)
                            .await;
                        return Err(TftpError::Protocol(format!(
                            "source produced {} bytes for a {} byte block",
                            data.len(),
                            block_size
                        )));
                    }
                    // Deferral: back-pressure, not an error. Yield and ask
                    // again on the next tick.
                    Ok(Pull::Pending) => tokio::time::sleep(PULL_RETRY_TICK).await,
                    // Exhausted on a block boundary: an empty frame tells
                    // the client the stream is over.
                    Ok(Pull::Eof) => break Vec::new(),
                    Err(e) => {
                        let _ = self
                            .endpoint
                            .send_to(&encode_error("An unknown error occurred"), self.peer)
                            .await;
                        return Err(TftpError::Other(e));
                    }
                }
            };

            let last = payload.len() < block_size;
            let frame = encode_data(block, &payload, block_size)?;
            self.send_and_await_ack(&frame, block, "Ack timeout", buf)
                .await?;
            bytes += payload.len() as u64;

            if last {
                return Ok(TransferStats { bytes, blocks: block });
            }
            if block == u16::MAX {
                // 16-bit block space exhausted and the stream is not done.
                let _ = self
                    .endpoint
                    .send_to(&encode_error("File too big."), self.peer)
                    .await;
                return Err(TftpError::Protocol(
                    "transfer exceeds 65535 blocks".to_string(),
                ));
            }
            block += 1;
        }
    }

    async fn write_loop(
        &mut self,
        sink: &mut dyn Sink,
        buf: &mut BytesMut,
    ) -> Result<TransferStats> {
        let block_size = self.options.block_size;

        // The opener doubles as the retransmit unit until the first DATA
        // arrives; afterwards the latest ACK takes that role.
        let mut reply = if self.oack.is_empty() {
            encode_ack(0)
        } else {
            encode_oack(&self.oack)?
        };
        self.endpoint.send_to(&reply, self.peer).await?;

        let mut expected: u16 = 1;
        let mut bytes: u64 = 0;
        let mut retries: u32 = 0;
        let mut deadline = Instant::now() + self.options.timeout;

        loop {
            match self.recv_from_peer(buf, deadline).await? {
                None => {
                    retries += 1;
                    if retries > self.max_retries {
                        let _ = self
                            .endpoint
                            .send_to(&encode_error("Data timeout"), self.peer)
                            .await;
                        return Err(TftpError::RetryExhausted {
                            retries: self.max_retries,
                        });
                    }
                    debug!(retry = retries, block = expected, "retransmitting reply");
                    self.endpoint.send_to(&reply, self.peer).await?;
                    deadline = Instant::now() + self.options.timeout;
                }
                Some(Packet::Data { block, payload }) if block == expected => {
                    let last = payload.len() < block_size;
                    if let Err(e) = sink.push(&payload, last) {
                        let _ = self
                            .endpoint
                            .send_to(&encode_error("An unknown error occurred"), self.peer)
                            .await;
                        return Err(TftpError::Other(e));
                    }
                    bytes += payload.len() as u64;
                    reply = encode_ack(block);
                    self.endpoint.send_to(&reply, self.peer).await?;
                    retries = 0;
                    deadline = Instant::now() + self.options.timeout;

                    if last {
                        if let Some(declared) = self.options.transfer_size
                            && declared > 0
                            && declared != bytes
                        {
                            warn!(declared, received = bytes, "tsize mismatch on write");
                        }
                        return Ok(TransferStats {
                            bytes,
                            blocks: block,
                        });
                    }
                    if expected == u16::MAX {
                        let _ = self
                            .endpoint
                            .send_to(&encode_error("File too big."), self.peer)
                            .await;
                        return Err(TftpError::Protocol(
                            "transfer exceeds 65535 blocks".to_string(),
                        ));
                    }
                    expected += 1;
                }
                Some(Packet::Data { block, .. }) if block < expected => {
                    // Retransmitted DATA: the client missed our ACK. Re-ACK
                    // without pushing the payload twice.
                    debug!(block, expected, "re-acknowledging duplicate DATA");
                    self.endpoint.send_to(&encode_ack(block), self.peer).await?;
                    deadline = Instant::now() + self.options.timeout;
                }
                Some(Packet::Data { block, .. }) => {
                    // A block from the future cannot happen in lock-step.
                    let _ = self
                        .endpoint
                        .send_to(&encode_error(ErrorCode::IllegalOperation), self.peer)
                        .await;
                    return Err(TftpError::Protocol(format!(
                        "DATA block {} ahead of expected {}",
                        block, expected
                    )));
                }
                Some(Packet::Error { code, message }) => {
                    return Err(TftpError::Peer { code, message });
                }
                Some(other) => {
                    debug!(?other, "ignoring unexpected frame while awaiting DATA");
                }
            }
        }
    }

    /// Emit `frame` and wait for ACK of `want_block` from the peer TID,
    /// retransmitting on deadline expiry. On retry exhaustion the peer gets
    /// a wire ERROR carrying `timeout_message` and the transfer fails.
    async fn send_and_await_ack(
        &self,
        frame: &[u8],
        want_block: u16,
        timeout_message: &str,
        buf: &mut BytesMut,
    ) -> Result<()> {
        let mut retries: u32 = 0;
        loop {
            self.endpoint.send_to(frame, self.peer).await?;
            let deadline = Instant::now() + self.options.timeout;

            loop {
                match self.recv_from_peer(buf, deadline).await? {
                    // Deadline passed: leave the receive loop to retransmit.
                    None => break,
                    Some(Packet::Ack { block }) if block == want_block => return Ok(()),
                    Some(Packet::Ack { block }) => {
                        debug!(block, want_block, "ignoring ACK for a different block");
                    }
                    Some(Packet::Error { code, message }) => {
                        return Err(TftpError::Peer { code, message });
                    }
                    Some(other) => {
                        debug!(?other, "ignoring unexpected frame while awaiting ACK");
                    }
                }
            }

            retries += 1;
            if retries > self.max_retries {
                let _ = self
                    .endpoint
                    .send_to(&encode_error(timeout_message), self.peer)
                    .await;
                return Err(TftpError::RetryExhausted {
                    retries: self.max_retries,
                });
            }
            debug!(retry = retries, want_block, "retransmitting");
        }
    }

    /// Receive the next parseable frame from the legitimate peer, or `None`
    /// when the deadline passes first.
    ///
    /// Datagrams from any other address are misrouted (RFC 1350 §4): the
    /// offender gets ERROR(5) and the transfer's own state, including its
    /// running deadline, is untouched. Unparseable datagrams from the peer
    /// are protocol-benign and ignored.
    async fn recv_from_peer(&self, buf: &mut BytesMut, deadline: Instant) -> Result<Option<Packet>> {
        loop {
            let received = match tokio::time::timeout_at(deadline, self.endpoint.recv_from(buf)).await
            {
                Err(_) => return Ok(None),
                Ok(Err(e)) => return Err(e),
                Ok(Ok(received)) => received,
            };
            let (len, from) = received;

            if from != self.peer {
                warn!(offender = %from, peer = %self.peer, "datagram from foreign TID");
                if self.audit {
                    AuditLogger::unknown_tid(self.peer, from);
                }
                // Best effort: a misrouted sender is not owed reliability.
                let _ = self
                    .endpoint
                    .try_send_to(&encode_error(ErrorCode::UnknownTransferId), from);
                continue;
            }

            match Packet::parse(&buf[..len], self.options.block_size) {
                Ok(packet) => return Ok(Some(packet)),
                Err(e) => debug!(error = %e, "ignoring unparseable datagram from peer"),
            }
        }
    }
}
