//! Thin non-blocking UDP facade.
//!
//! Endpoints are always non-blocking; would-block is reported distinctly
//! (`Ok(None)` from the `try_*` forms) and the awaiting forms park the task
//! on the runtime reactor until the socket reports readiness again. The
//! readiness wakeups are level-triggered in effect: a would-block result
//! simply re-enters the same await, so a spurious wakeup never advances a
//! transfer.

use std::io;
use std::net::{IpAddr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::config::SocketTuning;
use crate::error::{Result, TftpError};

pub(crate) struct UdpEndpoint {
    socket: UdpSocket,
}

impl UdpEndpoint {
    /// Bind a listener endpoint with the configured socket tuning applied.
    /// Must be called from within the runtime.
    pub fn bind(addr: SocketAddr, tuning: &SocketTuning) -> Result<Self> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        if tuning.reuse_address {
            socket.set_reuse_address(true)?;
        }
        // Buffer sizing is an optimization; the kernel may clamp or refuse.
        if let Err(e) = socket.set_recv_buffer_size(tuning.recv_buffer_kb * 1024) {
            warn!(requested_kb = tuning.recv_buffer_kb, error = %e, "failed to set SO_RCVBUF");
        }
        if let Err(e) = socket.set_send_buffer_size(tuning.send_buffer_kb * 1024) {
            warn!(requested_kb = tuning.send_buffer_kb, error = %e, "failed to set SO_SNDBUF");
        }

        socket
            .bind(&addr.into())
            .map_err(|e| TftpError::Protocol(format!("failed to bind {}: {}", addr, e)))?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket)?;
        debug!(addr = %addr, "listener endpoint bound");
        Ok(Self { socket })
    }

    /// Bind a data endpoint on an OS-assigned ephemeral port: the fresh TID
    /// of one transfer (RFC 1350 §4). Bound on the same local IP the request
    /// arrived on so replies traverse the same interface.
    pub async fn bind_ephemeral(local_ip: IpAddr) -> Result<Self> {
        let socket = UdpSocket::bind((local_ip, 0)).await?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Non-blocking send; `Ok(None)` when the socket would block.
    pub fn try_send_to(&self, buf: &[u8], peer: SocketAddr) -> Result<Option<usize>> {
        match self.socket.try_send_to(buf, peer) {
            Ok(sent) => Ok(Some(sent)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Non-blocking receive; `Ok(None)` when no datagram is queued.
    pub fn try_recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        match self.socket.try_recv_from(buf) {
            Ok(received) => Ok(Some(received)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Send one whole datagram, suspending on write interest as needed.
    pub async fn send_to(&self, buf: &[u8], peer: SocketAddr) -> Result<()> {
        loop {
            self.socket.writable().await?;
            match self.try_send_to(buf, peer)? {
                Some(sent) if sent == buf.len() => return Ok(()),
                Some(sent) => {
                    return Err(TftpError::Protocol(format!(
                        "short datagram send: {} of {} bytes",
                        sent,
                        buf.len()
                    )));
                }
                None => continue,
            }
        }
    }

    /// Receive one datagram, suspending on read interest as needed.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        loop {
            self.socket.readable().await?;
            match self.try_recv_from(buf)? {
                Some(received) => return Ok(received),
                None => continue,
            }
        }
    }
}
