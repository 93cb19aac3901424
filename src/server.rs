//! Listener and dispatcher.
//!
//! The dispatcher owns the well-known port(s) and every live transfer. It
//! runs on one thread: listener accept loops and per-transfer machines are
//! all local tasks on a [`LocalSet`], interleaving at their suspension
//! points. A transfer failure never takes the dispatcher down; the task
//! logs, the handle count drops, and the loop keeps accepting.

use std::cell::{Cell, RefCell};
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;

use tokio::task::LocalSet;
use tracing::{debug, info, warn};

use crate::audit::AuditLogger;
use crate::buffer_pool::BufferPool;
use crate::config::ServerConfig;
use crate::endpoint::UdpEndpoint;
use crate::error::{Result, TftpError};
use crate::options::{TransferOptions, negotiate};
use crate::packet::{ErrorCode, Request, RequestKind, TransferMode, encode_error, encode_error_parts};
use crate::stream::Backend;
use crate::transfer::Transfer;

pub struct Server {
    listeners: Vec<Rc<UdpEndpoint>>,
    config: ServerConfig,
}

/// Dispatcher-wide state: one buffer pool, one live-transfer count, one
/// config. Single-threaded, so plain `Cell`/`Rc` suffice.
struct Shared {
    pool: Rc<BufferPool>,
    active: Cell<usize>,
    config: ServerConfig,
}

/// A reserved place in the live-transfer count. Reservation happens before
/// the accept path first suspends, so two listener tasks can never pass the
/// cap check against the same stale count; the slot is released when the
/// guard drops, whether the transfer ran or the accept bailed early.
struct TransferSlot {
    shared: Rc<Shared>,
}

impl TransferSlot {
    fn reserve(shared: &Rc<Shared>) -> Option<Self> {
        if shared.active.get() >= shared.config.max_transfers {
            return None;
        }
        shared.active.set(shared.active.get() + 1);
        Some(Self {
            shared: Rc::clone(shared),
        })
    }
}

impl Drop for TransferSlot {
    fn drop(&mut self) {
        self.shared.active.set(self.shared.active.get() - 1);
    }
}

impl Server {
    /// Bind a listener endpoint on every configured address. Must be called
    /// from within the runtime.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        if config.bind_addrs.is_empty() {
            return Err(TftpError::Protocol(
                "no bind addresses configured".to_string(),
            ));
        }
        let mut listeners = Vec::with_capacity(config.bind_addrs.len());
        for addr in &config.bind_addrs {
            let endpoint = UdpEndpoint::bind(SocketAddr::new(*addr, config.port), &config.socket)?;
            listeners.push(Rc::new(endpoint));
        }
        Ok(Self { listeners, config })
    }

    /// Addresses actually bound; useful when the configured port is 0.
    pub fn local_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.listeners.iter().map(|l| l.local_addr()).collect()
    }

    /// Run the dispatcher loop. Does not return under normal operation;
    /// an error means a listener endpoint itself failed.
    ///
    /// Transfers are scheduled as local tasks, so the whole server, backend
    /// callbacks included, stays on the calling thread.
    pub async fn serve<B: Backend + 'static>(self, backend: B) -> Result<()> {
        let backend = Rc::new(RefCell::new(backend));
        let shared = Rc::new(Shared {
            pool: Rc::new(BufferPool::new()),
            active: Cell::new(0),
            config: self.config,
        });

        if shared.config.logging.audit_enabled {
            AuditLogger::server_started(&shared.config.bind_addrs, shared.config.port);
        }

        let local = LocalSet::new();
        let mut handles = Vec::with_capacity(self.listeners.len());
        for listener in self.listeners {
            handles.push(local.spawn_local(accept_loop(
                listener,
                Rc::clone(&backend),
                Rc::clone(&shared),
            )));
        }

        local
            .run_until(async move {
                for handle in handles {
                    handle
                        .await
                        .map_err(|e| TftpError::Protocol(format!("listener task failed: {}", e)))??;
                }
                Ok(())
            })
            .await
    }
}

/// Bind `port` on each address and serve with default settings, forever.
pub async fn listen<B: Backend + 'static>(
    backend: B,
    bind_addrs: Vec<IpAddr>,
    port: u16,
) -> Result<()> {
    let config = ServerConfig {
        bind_addrs,
        port,
        ..ServerConfig::default()
    };
    Server::bind(config)?.serve(backend).await
}

async fn accept_loop<B: Backend + 'static>(
    listener: Rc<UdpEndpoint>,
    backend: Rc<RefCell<B>>,
    shared: Rc<Shared>,
) -> Result<()> {
    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, "listening for requests");

    loop {
        let mut buf = shared.pool.acquire();
        match listener.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                accept(&listener, &buf[..len], peer, local_addr.ip(), &backend, &shared).await;
                shared.pool.release(buf);
            }
            Err(e) => {
                shared.pool.release(buf);
                return Err(e);
            }
        }
    }
}

/// Handle one datagram on the well-known port: parse, consult the backend,
/// and either refuse with a wire ERROR or hand the transfer to a fresh
/// machine on a fresh TID.
async fn accept<B: Backend + 'static>(
    listener: &Rc<UdpEndpoint>,
    datagram: &[u8],
    peer: SocketAddr,
    local_ip: IpAddr,
    backend: &Rc<RefCell<B>>,
    shared: &Rc<Shared>,
) {
    let audit = shared.config.logging.audit_enabled;

    let request = match Request::parse(datagram) {
        Ok(request) => request,
        Err(e) => {
            warn!(peer = %peer, error = %e, "rejecting malformed request");
            if audit {
                AuditLogger::protocol_violation(peer, &e.to_string());
            }
            let _ = listener
                .send_to(&encode_error(ErrorCode::IllegalOperation), peer)
                .await;
            return;
        }
    };

    // Only octet transfers are honored; netascii and mail are not served.
    if request.mode != TransferMode::Octet {
        warn!(peer = %peer, mode = request.mode.as_str(), "rejecting unsupported mode");
        if audit {
            AuditLogger::request_denied(peer, &request.filename, "unsupported transfer mode");
        }
        let _ = listener
            .send_to(&encode_error(ErrorCode::IllegalOperation), peer)
            .await;
        return;
    }

    let slot = match TransferSlot::reserve(shared) {
        Some(slot) => slot,
        None => {
            warn!(peer = %peer, active = shared.active.get(), "refusing request, transfer cap reached");
            if audit {
                AuditLogger::request_denied(peer, &request.filename, "too many concurrent transfers");
            }
            let _ = listener
                .send_to(&encode_error("too many concurrent transfers"), peer)
                .await;
            return;
        }
    };

    match request.kind {
        RequestKind::Read => {
            accept_read(listener, request, peer, local_ip, backend, shared, slot).await
        }
        RequestKind::Write => {
            accept_write(listener, request, peer, local_ip, backend, shared, slot).await
        }
    }
}

async fn accept_read<B: Backend + 'static>(
    listener: &Rc<UdpEndpoint>,
    request: Request,
    peer: SocketAddr,
    local_ip: IpAddr,
    backend: &Rc<RefCell<B>>,
    shared: &Rc<Shared>,
    slot: TransferSlot,
) {
    let audit = shared.config.logging.audit_enabled;
    if audit {
        AuditLogger::read_request(peer, &request.filename, &request.options);
    }

    // Bind the result first so the backend borrow never spans an await.
    let opened = backend.borrow_mut().open_read(&request.filename);
    let stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            debug!(peer = %peer, filename = %request.filename, error = %e, "read refused by backend");
            if audit {
                AuditLogger::request_denied(peer, &request.filename, &e.message);
            }
            let _ = listener
                .send_to(&encode_error_parts(e.code as u16, &e.message), peer)
                .await;
            return;
        }
    };

    let defaults = TransferOptions::defaults(shared.config.retransmit_timeout());
    let (options, oack) = negotiate(&request.options, RequestKind::Read, stream.size, defaults);

    let endpoint = match UdpEndpoint::bind_ephemeral(local_ip).await {
        Ok(endpoint) => endpoint,
        Err(e) => {
            warn!(peer = %peer, error = %e, "failed to allocate transfer endpoint");
            let _ = listener
                .send_to(&encode_error("transfer setup failed"), peer)
                .await;
            return;
        }
    };

    info!(
        peer = %peer,
        filename = %request.filename,
        block_size = options.block_size,
        size = stream.size,
        "starting read transfer"
    );
    if audit {
        AuditLogger::transfer_started(peer, &request.filename, "read", options.block_size, stream.size);
    }

    let transfer = Transfer {
        endpoint,
        peer,
        options,
        oack,
        max_retries: shared.config.max_retries,
        pool: Rc::clone(&shared.pool),
        audit,
    };

    let filename = request.filename;
    tokio::task::spawn_local(async move {
        // Holds the reserved transfer slot until the machine finishes.
        let _slot = slot;
        let started = std::time::Instant::now();
        match transfer.serve_read(stream.source).await {
            Ok(stats) => {
                info!(
                    peer = %peer,
                    filename = %filename,
                    bytes = stats.bytes,
                    blocks = stats.blocks,
                    "read transfer complete"
                );
                if audit {
                    AuditLogger::transfer_completed(
                        peer,
                        &filename,
                        stats.bytes,
                        stats.blocks,
                        started.elapsed().as_millis() as u64,
                    );
                }
            }
            Err(e) => {
                warn!(peer = %peer, filename = %filename, error = %e, "read transfer failed");
                if audit {
                    AuditLogger::transfer_failed(peer, &filename, &e.to_string());
                }
            }
        }
    });
}

async fn accept_write<B: Backend + 'static>(
    listener: &Rc<UdpEndpoint>,
    request: Request,
    peer: SocketAddr,
    local_ip: IpAddr,
    backend: &Rc<RefCell<B>>,
    shared: &Rc<Shared>,
    slot: TransferSlot,
) {
    let audit = shared.config.logging.audit_enabled;
    if audit {
        AuditLogger::write_request(peer, &request.filename, &request.options);
    }

    let opened = backend.borrow_mut().open_write(&request.filename);
    let sink = match opened {
        Ok(sink) => sink,
        Err(e) => {
            debug!(peer = %peer, filename = %request.filename, error = %e, "write refused by backend");
            if audit {
                AuditLogger::request_denied(peer, &request.filename, &e.message);
            }
            let _ = listener
                .send_to(&encode_error_parts(e.code as u16, &e.message), peer)
                .await;
            return;
        }
    };

    let defaults = TransferOptions::defaults(shared.config.retransmit_timeout());
    let (options, oack) = negotiate(&request.options, RequestKind::Write, None, defaults);

    let endpoint = match UdpEndpoint::bind_ephemeral(local_ip).await {
        Ok(endpoint) => endpoint,
        Err(e) => {
            warn!(peer = %peer, error = %e, "failed to allocate transfer endpoint");
            let _ = listener
                .send_to(&encode_error("transfer setup failed"), peer)
                .await;
            return;
        }
    };

    info!(
        peer = %peer,
        filename = %request.filename,
        block_size = options.block_size,
        "starting write transfer"
    );
    if audit {
        AuditLogger::transfer_started(peer, &request.filename, "write", options.block_size, None);
    }

    let transfer = Transfer {
        endpoint,
        peer,
        options,
        oack,
        max_retries: shared.config.max_retries,
        pool: Rc::clone(&shared.pool),
        audit,
    };

    let filename = request.filename;
    tokio::task::spawn_local(async move {
        // Holds the reserved transfer slot until the machine finishes.
        let _slot = slot;
        let started = std::time::Instant::now();
        match transfer.serve_write(sink).await {
            Ok(stats) => {
                info!(
                    peer = %peer,
                    filename = %filename,
                    bytes = stats.bytes,
                    blocks = stats.blocks,
                    "write transfer complete"
                );
                if audit {
                    AuditLogger::transfer_completed(
                        peer,
                        &filename,
                        stats.bytes,
                        stats.blocks,
                        started.elapsed().as_millis() as u64,
                    );
                }
            }
            Err(e) => {
                warn!(peer = %peer, filename = %filename, error = %e, "write transfer failed");
                if audit {
                    AuditLogger::transfer_failed(peer, &filename, &e.to_string());
                }
            }
        }
    });
}
