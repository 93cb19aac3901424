//! Shared harness: an in-memory backend plus a raw-UDP TFTP client, so the
//! tests exercise the real wire protocol against a live server.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use kestrel_tftp::config::ServerConfig;
use kestrel_tftp::packet::{Packet, Request, RequestKind, TransferMode};
use kestrel_tftp::{Backend, MAX_PACKET_SIZE, OpenError, Pull, ReadStream, Server, Sink, Source};

/// What a test file is backed by.
pub enum Fixture {
    /// Fixed content, size reported to the tsize negotiation.
    Bytes(Vec<u8>),
    /// Fixed content, but the source answers "not ready yet" this many
    /// times before every chunk.
    Deferred { data: Vec<u8>, stalls: usize },
    /// Never-ending stream of full blocks; size unknown.
    Endless,
}

pub struct TestBackend {
    pub fixtures: HashMap<String, Fixture>,
    pub writable: bool,
    /// Every push a sink received, with its final-frame flag.
    pub received: Arc<Mutex<Vec<(Vec<u8>, bool)>>>,
}

impl TestBackend {
    pub fn new() -> Self {
        Self {
            fixtures: HashMap::new(),
            writable: false,
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_file(mut self, name: &str, data: &[u8]) -> Self {
        self.fixtures
            .insert(name.to_string(), Fixture::Bytes(data.to_vec()));
        self
    }

    pub fn with_fixture(mut self, name: &str, fixture: Fixture) -> Self {
        self.fixtures.insert(name.to_string(), fixture);
        self
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }
}

impl Backend for TestBackend {
    fn open_read(&mut self, filename: &str) -> Result<ReadStream, OpenError> {
        match self.fixtures.get(filename) {
            Some(Fixture::Bytes(data)) => Ok(ReadStream {
                size: Some(data.len() as u64),
                source: Box::new(MemorySource::new(data.clone())),
            }),
            Some(Fixture::Deferred { data, stalls }) => Ok(ReadStream {
                size: Some(data.len() as u64),
                source: Box::new(DeferredSource {
                    inner: MemorySource::new(data.clone()),
                    stalls: *stalls,
                    remaining: *stalls,
                }),
            }),
            Some(Fixture::Endless) => Ok(ReadStream {
                size: None,
                source: Box::new(EndlessSource),
            }),
            None => Err(OpenError::not_found()),
        }
    }

    fn open_write(&mut self, _filename: &str) -> Result<Box<dyn Sink>, OpenError> {
        if !self.writable {
            return Err(OpenError::access_violation("writes are disabled"));
        }
        Ok(Box::new(CollectingSink {
            received: Arc::clone(&self.received),
        }))
    }
}

pub struct MemorySource {
    data: Vec<u8>,
    pos: usize,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }
}

impl Source for MemorySource {
    fn pull(&mut self, max_len: usize) -> anyhow::Result<Pull> {
        if self.pos == self.data.len() {
            return Ok(Pull::Eof);
        }
        let end = (self.pos + max_len).min(self.data.len());
        let chunk = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(Pull::Chunk(chunk))
    }
}

struct DeferredSource {
    inner: MemorySource,
    stalls: usize,
    remaining: usize,
}

impl Source for DeferredSource {
    fn pull(&mut self, max_len: usize) -> anyhow::Result<Pull> {
        if self.remaining > 0 {
            self.remaining -= 1;
            return Ok(Pull::Pending);
        }
        self.remaining = self.stalls;
        self.inner.pull(max_len)
    }
}

struct EndlessSource;

impl Source for EndlessSource {
    fn pull(&mut self, max_len: usize) -> anyhow::Result<Pull> {
        Ok(Pull::Chunk(vec![0x5A; max_len]))
    }
}

struct CollectingSink {
    received: Arc<Mutex<Vec<(Vec<u8>, bool)>>>,
}

impl Sink for CollectingSink {
    fn push(&mut self, data: &[u8], last: bool) -> anyhow::Result<()> {
        self.received.lock().unwrap().push((data.to_vec(), last));
        Ok(())
    }
}

/// A config suitable for tests: loopback, OS-assigned port, quick retries.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.bind_addrs = vec!["127.0.0.1".parse().unwrap()];
    config.port = 0;
    config.retransmit_timeout_ms = 400;
    config.logging.audit_enabled = false;
    config
}

/// Run the server on its own thread (with its own current-thread runtime)
/// and return the listener address.
pub fn start_server(backend: TestBackend, config: ServerConfig) -> SocketAddr {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async move {
            let server = Server::bind(config).unwrap();
            tx.send(server.local_addrs().unwrap()[0]).unwrap();
            let _ = server.serve(backend).await;
        });
    });
    rx.recv().unwrap()
}

/// Blocking UDP client speaking raw TFTP, one socket per client TID.
pub struct TestClient {
    pub socket: UdpSocket,
    pub server: SocketAddr,
}

impl TestClient {
    pub fn new(server: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        Self { socket, server }
    }

    pub fn send_request(&self, kind: RequestKind, filename: &str, options: &[(&str, &str)]) {
        let request = Request {
            kind,
            filename: filename.to_string(),
            mode: TransferMode::Octet,
            options: options
                .iter()
                .map(|(n, v)| (n.to_string(), v.to_string()))
                .collect(),
        };
        self.socket
            .send_to(&request.to_bytes().unwrap(), self.server)
            .unwrap();
    }

    pub fn send_to(&self, bytes: &[u8], to: SocketAddr) {
        self.socket.send_to(bytes, to).unwrap();
    }

    /// Next datagram, parsed, with its source address (the server TID).
    pub fn recv_packet(&self) -> (Packet, SocketAddr) {
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let (len, from) = self.socket.recv_from(&mut buf).unwrap();
        (Packet::parse(&buf[..len], kestrel_tftp::MAX_BLOCK_SIZE).unwrap(), from)
    }

    /// Next raw datagram; `None` if nothing arrives before the timeout.
    pub fn try_recv(&self, timeout: Duration) -> Option<(Vec<u8>, SocketAddr)> {
        self.socket.set_read_timeout(Some(timeout)).unwrap();
        let mut buf = [0u8; MAX_PACKET_SIZE];
        let result = match self.socket.recv_from(&mut buf) {
            Ok((len, from)) => Some((buf[..len].to_vec(), from)),
            Err(_) => None,
        };
        self.socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        result
    }
}

/// Convenience asserts for the common frame kinds.
pub fn expect_data(packet: Packet) -> (u16, Vec<u8>) {
    match packet {
        Packet::Data { block, payload } => (block, payload),
        other => panic!("expected DATA, got {:?}", other),
    }
}

pub fn expect_ack(packet: Packet) -> u16 {
    match packet {
        Packet::Ack { block } => block,
        other => panic!("expected ACK, got {:?}", other),
    }
}

pub fn expect_error(packet: Packet) -> (u16, String) {
    match packet {
        Packet::Error { code, message } => (code, message),
        other => panic!("expected ERROR, got {:?}", other),
    }
}

pub fn expect_oack(packet: Packet) -> Vec<(String, String)> {
    match packet {
        Packet::Oack { options } => options,
        other => panic!("expected OACK, got {:?}", other),
    }
}
