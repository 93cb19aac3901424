//! Structured audit records for the request/transfer lifecycle.
//!
//! Events serialize to JSON and ride the normal `tracing` pipeline, so a
//! JSON-formatted subscriber produces records a log aggregator can ingest
//! directly. Emission is gated by `logging.audit_enabled`.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tracing::{Level, event};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    ServerStarted {
        #[serde(flatten)]
        common: CommonFields,
        bind_addrs: Vec<String>,
        port: u16,
    },

    ReadRequest {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        options: serde_json::Value,
    },

    WriteRequest {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        options: serde_json::Value,
    },

    /// A request that parsed but was refused: backend denial, unsupported
    /// mode, or the concurrent-transfer cap.
    RequestDenied {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        reason: String,
    },

    TransferStarted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        direction: String,
        block_size: usize,
        size: Option<u64>,
    },

    TransferCompleted {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        bytes_transferred: u64,
        blocks: u16,
        duration_ms: u64,
    },

    TransferFailed {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        filename: String,
        error: String,
    },

    /// A datagram arrived on a transfer endpoint from an address that is not
    /// the transfer's peer TID (RFC 1350 §4).
    UnknownTid {
        #[serde(flatten)]
        common: CommonFields,
        transfer_peer: String,
        offender: String,
    },

    /// A datagram that does not parse as any TFTP frame.
    ProtocolViolation {
        #[serde(flatten)]
        common: CommonFields,
        client_addr: String,
        violation: String,
    },
}

/// Fields every audit record carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonFields {
    /// ISO 8601 timestamp.
    pub timestamp: String,
    pub hostname: String,
    pub service: String,
    /// info, warn or error.
    pub severity: String,
}

impl CommonFields {
    fn new(severity: &str) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            service: "kestrel-tftp".to_string(),
            severity: severity.to_string(),
        }
    }
}

impl AuditEvent {
    pub fn log(&self) {
        let severity = self.common().severity.clone();
        let json = serde_json::to_string(self)
            .unwrap_or_else(|_| format!("{{\"error\": \"unserializable audit event: {:?}\"}}", self));
        match severity.as_str() {
            "error" => event!(Level::ERROR, audit_event = %json),
            "warn" => event!(Level::WARN, audit_event = %json),
            _ => event!(Level::INFO, audit_event = %json),
        }
    }

    fn common(&self) -> &CommonFields {
        match self {
            AuditEvent::ServerStarted { common, .. }
            | AuditEvent::ReadRequest { common, .. }
            | AuditEvent::WriteRequest { common, .. }
            | AuditEvent::RequestDenied { common, .. }
            | AuditEvent::TransferStarted { common, .. }
            | AuditEvent::TransferCompleted { common, .. }
            | AuditEvent::TransferFailed { common, .. }
            | AuditEvent::UnknownTid { common, .. }
            | AuditEvent::ProtocolViolation { common, .. } => common,
        }
    }
}

fn options_json(options: &[(String, String)]) -> serde_json::Value {
    serde_json::Value::Object(
        options
            .iter()
            .map(|(n, v)| (n.clone(), serde_json::Value::String(v.clone())))
            .collect(),
    )
}

pub struct AuditLogger;

impl AuditLogger {
    pub fn server_started(bind_addrs: &[std::net::IpAddr], port: u16) {
        AuditEvent::ServerStarted {
            common: CommonFields::new("info"),
            bind_addrs: bind_addrs.iter().map(|a| a.to_string()).collect(),
            port,
        }
        .log();
    }

    pub fn read_request(client_addr: SocketAddr, filename: &str, options: &[(String, String)]) {
        AuditEvent::ReadRequest {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            options: options_json(options),
        }
        .log();
    }

    pub fn write_request(client_addr: SocketAddr, filename: &str, options: &[(String, String)]) {
        AuditEvent::WriteRequest {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            options: options_json(options),
        }
        .log();
    }

    pub fn request_denied(client_addr: SocketAddr, filename: &str, reason: &str) {
        AuditEvent::RequestDenied {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            reason: reason.to_string(),
        }
        .log();
    }

    pub fn transfer_started(
        client_addr: SocketAddr,
        filename: &str,
        direction: &str,
        block_size: usize,
        size: Option<u64>,
    ) {
        AuditEvent::TransferStarted {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            direction: direction.to_string(),
            block_size,
            size,
        }
        .log();
    }

    pub fn transfer_completed(
        client_addr: SocketAddr,
        filename: &str,
        bytes_transferred: u64,
        blocks: u16,
        duration_ms: u64,
    ) {
        AuditEvent::TransferCompleted {
            common: CommonFields::new("info"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            bytes_transferred,
            blocks,
            duration_ms,
        }
        .log();
    }

    pub fn transfer_failed(client_addr: SocketAddr, filename: &str, error: &str) {
        AuditEvent::TransferFailed {
            common: CommonFields::new("error"),
            client_addr: client_addr.to_string(),
            filename: filename.to_string(),
            error: error.to_string(),
        }
        .log();
    }

    pub fn unknown_tid(transfer_peer: SocketAddr, offender: SocketAddr) {
        AuditEvent::UnknownTid {
            common: CommonFields::new("warn"),
            transfer_peer: transfer_peer.to_string(),
            offender: offender.to_string(),
        }
        .log();
    }

    pub fn protocol_violation(client_addr: SocketAddr, violation: &str) {
        AuditEvent::ProtocolViolation {
            common: CommonFields::new("warn"),
            client_addr: client_addr.to_string(),
            violation: violation.to_string(),
        }
        .log();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_tag_and_common_fields() {
        let event = AuditEvent::RequestDenied {
            common: CommonFields::new("warn"),
            client_addr: "192.0.2.7:2048".to_string(),
            filename: "boot.cfg".to_string(),
            reason: "too many concurrent transfers".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "request_denied");
        assert_eq!(json["service"], "kestrel-tftp");
        assert_eq!(json["severity"], "warn");
        assert_eq!(json["filename"], "boot.cfg");
    }
}
