use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TftpError};
use crate::{DEFAULT_MAX_RETRIES, DEFAULT_PORT, DEFAULT_RETRANSMIT_TIMEOUT_MS};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Local addresses the well-known port is bound on. Every address gets
    /// its own listener endpoint; all of them feed the one dispatcher.
    pub bind_addrs: Vec<IpAddr>,

    /// Well-known request port (RFC 1350: 69).
    pub port: u16,

    /// Per-packet retransmit interval in milliseconds, used when the client
    /// does not negotiate an RFC 2349 `timeout`.
    pub retransmit_timeout_ms: u64,

    /// Retransmissions of one packet before the transfer is abandoned.
    pub max_retries: u32,

    /// Live transfers the dispatcher will carry at once; requests beyond
    /// this are refused with a wire ERROR.
    pub max_transfers: usize,

    pub socket: SocketTuning,
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addrs: vec![IpAddr::from([0, 0, 0, 0])],
            port: DEFAULT_PORT,
            retransmit_timeout_ms: DEFAULT_RETRANSMIT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            max_transfers: 64,
            socket: SocketTuning::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn retransmit_timeout(&self) -> Duration {
        Duration::from_millis(self.retransmit_timeout_ms)
    }
}

/// Listener socket tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketTuning {
    /// Receive buffer size in KB (SO_RCVBUF). Larger buffers reduce request
    /// drops under bursts of concurrent clients.
    pub recv_buffer_kb: usize,

    /// Send buffer size in KB (SO_SNDBUF).
    pub send_buffer_kb: usize,

    /// Enable SO_REUSEADDR for faster restarts.
    pub reuse_address: bool,
}

impl Default for SocketTuning {
    fn default() -> Self {
        Self {
            recv_buffer_kb: 512,
            send_buffer_kb: 512,
            reuse_address: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    /// Log file; stderr when unset.
    pub file: Option<PathBuf>,
    /// Emit structured audit records for request/transfer lifecycle events.
    pub audit_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
            audit_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text for human readability.
    Text,
    /// JSON structured logging for log aggregators.
    Json,
}

pub fn load_config(path: &std::path::Path) -> Result<ServerConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: ServerConfig = toml::from_str(&contents)
        .map_err(|e| TftpError::Protocol(format!("invalid config file {}: {}", path.display(), e)))?;
    Ok(config)
}

pub fn write_config(path: &std::path::Path, config: &ServerConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| TftpError::Protocol(format!("failed to serialize config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn validate_config(config: &ServerConfig) -> Result<()> {
    if config.bind_addrs.is_empty() {
        return Err(TftpError::Protocol(
            "bind_addrs must name at least one address".to_string(),
        ));
    }

    if config.port == 0 {
        return Err(TftpError::Protocol("port must be non-zero".to_string()));
    }

    // The RFC 2349 option tops out at 255 s; the configured default gets the
    // same ceiling so a transfer can never outlive every client that gave up.
    if !(1..=255_000).contains(&config.retransmit_timeout_ms) {
        return Err(TftpError::Protocol(
            "retransmit_timeout_ms must be in range 1-255000".to_string(),
        ));
    }

    if config.max_retries == 0 {
        return Err(TftpError::Protocol(
            "max_retries must be non-zero".to_string(),
        ));
    }

    if config.max_transfers == 0 {
        return Err(TftpError::Protocol(
            "max_transfers must be non-zero".to_string(),
        ));
    }

    if let Some(ref log_file) = config.logging.file {
        let parent = log_file.parent().ok_or_else(|| {
            TftpError::Protocol("logging.file must include a parent directory".to_string())
        })?;
        match std::fs::metadata(parent) {
            Ok(meta) => {
                if !meta.is_dir() {
                    return Err(TftpError::Protocol(
                        "logging.file parent must be a directory".to_string(),
                    ));
                }
            }
            Err(e) => {
                return Err(TftpError::Protocol(format!(
                    "logging.file parent error: {}",
                    e
                )));
            }
        }
        let _ = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| TftpError::Protocol(format!("logging.file not writable: {}", e)))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> std::io::Result<PathBuf> {
        let mut dir = std::env::temp_dir();
        dir.push(format!("kestrel_tftp_test_{}_{}", name, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    #[test]
    fn parses_minimal_toml() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let toml = r#"
bind_addrs = ["127.0.0.1"]
port = 6969
retransmit_timeout_ms = 100
"#;
        let config: ServerConfig = toml::from_str(toml)?;
        assert_eq!(config.port, 6969);
        assert_eq!(config.retransmit_timeout(), Duration::from_millis(100));
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        validate_config(&config)?;
        Ok(())
    }

    #[test]
    fn defaults_take_the_rfc_1350_port_and_interval() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 69);
        assert_eq!(config.retransmit_timeout(), Duration::from_secs(5));
        validate_config(&config).unwrap();
    }

    #[test]
    fn rejects_empty_bind_addrs() {
        let config = ServerConfig {
            bind_addrs: vec![],
            ..Default::default()
        };
        let err = validate_config(&config).unwrap_err();
        assert!(format!("{err}").contains("bind_addrs"));
    }

    #[test]
    fn rejects_zero_port() {
        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        let err = validate_config(&config).unwrap_err();
        assert!(format!("{err}").contains("port must be non-zero"));
    }

    #[test]
    fn rejects_retransmit_interval_out_of_range() {
        for ms in [0u64, 300_000] {
            let config = ServerConfig {
                retransmit_timeout_ms: ms,
                ..Default::default()
            };
            let err = validate_config(&config).unwrap_err();
            assert!(format!("{err}").contains("retransmit_timeout_ms"));
        }
    }

    #[test]
    fn rejects_zero_retries_and_zero_transfer_cap() {
        let config = ServerConfig {
            max_retries: 0,
            ..Default::default()
        };
        assert!(validate_config(&config).is_err());

        let config = ServerConfig {
            max_transfers: 0,
            ..Default::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_logging_file_with_missing_parent() {
        let mut config = ServerConfig::default();
        config.logging.file = Some(PathBuf::from("/nonexistent/kestrel-tftp/log.txt"));
        let err = validate_config(&config).unwrap_err();
        assert!(format!("{err}").contains("logging.file parent error"));
    }

    #[test]
    fn accepts_writable_logging_file() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let log_dir = temp_dir("logfile")?;
        let mut config = ServerConfig::default();
        config.logging.file = Some(log_dir.join("tftp.log"));
        validate_config(&config)?;
        Ok(())
    }

    #[test]
    fn config_round_trips_through_toml() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = temp_dir("roundtrip")?;
        let path = dir.join("tftp.toml");
        let mut config = ServerConfig::default();
        config.retransmit_timeout_ms = 250;
        config.logging.format = LogFormat::Json;
        write_config(&path, &config)?;

        let loaded = load_config(&path)?;
        assert_eq!(loaded.retransmit_timeout_ms, 250);
        assert_eq!(loaded.logging.format, LogFormat::Json);
        Ok(())
    }
}
