//! Standalone TFTP server binary.
//!
//! Embeds the `kestrel_tftp` library behind a directory-serving backend:
//! reads stream straight from files in `--root-dir`, writes (opt-in) land
//! next to them. The library itself never touches the filesystem; this
//! backend is the reference embedding.

use std::io::Read;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use kestrel_tftp::config::{LogFormat, ServerConfig, load_config, validate_config, write_config};
use kestrel_tftp::error::{Result, TftpError};
use kestrel_tftp::packet::ErrorCode;
use kestrel_tftp::{Backend, OpenError, Pull, ReadStream, Server, Sink, Source};

#[derive(Parser, Debug)]
#[command(name = "kestrel-tftpd", about = "Callback-backed TFTP server")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "/etc/kestrel/tftp.toml")]
    config: PathBuf,

    /// Write a default TOML configuration file and exit
    #[arg(long)]
    init_config: bool,

    /// Validate the configuration and exit (no socket bind)
    #[arg(long)]
    check_config: bool,

    /// Directory served by the built-in file backend
    #[arg(long, default_value = "/var/lib/kestrel/tftp")]
    root_dir: PathBuf,

    /// Create the root directory if it does not exist
    #[arg(long)]
    create_root_dir: bool,

    /// Bind address; repeat for multiple interfaces (overrides config)
    #[arg(long = "bind")]
    bind: Vec<IpAddr>,

    /// Request port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Retransmission interval in milliseconds (overrides config)
    #[arg(long)]
    retransmit_timeout_ms: Option<u64>,

    /// Retransmissions before a transfer is abandoned (overrides config)
    #[arg(long)]
    max_retries: Option<u32>,

    /// Accept write requests into the root directory
    #[arg(long)]
    allow_writes: bool,

    /// Allow write requests to replace existing files
    #[arg(long)]
    allow_overwrite: bool,
}

/// Streams files out of (and optionally into) one directory tree.
struct DirectoryBackend {
    root: PathBuf,
    allow_writes: bool,
    allow_overwrite: bool,
}

impl DirectoryBackend {
    fn new(root: PathBuf, allow_writes: bool, allow_overwrite: bool) -> Self {
        Self {
            root,
            allow_writes,
            allow_overwrite,
        }
    }

    /// Normalize a requested name into a path under the root. Traversal
    /// components and symlinks are refused outright, and the resolved path
    /// must stay inside the root after canonicalization.
    fn resolve(&self, filename: &str) -> std::result::Result<PathBuf, OpenError> {
        let filename = filename.replace('\\', "/");
        if filename.split('/').any(|part| part == "..") {
            return Err(OpenError::access_violation("path traversal refused"));
        }
        let path = self.root.join(filename.trim_start_matches('/'));
        match std::fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(OpenError::access_violation("symlinks are not served"));
            }
            _ => {}
        }

        // The name itself is clean, but a symlinked intermediate directory
        // under the root could still point elsewhere. The canonical path
        // must stay within the canonical root.
        let canonical_root = self
            .root
            .canonicalize()
            .map_err(|_| OpenError::access_violation("root directory unavailable"))?;
        if let Ok(canonical_path) = path.canonicalize() {
            if !canonical_path.starts_with(&canonical_root) {
                return Err(OpenError::access_violation("path escapes root"));
            }
        } else if let Some(parent) = path.parent()
            && let Ok(canonical_parent) = parent.canonicalize()
            && !canonical_parent.starts_with(&canonical_root)
        {
            // The file does not exist yet (writes); bound its directory.
            return Err(OpenError::access_violation("path escapes root"));
        }

        Ok(path)
    }
}

impl Backend for DirectoryBackend {
    fn open_read(&mut self, filename: &str) -> std::result::Result<ReadStream, OpenError> {
        let path = self.resolve(filename)?;
        let file = std::fs::File::open(&path).map_err(|_| OpenError::not_found())?;
        let size = file.metadata().ok().map(|m| m.len());
        Ok(ReadStream {
            source: Box::new(FileSource { file }),
            size,
        })
    }

    fn open_write(&mut self, filename: &str) -> std::result::Result<Box<dyn Sink>, OpenError> {
        if !self.allow_writes {
            return Err(OpenError::access_violation("writes are disabled"));
        }
        let path = self.resolve(filename)?;
        if !self.allow_overwrite && path.exists() {
            return Err(OpenError {
                code: ErrorCode::FileAlreadyExists,
                message: ErrorCode::FileAlreadyExists.as_str().to_string(),
            });
        }
        let file = std::fs::File::create(&path)
            .map_err(|e| OpenError::access_violation(e.to_string()))?;
        Ok(Box::new(FileSink { file }))
    }
}

struct FileSource {
    file: std::fs::File,
}

impl Source for FileSource {
    fn pull(&mut self, max_len: usize) -> anyhow::Result<Pull> {
        let mut buf = vec![0u8; max_len];
        // Fill the whole block if the file has the bytes; a partial read
        // mid-file must not masquerade as the terminal short frame.
        let mut filled = 0;
        while filled < max_len {
            let n = self.file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(Pull::Eof);
        }
        buf.truncate(filled);
        Ok(Pull::Chunk(buf))
    }
}

struct FileSink {
    file: std::fs::File,
}

impl Sink for FileSink {
    fn push(&mut self, data: &[u8], last: bool) -> anyhow::Result<()> {
        use std::io::Write;
        self.file.write_all(data)?;
        if last {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

fn check_root_dir(root: &Path, create: bool) -> Result<()> {
    if create {
        std::fs::create_dir_all(root)?;
    }
    match std::fs::metadata(root) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(TftpError::Protocol(format!(
            "{} is not a directory",
            root.display()
        ))),
        Err(e) => Err(TftpError::Protocol(format!(
            "root directory {}: {}",
            root.display(),
            e
        ))),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        load_config(&cli.config)?
    } else {
        ServerConfig::default()
    };

    if !cli.bind.is_empty() {
        config.bind_addrs = cli.bind.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(ms) = cli.retransmit_timeout_ms {
        config.retransmit_timeout_ms = ms;
    }
    if let Some(retries) = cli.max_retries {
        config.max_retries = retries;
    }

    if cli.init_config {
        write_config(&cli.config, &config)?;
        println!("Wrote config to {}", cli.config.display());
        return Ok(());
    }

    if cli.check_config {
        validate_config(&config)?;
        println!("Config OK: {}", cli.config.display());
        return Ok(());
    }

    validate_config(&config)?;
    check_root_dir(&cli.root_dir, cli.create_root_dir)?;

    let _log_guard = if let Some(ref log_file) = config.logging.file {
        let dir = log_file.parent().unwrap_or_else(|| Path::new("."));
        let file_name = log_file
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| TftpError::Protocol("logging.file must include a file name".to_string()))?;
        let file_appender = tracing_appender::rolling::never(dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        match config.logging.format {
            LogFormat::Json => {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(EnvFilter::new(config.logging.level.clone()))
                    .with_writer(non_blocking)
                    .init();
            }
            LogFormat::Text => {
                tracing_subscriber::fmt()
                    .with_env_filter(EnvFilter::new(config.logging.level.clone()))
                    .with_writer(non_blocking)
                    .init();
            }
        }
        Some(guard)
    } else {
        match config.logging.format {
            LogFormat::Json => {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(EnvFilter::new(config.logging.level.clone()))
                    .init();
            }
            LogFormat::Text => {
                tracing_subscriber::fmt()
                    .with_env_filter(EnvFilter::new(config.logging.level.clone()))
                    .init();
            }
        }
        None
    };

    let backend = DirectoryBackend::new(cli.root_dir, cli.allow_writes, cli.allow_overwrite);
    Server::bind(config)?.serve(backend).await
}
