//! RFC 2347 option negotiation for the supported set: `blksize` (RFC 2348),
//! `timeout` and `tsize` (RFC 2349). Anything else a client proposes is
//! dropped silently before the OACK, per RFC 2347.

use std::time::Duration;

use tracing::debug;

use crate::packet::RequestKind;
use crate::{DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};

/// Effective parameters of one transfer after negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOptions {
    /// DATA payload size for this transfer.
    pub block_size: usize,
    /// Per-packet retransmit interval.
    pub timeout: Duration,
    /// Total transfer size: the source's size hint on a read, the client's
    /// declared upload size on a write.
    pub transfer_size: Option<u64>,
}

impl TransferOptions {
    /// Parameters used when the client negotiates nothing: RFC 1350 block
    /// size and the server's configured retransmit interval.
    pub fn defaults(retransmit_timeout: Duration) -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            timeout: retransmit_timeout,
            transfer_size: None,
        }
    }
}

/// Negotiate the client's proposed options.
///
/// Returns the effective transfer parameters and the accepted subset to echo
/// in the OACK, in the order the client proposed them. An empty echo means
/// the OACK is suppressed entirely and the transfer proceeds as if no
/// options were requested.
///
/// `size_hint` is the total size reported by the source factory; on a read
/// request it replaces whatever the client put in `tsize`, and when it is
/// unknown the option is dropped.
pub fn negotiate(
    requested: &[(String, String)],
    kind: RequestKind,
    size_hint: Option<u64>,
    defaults: TransferOptions,
) -> (TransferOptions, Vec<(String, String)>) {
    let mut effective = defaults;
    let mut echo: Vec<(String, String)> = Vec::new();

    for (name, value) in requested {
        match name.as_str() {
            "blksize" => match value.parse::<usize>() {
                Ok(size) => {
                    let clamped = size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE);
                    effective.block_size = clamped;
                    echo.push(("blksize".to_string(), clamped.to_string()));
                }
                Err(_) => debug!(value = %value, "non-numeric blksize, dropping option"),
            },
            "timeout" => match value.parse::<u64>() {
                Ok(secs) => {
                    let clamped = secs.clamp(1, 255);
                    effective.timeout = Duration::from_secs(clamped);
                    echo.push(("timeout".to_string(), clamped.to_string()));
                }
                Err(_) => debug!(value = %value, "non-numeric timeout, dropping option"),
            },
            "tsize" => match kind {
                // On a read the client's value is a placeholder (usually 0);
                // the answer is the size the source factory reported.
                RequestKind::Read => match size_hint {
                    Some(size) => {
                        effective.transfer_size = Some(size);
                        echo.push(("tsize".to_string(), size.to_string()));
                    }
                    None => debug!("source size unknown, dropping tsize"),
                },
                // On a write the client declares how much it will upload.
                RequestKind::Write => match value.parse::<u64>() {
                    Ok(size) => {
                        effective.transfer_size = Some(size);
                        echo.push(("tsize".to_string(), size.to_string()));
                    }
                    Err(_) => debug!(value = %value, "non-numeric tsize, dropping option"),
                },
            },
            other => debug!(option = %other, "unsupported option, dropping"),
        }
    }

    (effective, echo)
}
