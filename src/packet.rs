//! TFTP wire format (RFC 1350, OACK per RFC 2347).
//!
//! All multi-byte integers are network byte order. Every string field in a
//! request, ERROR, or OACK frame is NUL-terminated; NULs are therefore legal
//! only between fields, never inside one. DATA payloads are opaque bytes
//! (`octet` mode only, so no netascii filtering on payloads).

use bytes::{BufMut, BytesMut};
use tracing::warn;

use crate::error::{Result, TftpError};

fn read_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

/// TFTP opcodes (RFC 1350, RFC 2347).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    Rrq = 1,
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
    Oack = 6,
}

impl TryFrom<u16> for Opcode {
    type Error = TftpError;

    fn try_from(value: u16) -> std::result::Result<Self, TftpError> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            6 => Ok(Opcode::Oack),
            _ => Err(TftpError::Protocol(format!("invalid opcode: {}", value))),
        }
    }
}

/// RFC 1350 error codes. Code 0 carries free text; the rest have fixed
/// messages (see [`ErrorCode::as_str`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotDefined => "Not defined",
            ErrorCode::FileNotFound => "File not found",
            ErrorCode::AccessViolation => "Access violation",
            ErrorCode::DiskFull => "Disk full or allocation exceeded",
            ErrorCode::IllegalOperation => "Illegal TFTP operation",
            ErrorCode::UnknownTransferId => "Unknown transfer ID",
            ErrorCode::FileAlreadyExists => "File already exists",
            ErrorCode::NoSuchUser => "No such user",
        }
    }
}

/// Argument to the ERROR frame builder: either a code from the fixed table
/// (the message is looked up) or free text (code 0, "Not defined").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorArg {
    Code(ErrorCode),
    Message(String),
}

impl ErrorArg {
    pub fn code(&self) -> u16 {
        match self {
            ErrorArg::Code(code) => *code as u16,
            ErrorArg::Message(_) => ErrorCode::NotDefined as u16,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            ErrorArg::Code(code) => code.as_str(),
            ErrorArg::Message(message) => message,
        }
    }
}

impl From<ErrorCode> for ErrorArg {
    fn from(code: ErrorCode) -> Self {
        ErrorArg::Code(code)
    }
}

impl From<&str> for ErrorArg {
    fn from(message: &str) -> Self {
        ErrorArg::Message(message.to_string())
    }
}

impl From<String> for ErrorArg {
    fn from(message: String) -> Self {
        ErrorArg::Message(message)
    }
}

/// RFC 1350 transfer modes. Parsing accepts all three (any case); the
/// dispatcher only honors `octet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Netascii,
    Octet,
    Mail,
}

impl TransferMode {
    fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "netascii" => Ok(TransferMode::Netascii),
            "octet" => Ok(TransferMode::Octet),
            "mail" => Ok(TransferMode::Mail),
            _ => Err(TftpError::Protocol(format!("unknown transfer mode: {}", s))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Netascii => "netascii",
            TransferMode::Octet => "octet",
            TransferMode::Mail => "mail",
        }
    }
}

/// Netascii admissibility (RFC 764): printable ASCII plus a handful of
/// control characters. Applied to filenames only.
pub fn is_netascii(byte: u8) -> bool {
    matches!(byte, 32..=127 | 0 | 7..=13)
}

fn check_netascii(label: &str, bytes: &[u8]) -> Result<()> {
    if bytes.iter().all(|&b| is_netascii(b)) {
        Ok(())
    } else {
        Err(TftpError::Protocol(format!("{} is not netascii", label)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
}

/// An RRQ or WRQ, parsed from the opening datagram of a transfer.
///
/// Option names and values arrive lowercased; duplicates collapse
/// last-write-wins (with a warning). Order is preserved so the OACK can echo
/// options in the order the client proposed them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub kind: RequestKind,
    pub filename: String,
    pub mode: TransferMode,
    pub options: Vec<(String, String)>,
}

impl Request {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(TftpError::Protocol("request too short".to_string()));
        }
        let kind = match Opcode::try_from(read_u16(buf))? {
            Opcode::Rrq => RequestKind::Read,
            Opcode::Wrq => RequestKind::Write,
            other => {
                return Err(TftpError::Protocol(format!(
                    "expected request, got {:?}",
                    other
                )));
            }
        };

        let body = &buf[2..];
        if body.last() != Some(&0) {
            return Err(TftpError::Protocol(
                "request not NUL-terminated".to_string(),
            ));
        }
        let fields: Vec<&[u8]> = body[..body.len() - 1].split(|&b| b == 0).collect();
        if fields.len() < 2 {
            return Err(TftpError::Protocol(
                "request is missing filename or mode".to_string(),
            ));
        }

        check_netascii("filename", fields[0])?;
        let filename = String::from_utf8(fields[0].to_vec())
            .map_err(|_| TftpError::Protocol("filename is not valid text".to_string()))?;
        let mode = TransferMode::parse(&String::from_utf8_lossy(fields[1]))?;

        let rest = &fields[2..];
        if rest.len() % 2 != 0 {
            return Err(TftpError::Protocol(
                "odd number of option fields".to_string(),
            ));
        }
        let mut options: Vec<(String, String)> = Vec::with_capacity(rest.len() / 2);
        for pair in rest.chunks_exact(2) {
            let name = String::from_utf8_lossy(pair[0]).to_lowercase();
            let value = String::from_utf8_lossy(pair[1]).to_lowercase();
            if let Some(existing) = options.iter_mut().find(|(n, _)| *n == name) {
                warn!(option = %name, "duplicate option in request, keeping last value");
                existing.1 = value;
            } else {
                options.push((name, value));
            }
        }

        Ok(Request {
            kind,
            filename,
            mode,
            options,
        })
    }

    /// Wire encoding of this request. Used by clients and the test suite;
    /// the server itself only parses requests.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        check_netascii("filename", self.filename.as_bytes())?;
        if self.filename.as_bytes().contains(&0) {
            return Err(TftpError::Protocol("filename contains NUL".to_string()));
        }
        let opcode = match self.kind {
            RequestKind::Read => Opcode::Rrq,
            RequestKind::Write => Opcode::Wrq,
        };
        let mut out = BytesMut::with_capacity(2 + self.filename.len() + 12);
        out.put_u16(opcode as u16);
        out.put_slice(self.filename.as_bytes());
        out.put_u8(0);
        out.put_slice(self.mode.as_str().as_bytes());
        out.put_u8(0);
        for (name, value) in &self.options {
            out.put_slice(name.as_bytes());
            out.put_u8(0);
            out.put_slice(value.as_bytes());
            out.put_u8(0);
        }
        Ok(out.to_vec())
    }
}

/// Any TFTP frame, as seen by a transfer endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Request(Request),
    Data { block: u16, payload: Vec<u8> },
    Ack { block: u16 },
    Error { code: u16, message: String },
    Oack { options: Vec<(String, String)> },
}

impl Packet {
    /// Parse a datagram. `max_payload` is the negotiated block size for this
    /// transfer; a DATA frame longer than that is a protocol violation.
    pub fn parse(buf: &[u8], max_payload: usize) -> Result<Self> {
        if buf.len() < 2 {
            return Err(TftpError::Protocol("datagram too short".to_string()));
        }
        match Opcode::try_from(read_u16(buf))? {
            Opcode::Rrq | Opcode::Wrq => Ok(Packet::Request(Request::parse(buf)?)),
            Opcode::Data => {
                if buf.len() < 4 {
                    return Err(TftpError::Protocol("DATA frame too short".to_string()));
                }
                let block = read_u16(&buf[2..4]);
                let payload = &buf[4..];
                if payload.len() > max_payload {
                    return Err(TftpError::Protocol(format!(
                        "DATA payload of {} exceeds block size {}",
                        payload.len(),
                        max_payload
                    )));
                }
                Ok(Packet::Data {
                    block,
                    payload: payload.to_vec(),
                })
            }
            Opcode::Ack => {
                if buf.len() != 4 {
                    return Err(TftpError::Protocol(format!(
                        "ACK frame of {} bytes",
                        buf.len()
                    )));
                }
                Ok(Packet::Ack {
                    block: read_u16(&buf[2..4]),
                })
            }
            Opcode::Error => {
                if buf.len() < 5 || buf.last() != Some(&0) {
                    return Err(TftpError::Protocol("malformed ERROR frame".to_string()));
                }
                let code = read_u16(&buf[2..4]);
                let message = String::from_utf8_lossy(&buf[4..buf.len() - 1]).into_owned();
                Ok(Packet::Error { code, message })
            }
            Opcode::Oack => {
                let body = &buf[2..];
                if body.is_empty() || body.last() != Some(&0) {
                    return Err(TftpError::Protocol("malformed OACK frame".to_string()));
                }
                let fields: Vec<&[u8]> = body[..body.len() - 1].split(|&b| b == 0).collect();
                if fields.len() % 2 != 0 {
                    return Err(TftpError::Protocol(
                        "odd number of OACK fields".to_string(),
                    ));
                }
                let options = fields
                    .chunks_exact(2)
                    .map(|pair| {
                        (
                            String::from_utf8_lossy(pair[0]).to_lowercase(),
                            String::from_utf8_lossy(pair[1]).to_lowercase(),
                        )
                    })
                    .collect();
                Ok(Packet::Oack { options })
            }
        }
    }
}

/// Encode a DATA frame. Block 0 never appears on the wire (ACK(0) is the
/// OACK acknowledgement, DATA starts at 1), and the payload must fit the
/// negotiated block size.
pub fn encode_data(block: u16, payload: &[u8], max_payload: usize) -> Result<Vec<u8>> {
    if block == 0 {
        return Err(TftpError::Protocol("DATA block 0 is reserved".to_string()));
    }
    if payload.len() > max_payload {
        return Err(TftpError::Protocol(format!(
            "payload of {} exceeds block size {}",
            payload.len(),
            max_payload
        )));
    }
    let mut out = BytesMut::with_capacity(4 + payload.len());
    out.put_u16(Opcode::Data as u16);
    out.put_u16(block);
    out.put_slice(payload);
    Ok(out.to_vec())
}

pub fn encode_ack(block: u16) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(4);
    out.put_u16(Opcode::Ack as u16);
    out.put_u16(block);
    out.to_vec()
}

pub fn encode_error<A: Into<ErrorArg>>(arg: A) -> Vec<u8> {
    let arg = arg.into();
    encode_error_parts(arg.code(), arg.text())
}

/// ERROR frame with an explicit code and message, for errors reported by the
/// backend with their own wording.
pub fn encode_error_parts(code: u16, message: &str) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(5 + message.len());
    out.put_u16(Opcode::Error as u16);
    out.put_u16(code);
    out.put_slice(message.as_bytes());
    out.put_u8(0);
    out.to_vec()
}

pub fn encode_oack(options: &[(String, String)]) -> Result<Vec<u8>> {
    let mut out = BytesMut::new();
    out.put_u16(Opcode::Oack as u16);
    for (name, value) in options {
        check_netascii("option name", name.as_bytes())?;
        out.put_slice(name.as_bytes());
        out.put_u8(0);
        out.put_slice(value.as_bytes());
        out.put_u8(0);
    }
    Ok(out.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rrq_with_options() {
        let bytes = b"\x00\x01firmware.bin\x00OCTET\x00blksize\x001024\x00TSIZE\x000\x00";
        let req = Request::parse(bytes).unwrap();
        assert_eq!(req.kind, RequestKind::Read);
        assert_eq!(req.filename, "firmware.bin");
        assert_eq!(req.mode, TransferMode::Octet);
        assert_eq!(
            req.options,
            vec![
                ("blksize".to_string(), "1024".to_string()),
                ("tsize".to_string(), "0".to_string()),
            ]
        );
    }

    #[test]
    fn request_round_trips() {
        let req = Request {
            kind: RequestKind::Write,
            filename: "logs/today.txt".to_string(),
            mode: TransferMode::Octet,
            options: vec![("tsize".to_string(), "512".to_string())],
        };
        let bytes = req.to_bytes().unwrap();
        assert_eq!(Request::parse(&bytes).unwrap(), req);
        // Canonical wire bytes survive a parse/encode cycle unchanged.
        assert_eq!(Request::parse(&bytes).unwrap().to_bytes().unwrap(), bytes);
    }

    #[test]
    fn rejects_non_netascii_filename() {
        let bytes = b"\x00\x01bad\x1fname\x00octet\x00";
        assert!(Request::parse(bytes).is_err());
        let bytes = b"\x00\x01caf\xc3\xa9\x00octet\x00";
        assert!(Request::parse(bytes).is_err());
    }

    #[test]
    fn rejects_missing_terminator_and_odd_options() {
        assert!(Request::parse(b"\x00\x01file\x00octet").is_err());
        assert!(Request::parse(b"\x00\x01file\x00octet\x00blksize\x00").is_err());
    }

    #[test]
    fn rejects_unknown_mode_and_opcode() {
        assert!(Request::parse(b"\x00\x01file\x00base64\x00").is_err());
        assert!(Request::parse(b"\x00\x09file\x00octet\x00").is_err());
        assert!(Packet::parse(b"\x00\x09\x00\x01", 512).is_err());
    }

    #[test]
    fn duplicate_option_keeps_last_value() {
        let bytes = b"\x00\x01f\x00octet\x00blksize\x00512\x00blksize\x001024\x00";
        let req = Request::parse(bytes).unwrap();
        assert_eq!(
            req.options,
            vec![("blksize".to_string(), "1024".to_string())]
        );
    }

    #[test]
    fn data_round_trips_and_respects_limit() {
        let frame = encode_data(7, b"abc", 512).unwrap();
        assert_eq!(frame, b"\x00\x03\x00\x07abc");
        match Packet::parse(&frame, 512).unwrap() {
            Packet::Data { block, payload } => {
                assert_eq!(block, 7);
                assert_eq!(payload, b"abc");
            }
            other => panic!("unexpected packet: {:?}", other),
        }

        // Payload limits are the negotiated block size, not a constant.
        assert!(encode_data(1, &[0u8; 16], 8).is_err());
        let oversized = encode_data(1, &[0u8; 16], 16).unwrap();
        assert!(Packet::parse(&oversized, 8).is_err());
        assert!(encode_data(0, b"x", 512).is_err());
    }

    #[test]
    fn data_payload_may_contain_nuls() {
        let frame = encode_data(1, b"\x00\x01\x00", 512).unwrap();
        match Packet::parse(&frame, 512).unwrap() {
            Packet::Data { payload, .. } => assert_eq!(payload, b"\x00\x01\x00"),
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn ack_round_trips() {
        let frame = encode_ack(0);
        assert_eq!(frame, b"\x00\x04\x00\x00");
        assert_eq!(Packet::parse(&frame, 512).unwrap(), Packet::Ack { block: 0 });
        assert!(Packet::parse(b"\x00\x04\x00", 512).is_err());
        assert!(Packet::parse(b"\x00\x04\x00\x01\x00", 512).is_err());
    }

    #[test]
    fn error_builder_accepts_code_or_text() {
        let from_code = encode_error(ErrorCode::UnknownTransferId);
        assert_eq!(
            Packet::parse(&from_code, 512).unwrap(),
            Packet::Error {
                code: 5,
                message: "Unknown transfer ID".to_string(),
            }
        );

        let from_text = encode_error("Ack timeout");
        assert_eq!(
            Packet::parse(&from_text, 512).unwrap(),
            Packet::Error {
                code: 0,
                message: "Ack timeout".to_string(),
            }
        );
    }

    #[test]
    fn oack_round_trips() {
        let options = vec![
            ("blksize".to_string(), "1024".to_string()),
            ("timeout".to_string(), "3".to_string()),
            ("tsize".to_string(), "3000".to_string()),
        ];
        let frame = encode_oack(&options).unwrap();
        assert_eq!(
            Packet::parse(&frame, 512).unwrap(),
            Packet::Oack { options }
        );
    }

    #[test]
    fn netascii_set_matches_rfc_764() {
        for b in [0u8, 7, 8, 9, 10, 11, 12, 13, 32, 64, 127] {
            assert!(is_netascii(b), "{} should be admissible", b);
        }
        for b in [1u8, 6, 14, 31, 128, 200, 255] {
            assert!(!is_netascii(b), "{} should be rejected", b);
        }
    }
}
