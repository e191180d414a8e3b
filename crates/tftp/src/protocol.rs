//! TFTP wire format
//!
//! This module contains the pure wire codec: parsing and building the six
//! TFTP packet types and validating transfer options.
//!
//! # TFTP Protocol Overview
//!
//! TFTP (Trivial File Transfer Protocol) is defined in RFC 1350 with option
//! negotiation from RFC 2347 and the `blksize` (RFC 2348), `timeout` and
//! `tsize` (RFC 2349) options.
//!
//! The protocol consists of six packet types:
//! - Read Request (RRQ) - Request to read a file from the server
//! - Write Request (WRQ) - Request to write a file to the server
//! - Data packets - Transfer file content in blocks
//! - Acknowledgment (ACK) - Confirm receipt of data blocks
//! - Error packets - Report errors during transfer
//! - Option acknowledgment (OACK) - Negotiate transfer options
//!
//! The codec here is side-effect free: it maps bytes to [`Packet`] values and
//! back, and never touches sockets, files, or addresses. The session layer
//! pairs a [`Packet`] with the peer it came from or goes to.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Default block size when no `blksize` option is negotiated (RFC 1350).
pub const DEFAULT_BLOCK_SIZE: u16 = 512;

/// Smallest acceptable `blksize` option value (RFC 2348).
pub const MIN_BLOCK_SIZE: u64 = 8;

/// Largest acceptable `blksize` option value (RFC 2348).
pub const MAX_BLOCK_SIZE: u64 = 65464;

/// Smallest acceptable `timeout` option value in seconds (RFC 2349).
pub const MIN_TIMEOUT_SECS: u64 = 1;

/// Largest acceptable `timeout` option value in seconds (RFC 2349).
pub const MAX_TIMEOUT_SECS: u64 = 255;

/// Largest transfer size expressible in one session: a full-size block for
/// every possible block number.
pub const MAX_TSIZE: u64 = MAX_BLOCK_SIZE * 65535;

/// Largest UDP payload we will ever receive or build.
pub const MAX_DATAGRAM: usize = 65507;

/// TFTP opcodes
///
/// These identify the type of a TFTP packet. The numeric values are the wire
/// values from RFC 1350 and RFC 2347 and must be preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Read Request (RRQ) - Opcode 1
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 | \[Options\] |
    Rrq = 1,

    /// Write Request (WRQ) - Opcode 2
    ///
    /// Packet format: | Opcode | Filename | 0 | Mode | 0 | \[Options\] |
    Wrq = 2,

    /// Data Packet (DATA) - Opcode 3
    ///
    /// Carries a 2-byte block number and up to one block of payload. A
    /// payload shorter than the negotiated block size marks the final block.
    ///
    /// Packet format: | Opcode | Block# | Data |
    Data = 3,

    /// Acknowledgment (ACK) - Opcode 4
    ///
    /// Acknowledges one DATA packet by block number. ACK with block 0
    /// acknowledges an OACK.
    ///
    /// Packet format: | Opcode | Block# |
    Ack = 4,

    /// Error Packet (ERROR) - Opcode 5
    ///
    /// Reports an error condition and terminates the transfer. Never
    /// acknowledged, never retransmitted.
    ///
    /// Packet format: | Opcode | ErrorCode | ErrMsg | 0 |
    Error = 5,

    /// Option Acknowledgment (OACK) - Opcode 6
    ///
    /// Names the requested options the server accepts, with their values
    /// (RFC 2347).
    ///
    /// Packet format: | Opcode | Opt1 | 0 | Value1 | 0 | ... |
    Oack = 6,
}

impl Opcode {
    /// Convert a u16 wire value to an [`Opcode`]
    ///
    /// # Examples
    /// ```
    /// use tftp::Opcode;
    ///
    /// assert_eq!(Opcode::from_u16(1), Some(Opcode::Rrq));
    /// assert_eq!(Opcode::from_u16(99), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Rrq),
            2 => Some(Self::Wrq),
            3 => Some(Self::Data),
            4 => Some(Self::Ack),
            5 => Some(Self::Error),
            6 => Some(Self::Oack),
            _ => None,
        }
    }

    /// Convert the opcode to its u16 wire value
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the conventional short name of the opcode
    ///
    /// # Examples
    /// ```
    /// use tftp::Opcode;
    ///
    /// assert_eq!(Opcode::Rrq.name(), "RRQ");
    /// assert_eq!(Opcode::Data.name(), "DATA");
    /// ```
    pub fn name(self) -> &'static str {
        match self {
            Self::Rrq => "RRQ",
            Self::Wrq => "WRQ",
            Self::Data => "DATA",
            Self::Ack => "ACK",
            Self::Error => "ERROR",
            Self::Oack => "OACK",
        }
    }
}

impl From<Opcode> for u16 {
    fn from(opcode: Opcode) -> Self {
        opcode.as_u16()
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TFTP error codes
///
/// Standard codes from RFC 1350 plus code 8 from RFC 2347.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Error code 0: Not defined, see error message.
    NotDefined = 0,

    /// Error code 1: File not found.
    FileNotFound = 1,

    /// Error code 2: Access violation.
    ///
    /// Also used for paths that resolve outside the served root.
    AccessViolation = 2,

    /// Error code 3: Disk full or allocation exceeded.
    DiskFull = 3,

    /// Error code 4: Illegal TFTP operation.
    ///
    /// Malformed packets and packets that are out of place for the current
    /// transfer state.
    IllegalOperation = 4,

    /// Error code 5: Unknown transfer ID.
    ///
    /// Sent out of band to a source whose port does not match the session
    /// TID. The only error that does not terminate a transfer.
    UnknownTid = 5,

    /// Error code 6: File already exists.
    FileExists = 6,

    /// Error code 7: No such user.
    NoSuchUser = 7,

    /// Error code 8: Invalid options (RFC 2347).
    InvalidOptions = 8,
}

impl ErrorCode {
    /// Convert a u16 wire value to an [`ErrorCode`]
    ///
    /// # Examples
    /// ```
    /// use tftp::ErrorCode;
    ///
    /// assert_eq!(ErrorCode::from_u16(1), Some(ErrorCode::FileNotFound));
    /// assert_eq!(ErrorCode::from_u16(99), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::NotDefined),
            1 => Some(Self::FileNotFound),
            2 => Some(Self::AccessViolation),
            3 => Some(Self::DiskFull),
            4 => Some(Self::IllegalOperation),
            5 => Some(Self::UnknownTid),
            6 => Some(Self::FileExists),
            7 => Some(Self::NoSuchUser),
            8 => Some(Self::InvalidOptions),
            _ => None,
        }
    }

    /// Convert the error code to its u16 wire value
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Get the default error message for this code
    ///
    /// # Examples
    /// ```
    /// use tftp::ErrorCode;
    ///
    /// assert_eq!(ErrorCode::FileNotFound.default_message(), "File not found");
    /// ```
    pub fn default_message(self) -> &'static str {
        match self {
            Self::NotDefined => "Undefined error",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal TFTP operation",
            Self::UnknownTid => "Unknown transfer ID",
            Self::FileExists => "File already exists",
            Self::NoSuchUser => "No such user",
            Self::InvalidOptions => "Invalid options",
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        code.as_u16()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// TFTP transfer modes
///
/// `octet` transfers bytes untouched; `netascii` applies the RFC 764 line
/// ending translation (see [`NetasciiEncoder`](crate::NetasciiEncoder) and
/// [`NetasciiDecoder`](crate::NetasciiDecoder)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataMode {
    /// Text mode with netascii line-ending translation.
    ///
    /// Mode string: "netascii"
    Netascii,

    /// Binary mode, bytes pass through untouched.
    ///
    /// Mode string: "octet"
    Octet,
}

impl DataMode {
    /// Parse a transfer mode from a string, case-insensitively
    ///
    /// # Examples
    /// ```
    /// use tftp::DataMode;
    ///
    /// assert_eq!(DataMode::from_str_opt("octet"), Some(DataMode::Octet));
    /// assert_eq!(DataMode::from_str_opt("NETASCII"), Some(DataMode::Netascii));
    /// assert_eq!(DataMode::from_str_opt("mail"), None);
    /// ```
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "netascii" => Some(Self::Netascii),
            "octet" => Some(Self::Octet),
            _ => None,
        }
    }

    /// Get the lowercase wire string for the mode
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Netascii => "netascii",
            Self::Octet => "octet",
        }
    }
}

impl FromStr for DataMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_opt(s).ok_or_else(|| format!("unsupported transfer mode: {}", s))
    }
}

impl fmt::Display for DataMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Direction of a transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// RRQ: the requester reads a file from its peer.
    Read,
    /// WRQ: the requester writes a file to its peer.
    Write,
}

impl RequestKind {
    /// The opcode a request of this kind carries on the wire.
    pub fn opcode(self) -> Opcode {
        match self {
            Self::Read => Opcode::Rrq,
            Self::Write => Opcode::Wrq,
        }
    }
}

/// Transfer options, keyed by lowercase option name.
///
/// Only `blksize`, `timeout` and `tsize` survive parsing; order on the wire
/// is irrelevant, so a sorted map keeps serialization deterministic.
pub type OptionMap = BTreeMap<String, u64>;

/// A parsed RRQ or WRQ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub kind: RequestKind,
    pub filename: String,
    pub mode: DataMode,
    pub options: OptionMap,
}

/// A decoded TFTP packet.
///
/// The variants mirror the six wire packet types. Parsing validates layout
/// and option rules; anything else (block-number checks, payload size limits)
/// belongs to the session state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Request(Request),
    Data { block: u16, data: Vec<u8> },
    Ack { block: u16 },
    Error { code: ErrorCode, message: String },
    Oack { options: OptionMap },
}

/// Error produced while decoding a datagram.
///
/// `Parsing` maps to wire ERROR(4) and `Options` to wire ERROR(8); the
/// session loop performs that mapping via [`PacketError::wire_code`].
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("malformed packet: {0}")]
    Parsing(String),
    #[error("invalid options: {0}")]
    Options(String),
}

impl PacketError {
    /// The wire error code a peer should receive for this failure.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            Self::Parsing(_) => ErrorCode::IllegalOperation,
            Self::Options(_) => ErrorCode::InvalidOptions,
        }
    }
}

/// Where a run of option pairs came from. Requests tolerate undecodable
/// values (the option is dropped); an OACK naming a value the server cannot
/// have accepted is an error.
#[derive(Clone, Copy, PartialEq, Eq)]
enum OptionSource {
    Request(RequestKind),
    Oack,
}

/// Find the NUL-terminated string starting at `pos`, returning it together
/// with the index just past the terminator.
fn take_cstr(buf: &[u8], pos: usize) -> Result<(&str, usize), PacketError> {
    let end = buf[pos..]
        .iter()
        .position(|&b| b == 0)
        .map(|off| pos + off)
        .ok_or_else(|| PacketError::Parsing("string not terminated".into()))?;
    let s = std::str::from_utf8(&buf[pos..end])
        .map_err(|_| PacketError::Parsing("string is not valid ASCII".into()))?;
    Ok((s, end + 1))
}

/// Apply the range rules of RFC 2348/2349 to already-parsed options.
///
/// - `blksize` below 8 is dropped; above 65464 it is clamped.
/// - `timeout` outside 1..=255 is dropped.
/// - `tsize` above [`MAX_TSIZE`] is dropped.
///
/// # Examples
/// ```
/// use tftp::{filter_options, OptionMap};
///
/// let mut opts = OptionMap::new();
/// opts.insert("blksize".to_string(), 4);
/// opts.insert("timeout".to_string(), 10);
/// let opts = filter_options(opts);
/// assert!(!opts.contains_key("blksize"));
/// assert_eq!(opts.get("timeout"), Some(&10));
/// ```
pub fn filter_options(mut options: OptionMap) -> OptionMap {
    if let Some(&blksize) = options.get("blksize") {
        if blksize < MIN_BLOCK_SIZE {
            options.remove("blksize");
        } else if blksize > MAX_BLOCK_SIZE {
            options.insert("blksize".to_string(), MAX_BLOCK_SIZE);
        }
    }
    if let Some(&timeout) = options.get("timeout") {
        if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&timeout) {
            options.remove("timeout");
        }
    }
    if let Some(&tsize) = options.get("tsize") {
        if tsize > MAX_TSIZE {
            options.remove("tsize");
        }
    }
    options
}

/// Parse the NUL-delimited option pairs trailing a request or OACK.
fn parse_option_pairs(
    buf: &[u8],
    mut pos: usize,
    source: OptionSource,
) -> Result<OptionMap, PacketError> {
    let mut options = OptionMap::new();
    let mut seen: Vec<String> = Vec::new();

    while pos < buf.len() {
        let (name, next) = take_cstr(buf, pos)
            .map_err(|_| PacketError::Options("option name not terminated".into()))?;
        let name = name.to_ascii_lowercase();
        if name.is_empty() {
            return Err(PacketError::Options("empty option name".into()));
        }
        if seen.contains(&name) {
            return Err(PacketError::Options(format!("option '{}' occurs multiple times", name)));
        }
        pos = next;

        let (value, next) = take_cstr(buf, pos)
            .map_err(|_| PacketError::Options(format!("value of option '{}' not terminated", name)))?;
        if value.is_empty() {
            return Err(PacketError::Options(format!("empty value for option '{}'", name)));
        }
        pos = next;
        seen.push(name.clone());

        if !matches!(name.as_str(), "blksize" | "timeout" | "tsize") {
            continue;
        }

        let value = match value.parse::<u64>() {
            Ok(v) => v,
            // A server that acknowledged an option must supply a numeric
            // value; a client asking with a garbage value just loses it.
            Err(_) if source == OptionSource::Oack => {
                return Err(PacketError::Options(format!("unparseable value for option '{}'", name)));
            }
            Err(_) => continue,
        };

        // tsize on an RRQ is a question, not a statement.
        if name == "tsize" && source == OptionSource::Request(RequestKind::Read) && value != 0 {
            continue;
        }

        options.insert(name, value);
    }

    Ok(filter_options(options))
}

fn parse_request(kind: RequestKind, buf: &[u8]) -> Result<Packet, PacketError> {
    let (filename, pos) = take_cstr(buf, 2)?;
    if filename.is_empty() {
        return Err(PacketError::Parsing("empty filename".into()));
    }
    let filename = filename.to_string();

    let (mode, pos) = take_cstr(buf, pos)?;
    if mode.is_empty() {
        return Err(PacketError::Parsing("empty mode".into()));
    }
    let mode = DataMode::from_str_opt(mode)
        .ok_or_else(|| PacketError::Parsing(format!("unknown mode '{}'", mode)))?;

    let options = parse_option_pairs(buf, pos, OptionSource::Request(kind))?;

    Ok(Packet::Request(Request {
        kind,
        filename,
        mode,
        options,
    }))
}

fn parse_error(buf: &[u8]) -> Result<Packet, PacketError> {
    if buf.len() < 5 {
        return Err(PacketError::Parsing("ERROR packet too short".into()));
    }
    let raw = u16::from_be_bytes([buf[2], buf[3]]);
    let code = ErrorCode::from_u16(raw)
        .ok_or_else(|| PacketError::Parsing(format!("invalid error code {}", raw)))?;
    let (message, _) = take_cstr(buf, 4)?;
    Ok(Packet::Error {
        code,
        message: message.to_string(),
    })
}

impl Packet {
    /// Decode one datagram.
    ///
    /// Layout violations yield [`PacketError::Parsing`]; option-rule
    /// violations yield [`PacketError::Options`].
    pub fn parse(buf: &[u8]) -> Result<Packet, PacketError> {
        if buf.len() < 2 {
            return Err(PacketError::Parsing("datagram too short for opcode".into()));
        }
        let raw = u16::from_be_bytes([buf[0], buf[1]]);
        let opcode = Opcode::from_u16(raw)
            .ok_or_else(|| PacketError::Parsing(format!("unknown opcode {}", raw)))?;

        match opcode {
            Opcode::Rrq => parse_request(RequestKind::Read, buf),
            Opcode::Wrq => parse_request(RequestKind::Write, buf),
            Opcode::Data => {
                if buf.len() < 4 {
                    return Err(PacketError::Parsing("DATA packet too short".into()));
                }
                Ok(Packet::Data {
                    block: u16::from_be_bytes([buf[2], buf[3]]),
                    data: buf[4..].to_vec(),
                })
            }
            Opcode::Ack => {
                if buf.len() != 4 {
                    return Err(PacketError::Parsing("ACK packet must be exactly 4 bytes".into()));
                }
                Ok(Packet::Ack {
                    block: u16::from_be_bytes([buf[2], buf[3]]),
                })
            }
            Opcode::Error => parse_error(buf),
            Opcode::Oack => {
                if buf.len() < 4 {
                    return Err(PacketError::Parsing("OACK packet too short".into()));
                }
                Ok(Packet::Oack {
                    options: parse_option_pairs(buf, 2, OptionSource::Oack)?,
                })
            }
        }
    }

    /// Encode the packet into a fresh datagram buffer.
    pub fn serialize(&self) -> Vec<u8> {
        fn push_options(buf: &mut Vec<u8>, options: &OptionMap) {
            for (name, value) in options {
                buf.extend_from_slice(name.as_bytes());
                buf.push(0);
                buf.extend_from_slice(value.to_string().as_bytes());
                buf.push(0);
            }
        }

        let mut buf = Vec::with_capacity(4);
        buf.extend_from_slice(&self.opcode().as_u16().to_be_bytes());
        match self {
            Packet::Request(req) => {
                buf.extend_from_slice(req.filename.as_bytes());
                buf.push(0);
                buf.extend_from_slice(req.mode.as_str().as_bytes());
                buf.push(0);
                push_options(&mut buf, &req.options);
            }
            Packet::Data { block, data } => {
                buf.extend_from_slice(&block.to_be_bytes());
                buf.extend_from_slice(data);
            }
            Packet::Ack { block } => {
                buf.extend_from_slice(&block.to_be_bytes());
            }
            Packet::Error { code, message } => {
                buf.extend_from_slice(&code.as_u16().to_be_bytes());
                buf.extend_from_slice(message.as_bytes());
                buf.push(0);
            }
            Packet::Oack { options } => {
                push_options(&mut buf, options);
            }
        }
        buf
    }

    /// The wire opcode of this packet.
    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Request(req) => req.kind.opcode(),
            Packet::Data { .. } => Opcode::Data,
            Packet::Ack { .. } => Opcode::Ack,
            Packet::Error { .. } => Opcode::Error,
            Packet::Oack { .. } => Opcode::Oack,
        }
    }

    /// Build an ERROR packet for a code with a custom message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Packet {
        Packet::Error {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Request(req) => {
                write!(f, "{} {} {}", req.kind.opcode(), req.filename, req.mode)?;
                for (name, value) in &req.options {
                    write!(f, " {}={}", name, value)?;
                }
                Ok(())
            }
            Packet::Data { block, data } => write!(f, "DATA {} ({} bytes)", block, data.len()),
            Packet::Ack { block } => write!(f, "ACK {}", block),
            Packet::Error { code, message } => write!(f, "ERROR {} {}", code.as_u16(), message),
            Packet::Oack { options } => {
                write!(f, "OACK")?;
                for (name, value) in options {
                    write!(f, " {}={}", name, value)?;
                }
                Ok(())
            }
        }
    }
}
