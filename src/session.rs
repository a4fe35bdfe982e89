//! Session wiring and the error model (C10), plus the path resolver (C8).
//!
//! `Session` is the seam every component above the request engine reports
//! through: command handlers never see a raw frame or `io::Error`, only
//! `SftpError`.
use std::fmt;
use std::sync::Arc;

use crate::attrs::AttrCodec;
use crate::proto::StatusCode;
use crate::request::RequestEngine;

/// The six error kinds of spec.md §7, each carrying enough context to print
/// a useful message. Implements `std::error::Error`, so it converts into
/// `color_eyre::eyre::Report` via `?` the same way the teacher crate's
/// `ProtocolError` does.
#[derive(Debug)]
pub enum SftpError {
    /// Unexpected EOF or write failure on the stream. Fatal.
    TransportFatal(String),
    /// Unexpected kind, id mismatch, truncated frame, unsupported version. Fatal.
    ProtocolFatal(String),
    /// A STATUS with non-OK code. Recoverable; the session continues.
    RemoteError { code: StatusCode, message: String },
    /// A requested flag cannot be expressed in the negotiated version.
    EmulationError(String),
    /// A local filesystem error during GET/PUT.
    LocalIoError(std::io::Error),
    /// Unknown command or wrong arity.
    UsageError(String),
}

impl SftpError {
    /// Fatal errors terminate the whole session; everything else is
    /// reported and the REPL continues (spec.md §7).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TransportFatal(_) | Self::ProtocolFatal(_))
    }
}

impl fmt::Display for SftpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::TransportFatal(msg) => write!(f, "transport error: {msg}"),
            Self::ProtocolFatal(msg) => write!(f, "protocol error: {msg}"),
            Self::RemoteError { code, message } => write!(f, "{message} ({code})"),
            Self::EmulationError(msg) => write!(f, "cannot emulate in this protocol version: {msg}"),
            Self::LocalIoError(e) => write!(f, "local I/O error: {e}"),
            Self::UsageError(msg) => write!(f, "usage error: {msg}"),
        }
    }
}

impl std::error::Error for SftpError {}

impl From<std::io::Error> for SftpError {
    fn from(e: std::io::Error) -> Self {
        Self::LocalIoError(e)
    }
}

/// Informational server identity parsed from the `vendor-id` extension, if
/// the server sent one.
#[derive(Debug, Clone, Default)]
pub struct ServerIdentity {
    pub vendor: String,
    pub name: String,
    pub version: String,
    pub build: u64,
}

/// Tuning knobs and toggles a user sets on the command line or mid-session
/// (spec.md §3).
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub buffer_size: u32,
    pub max_in_flight: usize,
    pub stop_on_error: bool,
    pub progress_enabled: bool,
    pub quirk_reverse_symlink: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            buffer_size: 32 * 1024,
            max_in_flight: 8,
            stop_on_error: false,
            progress_enabled: true,
            quirk_reverse_symlink: false,
        }
    }
}

/// The live session: negotiated protocol state plus the request engine
/// every operation goes through.
pub struct Session {
    pub engine: Arc<RequestEngine>,
    pub protocol_version: u32,
    pub attr_codec: AttrCodec,
    pub newline: Vec<u8>,
    pub server_identity: Option<ServerIdentity>,
    pub cwd: String,
    pub text_mode: bool,
    pub options: SessionOptions,
}

impl Session {
    pub fn new(
        engine: Arc<RequestEngine>,
        protocol_version: u32,
        newline: Vec<u8>,
        server_identity: Option<ServerIdentity>,
        cwd: String,
        options: SessionOptions,
    ) -> Self {
        Self {
            engine,
            protocol_version,
            attr_codec: AttrCodec::for_version(protocol_version),
            newline,
            server_identity,
            cwd,
            text_mode: false,
            options,
        }
    }

    /// Resolve a possibly-relative name against `cwd` (C8). Never touches
    /// the wire; REALPATH is explicit (spec.md §4.8).
    pub fn resolve(&self, name: &str) -> String {
        if name.starts_with('/') {
            name.to_string()
        } else if self.cwd.ends_with('/') {
            format!("{}{}", self.cwd, name)
        } else {
            format!("{}/{}", self.cwd, name)
        }
    }
}
