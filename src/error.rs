//! Error types for the DNS monitor.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Main error type for monitor operations that reach the command line.
#[derive(Debug, Error)]
pub enum Error {
    #[error("activation failed: {0}")]
    Activation(#[from] ActivationError),

    #[error("block list error: {0}")]
    Blocklist(#[from] BlocklistError),

    #[error("invalid address {value:?}: {source}")]
    InvalidAddress {
        value: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Structural violations found while decoding a DNS message.
///
/// Each variant carries the offset at which decoding stopped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("truncated message at offset {offset}")]
    Truncated { offset: usize },

    #[error("malformed name at offset {offset}: {reason}")]
    MalformedName { offset: usize, reason: &'static str },

    #[error("compression pointer at offset {offset} does not point backwards")]
    PointerCycle { offset: usize },

    #[error("{section} count {expected} exceeds records present (found {found})")]
    RecordCountMismatch {
        section: &'static str,
        expected: u16,
        found: u16,
    },
}

/// Fieldless form of [`ParseError`] carried by rejected flow records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ParseErrorKind {
    Truncated,
    MalformedName,
    PointerCycle,
    RecordCountMismatch,
}

impl ParseError {
    pub fn kind(&self) -> ParseErrorKind {
        match self {
            ParseError::Truncated { .. } => ParseErrorKind::Truncated,
            ParseError::MalformedName { .. } => ParseErrorKind::MalformedName,
            ParseError::PointerCycle { .. } => ParseErrorKind::PointerCycle,
            ParseError::RecordCountMismatch { .. } => ParseErrorKind::RecordCountMismatch,
        }
    }
}

/// Failures while resolving a process identity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessLookupError {
    #[error("process {0} not found")]
    NotFound(u32),

    #[error("process {pid} partially resolved (missing: {})", .missing.join(", "))]
    PartiallyResolved {
        pid: u32,
        missing: Vec<&'static str>,
    },
}

/// Failures of an activation or deactivation request.
#[derive(Debug, Error)]
pub enum ActivationError {
    #[error("failed to bind interceptor on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("control channel error: {0}")]
    Control(#[source] io::Error),

    #[error("no reply from monitor at {0}")]
    Timeout(SocketAddr),

    #[error("monitor refused request: {0}")]
    Refused(String),
}

/// Failures while loading a block list.
#[derive(Debug, Error)]
pub enum BlocklistError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;
