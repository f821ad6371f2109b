//! Errors from the apphost protocol layer.

use apphost_types::{Identity, IdentityError, ResultCode};
use std::time::Duration;
use thiserror::Error;

/// Errors from the apphost protocol layer.
///
/// Low-level variants (I/O, framing, result codes) are wrapped by the
/// operation-scoped variants as they travel up, so the chain reachable
/// through [`std::error::Error::source`] names both the operation and the
/// original cause.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Cannot connect to local daemon at {addr}: {source}")]
    DaemonUnreachable {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Result(ResultCode),
    #[error("Field too long: {len} bytes (max {max})")]
    FieldTooLong { len: usize, max: usize },
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error(transparent)]
    InvalidIdentity(#[from] IdentityError),
    #[error("Invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("Unsupported address: {0}")]
    UnsupportedAddress(String),
    #[error("Port closed")]
    PortClosed,
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Handler failed: {0}")]
    Handler(String),
    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("Cannot register port {port}: {source}")]
    Register {
        port: String,
        #[source]
        source: Box<WireError>,
    },
    #[error("Cannot query port {port} on {identity}: {source}")]
    Query {
        port: String,
        identity: Identity,
        #[source]
        source: Box<WireError>,
    },
    #[error("Cannot resolve {name}: {source}")]
    Resolve {
        name: String,
        #[source]
        source: Box<WireError>,
    },
    #[error("Port {port} failed: {source}")]
    Port {
        port: String,
        #[source]
        source: Box<WireError>,
    },
    #[error("Cannot accept {query} from {caller}: {source}")]
    Accept {
        caller: Identity,
        query: String,
        #[source]
        source: Box<WireError>,
    },
    #[error("Cannot reject {query} from {caller}: {source}")]
    Reject {
        caller: Identity,
        query: String,
        #[source]
        source: Box<WireError>,
    },
}

impl WireError {
    /// Wrap an application failure raised inside a handler.
    pub fn handler(err: impl std::fmt::Display) -> Self {
        WireError::Handler(err.to_string())
    }

    /// The result code carried by this error or by any error it wraps.
    pub fn result_code(&self) -> Option<ResultCode> {
        match self {
            WireError::Result(code) => Some(*code),
            WireError::Register { source, .. }
            | WireError::Query { source, .. }
            | WireError::Resolve { source, .. }
            | WireError::Port { source, .. }
            | WireError::Accept { source, .. }
            | WireError::Reject { source, .. } => source.result_code(),
            _ => None,
        }
    }

    /// Innermost error of an operation-scoped chain.
    pub fn root_cause(&self) -> &WireError {
        match self {
            WireError::Register { source, .. }
            | WireError::Query { source, .. }
            | WireError::Resolve { source, .. }
            | WireError::Port { source, .. }
            | WireError::Accept { source, .. }
            | WireError::Reject { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Alias for Result with WireError.
pub type WireResult<T> = Result<T, WireError>;
