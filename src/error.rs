//! Session error taxonomy shared by every bridge component

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Everything that can abort a mount session. Each variant maps to exactly
/// one failure class so callers can tell "asked to stop" apart from
/// "something broke" without string matching.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Bad magic, unexpected request type, or an inconsistent/oversized
    /// length field. Always fatal to the session.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The peer closed the connection. Only the I/O-control-connection read
    /// path treats this as a valid signal; everywhere else it is converted
    /// into `Communication`.
    #[error("peer closed the connection")]
    PeerClosed,

    /// Timeout, reset, or any other transport-level send/receive failure.
    #[error("communication failure: {context}: {source}")]
    Communication {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Non-zero status in an acknowledgement header from the daemon.
    #[error("negative acknowledgement from daemon (status {status})")]
    NegativeAck { status: i32 },

    /// Explicit error report carried inside a peer message.
    #[error("peer reported error {code}: {message}")]
    ReportedError { code: i32, message: String },

    /// Correlation fields on a gateway reply do not match the request.
    #[error("transaction id mismatch: sent {sent}, reply carried {received}")]
    TransactionMismatch { sent: u64, received: u64 },

    /// Pending-transfer table full or too many I/O control connections.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// File-sequence number out of order while writing.
    #[error("file sequence violation: expected {expected}, got {got}")]
    SequenceViolation { expected: i32, got: i32 },

    /// The external graceful-stop flag was observed.
    #[error("session cancelled by graceful stop request")]
    Cancelled,
}

impl BridgeError {
    /// Wrap an I/O error with the operation that failed.
    pub fn comm(context: impl Into<String>, source: io::Error) -> Self {
        BridgeError::Communication {
            context: context.into(),
            source,
        }
    }

    /// True when the error kind means the transport timed out rather than
    /// the peer misbehaving.
    pub fn is_timeout(&self) -> bool {
        match self {
            BridgeError::Communication { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}
