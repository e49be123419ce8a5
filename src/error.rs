use std::io;
use std::net::IpAddr;

use thiserror::Error;

/// Errors surfaced by the measurement core.
///
/// Timeouts are not errors: a probe that receives no reply produces a
/// `PingResult` with `ResultKind::NoReply`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The hostname has no address for the requested family.
    #[error("no address of the requested family found for {0}")]
    Resolution(String),

    /// A socket create/send/recv call failed structurally. Fatal to the
    /// affected engine.
    #[error("socket operation failed: {0}")]
    Socket(#[from] io::Error),

    /// Neither a raw nor a datagram ICMP socket could be opened.
    #[error("ICMP sockets unavailable - run with elevated privileges or enable unprivileged ICMP")]
    PermissionDenied,

    /// A received datagram could not be parsed as a recognised ICMP message.
    /// Non-fatal; the receiver counts and discards these.
    #[error("malformed ICMP packet")]
    InvalidPacket,

    /// The address family does not match the engine's IP version.
    #[error("address family mismatch for {0}")]
    AddressFamily(IpAddr),

    /// The operation is not permitted in the engine's current state.
    #[error("invalid engine state: {0}")]
    InvalidState(&'static str),

    /// The operation was cancelled before it produced a result.
    #[error("operation cancelled")]
    Cancelled,
}

impl EngineError {
    /// Transient socket conditions are retried inside the workers rather
    /// than surfaced.
    pub fn is_transient(err: &io::Error) -> bool {
        matches!(
            err.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
