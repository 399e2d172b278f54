//! Stable error vocabulary shared by the session, the stream adapter and the acceptor.
//!
//! Transport errors are folded into four classes so callers never need to match on
//! quinn types:
//!
//! | class    | `ErrorKind`        |
//! |----------|--------------------|
//! | closed   | `NotConnected`     |
//! | reset    | `ConnectionReset`  |
//! | timeout  | `TimedOut`         |
//! | canceled | `Interrupted`      |

use std::io::{Error, ErrorKind};

pub fn closed_error(message: &str) -> Error {
    Error::new(ErrorKind::NotConnected, message.to_string())
}

pub fn canceled_error() -> Error {
    Error::new(ErrorKind::Interrupted, "context canceled")
}

/// Whether an error only reports an orderly close or an outer cancellation.
pub fn is_closed_or_canceled(err: &Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::NotConnected
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::Interrupted
    )
}

pub fn from_connection_error(err: quinn::ConnectionError) -> Error {
    match err {
        quinn::ConnectionError::ApplicationClosed(ref close) => {
            Error::new(ErrorKind::NotConnected, format!("connection closed: {close}"))
        }
        quinn::ConnectionError::ConnectionClosed(ref close) => {
            Error::new(ErrorKind::NotConnected, format!("connection closed: {close}"))
        }
        quinn::ConnectionError::LocallyClosed => closed_error("connection closed locally"),
        quinn::ConnectionError::Reset => Error::new(ErrorKind::ConnectionReset, "connection reset"),
        quinn::ConnectionError::TimedOut => Error::new(ErrorKind::TimedOut, "connection timed out"),
        e => Error::other(e),
    }
}

/// Maps an error surfaced by a quinn stream (already converted to io::Error by quinn)
/// into the closed/reset/timeout classes, dropping the transport-specific payload.
pub fn wrap_quic_error(err: Error) -> Error {
    match err.kind() {
        ErrorKind::NotConnected
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof => closed_error("stream closed"),
        ErrorKind::ConnectionReset => Error::new(ErrorKind::ConnectionReset, "stream reset"),
        ErrorKind::TimedOut => Error::new(ErrorKind::TimedOut, "stream timed out"),
        _ => err,
    }
}
