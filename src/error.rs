//! Error taxonomy for connection establishment and teardown.
//!
//! Precondition violations (calling a public operation in a state that
//! forbids it) are not part of this enum: per the design, those are
//! programmer errors and surface as panics via `assert!`, not as a
//! recoverable `Result`.

use std::fmt;
use std::io;
use std::sync::Arc;

/// Errors returned by [`crate::connection::Connection`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The remote endpoint (or configured proxy) could not be resolved
    /// to a usable address.
    #[error("address error: {0}")]
    Address(String),

    /// The TCP connect itself failed (refused, reset, timed out).
    #[error("tcp error: {0}")]
    Tcp(#[source] Arc<io::Error>),

    /// The TLS client stream could not be constructed (bad config, no
    /// backend available).
    #[error("tls init error: {0}")]
    TlsInit(String),

    /// The TLS handshake failed, including unrecovered certificate
    /// rejection.
    #[error("tls error: {0}")]
    Tls(String),

    /// The operation was cancelled via its cancellation token.
    #[error("operation cancelled")]
    Cancelled,
}

impl ConnectionError {
    pub(crate) fn tcp(err: io::Error) -> Self {
        ConnectionError::Tcp(Arc::new(err))
    }
}

/// A contract violation: a public operation invoked outside the states it
/// allows. Per the design this is a fatal precondition failure, not a
/// recoverable error — callers get a panic with a descriptive message
/// rather than a `Result::Err` they could paper over.
#[track_caller]
pub(crate) fn usage_violation(message: impl fmt::Display) -> ! {
    panic!("htconn-core: usage error: {message}");
}
