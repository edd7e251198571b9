//! Broker error types.
//!
//! One enum covers the whole crate so that retryability can be decided in a
//! single place: only Google API responses with a 5xx status are worth
//! retrying, everything else surfaces at the call site that triggered it.

use std::sync::Arc;

use thiserror::Error;

/// Errors produced by the broker.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed instance connection name.
    #[error("invalid instance connection name {0:?}: expected project:region:name")]
    InvalidInstanceName(String),

    /// The instance is already proxied under a different authentication mode.
    #[error("instance {0} is already active with a different authentication mode")]
    AuthModeConflict(String),

    /// Credential material could not be loaded or parsed.
    #[error("credentials: {0}")]
    Credentials(String),

    /// An OAuth token exchange failed before producing a usable token.
    #[error("token exchange: {0}")]
    TokenExchange(String),

    /// A Google API endpoint answered with a non-2xx status.
    #[error("{endpoint} returned HTTP {status}: {message}")]
    Api {
        /// Which endpoint answered.
        endpoint: &'static str,
        /// The HTTP status code.
        status: u16,
        /// Message from the Google error envelope, or the raw body.
        message: String,
    },

    /// Transport-level HTTP failure (DNS, connect, body read).
    #[error("http transport: {0}")]
    Http(#[from] reqwest::Error),

    /// TLS configuration or handshake failure.
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    /// Certificate or key material could not be produced or parsed.
    #[error("certificate: {0}")]
    Certificate(String),

    /// Socket-level failure.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    /// The caller's cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,

    /// A startup failure shared with every waiter of the same instance.
    #[error("proxy startup failed: {0}")]
    Startup(Arc<Error>),
}

impl Error {
    /// Whether the failed operation is worth retrying under backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Api { status, .. } => *status >= 500,
            Error::Startup(inner) => inner.is_retryable(),
            _ => false,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
