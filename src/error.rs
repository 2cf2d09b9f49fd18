//! Unified error type.

use std::net::SocketAddr;

/// The error type returned by applyd's fallible infrastructure operations.
///
/// Call-level failures (bad token, handler fault, timeout) are expressed as
/// [`Status`](crate::Status) values, not as `Error`s. This type surfaces
/// failures that stop the process from serving at all: binding the listener,
/// loading configuration, composing the chain.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid socket address `{0}`")]
    Address(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config {path}: {reason}")]
    Config { path: String, reason: String },

    #[error("interceptor chain: {requested} stages registered, limit is {max}")]
    TooManyStages { requested: usize, max: usize },

    #[error("logging: {0}")]
    Logging(String),
}

impl Error {
    pub(crate) fn bind(addr: SocketAddr, source: std::io::Error) -> Self {
        Self::Bind { addr: addr.to_string(), source }
    }
}
