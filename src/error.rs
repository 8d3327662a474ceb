use std::io;

use thiserror::Error;

/// Errors surfaced by the relay's lifecycle API.
///
/// Per-connection failures (dial, copy) never show up here; they stay inside
/// the connection's task and are reported through events and
/// [`ConnectionOutcome`](crate::dispatch::ConnectionOutcome).
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid {role} endpoint {endpoint:?}: expected host:port")]
    InvalidEndpoint {
        role: &'static str,
        endpoint: String,
    },

    #[error("invalid entry {entry:?} in {list} list: expected an IP address, CIDR or \"*\"")]
    InvalidPolicyEntry { list: &'static str, entry: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("proxy is already running")]
    AlreadyRunning,

    #[error("proxy already stopped")]
    AlreadyStopped,
}
