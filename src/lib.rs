//! TCP Relay
//!
//! Accepts TCP connections on one endpoint, checks each peer against IP
//! allow/deny policies, and relays permitted connections byte-for-byte to a
//! single destination.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod proxy;
pub mod relay;
pub mod security;
pub mod socket;

// Re-export commonly used types and functions
pub use config::{Config, LogConfig, Monitor, Policies, load_config, validate_endpoint};
pub use dispatch::{Accept, ConnectionHandler, ConnectionOutcome, DispatchMode, Dispatcher, Job, WorkerPool};
pub use error::ProxyError;
pub use events::{Direction, Event, EventSink, TracingSink};
pub use proxy::Proxy;
pub use relay::{BUFFER_SIZE, RelayReport, relay};
pub use security::{Decision, PolicyEngine, Rule, Verdict};
