//! Structured events emitted by the relay.
//!
//! The core never writes logs on its own; it hands every noteworthy moment to
//! an [`EventSink`] supplied at construction. [`TracingSink`] forwards them to
//! `tracing`, which is what the binary uses.

use std::{fmt, net::SocketAddr};
use tracing::{debug, error, info, warn};

use crate::security::{Decision, Verdict};

/// Direction of one half of a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// inbound peer -> destination
    Inbound,
    /// destination -> inbound peer
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ProxyStarted {
        listen: SocketAddr,
        destination: String,
    },
    ProxyStopped,
    AcceptFailed {
        error: String,
    },
    Accepted {
        peer: SocketAddr,
    },
    PolicyDecision {
        peer: SocketAddr,
        decision: Decision,
    },
    DialFailed {
        peer: SocketAddr,
        destination: String,
        error: String,
    },
    CopyCompleted {
        peer: SocketAddr,
        direction: Direction,
        bytes: u64,
        error: Option<String>,
    },
    ConnectionClosed {
        peer: SocketAddr,
        bytes_in: u64,
        bytes_out: u64,
    },
}

/// Receiver for relay events. Called from many tasks at once.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Renders events through the `tracing` macros.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        match event {
            Event::ProxyStarted {
                listen,
                destination,
            } => info!(listen_addr = %listen, destination = %destination, "Started proxy"),
            Event::ProxyStopped => warn!("Stopping proxy"),
            Event::AcceptFailed { error } => error!(error = %error, "Failed to accept connection"),
            Event::Accepted { peer } => debug!(peer = %peer, "Accepted connection"),
            Event::PolicyDecision { peer, decision } => match decision.verdict {
                Verdict::Allow => info!(peer = %peer, rule = %decision.rule, "Connection allowed"),
                Verdict::Deny => warn!(peer = %peer, rule = %decision.rule, "Failed to meet policies"),
            },
            Event::DialFailed {
                peer,
                destination,
                error,
            } => warn!(
                peer = %peer,
                destination = %destination,
                error = %error,
                "Failed to connect to destination"
            ),
            Event::CopyCompleted {
                peer,
                direction,
                bytes,
                error,
            } => match error {
                Some(error) => info!(
                    peer = %peer,
                    direction = %direction,
                    bytes,
                    error = %error,
                    "Copy finished with error"
                ),
                None => info!(peer = %peer, direction = %direction, bytes, "Copy finished"),
            },
            Event::ConnectionClosed {
                peer,
                bytes_in,
                bytes_out,
            } => info!(peer = %peer, bytes_in, bytes_out, "Processed connection"),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{Event, EventSink};
    use std::sync::Mutex;

    /// Keeps every event for later assertions.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingSink {
        pub fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }

        pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
            self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: Event) {
            self.events.lock().unwrap().push(event);
        }
    }
}
