use socket2::{SockRef, TcpKeepalive};
use std::{io, time::Duration};
use tokio::{net::TcpStream, time::timeout};

use crate::config::Policies;

const KEEPALIVE_TIME: Duration = Duration::from_secs(60);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Per-socket options applied to both ends of a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    pub no_delay: bool,
    pub keep_alive: bool,
}

impl From<&Policies> for SocketOptions {
    fn from(policies: &Policies) -> Self {
        Self {
            no_delay: !policies.nagle,
            keep_alive: policies.keep_alive,
        }
    }
}

pub fn apply_socket_options(stream: &TcpStream, options: SocketOptions) -> io::Result<()> {
    stream.set_nodelay(options.no_delay)?;

    if options.keep_alive {
        let keepalive = TcpKeepalive::new()
            .with_time(KEEPALIVE_TIME)
            .with_interval(KEEPALIVE_INTERVAL);
        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

/// Connects to `destination`, giving up after `dial_timeout`.
pub async fn dial(destination: &str, dial_timeout: Duration) -> io::Result<TcpStream> {
    timeout(dial_timeout, TcpStream::connect(destination))
        .await
        .unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {destination} timed out after {dial_timeout:?}"),
            ))
        })
}
