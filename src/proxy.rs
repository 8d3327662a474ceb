use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dispatch::{ConnectionHandler, DispatchMode, Dispatcher};
use crate::error::ProxyError;
use crate::events::{Event, EventSink, TracingSink};
use crate::security::PolicyEngine;

/// A single-destination TCP relay with a `start`/`stop` lifecycle.
///
/// The configuration is validated and the policy compiled in [`Proxy::new`];
/// nothing about either changes afterwards. Each `start` opens a fresh run
/// with its own shutdown token, so Start -> Stop -> Start is two independent
/// runs on the same instance.
pub struct Proxy {
    config: Config,
    handler: Arc<ConnectionHandler>,
    mode: DispatchMode,
    sink: Arc<dyn EventSink>,
    shutdown: Option<CancellationToken>,
    local_addr: Option<SocketAddr>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Proxy {
    /// Builds a proxy that reports through [`TracingSink`].
    pub fn new(config: Config) -> Result<Self, ProxyError> {
        Self::with_sink(config, Arc::new(TracingSink))
    }

    pub fn with_sink(config: Config, sink: Arc<dyn EventSink>) -> Result<Self, ProxyError> {
        config.validate()?;
        let policy = PolicyEngine::new(&config.policies)?;
        let handler = Arc::new(ConnectionHandler::new(&config, policy, Arc::clone(&sink)));
        let mode = DispatchMode::from_config(&config.dispatch);

        Ok(Self {
            config,
            handler,
            mode,
            sink,
            shutdown: None,
            local_addr: None,
            dispatcher: None,
        })
    }

    /// Binds the listen endpoint and spawns the accept loop. Returns as soon
    /// as the socket is bound. After a `stop`, waits for the previous accept
    /// loop to release its listener first.
    pub async fn start(&mut self) -> Result<(), ProxyError> {
        if self.shutdown.is_some() {
            return Err(ProxyError::AlreadyRunning);
        }
        // The previous run's accept loop still owns its listener until it
        // observes the cancelled token.
        if let Some(previous) = self.dispatcher.take() {
            let _ = previous.await;
        }

        let bind_error = |source| ProxyError::Bind {
            addr: self.config.from.clone(),
            source,
        };
        let listener = TcpListener::bind(&self.config.from)
            .await
            .map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let shutdown = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            listener,
            Arc::clone(&self.handler),
            shutdown.clone(),
            self.mode,
        );
        self.dispatcher = Some(tokio::spawn(dispatcher.run()));
        self.shutdown = Some(shutdown);
        self.local_addr = Some(local_addr);

        self.sink.emit(Event::ProxyStarted {
            listen: local_addr,
            destination: self.config.to.clone(),
        });
        Ok(())
    }

    /// Signals shutdown without waiting. The accept loop exits and drops the
    /// listener; in-flight relays unwind on their own.
    pub fn stop(&mut self) -> Result<(), ProxyError> {
        let shutdown = self.shutdown.take().ok_or(ProxyError::AlreadyStopped)?;
        self.sink.emit(Event::ProxyStopped);
        shutdown.cancel();
        Ok(())
    }

    /// Stops the proxy and waits for the accept loop (and any workers) to
    /// finish.
    pub async fn shutdown(mut self) -> Result<(), ProxyError> {
        let result = self.stop();
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.await;
        }
        result
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shutdown.is_some()
    }

    /// Address the listener is bound to, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.cancel();
        }
    }
}
