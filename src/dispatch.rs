//! Accept loop and connection routing.
//!
//! Every accepted socket goes through [`ConnectionHandler::handle`]: policy,
//! then dial, then relay. The [`Dispatcher`] either spawns one task per
//! connection or feeds a fixed [`WorkerPool`] through a bounded queue.

use std::{
    io,
    net::SocketAddr,
    num::NonZeroUsize,
    sync::Arc,
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{Mutex, mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{Config, DispatchConfig, DispatchKind, Monitor};
use crate::events::{Direction, Event, EventSink};
use crate::relay::{RelayReport, relay};
use crate::security::{Decision, PolicyEngine};
use crate::socket::{SocketOptions, apply_socket_options, dial};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);
const QUEUE_PER_WORKER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// One task per accepted connection.
    Direct,
    /// `workers` long-lived tasks sharing a queue of `queue` pending
    /// connections.
    Pool { workers: usize, queue: usize },
}

impl DispatchMode {
    #[must_use]
    pub fn from_config(config: &DispatchConfig) -> Self {
        match config.mode {
            DispatchKind::Direct => Self::Direct,
            DispatchKind::Pool => {
                let workers = config
                    .workers
                    .filter(|&n| n > 0)
                    .unwrap_or_else(available_workers);
                let queue = config
                    .queue
                    .filter(|&n| n > 0)
                    .unwrap_or(workers * QUEUE_PER_WORKER);
                Self::Pool { workers, queue }
            }
        }
    }
}

fn available_workers() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

#[derive(Debug)]
pub enum ConnectionOutcome {
    Denied(Decision),
    DialFailed(io::Error),
    Relayed(RelayReport),
}

/// Everything needed to serve one accepted connection. Shared read-only
/// between all handling tasks.
pub struct ConnectionHandler {
    policy: PolicyEngine,
    destination: String,
    dial_timeout: Duration,
    copy_timeout: Option<Duration>,
    socket_options: SocketOptions,
    monitor: Monitor,
    sink: Arc<dyn EventSink>,
}

impl ConnectionHandler {
    pub fn new(config: &Config, policy: PolicyEngine, sink: Arc<dyn EventSink>) -> Self {
        Self {
            policy,
            destination: config.to.clone(),
            dial_timeout: config.policies.dial_timeout(),
            copy_timeout: config.policies.copy_timeout(),
            socket_options: SocketOptions::from(&config.policies),
            monitor: config.monitor,
            sink,
        }
    }

    #[must_use]
    pub fn socket_options(&self) -> SocketOptions {
        self.socket_options
    }

    #[must_use]
    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    /// Applies the policy to `peer`, then dials the destination and relays
    /// until either side is done or `shutdown` fires. A denied peer is
    /// closed without ever dialing.
    #[tracing::instrument(skip(self, inbound, shutdown), fields(peer = %peer))]
    pub async fn handle(
        &self,
        inbound: TcpStream,
        peer: SocketAddr,
        shutdown: &CancellationToken,
    ) -> ConnectionOutcome {
        let decision = self.policy.decide(peer.ip());
        self.sink.emit(Event::PolicyDecision { peer, decision });
        if !decision.is_allowed() {
            drop(inbound);
            return ConnectionOutcome::Denied(decision);
        }

        debug!(destination = %self.destination, "Attempting to connect to destination");
        let outbound = match dial(&self.destination, self.dial_timeout).await {
            Ok(outbound) => outbound,
            Err(e) => {
                self.sink.emit(Event::DialFailed {
                    peer,
                    destination: self.destination.clone(),
                    error: e.to_string(),
                });
                return ConnectionOutcome::DialFailed(e);
            }
        };
        if let Err(e) = apply_socket_options(&outbound, self.socket_options) {
            debug!(error = %e, "Failed to set destination socket options");
        }

        let report = relay(inbound, outbound, shutdown, self.copy_timeout).await;
        self.report(peer, &report);
        ConnectionOutcome::Relayed(report)
    }

    fn report(&self, peer: SocketAddr, report: &RelayReport) {
        for (direction, enabled) in [
            (Direction::Inbound, self.monitor.from),
            (Direction::Outbound, self.monitor.to),
        ] {
            if enabled {
                self.sink.emit(Event::CopyCompleted {
                    peer,
                    direction,
                    bytes: report.bytes(direction),
                    error: report.error(direction).map(ToString::to_string),
                });
            }
        }

        self.sink.emit(Event::ConnectionClosed {
            peer,
            bytes_in: report.bytes_in,
            bytes_out: report.bytes_out,
        });
    }
}

/// Source of inbound connections for a [`Dispatcher`].
pub trait Accept: Send + Sync + 'static {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Accept for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

/// Owns the listener for one proxy run and routes accepted sockets until the
/// shutdown token fires.
pub struct Dispatcher<L = TcpListener> {
    listener: L,
    handler: Arc<ConnectionHandler>,
    shutdown: CancellationToken,
    mode: DispatchMode,
}

impl<L: Accept> Dispatcher<L> {
    pub fn new(
        listener: L,
        handler: Arc<ConnectionHandler>,
        shutdown: CancellationToken,
        mode: DispatchMode,
    ) -> Self {
        Self {
            listener,
            handler,
            shutdown,
            mode,
        }
    }

    pub async fn run(self) {
        let pool = match self.mode {
            DispatchMode::Direct => None,
            DispatchMode::Pool { workers, queue } => Some(WorkerPool::start(
                workers,
                queue,
                Arc::clone(&self.handler),
                self.shutdown.clone(),
            )),
        };
        let sink = Arc::clone(self.handler.sink());
        let options = self.handler.socket_options();

        loop {
            let accepted = tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    sink.emit(Event::AcceptFailed {
                        error: e.to_string(),
                    });
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };
            sink.emit(Event::Accepted { peer });

            if let Err(e) = apply_socket_options(&stream, options) {
                debug!(peer = %peer, error = %e, "Failed to set inbound socket options");
            }

            if let Some(pool) = &pool {
                let submitted = tokio::select! {
                    () = self.shutdown.cancelled() => break,
                    submitted = pool.submit(Job { stream, peer }) => submitted,
                };
                if !submitted {
                    break;
                }
            } else {
                let handler = Arc::clone(&self.handler);
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    handler.handle(stream, peer, &shutdown).await;
                });
            }
        }

        drop(self.listener);
        if let Some(mut pool) = pool {
            pool.stop();
            pool.join().await;
        }
        debug!("Dispatcher stopped");
    }
}

/// An accepted connection waiting for a worker.
pub struct Job {
    pub stream: TcpStream,
    pub peer: SocketAddr,
}

/// Fixed set of workers pulling [`Job`]s off one bounded queue. Each worker
/// has its own quit signal.
pub struct WorkerPool {
    jobs: mpsc::Sender<Job>,
    quit: Vec<oneshot::Sender<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        size: usize,
        queue: usize,
        handler: Arc<ConnectionHandler>,
        shutdown: CancellationToken,
    ) -> Self {
        let (jobs, receiver) = mpsc::channel(queue.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let size = size.max(1);

        let mut quit = Vec::with_capacity(size);
        let mut workers = Vec::with_capacity(size);
        for id in 0..size {
            let (quit_tx, quit_rx) = oneshot::channel();
            quit.push(quit_tx);
            workers.push(tokio::spawn(worker(
                id,
                Arc::clone(&receiver),
                quit_rx,
                Arc::clone(&handler),
                shutdown.clone(),
            )));
        }
        debug!(workers = size, queue, "Worker pool started");

        Self {
            jobs,
            quit,
            workers,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues a job, waiting while the queue is full. Returns `false` once
    /// every worker is gone.
    pub async fn submit(&self, job: Job) -> bool {
        self.jobs.send(job).await.is_ok()
    }

    /// Sends one quit signal per worker. Workers busy with a connection pick
    /// it up when they finish.
    pub fn stop(&mut self) {
        for quit in self.quit.drain(..) {
            let _ = quit.send(());
        }
    }

    pub async fn join(self) {
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn worker(
    id: usize,
    jobs: Arc<Mutex<mpsc::Receiver<Job>>>,
    mut quit: oneshot::Receiver<()>,
    handler: Arc<ConnectionHandler>,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = &mut quit => break,
            job = next_job(&jobs) => job,
        };
        let Some(job) = job else { break };

        debug!(worker = id, peer = %job.peer, "Worker picked up connection");
        handler.handle(job.stream, job.peer, &shutdown).await;
    }
    debug!(worker = id, "Worker stopped");
}

async fn next_job(jobs: &Mutex<mpsc::Receiver<Job>>) -> Option<Job> {
    jobs.lock().await.recv().await
}
