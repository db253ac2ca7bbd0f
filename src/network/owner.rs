// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::oneshot;
use tokio::time;
use tracing::{debug, error, info, warn};

use super::connection::Connection;
use super::frame::{DefaultProtocol, FrameProtocol, WireMessage};
use super::handler::ConnectionHandler;
use super::io_worker::{select_least_loaded, IoWorker};
use super::state::ConnectionState;
use crate::utils::{CrossThreadQueue, ShutdownSignal};
use crate::{AppError, AppResult, NetworkConfig};

/// Resolves once the dial finished: the connected connection, or `None` on failure.
///
/// Can be awaited, polled with `try_recv` or waited on with `blocking_recv`.
pub type PendingConnection = oneshot::Receiver<Option<Arc<Connection>>>;

/// Work deferred to the owner thread.
pub(crate) enum OwnerTask {
    Connected(Arc<Connection>),
    Disconnected(Arc<Connection>),
    Deferred(Box<dyn FnOnce() + Send>),
}

/// Everything the I/O workers need to reach the owner. All cross-thread traffic into
/// the owner goes through the two queues.
pub(crate) struct OwnerShared {
    tasks: CrossThreadQueue<OwnerTask>,
    messages: CrossThreadQueue<(Arc<Connection>, WireMessage)>,
    live_connections: AtomicUsize,
    workers: Vec<Arc<IoWorker>>,
    protocol: Arc<dyn FrameProtocol>,
    config: NetworkConfig,
    closing: ShutdownSignal,
}

impl OwnerShared {
    pub(crate) fn push_task(&self, task: OwnerTask) {
        self.tasks.enqueue(task);
    }

    pub(crate) fn push_message(&self, connection: Arc<Connection>, message: WireMessage) {
        self.messages.enqueue((connection, message));
    }

    pub(crate) fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub(crate) fn protocol(&self) -> &Arc<dyn FrameProtocol> {
        &self.protocol
    }

    pub(crate) fn closing(&self) -> &ShutdownSignal {
        &self.closing
    }

    pub(crate) fn increase_live_connections(&self) {
        let live = self.live_connections.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("current live connection count {}", live);
    }

    pub(crate) fn decrease_live_connections(&self) -> usize {
        self.live_connections.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn live_connections(&self) -> usize {
        self.live_connections.load(Ordering::Acquire)
    }

    pub(crate) fn select_worker(&self) -> &Arc<IoWorker> {
        // the pool is never empty, `ConnectionOwner::with_protocol` starts at least one worker
        select_least_loaded(&self.workers).unwrap_or(&self.workers[0])
    }

    /// Moves an accepted socket off the acceptor reactor onto the least loaded worker.
    fn bind_accepted(self: &Arc<Self>, stream: TcpStream) {
        let stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(e) => {
                warn!("detach accepted socket failed: {}", e);
                return;
            }
        };
        let worker = self.select_worker().clone();
        let connection = Connection::new(worker.clone(), self.clone());
        worker.spawn(async move {
            if let Err(e) = connection.accept_stream(stream) {
                warn!("accepted connection {} failed to start: {}", connection.id(), e);
            }
        });
    }
}

#[cfg(test)]
impl OwnerShared {
    /// Bare shared state for exercising a connection without an owner pumping it.
    pub(crate) fn detached(config: NetworkConfig) -> AppResult<Arc<OwnerShared>> {
        let workers = (0..config.resolved_worker_threads())
            .map(|id| IoWorker::start(id, format!("io-worker-{}", id)))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Arc::new(OwnerShared {
            tasks: CrossThreadQueue::new(),
            messages: CrossThreadQueue::new(),
            live_connections: AtomicUsize::new(0),
            workers,
            protocol: Arc::new(DefaultProtocol),
            config,
            closing: ShutdownSignal::new(),
        }))
    }

    pub(crate) fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }
}

/// Owner-thread state: the registry and the embedder's hooks.
struct OwnerContext<H> {
    registry: HashMap<String, Arc<Connection>>,
    // superseded by a reconnect under the same peer name, waiting for their disconnect
    pending_cleanup: Vec<Arc<Connection>>,
    connected_connections: usize,
    handler: H,
}

impl<H: ConnectionHandler> OwnerContext<H> {
    fn on_connected(&mut self, connection: Arc<Connection>) {
        let name = connection.peer_name().to_string();
        if let Some(existing) = self.registry.insert(name.clone(), connection.clone()) {
            warn!("existed connection <{}>, replacing it", name);
            if existing.state() == ConnectionState::Connected {
                let _ = existing.disconnect();
            }
            self.pending_cleanup.push(existing);
        }
        self.connected_connections += 1;
        info!("connection <{}> connected", name);
        debug!(
            "current connected connection count {}",
            self.connected_connections
        );
        self.handler.on_connected(&connection);
    }

    fn on_disconnected(&mut self, connection: Arc<Connection>) {
        let name = connection.peer_name();
        if let Some(index) = self
            .pending_cleanup
            .iter()
            .position(|c| Arc::ptr_eq(c, &connection))
        {
            self.pending_cleanup.swap_remove(index);
        } else {
            match self.registry.get(name) {
                Some(registered) if Arc::ptr_eq(registered, &connection) => {
                    self.registry.remove(name);
                }
                _ => error!("disconnected connection <{}> is not registered", name),
            }
        }
        self.connected_connections = self.connected_connections.saturating_sub(1);
        info!("connection <{}> disconnected", name);
        debug!(
            "current connected connection count {}",
            self.connected_connections
        );
        self.handler.on_disconnected(&connection);
    }
}

/// Owns the I/O worker pool, the acceptor and the connection registry.
///
/// The same type plays the server role (`listen`) and the client role
/// (`connect_to_server`). The embedder calls [`ConnectionOwner::process_event`] from its
/// own loop; that thread becomes the owner thread, the only one that touches the
/// registry and runs [`ConnectionHandler`] hooks.
///
/// Dropping the owner disconnects every registered connection and pumps events until no
/// connection is alive, then joins the workers. Connection handles kept outside the
/// owner must be released before that, or the drop waits for them.
pub struct ConnectionOwner<H: ConnectionHandler> {
    shared: Arc<OwnerShared>,
    acceptor: Arc<IoWorker>,
    context: OwnerContext<H>,
}

impl<H: ConnectionHandler> ConnectionOwner<H> {
    pub fn new(config: NetworkConfig, handler: H) -> AppResult<Self> {
        Self::with_protocol(config, handler, Arc::new(DefaultProtocol))
    }

    pub fn with_protocol(
        config: NetworkConfig,
        handler: H,
        protocol: Arc<dyn FrameProtocol>,
    ) -> AppResult<Self> {
        config.validate()?;
        let worker_threads = config.resolved_worker_threads();
        debug!("io worker thread count {}", worker_threads);

        let acceptor = IoWorker::start(worker_threads, "io-acceptor")?;
        let workers = (0..worker_threads)
            .map(|id| IoWorker::start(id, format!("io-worker-{}", id)))
            .collect::<AppResult<Vec<_>>>()?;

        let shared = Arc::new(OwnerShared {
            tasks: CrossThreadQueue::new(),
            messages: CrossThreadQueue::new(),
            live_connections: AtomicUsize::new(0),
            workers,
            protocol,
            config,
            closing: ShutdownSignal::new(),
        });
        Ok(ConnectionOwner {
            shared,
            acceptor,
            context: OwnerContext {
                registry: HashMap::new(),
                pending_cleanup: Vec::new(),
                connected_connections: 0,
                handler,
            },
        })
    }

    /// Binds and listens on the acceptor worker, then starts accepting.
    ///
    /// An empty `ip` listens on every IPv4 interface; port 0 picks a free port. Returns
    /// the bound address.
    pub fn listen(&self, ip: &str, port: u16) -> AppResult<SocketAddr> {
        let ip: IpAddr = if ip.is_empty() {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            ip.parse()
                .map_err(|_| AppError::InvalidValue(format!("listen address: {}", ip)))?
        };
        let address = SocketAddr::new(ip, port);

        let listener = {
            // register the listener with the acceptor's reactor
            let _guard = self.acceptor.handle().enter();
            let socket = if address.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_reuseaddr(true)?;
            socket.bind(address).map_err(|e| {
                let error_msg = format!("Failed to bind to address: {} - Error: {}", address, e);
                error!("{}", error_msg);
                AppError::DetailedIoError(error_msg)
            })?;
            socket.listen(self.shared.config.listen_backlog)?
        };
        let local_addr = listener.local_addr()?;
        info!("tcp server binding to {} for listening", local_addr);

        self.acceptor
            .spawn(accept_loop(self.shared.clone(), listener));
        Ok(local_addr)
    }

    /// Dials `ip:port` on the least loaded worker.
    ///
    /// `callback` runs on the owner thread during a later `process_event`, after the
    /// connection (if any) has been registered. The returned receiver resolves as soon as
    /// the dial finished.
    pub fn connect_to_server<F>(&self, ip: &str, port: u16, callback: F) -> PendingConnection
    where
        F: FnOnce(Option<Arc<Connection>>) + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let worker = self.shared.select_worker().clone();
        let connection = Connection::new(worker.clone(), self.shared.clone());
        let shared = self.shared.clone();
        let address = format!("{}:{}", ip, port);

        worker.spawn(async move {
            let connection = match connection.dial(&address).await {
                Ok(()) => Some(connection),
                Err(e) => {
                    warn!("connect to {} failed: {}", address, e);
                    None
                }
            };
            let callback_connection = connection.clone();
            shared.push_task(OwnerTask::Deferred(Box::new(move || {
                callback(callback_connection)
            })));
            let _ = result_tx.send(connection);
        });
        result_rx
    }

    /// Runs every deferred task, in queue order. Returns how many ran.
    pub fn process_task(&mut self) -> usize {
        let mut processed = 0;
        while let Some(task) = self.shared.tasks.dequeue() {
            processed += 1;
            match task {
                OwnerTask::Connected(connection) => self.context.on_connected(connection),
                OwnerTask::Disconnected(connection) => self.context.on_disconnected(connection),
                OwnerTask::Deferred(task) => task(),
            }
        }
        processed
    }

    /// Hands every received message to the handler. Returns how many were dispatched.
    pub fn process_messages(&mut self) -> usize {
        let mut processed = 0;
        while let Some((connection, message)) = self.shared.messages.dequeue() {
            processed += 1;
            self.context.handler.on_message(&connection, message);
        }
        processed
    }

    /// Owner-thread pump: drains the task queue, then the message queue. Never blocks.
    ///
    /// Returns the number of messages processed so the caller can decide how to idle.
    pub fn process_event(&mut self) -> usize {
        self.process_task();
        self.process_messages()
    }

    pub fn connection_map(&self) -> &HashMap<String, Arc<Connection>> {
        debug_assert!(
            self.run_in_owner_thread(),
            "connection registry read off the owner thread"
        );
        &self.context.registry
    }

    pub fn live_connections(&self) -> usize {
        self.shared.live_connections()
    }

    pub fn connected_connections(&self) -> usize {
        self.context.connected_connections
    }

    pub fn pending_cleanup_len(&self) -> usize {
        self.context.pending_cleanup.len()
    }

    pub fn worker_count(&self) -> usize {
        self.shared.workers.len()
    }

    /// Bound sockets per worker, in worker order.
    pub fn worker_loads(&self) -> Vec<usize> {
        self.shared.workers.iter().map(|w| w.socket_count()).collect()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.shared.config
    }

    pub fn handler(&self) -> &H {
        &self.context.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.context.handler
    }

    /// True on the thread that drains the owner queues, or before anyone drained them.
    pub fn run_in_owner_thread(&self) -> bool {
        self.shared.tasks.is_consumer_thread()
    }

    fn disconnect_registered(&self) {
        for connection in self.context.registry.values() {
            if connection.state() == ConnectionState::Connected && !connection.is_closing() {
                let _ = connection.disconnect();
            }
        }
    }
}

impl<H: ConnectionHandler> fmt::Debug for ConnectionOwner<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOwner")
            .field("workers", &self.shared.workers.len())
            .field("live_connections", &self.shared.live_connections())
            .field("connected_connections", &self.context.connected_connections)
            .field("pending_cleanup", &self.context.pending_cleanup.len())
            .finish()
    }
}

impl<H: ConnectionHandler> Drop for ConnectionOwner<H> {
    fn drop(&mut self) {
        self.shared.closing.trigger();
        self.acceptor.stop();

        let mut last_report = Instant::now();
        while self.shared.live_connections() != 0 {
            // connections registered by this very pump also have to go
            self.disconnect_registered();
            self.process_event();
            if cfg!(debug_assertions) && last_report.elapsed() > Duration::from_millis(100) {
                last_report = Instant::now();
                for (name, connection) in &self.context.registry {
                    warn!(
                        "connection <{}> use count is {}",
                        name,
                        Arc::strong_count(connection)
                    );
                }
            }
            thread::yield_now();
        }
        // deferred callbacks of dials that failed during shutdown
        self.process_task();

        for worker in &self.shared.workers {
            worker.stop();
        }
        debug!("connection owner dropped");
    }
}

async fn accept_loop(shared: Arc<OwnerShared>, listener: TcpListener) {
    let mut shutdown = shared.closing.subscribe();
    loop {
        let stream = tokio::select! {
            res = accept(&listener) => match res {
                Ok(stream) => stream,
                Err(e) => {
                    error!(cause = %e, "failed to accept");
                    break;
                }
            },
            _ = shutdown.recv() => {
                debug!("acceptor exit accept loop after recv shutdown signal");
                break;
            }
        };
        debug!("accept new connection");
        // hand off right away so a slow handshake never holds up the next accept
        shared.bind_accepted(stream);
    }
}

async fn accept(listener: &TcpListener) -> AppResult<TcpStream> {
    let mut backoff = 1;

    loop {
        match listener.accept().await {
            Ok((socket, _)) => return Ok(socket),
            Err(err) => {
                if backoff > 64 {
                    return Err(AppError::DetailedIoError(format!(
                        "accept tcp server error: {}",
                        err
                    )));
                }
                warn!("accept error: {}, retry in {}s", err, backoff);
            }
        }

        time::sleep(Duration::from_secs(backoff)).await;
        backoff *= 2;
    }
}
