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

use std::fmt;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use super::frame::{check_body_size, FrameProtocol, WireMessage};
use super::io_worker::IoWorker;
use super::owner::{OwnerShared, OwnerTask};
use super::state::{ConnectionState, ConnectionStateCell};
use crate::utils::ShutdownSignal;
use crate::{AppError, AppResult};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One TCP socket bound for its whole life to a single [`IoWorker`].
///
/// The read half is owned by the read pipeline task and the write half by the write
/// pipeline task, both running on the bound worker and both holding an `Arc` to the
/// connection. The connection is therefore dropped only after every pending I/O
/// completion has run and the owner's registry has let go of it.
///
/// `send` may be called from any thread. Received frames and lifecycle notifications are
/// handed to the owner thread through the owner's queues.
pub struct Connection {
    id: u64,
    state: ConnectionStateCell,
    peer_name: OnceCell<String>,
    worker: Arc<IoWorker>,
    owner: Arc<OwnerShared>,
    protocol: Arc<dyn FrameProtocol>,
    max_frame_size: usize,
    send_queue: ArrayQueue<WireMessage>,
    // set by whoever is responsible for waking the write pipeline
    write_in_flight: AtomicBool,
    write_ready: Notify,
    // last sequence handed out; held while stamping and queueing so queue order is
    // sequence order
    last_sequence: Mutex<u64>,
    closing: ShutdownSignal,
    pipelines: Mutex<Vec<JoinHandle<()>>>,
}

impl Connection {
    pub(crate) fn new(worker: Arc<IoWorker>, owner: Arc<OwnerShared>) -> Arc<Connection> {
        let config = owner.config();
        let connection = Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            state: ConnectionStateCell::new(),
            peer_name: OnceCell::new(),
            protocol: owner.protocol().clone(),
            max_frame_size: config.max_frame_size,
            send_queue: ArrayQueue::new(config.send_queue_capacity.max(1)),
            write_in_flight: AtomicBool::new(false),
            write_ready: Notify::new(),
            last_sequence: Mutex::new(0),
            closing: ShutdownSignal::new(),
            pipelines: Mutex::new(Vec::with_capacity(2)),
            worker,
            owner,
        };
        connection.worker.increase_socket_count();
        connection.owner.increase_live_connections();
        Arc::new(connection)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// `ip:port` of the remote side, empty until the transport handshake completed.
    pub fn peer_name(&self) -> &str {
        self.peer_name.get().map(String::as_str).unwrap_or("")
    }

    pub fn worker_id(&self) -> usize {
        self.worker.id()
    }

    pub fn protocol(&self) -> &Arc<dyn FrameProtocol> {
        &self.protocol
    }

    /// Messages accepted by `send` that the write pipeline has not picked up yet.
    pub fn pending_sends(&self) -> usize {
        self.send_queue.len()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.is_triggered()
    }

    pub fn send(&self, body: impl AsRef<[u8]>) -> AppResult<u64> {
        self.send_with_descriptor(0, body)
    }

    /// Frames `body`, stamps the next sequence number and queues it for writing.
    ///
    /// Legal while connecting or connected. Returns the sequence number written into the
    /// header; numbers start at 1 and increase by one per accepted message, in the order
    /// the messages reach the wire.
    pub fn send_with_descriptor(&self, descriptor: u32, body: impl AsRef<[u8]>) -> AppResult<u64> {
        let state = self.state();
        if !state.accepts_send() {
            error!(
                "<{}> send on {:?} connection {} rejected",
                self.peer_name(),
                state,
                self.id
            );
            return Err(AppError::IllegalStateError(format!(
                "send on {:?} connection",
                state
            )));
        }
        let body = body.as_ref();
        check_body_size(body.len(), self.max_frame_size)?;
        let mut message = self.protocol.encode(descriptor, body)?;

        let sequence = {
            let mut last_sequence = self.last_sequence.lock();
            let sequence = *last_sequence + 1;
            self.protocol.stamp_sequence(&mut message, sequence);
            if self.send_queue.push(message).is_err() {
                drop(last_sequence);
                warn!(
                    "<{}> send queue full, capacity {}",
                    self.peer_name(),
                    self.send_queue.capacity()
                );
                return Err(AppError::SendQueueFull(self.send_queue.capacity()));
            }
            *last_sequence = sequence;
            sequence
        };
        // only the sender that flips the flag wakes the pipeline, everyone else rides along
        if self
            .write_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.write_ready.notify_one();
        }
        Ok(sequence)
    }

    /// Closes the socket on the bound worker and blocks until that finished.
    ///
    /// The close job runs on the worker so it can never interleave with a read or write
    /// completion of the same socket. The `Disconnected` transition and the owner
    /// notification happen through the regular error path. When called on the worker
    /// itself the close is only started, since waiting there would never return.
    ///
    /// Must not be called from inside an async context other than the bound worker.
    pub fn disconnect(self: &Arc<Self>) -> AppResult<()> {
        let state = self.state();
        if state != ConnectionState::Connected {
            error!(
                "<{}> disconnect on {:?} connection {} ignored",
                self.peer_name(),
                state,
                self.id
            );
            return Err(AppError::InvalidStateTransition {
                from: ConnectionState::Connected,
                to: ConnectionState::Disconnected,
                actual: state,
            });
        }
        if self.worker.is_current() {
            self.closing.trigger();
            return Ok(());
        }
        let (done_tx, done_rx) = oneshot::channel();
        let connection = self.clone();
        self.worker.spawn(async move {
            connection.close().await;
            let _ = done_tx.send(());
        });
        done_rx
            .blocking_recv()
            .map_err(|e| AppError::ChannelRecvError(format!("close job dropped: {}", e)))
    }

    async fn close(&self) {
        self.closing.trigger();
        let pipelines = std::mem::take(&mut *self.pipelines.lock());
        for pipeline in pipelines {
            if let Err(join_error) = pipeline.await {
                if join_error.is_panic() {
                    error!("<{}> pipeline panicked during close", self.peer_name());
                }
            }
        }
        debug!("<{}> socket closed", self.peer_name());
    }

    /// Accepted socket handed over from the acceptor, runs on the bound worker.
    pub(crate) fn accept_stream(self: &Arc<Self>, stream: std::net::TcpStream) -> AppResult<()> {
        let stream = TcpStream::from_std(stream)?;
        let peer = stream.peer_addr()?;
        self.state.accepted()?;
        self.start(stream, peer);
        Ok(())
    }

    /// Dials `address` on the bound worker; aborted when the owner shuts down.
    pub(crate) async fn dial(self: &Arc<Self>, address: &str) -> AppResult<()> {
        self.state.begin_dial()?;
        let mut shutdown = self.owner.closing().subscribe();
        let connected = tokio::select! {
            res = TcpStream::connect(address) => res,
            _ = shutdown.recv() => Err(io::Error::new(
                ErrorKind::ConnectionAborted,
                "connection owner is shutting down",
            )),
        };
        let dialed = connected.and_then(|stream| {
            let peer = stream.peer_addr()?;
            Ok((stream, peer))
        });
        match dialed {
            Ok((stream, peer)) => {
                self.state.dial_succeeded()?;
                self.start(stream, peer);
                Ok(())
            }
            Err(e) => {
                self.state.dial_failed()?;
                Err(e.into())
            }
        }
    }

    fn start(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        debug_assert!(self.worker.is_current());
        let _ = self.peer_name.set(peer.to_string());
        if let Err(e) = stream.set_nodelay(true) {
            trace!("<{}> set nodelay failed: {}", self.peer_name(), e);
        }
        let (reader, writer) = stream.into_split();

        self.owner.push_task(OwnerTask::Connected(self.clone()));
        let read_task = self.worker.spawn(self.clone().read_pipeline(reader));
        let write_task = self.worker.spawn(self.clone().write_pipeline(writer));
        self.pipelines.lock().extend([read_task, write_task]);
        debug!(
            "<{}> connection {} connected on {}",
            self.peer_name(),
            self.id,
            self.worker.name()
        );
    }

    async fn read_pipeline(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let mut shutdown = self.closing.subscribe();
        let result = tokio::select! {
            res = self.read_frames(&mut reader) => res,
            _ = shutdown.recv() => Err(AppError::IoError(io::Error::new(
                ErrorKind::ConnectionAborted,
                "connection closed locally",
            ))),
        };
        if let Err(e) = result {
            self.on_error(e);
        }
    }

    /// Header, then body, then hand the frame over and start again. Only returns on error.
    async fn read_frames(self: &Arc<Self>, reader: &mut OwnedReadHalf) -> AppResult<()> {
        let header_size = self.protocol.header_size();
        loop {
            let mut frame = BytesMut::zeroed(header_size);
            reader.read_exact(&mut frame[..]).await?;

            let body_size = self.protocol.body_size(&frame)?;
            check_body_size(body_size, self.max_frame_size)?;
            // an empty body completes the frame without a zero-length read
            if body_size > 0 {
                frame.resize(header_size + body_size, 0);
                reader.read_exact(&mut frame[header_size..]).await.map_err(|e| {
                    if e.kind() == ErrorKind::UnexpectedEof {
                        io::Error::new(
                            ErrorKind::ConnectionReset,
                            "remote closed the connection in the middle of a frame",
                        )
                    } else {
                        e
                    }
                })?;
            }
            self.owner
                .push_message(self.clone(), WireMessage::from_frame(frame, header_size));
        }
    }

    async fn write_pipeline(self: Arc<Self>, writer: OwnedWriteHalf) {
        let mut writer = BufWriter::new(writer);
        let mut shutdown = self.closing.subscribe();
        let result = tokio::select! {
            res = self.write_frames(&mut writer) => res,
            _ = shutdown.recv() => Ok(()),
        };
        // half close so the peer reads end of stream before the socket goes away; skip the
        // buffered bytes, a stalled peer must not hold up the close
        if let Err(e) = writer.get_mut().shutdown().await {
            trace!("<{}> shutdown write half: {}", self.peer_name(), e);
        }
        if let Err(e) = result {
            self.on_error(e);
        }
    }

    async fn write_frames(&self, writer: &mut BufWriter<OwnedWriteHalf>) -> AppResult<()> {
        loop {
            self.write_ready.notified().await;
            self.flush_send_queue(writer).await?;
        }
    }

    /// Writes queued messages in order until the queue is empty, then clears the
    /// in-flight flag. Runs with the flag set, so at most one flush is active.
    async fn flush_send_queue(&self, writer: &mut BufWriter<OwnedWriteHalf>) -> AppResult<()> {
        loop {
            let state = self.state();
            if state != ConnectionState::Connected {
                error!(
                    "<{}> flush on {:?} connection dropped",
                    self.peer_name(),
                    state
                );
                self.write_in_flight.store(false, Ordering::Release);
                return Ok(());
            }
            while let Some(message) = self.send_queue.pop() {
                writer.write_all(message.header()).await?;
                if message.body_len() > 0 {
                    writer.write_all(message.body()).await?;
                }
            }
            writer.flush().await?;

            self.write_in_flight.store(false, Ordering::Release);
            // a send racing the store above saw the flag still set and did not wake us
            if self.send_queue.is_empty()
                || self
                    .write_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                return Ok(());
            }
        }
    }

    /// Single exit for every transport failure of this connection.
    ///
    /// Both pipelines may land here; the `Connected -> Disconnected` compare-and-set lets
    /// exactly one of them stop the other pipeline and notify the owner.
    fn on_error(self: &Arc<Self>, error: AppError) {
        debug_assert!(
            self.worker.is_current(),
            "connection errors are handled on the bound worker"
        );
        match classify_error(&error, self.closing.is_triggered()) {
            ErrorClass::EndOfStream => {
                debug!("<{}> remote closed the connection", self.peer_name())
            }
            ErrorClass::LocalClose => debug!("<{}> connection closed locally", self.peer_name()),
            ErrorClass::Transport => warn!("<{}> socket error: {}", self.peer_name(), error),
        }

        match self.state.disconnected() {
            Ok(()) => {
                self.closing.trigger();
                self.owner.push_task(OwnerTask::Disconnected(self.clone()));
            }
            Err(e) => trace!("<{}> already torn down: {}", self.peer_name(), e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorClass {
    EndOfStream,
    LocalClose,
    Transport,
}

/// Whether a close was requested on our side decides the local case, the error kind
/// alone cannot tell our abort from one reported by the OS.
fn classify_error(error: &AppError, closing: bool) -> ErrorClass {
    if error.is_end_of_stream() {
        ErrorClass::EndOfStream
    } else if closing {
        ErrorClass::LocalClose
    } else {
        ErrorClass::Transport
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_name", &self.peer_name())
            .field("state", &self.state())
            .field("worker", &self.worker.name())
            .field("pending_sends", &self.send_queue.len())
            .finish()
    }
}

impl Drop for Connection {
    // The pipelines hold strong references, so reaching this point means no read or
    // write completion of this socket can run anymore.
    fn drop(&mut self) {
        self.closing.trigger();
        self.worker.decrease_socket_count();
        let live = self.owner.decrease_live_connections();
        debug!(
            "<{}> connection {} dropped, live connections {}",
            self.peer_name(),
            self.id,
            live
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NetworkConfig;

    fn detached_connection(send_queue_capacity: usize) -> (Arc<OwnerShared>, Arc<Connection>) {
        let config = NetworkConfig {
            send_queue_capacity,
            ..NetworkConfig::default()
        }
        .with_worker_threads(1);
        let shared = OwnerShared::detached(config).unwrap();
        let worker = shared.select_worker().clone();
        let connection = Connection::new(worker, shared.clone());
        (shared, connection)
    }

    #[test]
    fn send_is_refused_before_dialing() {
        let (_shared, connection) = detached_connection(4);
        assert_eq!(connection.state(), ConnectionState::Init);
        assert!(matches!(
            connection.send(b"early"),
            Err(AppError::IllegalStateError(_))
        ));
        assert_eq!(connection.pending_sends(), 0);
    }

    #[test]
    fn sends_queue_while_connecting_up_to_capacity() {
        let (_shared, connection) = detached_connection(2);
        connection.state.begin_dial().unwrap();

        assert_eq!(connection.send(b"one").unwrap(), 1);
        assert_eq!(connection.send_with_descriptor(7, b"two").unwrap(), 2);
        assert!(matches!(
            connection.send(b"three"),
            Err(AppError::SendQueueFull(2))
        ));
        assert_eq!(connection.pending_sends(), 2);

        let first = connection.send_queue.pop().unwrap();
        assert_eq!(first.sequence(), Some(1));
        assert_eq!(first.body(), b"one");
        let second = connection.send_queue.pop().unwrap();
        assert_eq!(second.descriptor(), Some(7));
        // a refused message does not consume a number
        assert_eq!(connection.send(b"four").unwrap(), 3);
        assert_eq!(connection.send(b"five").unwrap(), 4);
        assert!(matches!(
            connection.send(b"six"),
            Err(AppError::SendQueueFull(2))
        ));
        assert_eq!(connection.send_queue.pop().unwrap().sequence(), Some(3));
        assert_eq!(connection.send(b"seven").unwrap(), 5);
    }

    #[test]
    fn oversized_body_is_refused() {
        let config = NetworkConfig {
            max_frame_size: 8,
            ..NetworkConfig::default()
        }
        .with_worker_threads(1);
        let shared = OwnerShared::detached(config).unwrap();
        let connection = Connection::new(shared.select_worker().clone(), shared.clone());
        connection.state.begin_dial().unwrap();
        assert!(matches!(
            connection.send([0u8; 9]),
            Err(AppError::FrameTooLarge(9))
        ));
        assert!(connection.send([0u8; 8]).is_ok());
    }

    #[test]
    fn queue_order_is_sequence_order_under_contention() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 2_000;
        let (_shared, connection) = detached_connection(THREADS * PER_THREAD);
        connection.state.begin_dial().unwrap();

        let senders: Vec<_> = (0..THREADS)
            .map(|_| {
                let connection = connection.clone();
                std::thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        connection.send(b"x").unwrap();
                    }
                })
            })
            .collect();
        for sender in senders {
            sender.join().unwrap();
        }

        let mut expected = 1;
        while let Some(message) = connection.send_queue.pop() {
            assert_eq!(message.sequence(), Some(expected));
            expected += 1;
        }
        assert_eq!(expected, (THREADS * PER_THREAD) as u64 + 1);
    }

    #[test]
    fn abort_is_local_only_after_our_close() {
        let aborted = AppError::from(io::Error::new(ErrorKind::ConnectionAborted, "aborted"));
        assert_eq!(classify_error(&aborted, false), ErrorClass::Transport);
        assert_eq!(classify_error(&aborted, true), ErrorClass::LocalClose);

        let eof = AppError::from(io::Error::new(ErrorKind::UnexpectedEof, "eof"));
        assert_eq!(classify_error(&eof, false), ErrorClass::EndOfStream);
        assert_eq!(classify_error(&eof, true), ErrorClass::EndOfStream);

        let reset = AppError::from(io::Error::new(ErrorKind::ConnectionReset, "reset"));
        assert_eq!(classify_error(&reset, false), ErrorClass::Transport);
    }

    #[test]
    fn disconnect_needs_connected_state() {
        let (_shared, connection) = detached_connection(1);
        let result = connection.disconnect();
        assert!(matches!(
            result,
            Err(AppError::InvalidStateTransition {
                actual: ConnectionState::Init,
                ..
            })
        ));
        assert!(!connection.is_closing());
    }

    #[test]
    fn drop_releases_worker_and_owner_counts() {
        let (shared, connection) = detached_connection(1);
        let worker = shared.select_worker().clone();
        assert_eq!(worker.socket_count(), 1);
        assert_eq!(shared.live_connections(), 1);

        drop(connection);
        assert_eq!(worker.socket_count(), 0);
        assert_eq!(shared.live_connections(), 0);
        assert_eq!(shared.pending_tasks(), 0);
    }
}
