//! Network Module Implementation
//!
//! Asynchronous TCP connection layer: framed messages, a pool of I/O workers and a
//! single owner thread that receives everything the sockets produce.
//!
//! # Architecture
//!
//! - `IoWorker`: one OS thread running one single-threaded tokio reactor
//! - `Connection`: one socket bound to one worker, with a read pipeline, a serialized
//!   write pipeline and a compare-and-set state machine
//! - `ConnectionOwner`: worker pool, acceptor or outbound dialing, the peer-name
//!   registry and the `process_event` pump the embedder drives
//! - `FrameProtocol`: pluggable framing, `DefaultProtocol` by default
//!
//! # Data flow
//!
//! Bytes arrive on a worker, the connection cuts them into frames and queues
//! `(connection, message)` pairs for the owner. `process_event` drains deferred tasks
//! first and received messages second, calling the `ConnectionHandler` hooks.
//! `Connection::send` may be called from any thread; it queues the frame and wakes the
//! write pipeline on the connection's worker if no write is in flight.

pub use connection::Connection;
pub use frame::{
    check_body_size, DefaultProtocol, FrameProtocol, LengthPrefixProtocol, MessageHeader,
    WireMessage, HEADER_SIZE, LENGTH_PREFIX_SIZE, RESERVED_SIZE,
};
pub use handler::ConnectionHandler;
pub use io_worker::{select_least_loaded, IoWorker};
pub use owner::{ConnectionOwner, PendingConnection};
pub use state::{ConnectionState, ConnectionStateCell};

mod connection;
mod frame;
mod handler;
mod io_worker;
mod owner;
mod state;
