//! TCP server, connection pool and client.
//!
//! The [`Server`] accepts connections and runs one handler thread per socket.
//! Each handler decodes requests, hands them to the installed [`Dispatcher`]
//! and writes the response back, strictly one request at a time. A
//! `CreateStream` request upgrades the connection to a push channel fed by a
//! [`StreamSender`].
//!
//! The [`Client`] issues requests through a [`ConnectionPool`] that keeps at
//! most `max_conn` live connections per address. Pooled connections are moved
//! out on acquire and moved back on release, so no socket ever has two owners.
//!
//! # Lifecycle
//!
//! ```text
//! Created ──listen_and_serve──▶ Listening ──shutdown──▶ Draining ──▶ Closed
//! ```
//!
//! # See Also
//!
//! - [`protocol`](crate::protocol): framing used on every connection.
use std::{io, time::Duration};

use thiserror::Error;

use crate::protocol::{FrameError, Status, TransportError};

mod client;
mod config;
mod dispatcher;
mod handler;
mod latch;
mod pool;
mod server;
mod stream;
mod supervisor;

pub use client::{AddressSelector, Client, RoundRobin};
pub use config::{ClientConfig, ServerConfig};
pub use dispatcher::{DispatchError, Dispatcher, ResponseWriter, STREAM_BACKLOG, StreamSender};
pub use latch::Latch;
pub use pool::{Connection, ConnectionPool, PooledConnection};
pub use server::{Server, ServerState};
pub use stream::{Messages, StreamChannel};

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    #[error("failed to encode request: {0}")]
    Encoding(#[source] FrameError),

    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),

    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),

    #[error("no connection to {addr} became available within {waited:?}")]
    PoolExhausted { addr: String, waited: Duration },

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("shutdown deadline elapsed with {remaining} connection(s) still open")]
    ShutdownTimeout { remaining: usize },

    #[error("no dispatcher installed")]
    NoDispatcher,

    #[error("dispatcher cannot be replaced once the server has started")]
    DispatcherLocked,

    #[error("server is already serving")]
    AlreadyServing,

    #[error("server is closed")]
    ServerClosed,

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("stream creation refused with status {0:?}")]
    StreamRefused(Status),

    #[error("stream channel is closed")]
    StreamClosed,

    #[error("stream backlog of {limit} messages is full")]
    StreamBacklogFull { limit: usize },
}

impl From<TransportError> for Error {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Frame(e) => Error::Protocol(e),
            TransportError::Io(e) => Error::Transport(e),
        }
    }
}

impl Error {
    /// `true` for failures that mean the connection in use can no longer be
    /// trusted.
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, Error::Protocol(_) | Error::Transport(_))
    }
}
