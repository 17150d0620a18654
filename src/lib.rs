//! Network transport core for a distributed in-memory data-structure server.
//!
//! - [`protocol`]: message model and binary framing.
//! - [`net`]: threaded TCP server, connection pool, client and stream
//!   channels.
pub mod net;
pub mod protocol;

pub use net::{
    Client, ClientConfig, DispatchError, Dispatcher, Error, ResponseWriter, Server, ServerConfig,
    StreamChannel, StreamSender,
};
pub use protocol::{Kind, Message, OpCode, Status};
