//! Wire protocol shared by skein servers and clients.
//!
//! This module defines the message model exchanged between the transport
//! server and its clients, the binary frame used to carry it over a socket,
//! and a framed reader/writer that can sit on top of any bidirectional
//! byte stream.
//!
//! # Overview
//!
//! Every exchange is a [`Message`]: a message [`Kind`] (map request or stream
//! traffic), an [`OpCode`], a [`Status`], kind-specific [`Extra`] metadata and
//! an opaque body. Requests and responses share the same shape; only the
//! status is meaningful on responses.
//!
//! # Binary Format
//!
//! ```text
//! ┌───────┬─────────┬──────┬────┬────────┬───────────┬──────────┬─────────┬──────┐
//! │ Magic │ Version │ Kind │ Op │ Status │ Extra len │ Body len │ Extra   │ Body │
//! │ 2     │ 1       │ 1    │ 1  │ 1      │ u32       │ u32      │ ...     │ ...  │
//! └───────┴─────────┴──────┴────┴────────┴───────────┴──────────┴─────────┴──────┘
//! ```
//!
//! - The header is a fixed [`HEADER_SIZE`] bytes, so a reader always knows how
//!   much more to read before it touches the payload.
//! - All integers are big-endian.
//! - Extra fields are serialized with `bincode` (big-endian, fixed-width
//!   integers) and must match the message kind.
//!
//! # Key Components
//!
//! - [`Message`]: a decoded request or response.
//! - [`frame`]: slice based encode/decode.
//! - [`ProtocolTransport`]: framed reads and writes over a `Read + Write` stream.
//!
//! # See Also
//!
//! - [`net`](crate::net): server, connection pool and client built on top of
//!   this module.
pub mod frame;
mod message;
mod transport;

pub use frame::{Header, decode, encode};
pub use message::{DMapExtra, Extra, Kind, Message, OpCode, Status, StreamExtra};
pub use transport::{ProtocolTransport, TransportError};

pub mod header {
    pub const MAGIC: u16 = 0x534B;
    pub const VERSION: u8 = 1;

    pub const MAGIC_SIZE: usize = size_of::<u16>();
    pub const VERSION_SIZE: usize = size_of::<u8>();
    pub const KIND_SIZE: usize = size_of::<u8>();
    pub const OP_SIZE: usize = size_of::<u8>();
    pub const STATUS_SIZE: usize = size_of::<u8>();
    pub const EXTRA_LEN_SIZE: usize = size_of::<u32>();
    pub const BODY_LEN_SIZE: usize = size_of::<u32>();

    pub(crate) const MAGIC_AT: usize = 0;
    pub(crate) const VERSION_AT: usize = MAGIC_AT + MAGIC_SIZE;
    pub(crate) const KIND_AT: usize = VERSION_AT + VERSION_SIZE;
    pub(crate) const OP_AT: usize = KIND_AT + KIND_SIZE;
    pub(crate) const STATUS_AT: usize = OP_AT + OP_SIZE;
    pub(crate) const EXTRA_LEN_AT: usize = STATUS_AT + STATUS_SIZE;
    pub(crate) const BODY_LEN_AT: usize = EXTRA_LEN_AT + EXTRA_LEN_SIZE;

    /// Size of the fixed frame header.
    pub const HEADER_SIZE: usize = BODY_LEN_AT + BODY_LEN_SIZE;

    /// Upper bound for a whole frame (header, extra fields and body).
    pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
}

pub use header::{HEADER_SIZE, MAX_FRAME_SIZE};

pub mod error {
    use thiserror::Error;

    use super::Kind;

    /// Failures raised while encoding or decoding a frame.
    #[derive(Debug, Error)]
    pub enum FrameError {
        #[error("frame of {size} bytes exceeds the {max} byte limit")]
        TooLarge { size: usize, max: usize },

        #[error("failed to encode extra fields: {0}")]
        Encode(#[from] bincode::error::EncodeError),

        #[error("{extra} extra fields cannot be attached to a {kind:?} message")]
        ExtraMismatch { kind: Kind, extra: &'static str },

        #[error("invalid magic marker {0:#06x}")]
        BadMagic(u16),

        #[error("unsupported protocol version {0}")]
        UnsupportedVersion(u8),

        #[error("unknown message kind {0:#04x}")]
        UnknownKind(u8),

        #[error("unknown operation code {0:#04x}")]
        UnknownOp(u8),

        #[error("unknown status code {0:#04x}")]
        UnknownStatus(u8),

        #[error("malformed extra fields: {0}")]
        Extra(String),

        #[error("truncated frame: {needed} bytes needed, {available} available")]
        Truncated { needed: usize, available: usize },
    }

    impl FrameError {
        /// `true` when more bytes may turn this failure into a valid frame.
        pub fn is_truncated(&self) -> bool {
            matches!(self, FrameError::Truncated { .. })
        }
    }
}

pub use error::FrameError;
