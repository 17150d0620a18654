use std::io::{self, ErrorKind, Read, Write};

use log::trace;
use thiserror::Error;

use super::{
    FrameError, HEADER_SIZE, Message,
    frame::{self, Header},
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{0}")]
    Frame(#[from] FrameError),
    #[error("transport IO error: {0}")]
    Io(#[from] io::Error),
}

/// Reads and writes whole frames over a bidirectional byte stream.
///
/// Bytes of a frame that arrive before a read timeout stay buffered, so the
/// next [`read_message`](Self::read_message) resumes where the last one
/// stopped.
pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
    pending: Vec<u8>,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self {
            stream,
            pending: Vec::new(),
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.stream
    }

    /// Unwraps the stream, dropping any partially read frame.
    pub fn into_inner(self) -> T {
        self.stream
    }

    /// Bytes of an incomplete frame held from an interrupted read.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    pub fn write_message(&mut self, message: &Message) -> Result<(), TransportError> {
        let bytes = frame::encode(message)?;
        self.write_frame(&bytes)
    }

    /// Writes an already encoded frame.
    pub fn write_frame(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(bytes)?;
        self.stream.flush()?;
        trace!("wrote frame of {} bytes", bytes.len());
        Ok(())
    }

    /// Reads exactly one frame.
    ///
    /// Returns `Ok(None)` when the peer closed the stream cleanly between
    /// frames; an end of stream inside a frame is a truncation error. An I/O
    /// error such as a read timeout keeps the bytes read so far for the next
    /// call; any other outcome starts the next call on a fresh frame.
    pub fn read_message(&mut self) -> Result<Option<Message>, TransportError> {
        let result = self.read_frame();
        if !matches!(result, Err(TransportError::Io(_))) {
            self.pending.clear();
        }
        result
    }

    fn read_frame(&mut self) -> Result<Option<Message>, TransportError> {
        if !self.fill_to(HEADER_SIZE)? {
            if self.pending.is_empty() {
                return Ok(None);
            }
            return Err(FrameError::Truncated {
                needed: HEADER_SIZE,
                available: self.pending.len(),
            }
            .into());
        }

        let header = Header::decode(&self.pending[..HEADER_SIZE])?;
        let frame_len = header.frame_len();
        if !self.fill_to(frame_len)? {
            return Err(FrameError::Truncated {
                needed: frame_len,
                available: self.pending.len(),
            }
            .into());
        }

        trace!(
            "read frame {:?}/{:?} of {frame_len} bytes",
            header.kind,
            header.op
        );
        Ok(Some(frame::decode_payload(
            &header,
            &self.pending[HEADER_SIZE..frame_len],
        )?))
    }

    /// Reads until `pending` holds `len` bytes. Returns `false` if the stream
    /// ended first. Bytes read before an error are kept.
    fn fill_to(&mut self, len: usize) -> io::Result<bool> {
        let mut filled = self.pending.len();
        if filled >= len {
            return Ok(true);
        }
        self.pending.resize(len, 0);

        let outcome = loop {
            if filled == len {
                break Ok(true);
            }
            match self.stream.read(&mut self.pending[filled..]) {
                Ok(0) => break Ok(false),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
        };
        self.pending.truncate(filled);
        outcome
    }
}
