//! Slice based frame encoding and decoding.
//!
//! [`Header::decode`] only needs the first [`HEADER_SIZE`] bytes and reports
//! how long the rest of the frame is, which lets stream readers pull exactly
//! one frame at a time without buffering ahead.
use bincode::config::{BigEndian, Configuration, Fixint};

use super::{
    DMapExtra, Extra, FrameError, Kind, Message, OpCode, Status, StreamExtra,
    header::{
        BODY_LEN_AT, EXTRA_LEN_AT, HEADER_SIZE, KIND_AT, MAGIC, MAGIC_AT, MAX_FRAME_SIZE, OP_AT,
        STATUS_AT, VERSION, VERSION_AT,
    },
};

fn config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

/// Fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: Kind,
    pub op: OpCode,
    pub status: Status,
    pub extra_len: u32,
    pub body_len: u32,
}

impl Header {
    /// Decodes and validates the header at the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        let Some(raw) = buf.get(..HEADER_SIZE) else {
            return Err(FrameError::Truncated {
                needed: HEADER_SIZE,
                available: buf.len(),
            });
        };

        let magic = u16::from_be_bytes([raw[MAGIC_AT], raw[MAGIC_AT + 1]]);
        if magic != MAGIC {
            return Err(FrameError::BadMagic(magic));
        }
        if raw[VERSION_AT] != VERSION {
            return Err(FrameError::UnsupportedVersion(raw[VERSION_AT]));
        }

        let header = Self {
            kind: raw[KIND_AT].try_into()?,
            op: raw[OP_AT].try_into()?,
            status: raw[STATUS_AT].try_into()?,
            extra_len: read_u32(raw, EXTRA_LEN_AT),
            body_len: read_u32(raw, BODY_LEN_AT),
        };

        let size = header.frame_len();
        if size > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge {
                size,
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(header)
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[MAGIC_AT..VERSION_AT].copy_from_slice(&MAGIC.to_be_bytes());
        buf[VERSION_AT] = VERSION;
        buf[KIND_AT] = self.kind.into();
        buf[OP_AT] = self.op.into();
        buf[STATUS_AT] = self.status.into();
        buf[EXTRA_LEN_AT..BODY_LEN_AT].copy_from_slice(&self.extra_len.to_be_bytes());
        buf[BODY_LEN_AT..HEADER_SIZE].copy_from_slice(&self.body_len.to_be_bytes());
        buf
    }

    /// Bytes following the header.
    pub fn payload_len(&self) -> usize {
        (self.extra_len as usize).saturating_add(self.body_len as usize)
    }

    /// Total frame length, header included.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE.saturating_add(self.payload_len())
    }
}

fn read_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

fn too_large(size: usize) -> FrameError {
    FrameError::TooLarge {
        size,
        max: MAX_FRAME_SIZE,
    }
}

fn encode_extra(kind: Kind, extra: &Extra) -> Result<Vec<u8>, FrameError> {
    if !extra.fits(kind) {
        return Err(FrameError::ExtraMismatch {
            kind,
            extra: extra.name(),
        });
    }
    let bytes = match extra {
        Extra::None => Vec::new(),
        Extra::DMap(extra) => bincode::encode_to_vec(extra, config())?,
        Extra::Stream(extra) => bincode::encode_to_vec(extra, config())?,
    };
    Ok(bytes)
}

fn decode_extra(kind: Kind, bytes: &[u8]) -> Result<Extra, FrameError> {
    if bytes.is_empty() {
        return Ok(Extra::None);
    }

    let (extra, read) = match kind {
        Kind::DMap => bincode::decode_from_slice::<DMapExtra, _>(bytes, config())
            .map(|(extra, read)| (Extra::DMap(extra), read)),
        Kind::Stream => bincode::decode_from_slice::<StreamExtra, _>(bytes, config())
            .map(|(extra, read)| (Extra::Stream(extra), read)),
    }
    .map_err(|e| FrameError::Extra(e.to_string()))?;

    if read != bytes.len() {
        return Err(FrameError::Extra(format!(
            "{} trailing bytes after extra fields",
            bytes.len() - read
        )));
    }
    Ok(extra)
}

/// Encodes `message` into a single contiguous frame.
pub fn encode(message: &Message) -> Result<Vec<u8>, FrameError> {
    let extra = encode_extra(message.kind(), message.extra())?;
    let body = message.body();

    let size = HEADER_SIZE + extra.len() + body.len();
    if size > MAX_FRAME_SIZE {
        return Err(too_large(size));
    }

    let header = Header {
        kind: message.kind(),
        op: message.op(),
        status: message.status(),
        extra_len: u32::try_from(extra.len()).map_err(|_| too_large(size))?,
        body_len: u32::try_from(body.len()).map_err(|_| too_large(size))?,
    };

    let mut buf = Vec::with_capacity(size);
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(&extra);
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Decodes one frame from the start of `buf`, returning the message and the
/// number of bytes it occupied.
pub fn decode(buf: &[u8]) -> Result<(Message, usize), FrameError> {
    let header = Header::decode(buf)?;
    let frame_len = header.frame_len();
    let Some(payload) = buf.get(HEADER_SIZE..frame_len) else {
        return Err(FrameError::Truncated {
            needed: frame_len,
            available: buf.len(),
        });
    };
    Ok((decode_payload(&header, payload)?, frame_len))
}

/// Builds the message for an already decoded header from exactly
/// `header.payload_len()` bytes.
pub fn decode_payload(header: &Header, payload: &[u8]) -> Result<Message, FrameError> {
    if payload.len() != header.payload_len() {
        return Err(FrameError::Truncated {
            needed: header.payload_len(),
            available: payload.len(),
        });
    }
    let (extra, body) = payload.split_at(header.extra_len as usize);
    let extra = decode_extra(header.kind, extra)?;

    Ok(Message::from_parts(
        header.kind,
        header.op,
        header.status,
        extra,
        body.to_vec(),
    ))
}
