use bincode::{Decode, Encode};

use super::FrameError;

/// Family a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Request/response traffic addressed to a distributed map.
    DMap,
    /// Stream setup and pushed stream traffic.
    Stream,
}

impl TryFrom<u8> for Kind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Kind::DMap),
            0x02 => Ok(Kind::Stream),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

impl From<Kind> for u8 {
    fn from(value: Kind) -> Self {
        match value {
            Kind::DMap => 0x01,
            Kind::Stream => 0x02,
        }
    }
}

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident : $err:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($(#[$vmeta])* $variant,)+
        }

        impl TryFrom<u8> for $name {
            type Error = FrameError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok($name::$variant),)+
                    other => Err(FrameError::$err(other)),
                }
            }
        }

        impl From<$name> for u8 {
            fn from(value: $name) -> Self {
                match value {
                    $($name::$variant => $value,)+
                }
            }
        }
    };
}

wire_enum! {
    /// Requested action. Shared by servers and clients; the values are part of
    /// the wire format and must never be reassigned.
    pub enum OpCode: UnknownOp {
        Put = 0x01,
        PutEx = 0x02,
        PutIf = 0x03,
        Get = 0x04,
        Delete = 0x05,
        Destroy = 0x06,
        Expire = 0x07,
        Incr = 0x08,
        Decr = 0x09,
        Lock = 0x0A,
        Unlock = 0x0B,
        Ping = 0x0C,
        /// Upgrades the connection to a stream channel.
        CreateStream = 0x30,
        StreamCreated = 0x31,
        StreamMessage = 0x32,
        StreamPing = 0x33,
        StreamPong = 0x34,
    }
}

wire_enum! {
    /// Outcome of a request. Always [`Status::Ok`] on fresh requests.
    pub enum Status: UnknownStatus {
        Ok = 0x00,
        InternalError = 0x01,
        BadRequest = 0x02,
        KeyNotFound = 0x03,
        KeyFound = 0x04,
        Locked = 0x05,
        NoSuchLock = 0x06,
        PreconditionFailed = 0x07,
    }
}

/// Metadata carried by map requests.
#[derive(Debug, Clone, Default, Encode, Decode, PartialEq, Eq)]
pub struct DMapExtra {
    pub dmap: String,
    pub key: String,
    /// Time to live in milliseconds, `0` for none.
    pub ttl_ms: u64,
}

/// Metadata carried by stream messages.
#[derive(Debug, Clone, Copy, Default, Encode, Decode, PartialEq, Eq)]
pub struct StreamExtra {
    pub stream_id: u64,
}

/// Kind-specific metadata placed between the header and the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Extra {
    #[default]
    None,
    DMap(DMapExtra),
    Stream(StreamExtra),
}

impl Extra {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Extra::None => "empty",
            Extra::DMap(_) => "dmap",
            Extra::Stream(_) => "stream",
        }
    }

    pub(crate) fn fits(&self, kind: Kind) -> bool {
        matches!(
            (self, kind),
            (Extra::None, _) | (Extra::DMap(_), Kind::DMap) | (Extra::Stream(_), Kind::Stream)
        )
    }
}

/// A request or response exchanged over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: Kind,
    op: OpCode,
    status: Status,
    extra: Extra,
    body: Vec<u8>,
}

impl Message {
    pub fn new(kind: Kind, op: OpCode) -> Self {
        Self {
            kind,
            op,
            status: Status::Ok,
            extra: Extra::None,
            body: Vec::new(),
        }
    }

    /// New map request.
    pub fn dmap(op: OpCode) -> Self {
        Self::new(Kind::DMap, op)
    }

    /// New stream message.
    pub fn stream(op: OpCode) -> Self {
        Self::new(Kind::Stream, op)
    }

    /// Builds the response skeleton for this request: same kind and op code,
    /// `Ok` status, no extra fields and an empty body.
    pub fn reply(&self) -> Self {
        Self::new(self.kind, self.op)
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn with_extra(mut self, extra: Extra) -> Self {
        self.extra = extra;
        self
    }

    /// Attaches map name and key; keeps any TTL already set.
    pub fn with_key(mut self, dmap: impl Into<String>, key: impl Into<String>) -> Self {
        let ttl_ms = match &self.extra {
            Extra::DMap(extra) => extra.ttl_ms,
            _ => 0,
        };
        self.extra = Extra::DMap(DMapExtra {
            dmap: dmap.into(),
            key: key.into(),
            ttl_ms,
        });
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn op(&self) -> OpCode {
        self.op
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn extra(&self) -> &Extra {
        &self.extra
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// Map extra fields, if this message carries them.
    pub fn dmap_extra(&self) -> Option<&DMapExtra> {
        match &self.extra {
            Extra::DMap(extra) => Some(extra),
            _ => None,
        }
    }

    /// Stream id, if this message carries stream extra fields.
    pub fn stream_id(&self) -> Option<u64> {
        match &self.extra {
            Extra::Stream(extra) => Some(extra.stream_id),
            _ => None,
        }
    }

    pub fn is_create_stream(&self) -> bool {
        self.op == OpCode::CreateStream
    }

    pub(crate) fn from_parts(
        kind: Kind,
        op: OpCode,
        status: Status,
        extra: Extra,
        body: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            op,
            status,
            extra,
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_keeps_kind_and_op() {
        let req = Message::dmap(OpCode::Get)
            .with_key("users", "alice")
            .with_body(b"ignored".to_vec());
        let resp = req.reply();

        assert_eq!(resp.kind(), Kind::DMap);
        assert_eq!(resp.op(), OpCode::Get);
        assert_eq!(resp.status(), Status::Ok);
        assert_eq!(resp.extra(), &Extra::None);
        assert!(resp.body().is_empty());
    }

    #[test]
    fn with_key_preserves_ttl() {
        let msg = Message::dmap(OpCode::PutEx)
            .with_extra(Extra::DMap(DMapExtra {
                ttl_ms: 1500,
                ..Default::default()
            }))
            .with_key("sessions", "token");

        let extra = msg.dmap_extra().unwrap();
        assert_eq!(extra.dmap, "sessions");
        assert_eq!(extra.key, "token");
        assert_eq!(extra.ttl_ms, 1500);
    }

    #[test]
    fn wire_values_are_stable() {
        assert_eq!(u8::from(OpCode::Put), 0x01);
        assert_eq!(u8::from(OpCode::CreateStream), 0x30);
        assert_eq!(u8::from(Status::Ok), 0x00);
        assert_eq!(u8::from(Kind::Stream), 0x02);

        assert_eq!(OpCode::try_from(0x34).unwrap(), OpCode::StreamPong);
        assert_eq!(Status::try_from(0x03).unwrap(), Status::KeyNotFound);
        assert!(matches!(
            OpCode::try_from(0xFF),
            Err(FrameError::UnknownOp(0xFF))
        ));
        assert!(matches!(
            Kind::try_from(0x00),
            Err(FrameError::UnknownKind(0x00))
        ));
    }

    #[test]
    fn extra_must_fit_kind() {
        assert!(Extra::None.fits(Kind::Stream));
        assert!(Extra::DMap(DMapExtra::default()).fits(Kind::DMap));
        assert!(!Extra::DMap(DMapExtra::default()).fits(Kind::Stream));
        assert!(!Extra::Stream(StreamExtra::default()).fits(Kind::DMap));
    }
}
