//! Wire types exchanged over a multiplexed connection.
//!
//! Every unit on the physical connection is an [`Envelope`]: a message-type code, an optional
//! correlation ID used to match a response with its request, and an opaque payload. Payload
//! layouts are described by the types implementing [`Payload`].

use core::fmt;

use bytes::{Buf as _, BufMut as _};

// We re-export these types, because they are used in the public API.
#[rustfmt::skip]
pub use bytes::{Bytes, BytesMut};

/// Identifier of a tunnel, chosen by the requesting side
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct TunnelId(u64);

impl From<u64> for TunnelId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl From<TunnelId> for u64 {
    fn from(id: TunnelId) -> Self {
        id.0
    }
}

impl fmt::Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t#{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("packet oversized: max is {max}, got {packet_size}")]
    PacketOversized { packet_size: usize, max: usize },
    #[error("not enough bytes provided to decode {name}: received {received} bytes, expected {expected} bytes")]
    NotEnoughBytes {
        name: &'static str,
        received: usize,
        expected: usize,
    },
    #[error("invalid `{field}` in {name}: {reason}")]
    InvalidPacket {
        name: &'static str,
        field: &'static str,
        reason: &'static str,
    },
}

macro_rules! ensure_size {
    ($buf:ident [$expected:expr] for $name:expr) => {{
        let received = $buf.len();
        let expected = $expected;
        if !(received >= expected) {
            return Err(Error::NotEnoughBytes {
                name: $name,
                received,
                expected,
            });
        }
    }};
    (fixed $packet_struct:ident in $buf:ident) => {{
        ensure_size!($buf[$packet_struct::FIXED_PART_SIZE] for $packet_struct::NAME)
    }};
}

fn decode_trailing_str(buf: &Bytes, name: &'static str, field: &'static str) -> Result<String, Error> {
    let value = std::str::from_utf8(buf).map_err(|_| Error::InvalidPacket {
        name,
        field,
        reason: "not valid UTF-8",
    })?;

    Ok(value.to_owned())
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    ShellReq = 0x10,
    ShellResp = 0x11,
    PortFwdReq = 0x12,
    PortFwdResp = 0x13,
    TunnelData = 0x20,
    TunnelClose = 0x21,
}

impl TryFrom<u32> for MessageType {
    type Error = Error;

    fn try_from(v: u32) -> Result<MessageType, Error> {
        match v {
            0x10 => Ok(MessageType::ShellReq),
            0x11 => Ok(MessageType::ShellResp),
            0x12 => Ok(MessageType::PortFwdReq),
            0x13 => Ok(MessageType::PortFwdResp),
            0x20 => Ok(MessageType::TunnelData),
            0x21 => Ok(MessageType::TunnelClose),
            _ => Err(Error::InvalidPacket {
                name: Envelope::NAME,
                field: "msgType",
                reason: "unknown value",
            }),
        }
    }
}

impl From<MessageType> for u32 {
    fn from(ty: MessageType) -> Self {
        ty as u32
    }
}

/// One message unit on the physical connection
#[derive(Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Raw message-type code, kept as is so unknown codes can be reported by the receiver.
    pub ty: u32,
    /// Correlation ID, only set on requests expecting a response and on their responses.
    pub id: Option<u64>,
    pub data: Bytes,
}

// We don't want to print `data` content (usually too big)
impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("ty", &self.ty)
            .field("id", &self.id)
            .field("data.len()", &self.data.len())
            .finish_non_exhaustive()
    }
}

impl Envelope {
    pub const NAME: &'static str = "ENVELOPE";
    pub const HEADER_SIZE: usize = 4 /* msgSize */ + 4 /* msgType */ + 1 /* msgFlags */;
    pub const CORRELATION_ID_SIZE: usize = 8;
    pub const MAXIMUM_SIZE: usize = 16 * 1024 * 1024; // 16 MiB

    const FLAG_CORRELATION_ID: u8 = 0b0000_0001;

    pub fn new(ty: MessageType, data: Bytes) -> Self {
        Self {
            ty: u32::from(ty),
            id: None,
            data,
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, id: Option<u64>) -> Self {
        self.id = id;
        self
    }

    pub fn from_payload<P: Payload>(ty: MessageType, payload: &P) -> Self {
        Self::new(ty, payload.to_bytes())
    }

    pub fn message_type(&self) -> Result<MessageType, Error> {
        MessageType::try_from(self.ty)
    }

    pub fn size(&self) -> usize {
        let id_size = if self.id.is_some() { Self::CORRELATION_ID_SIZE } else { 0 };
        Self::HEADER_SIZE + id_size + self.data.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), Error> {
        let size = self.size();

        if size > Self::MAXIMUM_SIZE {
            return Err(Error::PacketOversized {
                packet_size: size,
                max: Self::MAXIMUM_SIZE,
            });
        }

        let size_u32 = u32::try_from(size).map_err(|_| Error::PacketOversized {
            packet_size: size,
            max: Self::MAXIMUM_SIZE,
        })?;

        buf.reserve(size);
        buf.put_u32(size_u32);
        buf.put_u32(self.ty);

        match self.id {
            Some(id) => {
                buf.put_u8(Self::FLAG_CORRELATION_ID);
                buf.put_u64(id);
            }
            None => buf.put_u8(0),
        }

        buf.put(self.data.slice(..));

        Ok(())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(buf[Self::HEADER_SIZE] for Self::NAME);

        let total_size = buf.get_u32() as usize;
        let ty = buf.get_u32();
        let flags = buf.get_u8();

        if total_size > Self::MAXIMUM_SIZE {
            return Err(Error::PacketOversized {
                packet_size: total_size,
                max: Self::MAXIMUM_SIZE,
            });
        }

        let body_size = total_size.checked_sub(Self::HEADER_SIZE).ok_or(Error::InvalidPacket {
            name: Self::NAME,
            field: "msgSize",
            reason: "too small",
        })?;

        ensure_size!(buf[body_size] for "BODY");
        let mut body = buf.split_to(body_size);

        let id = if flags & Self::FLAG_CORRELATION_ID != 0 {
            ensure_size!(body[Self::CORRELATION_ID_SIZE] for "CORRELATION ID");
            Some(body.get_u64())
        } else {
            None
        };

        Ok(Self { ty, id, data: body })
    }
}

/// A payload carried by an [`Envelope`]
pub trait Payload: Sized {
    const NAME: &'static str;

    fn size(&self) -> usize;

    fn encode(&self, buf: &mut BytesMut);

    fn decode(buf: Bytes) -> Result<Self, Error>;

    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size());
        self.encode(&mut buf);
        buf.freeze()
    }
}

/// Request for an interactive shell bound to a new tunnel
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ShellReq {
    pub tunnel_id: u64,
    pub enable_pty: bool,
    /// Shell executable override, empty when the system shell should be used.
    pub path: String,
}

impl ShellReq {
    pub const FIXED_PART_SIZE: usize = 8 /* tunnelId */ + 1 /* enablePty */;

    pub fn new(id: TunnelId, path: impl Into<String>, enable_pty: bool) -> Self {
        Self {
            tunnel_id: u64::from(id),
            enable_pty,
            path: path.into(),
        }
    }

    /// The requested shell path, if any.
    pub fn path_override(&self) -> Option<&str> {
        if self.path.is_empty() { None } else { Some(&self.path) }
    }
}

impl Payload for ShellReq {
    const NAME: &'static str = "SHELL REQUEST";

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE + self.path.len()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.tunnel_id);
        buf.put_u8(u8::from(self.enable_pty));
        buf.put(self.path.as_bytes());
    }

    fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(fixed Self in buf);

        let tunnel_id = buf.get_u64();
        let enable_pty = decode_bool(buf.get_u8(), Self::NAME, "enablePty")?;
        let path = decode_trailing_str(&buf, Self::NAME, "path")?;

        Ok(Self {
            tunnel_id,
            enable_pty,
            path,
        })
    }
}

/// Request for a TCP port-forward bound to a new tunnel
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PortFwdReq {
    pub tunnel_id: u64,
    pub port: u16,
    pub host: String,
}

impl PortFwdReq {
    pub const FIXED_PART_SIZE: usize = 8 /* tunnelId */ + 2 /* port */;

    pub fn new(id: TunnelId, host: impl Into<String>, port: u16) -> Self {
        Self {
            tunnel_id: u64::from(id),
            port,
            host: host.into(),
        }
    }
}

impl Payload for PortFwdReq {
    const NAME: &'static str = "PORT FORWARD REQUEST";

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE + self.host.len()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.tunnel_id);
        buf.put_u16(self.port);
        buf.put(self.host.as_bytes());
    }

    fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(fixed Self in buf);

        let tunnel_id = buf.get_u64();
        let port = buf.get_u16();
        let host = decode_trailing_str(&buf, Self::NAME, "host")?;

        if host.is_empty() {
            return Err(Error::InvalidPacket {
                name: Self::NAME,
                field: "host",
                reason: "empty",
            });
        }

        Ok(Self { tunnel_id, port, host })
    }
}

/// Acknowledgement of a tunnel opening request (shell or port-forward)
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TunnelOpenResponse {
    pub success: bool,
    /// Failure description, empty on success.
    pub err: String,
}

impl TunnelOpenResponse {
    pub const FIXED_PART_SIZE: usize = 1 /* success */;

    pub fn success() -> Self {
        Self {
            success: true,
            err: String::new(),
        }
    }

    pub fn failure(err: impl Into<String>) -> Self {
        Self {
            success: false,
            err: err.into(),
        }
    }
}

impl Payload for TunnelOpenResponse {
    const NAME: &'static str = "TUNNEL OPEN RESPONSE";

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE + self.err.len()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(self.success));
        buf.put(self.err.as_bytes());
    }

    fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(fixed Self in buf);

        let success = decode_bool(buf.get_u8(), Self::NAME, "success")?;
        let err = decode_trailing_str(&buf, Self::NAME, "err")?;

        Ok(Self { success, err })
    }
}

#[derive(PartialEq, Eq, Clone)]
pub struct TunnelData {
    pub tunnel_id: u64,
    pub data: Bytes,
}

// We don't want to print `data` content (usually too big)
impl fmt::Debug for TunnelData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelData")
            .field("tunnel_id", &self.tunnel_id)
            .field("data.len()", &self.data.len())
            .finish_non_exhaustive()
    }
}

impl TunnelData {
    pub const FIXED_PART_SIZE: usize = 8 /* tunnelId */;

    pub fn new(id: TunnelId, data: Bytes) -> Self {
        Self {
            tunnel_id: u64::from(id),
            data,
        }
    }
}

impl Payload for TunnelData {
    const NAME: &'static str = "TUNNEL DATA";

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE + self.data.len()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.tunnel_id);
        buf.put(self.data.slice(..));
    }

    fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(fixed Self in buf);
        Ok(Self {
            tunnel_id: buf.get_u64(),
            data: buf,
        })
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TunnelClose {
    pub tunnel_id: u64,
    /// Close reason, may be empty.
    pub err: String,
}

impl TunnelClose {
    pub const FIXED_PART_SIZE: usize = 8 /* tunnelId */;

    pub fn new(id: TunnelId, err: impl Into<String>) -> Self {
        Self {
            tunnel_id: u64::from(id),
            err: err.into(),
        }
    }
}

impl Payload for TunnelClose {
    const NAME: &'static str = "TUNNEL CLOSE";

    fn size(&self) -> usize {
        Self::FIXED_PART_SIZE + self.err.len()
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.tunnel_id);
        buf.put(self.err.as_bytes());
    }

    fn decode(mut buf: Bytes) -> Result<Self, Error> {
        ensure_size!(fixed Self in buf);

        let tunnel_id = buf.get_u64();
        let err = decode_trailing_str(&buf, Self::NAME, "err")?;

        Ok(Self { tunnel_id, err })
    }
}

fn decode_bool(value: u8, name: &'static str, field: &'static str) -> Result<bool, Error> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(Error::InvalidPacket {
            name,
            field,
            reason: "not a boolean",
        }),
    }
}
