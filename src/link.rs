//! Link framing
//!
//! Packets on the link: `kind:u8, token:u32 (big-endian), len:u8, payload`.
//! The token names the session chosen by the agent at connect time.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

const HEADER: usize = 6;

pub const MAX_PAYLOAD: usize = u8::MAX as usize;

pub const CONNECT_OK: u8 = 0;
pub const CONNECT_UNKNOWN_SERVICE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Connect = 1,
    ConnectResponse = 2,
    Data = 3,
    Eos = 4,
    Reset = 5,
}

impl TryFrom<u8> for PacketKind {
    type Error = LinkError;

    fn try_from(value: u8) -> Result<Self, LinkError> {
        Ok(match value {
            1 => Self::Connect,
            2 => Self::ConnectResponse,
            3 => Self::Data,
            4 => Self::Eos,
            5 => Self::Reset,
            other => return Err(LinkError::UnknownKind(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub token: u32,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(kind: PacketKind, token: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            token,
            payload: payload.into(),
        }
    }

    pub fn control(kind: PacketKind, token: u32) -> Self {
        Self::new(kind, token, Bytes::new())
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link i/o: {0}")]
    Io(#[from] io::Error),
    #[error("unknown packet kind {0}")]
    UnknownKind(u8),
    #[error("payload of {0} bytes does not fit a packet")]
    Oversized(usize),
    #[error("service refused connection (status {0})")]
    Refused(u8),
    #[error("link closed before connect completed")]
    Closed,
    #[error("unexpected {0:?} packet while connecting")]
    Unexpected(PacketKind),
}

#[derive(Debug, Default)]
pub struct LinkCodec;

impl Decoder for LinkCodec {
    type Item = Packet;
    type Error = LinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, LinkError> {
        if src.len() < HEADER {
            return Ok(None);
        }
        let len = usize::from(src[HEADER - 1]);
        if src.len() < HEADER + len {
            src.reserve(HEADER + len - src.len());
            return Ok(None);
        }

        let kind = PacketKind::try_from(src.get_u8())?;
        let token = src.get_u32();
        src.advance(1);
        let payload = src.split_to(len).freeze();
        Ok(Some(Packet { kind, token, payload }))
    }
}

impl Encoder<Packet> for LinkCodec {
    type Error = LinkError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), LinkError> {
        let len = packet.payload.len();
        if len > MAX_PAYLOAD {
            return Err(LinkError::Oversized(len));
        }
        dst.reserve(HEADER + len);
        dst.put_u8(packet.kind as u8);
        dst.put_u32(packet.token);
        dst.put_u8(len as u8);
        dst.put_slice(&packet.payload);
        Ok(())
    }
}
