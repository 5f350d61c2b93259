//! Wire protocol shared by the gate, the dispatcher and test clients.
//!
//! Every frame body on the wire is a [`Packet`]: a little-endian `u16`
//! message type followed by a type-specific payload. Strings are encoded as a
//! `u32` length prefix followed by UTF-8 bytes, and client identities as
//! [`CLIENT_ID_LENGTH`] raw bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use thiserror::Error;

pub type MsgType = u16;

/// Largest frame body (message type plus payload) accepted on any connection.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

pub const CLIENT_ID_LENGTH: usize = 16;

// Gate -> dispatcher notifications
pub const SET_GATE_ID: MsgType = 1;
pub const NOTIFY_CLIENT_CONNECTED: MsgType = 2;
pub const NOTIFY_CLIENT_DISCONNECTED: MsgType = 3;

// Dispatcher -> gate, routed to a single client proxy
pub const REDIRECT_TO_GATEPROXY_START: MsgType = 1001;
pub const CREATE_ENTITY_ON_CLIENT: MsgType = 1002;
pub const DESTROY_ENTITY_ON_CLIENT: MsgType = 1003;
pub const NOTIFY_ATTR_CHANGE_ON_CLIENT: MsgType = 1004;
pub const CALL_ENTITY_METHOD_ON_CLIENT: MsgType = 1005;
pub const SET_CLIENTPROXY_FILTER_PROP: MsgType = 1006;
pub const CLEAR_CLIENTPROXY_FILTER_PROPS: MsgType = 1007;
pub const REDIRECT_TO_GATEPROXY_STOP: MsgType = 1500;

// Dispatcher -> gate, fanned out through the filter index
pub const CALL_FILTERED_CLIENTS: MsgType = 1501;

// Client -> gate -> dispatcher
pub const CALL_ENTITY_METHOD_FROM_CLIENT: MsgType = 2001;
pub const HEARTBEAT_FROM_CLIENT: MsgType = 2002;

/// Returns true if packets of this type are addressed to one client proxy.
pub fn is_redirect_to_gateproxy(msgtype: MsgType) -> bool {
    (REDIRECT_TO_GATEPROXY_START..=REDIRECT_TO_GATEPROXY_STOP).contains(&msgtype)
}

/// Errors raised while decoding a packet payload
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short for message type ({0} bytes)")]
    MissingMsgType(usize),

    #[error("packet truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
}

/// Opaque identity of one client connection, unique for its lifetime
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId([u8; CLIENT_ID_LENGTH]);

impl ClientId {
    /// Generates a fresh random identity
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub fn from_bytes(bytes: [u8; CLIENT_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CLIENT_ID_LENGTH] {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self)
    }
}

/// A decoded frame body with a read cursor over its payload
///
/// The underlying buffer is reference counted, so cloning a packet for
/// several recipients never copies the payload. Reading advances a cursor
/// private to this instance and leaves the buffer untouched; forwarding a
/// packet always forwards the complete frame body.
#[derive(Clone)]
pub struct Packet {
    data: Bytes,
    pos: usize,
}

impl Packet {
    const HEADER_LEN: usize = 2;

    /// Wraps a received frame body
    pub fn from_bytes(data: Bytes) -> Result<Self, PacketError> {
        if data.len() < Self::HEADER_LEN {
            return Err(PacketError::MissingMsgType(data.len()));
        }
        Ok(Self {
            data,
            pos: Self::HEADER_LEN,
        })
    }

    pub fn builder(msgtype: MsgType) -> PacketBuilder {
        PacketBuilder::new(msgtype)
    }

    pub fn msg_type(&self) -> MsgType {
        let mut header = &self.data[..Self::HEADER_LEN];
        header.get_u16_le()
    }

    /// The complete frame body, message type included
    pub fn as_bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[Self::HEADER_LEN..]
    }

    /// Unread part of the payload
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub fn read_u16(&mut self) -> Result<u16, PacketError> {
        self.ensure(2)?;
        let mut buf = &self.data[self.pos..];
        let value = buf.get_u16_le();
        self.pos += 2;
        Ok(value)
    }

    pub fn read_u32(&mut self) -> Result<u32, PacketError> {
        self.ensure(4)?;
        let mut buf = &self.data[self.pos..];
        let value = buf.get_u32_le();
        self.pos += 4;
        Ok(value)
    }

    pub fn read_client_id(&mut self) -> Result<ClientId, PacketError> {
        self.ensure(CLIENT_ID_LENGTH)?;
        let mut bytes = [0u8; CLIENT_ID_LENGTH];
        bytes.copy_from_slice(&self.data[self.pos..self.pos + CLIENT_ID_LENGTH]);
        self.pos += CLIENT_ID_LENGTH;
        Ok(ClientId(bytes))
    }

    pub fn read_var_bytes(&mut self) -> Result<Bytes, PacketError> {
        let len = self.read_u32()? as usize;
        self.ensure(len)?;
        let value = self.data.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(value)
    }

    pub fn read_var_str(&mut self) -> Result<String, PacketError> {
        let bytes = self.read_var_bytes()?;
        std::str::from_utf8(&bytes)
            .map(str::to_owned)
            .map_err(|_| PacketError::InvalidUtf8)
    }

    fn ensure(&self, needed: usize) -> Result<(), PacketError> {
        let remaining = self.data.len() - self.pos;
        if remaining < needed {
            return Err(PacketError::Truncated { needed, remaining });
        }
        Ok(())
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("msgtype", &self.msg_type())
            .field("payload_len", &self.payload().len())
            .field("pos", &self.pos)
            .finish()
    }
}

/// Incrementally encodes a packet
pub struct PacketBuilder {
    buf: BytesMut,
}

impl PacketBuilder {
    pub fn new(msgtype: MsgType) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u16_le(msgtype);
        Self { buf }
    }

    pub fn append_u16(mut self, value: u16) -> Self {
        self.buf.put_u16_le(value);
        self
    }

    pub fn append_u32(mut self, value: u32) -> Self {
        self.buf.put_u32_le(value);
        self
    }

    pub fn append_client_id(mut self, id: ClientId) -> Self {
        self.buf.put_slice(id.as_bytes());
        self
    }

    pub fn append_var_str(self, value: &str) -> Self {
        self.append_var_bytes(value.as_bytes())
    }

    pub fn append_var_bytes(mut self, value: &[u8]) -> Self {
        self.buf.put_u32_le(value.len() as u32);
        self.buf.put_slice(value);
        self
    }

    /// Appends raw bytes without a length prefix
    pub fn append_bytes(mut self, value: &[u8]) -> Self {
        self.buf.put_slice(value);
        self
    }

    pub fn build(self) -> Packet {
        Packet {
            data: self.buf.freeze(),
            pos: Packet::HEADER_LEN,
        }
    }
}
