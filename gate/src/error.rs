//! Gate error types.

use shared::{MsgType, PacketError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GateError {
    /// Payload could not be decoded
    #[error("malformed packet: {0}")]
    Packet(#[from] PacketError),

    /// Message type outside the dispatcher protocol
    #[error("unknown msg type: {0}")]
    UnknownMsgType(MsgType),

    /// Frame length header above the protocol limit
    #[error("frame of {0} bytes exceeds the packet size limit")]
    FrameTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GateError>;
