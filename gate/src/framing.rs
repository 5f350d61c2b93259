//! Length-prefixed packet framing used on client and dispatcher sockets
//!
//! A frame is a little-endian `u32` body length followed by the body, which
//! is a complete [`Packet`] (message type and payload).
//!
//! [`read_packet`] suits loops that stop reading once they lose a race.
//! Callers that keep reading after a cancelled read (a `select!` with a timer
//! arm, for instance) use [`PacketReader`], which keeps partial frames
//! across calls.

use crate::error::{GateError, Result};
use bytes::{Buf, Bytes, BytesMut};
use shared::{Packet, MAX_PACKET_SIZE};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LEN_PREFIX: usize = 4;

/// Reads one frame. Returns `Ok(None)` on a clean end of stream.
///
/// Not cancel safe: dropping the future after the length prefix was read
/// loses those bytes and desynchronizes the stream.
pub async fn read_packet<R>(reader: &mut R) -> Result<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32_le().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_PACKET_SIZE {
        return Err(GateError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(Packet::from_bytes(Bytes::from(body))?))
}

/// Buffered frame reader whose [`next_packet`](PacketReader::next_packet)
/// is cancel safe
///
/// Bytes read so far are kept in the reader, so a `next_packet` future can
/// be dropped at any await point and the next call picks up where it left
/// off.
pub struct PacketReader<R> {
    reader: R,
    buf: BytesMut,
}

impl<R> PacketReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Wraps the read half of a stream
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Reads the next frame. Returns `Ok(None)` on a clean end of stream.
    pub async fn next_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            if let Some(packet) = self.take_frame()? {
                return Ok(Some(packet));
            }

            // read_buf only appends to self.buf, so cancelling here loses nothing
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
        }
    }

    fn take_frame(&mut self) -> Result<Option<Packet>> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&self.buf[..LEN_PREFIX]);
        let len = u32::from_le_bytes(prefix) as usize;
        if len > MAX_PACKET_SIZE {
            return Err(GateError::FrameTooLarge(len));
        }
        if self.buf.len() < LEN_PREFIX + len {
            self.buf.reserve(LEN_PREFIX + len - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(LEN_PREFIX);
        let body = self.buf.split_to(len).freeze();
        Ok(Some(Packet::from_bytes(body)?))
    }
}

/// Writes one frame without flushing
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = packet.as_bytes();
    writer.write_u32_le(body.len() as u32).await?;
    writer.write_all(body).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{ClientId, CALL_FILTERED_CLIENTS, SET_CLIENTPROXY_FILTER_PROP};
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let id = ClientId::generate();

        let first = Packet::builder(SET_CLIENTPROXY_FILTER_PROP)
            .append_u16(0)
            .append_client_id(id)
            .append_var_str("zone")
            .append_var_str("forest")
            .build();
        let second = Packet::builder(CALL_FILTERED_CLIENTS).build();

        assert_ok!(write_packet(&mut a, &first).await);
        assert_ok!(write_packet(&mut a, &second).await);
        drop(a);

        let mut received = read_packet(&mut b).await.unwrap().unwrap();
        assert_eq!(received.as_bytes(), first.as_bytes());
        assert_eq!(received.read_u16().unwrap(), 0);
        assert_eq!(received.read_client_id().unwrap(), id);

        let received = read_packet(&mut b).await.unwrap().unwrap();
        assert_eq!(received.msg_type(), CALL_FILTERED_CLIENTS);

        assert!(read_packet(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32_le((MAX_PACKET_SIZE + 1) as u32).await.unwrap();

        let result = read_packet(&mut b).await;
        assert!(matches!(result, Err(GateError::FrameTooLarge(_))));
    }

    #[tokio::test]
    async fn test_frame_without_msg_type() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32_le(1).await.unwrap();
        a.write_u8(7).await.unwrap();

        assert_err!(read_packet(&mut b).await);
    }

    #[tokio::test]
    async fn test_packet_reader_survives_cancelled_read() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut reader = PacketReader::new(b);

        let packet = Packet::builder(CALL_FILTERED_CLIENTS)
            .append_var_str("zone")
            .append_var_str("forest")
            .build();
        let mut frame = Vec::new();
        assert_ok!(write_packet(&mut frame, &packet).await);

        // Half of the length prefix, then the read is abandoned
        a.write_all(&frame[..2]).await.unwrap();
        let cancelled =
            tokio::time::timeout(std::time::Duration::from_millis(20), reader.next_packet()).await;
        assert!(cancelled.is_err());

        a.write_all(&frame[2..]).await.unwrap();
        let received = reader.next_packet().await.unwrap().unwrap();
        assert_eq!(received.msg_type(), CALL_FILTERED_CLIENTS);
        assert_eq!(received.as_bytes(), packet.as_bytes());

        drop(a);
        assert!(reader.next_packet().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_packet_reader_frames_in_one_read() {
        let (mut a, b) = tokio::io::duplex(1024);
        let mut reader = PacketReader::new(b);

        let first = Packet::builder(SET_CLIENTPROXY_FILTER_PROP).append_u16(7).build();
        let second = Packet::builder(CALL_FILTERED_CLIENTS).build();
        assert_ok!(write_packet(&mut a, &first).await);
        assert_ok!(write_packet(&mut a, &second).await);
        a.write_all(&[1, 0]).await.unwrap();
        drop(a);

        let mut received = reader.next_packet().await.unwrap().unwrap();
        assert_eq!(received.read_u16().unwrap(), 7);
        assert_eq!(
            reader.next_packet().await.unwrap().unwrap().msg_type(),
            CALL_FILTERED_CLIENTS
        );
        // Trailing partial prefix at end of stream
        assert!(matches!(reader.next_packet().await, Err(GateError::Io(_))));
    }

    #[tokio::test]
    async fn test_packet_reader_rejects_oversized_frame() {
        let (mut a, b) = tokio::io::duplex(64);
        let mut reader = PacketReader::new(b);
        a.write_u32_le((MAX_PACKET_SIZE + 1) as u32).await.unwrap();

        assert!(matches!(
            reader.next_packet().await,
            Err(GateError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_body() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32_le(10).await.unwrap();
        a.write_all(&[1, 2, 3]).await.unwrap();
        drop(a);

        assert!(matches!(read_packet(&mut b).await, Err(GateError::Io(_))));
    }
}
