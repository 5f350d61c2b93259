//! Link between the gate and the dispatcher
//!
//! The gate core only needs three outbound calls, captured by the
//! [`Dispatcher`] trait. [`DispatcherClient`] implements them over a single
//! TCP connection: outbound packets go through an unbounded channel to a
//! writer task, and [`DispatcherReader`] pushes every inbound packet onto the
//! gate's packet queue.

use crate::error::Result;
use crate::framing::{read_packet, write_packet};
use crate::packet_queue::PacketQueue;
use log::{debug, error, info, warn};
use shared::{
    ClientId, Packet, NOTIFY_CLIENT_CONNECTED, NOTIFY_CLIENT_DISCONNECTED, SET_GATE_ID,
};
use std::net::SocketAddr;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Outbound calls from the gate to the dispatcher
///
/// Implementations must not block: every call is made from latency-sensitive
/// paths (the packet routine, connection tasks).
pub trait Dispatcher: Send + Sync {
    fn notify_client_connected(&self, client_id: ClientId);

    fn notify_client_disconnected(&self, client_id: ClientId);

    /// Relays a packet received from a client
    fn forward_client_packet(&self, client_id: ClientId, packet: &Packet);
}

/// Builds the packet relayed upstream for a client packet: same message
/// type, client id first, then the client's original payload.
pub fn client_packet_for_dispatcher(client_id: ClientId, packet: &Packet) -> Packet {
    Packet::builder(packet.msg_type())
        .append_client_id(client_id)
        .append_bytes(packet.payload())
        .build()
}

/// Outbound half of the TCP link to the dispatcher
pub struct DispatcherClient {
    addr: SocketAddr,
    tx: mpsc::UnboundedSender<Packet>,
}

/// Inbound half of a dispatcher connection, not yet attached to a gate
pub struct DispatcherReader {
    addr: SocketAddr,
    reader: OwnedReadHalf,
}

impl DispatcherClient {
    /// Connects and announces `gate_id`
    pub async fn connect(addr: &str, gate_id: u16) -> Result<(Self, DispatcherReader)> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        info!("Connected to dispatcher at {}", peer);

        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        let handshake = Packet::builder(SET_GATE_ID).append_u16(gate_id).build();
        // The receiver is alive until the writer task below exits
        let _ = tx.send(handshake);
        tokio::spawn(Self::write_loop(peer, writer, rx));

        Ok((
            Self { addr: peer, tx },
            DispatcherReader { addr: peer, reader },
        ))
    }

    fn send(&self, packet: Packet) {
        if self.tx.send(packet).is_err() {
            warn!("Dispatcher link to {} is down, dropping packet", self.addr);
        }
    }

    async fn write_loop(
        addr: SocketAddr,
        writer: OwnedWriteHalf,
        mut rx: mpsc::UnboundedReceiver<Packet>,
    ) {
        let mut writer = BufWriter::new(writer);

        while let Some(packet) = rx.recv().await {
            if let Err(e) = write_packet(&mut writer, &packet).await {
                error!("Failed to write to dispatcher {}: {}", addr, e);
                return;
            }
            // Batch whatever is already queued before flushing
            while let Ok(packet) = rx.try_recv() {
                if let Err(e) = write_packet(&mut writer, &packet).await {
                    error!("Failed to write to dispatcher {}: {}", addr, e);
                    return;
                }
            }
            if let Err(e) = writer.flush().await {
                error!("Failed to flush to dispatcher {}: {}", addr, e);
                return;
            }
        }
        debug!("Dispatcher writer for {} stopped", addr);
    }
}

impl Dispatcher for DispatcherClient {
    fn notify_client_connected(&self, client_id: ClientId) {
        let packet = Packet::builder(NOTIFY_CLIENT_CONNECTED)
            .append_client_id(client_id)
            .build();
        self.send(packet);
    }

    fn notify_client_disconnected(&self, client_id: ClientId) {
        let packet = Packet::builder(NOTIFY_CLIENT_DISCONNECTED)
            .append_client_id(client_id)
            .build();
        self.send(packet);
    }

    fn forward_client_packet(&self, client_id: ClientId, packet: &Packet) {
        self.send(client_packet_for_dispatcher(client_id, packet));
    }
}

impl DispatcherReader {
    /// Spawns the task feeding dispatcher packets into `queue`
    pub fn spawn(self, queue: PacketQueue) -> JoinHandle<()> {
        tokio::spawn(self.read_loop(queue))
    }

    async fn read_loop(mut self, queue: PacketQueue) {
        loop {
            match read_packet(&mut self.reader).await {
                Ok(Some(packet)) => {
                    if !queue.enqueue(packet) {
                        debug!("Packet queue closed, dispatcher reader exiting");
                        return;
                    }
                }
                Ok(None) => {
                    warn!("Dispatcher {} closed the connection", self.addr);
                    return;
                }
                Err(e) => {
                    error!("Failed to read from dispatcher {}: {}", self.addr, e);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet_queue::packet_queue;
    use shared::{CALL_ENTITY_METHOD_FROM_CLIENT, CALL_FILTERED_CLIENTS};
    use tokio::net::TcpListener;

    #[test]
    fn test_client_packet_prefixes_client_id() {
        let id = ClientId::generate();
        let from_client = Packet::builder(CALL_ENTITY_METHOD_FROM_CLIENT)
            .append_var_str("attack")
            .build();

        let mut relayed = client_packet_for_dispatcher(id, &from_client);
        assert_eq!(relayed.msg_type(), CALL_ENTITY_METHOD_FROM_CLIENT);
        assert_eq!(relayed.read_client_id().unwrap(), id);
        assert_eq!(relayed.read_var_str().unwrap(), "attack");
    }

    #[tokio::test]
    async fn test_handshake_notifications_and_inbound_queue() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let (client, reader) = DispatcherClient::connect(&addr, 7).await.unwrap();
        let (mut dispatcher_side, _) = listener.accept().await.unwrap();

        let (queue, mut receiver) = packet_queue();
        reader.spawn(queue);

        let id = ClientId::generate();
        client.notify_client_connected(id);
        client.notify_client_disconnected(id);

        let mut handshake = read_packet(&mut dispatcher_side).await.unwrap().unwrap();
        assert_eq!(handshake.msg_type(), SET_GATE_ID);
        assert_eq!(handshake.read_u16().unwrap(), 7);

        let mut connected = read_packet(&mut dispatcher_side).await.unwrap().unwrap();
        assert_eq!(connected.msg_type(), NOTIFY_CLIENT_CONNECTED);
        assert_eq!(connected.read_client_id().unwrap(), id);

        let mut disconnected = read_packet(&mut dispatcher_side).await.unwrap().unwrap();
        assert_eq!(disconnected.msg_type(), NOTIFY_CLIENT_DISCONNECTED);
        assert_eq!(disconnected.read_client_id().unwrap(), id);

        let inbound = Packet::builder(CALL_FILTERED_CLIENTS)
            .append_var_str("zone")
            .append_var_str("forest")
            .build();
        write_packet(&mut dispatcher_side, &inbound).await.unwrap();

        let item = receiver.pop().await.unwrap();
        assert_eq!(item.msgtype, CALL_FILTERED_CLIENTS);
        assert_eq!(item.packet.as_bytes(), inbound.as_bytes());
    }
}
