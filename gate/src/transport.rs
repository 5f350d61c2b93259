//! TCP transport for client connections
//!
//! Accepts sockets, gives each one a fresh [`ClientId`] and serves it with two
//! tasks: a reader that relays client packets to the dispatcher and a writer
//! that drains the connection's outbound channel. The gate core only sees the
//! [`TcpClientConnection`] handle.

use crate::client_proxy::ClientConnection;
use crate::error::{GateError, Result};
use crate::framing::{read_packet, write_packet};
use crate::service::GateService;
use log::{debug, error, info, warn};
use shared::{ClientId, Packet, HEARTBEAT_FROM_CLIENT};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};

/// Handle to one accepted TCP client
pub struct TcpClientConnection {
    id: ClientId,
    addr: SocketAddr,
    tx: mpsc::UnboundedSender<Packet>,
    closed: watch::Sender<bool>,
}

impl ClientConnection for TcpClientConnection {
    fn client_id(&self) -> ClientId {
        self.id
    }

    fn send_packet(&self, packet: &Packet) {
        if self.tx.send(packet.clone()).is_err() {
            debug!("Client {} writer gone, dropping packet", self.id);
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.addr)
    }
}

/// Accepts client connections until the gate terminates
pub async fn serve(gate: Arc<GateService>, listener: TcpListener) {
    loop {
        tokio::select! {
            _ = gate.wait_terminated() => {
                info!("{} stopped accepting connections", gate);
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let gate = Arc::clone(&gate);
                    tokio::spawn(async move {
                        serve_connection(gate, stream, addr).await;
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    sleep(Duration::from_millis(10)).await;
                }
            },
        }
    }
}

async fn serve_connection(gate: Arc<GateService>, stream: TcpStream, addr: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
    }

    let id = ClientId::generate();
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    let (closed, closed_rx) = watch::channel(false);
    let conn = Arc::new(TcpClientConnection {
        id,
        addr,
        tx,
        closed,
    });

    // Refused connections are closed by dropping the socket halves here
    if !gate.on_client_connected(Arc::clone(&conn) as Arc<dyn ClientConnection>) {
        return;
    }

    let writer_task = tokio::spawn(write_loop(id, writer, rx, closed_rx.clone()));
    read_loop(&gate, id, reader, closed_rx).await;

    conn.close();
    gate.on_client_disconnected(id);
    drop(conn);
    if let Err(e) = writer_task.await {
        error!("Writer task for client {} failed: {}", id, e);
    }
}

async fn read_loop(
    gate: &GateService,
    id: ClientId,
    mut reader: OwnedReadHalf,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        tokio::select! {
            _ = closed.changed() => return,
            result = read_packet(&mut reader) => match result {
                Ok(Some(packet)) => {
                    if packet.msg_type() == HEARTBEAT_FROM_CLIENT {
                        continue;
                    }
                    gate.dispatcher().forward_client_packet(id, &packet);
                }
                Ok(None) => {
                    debug!("Client {} closed the connection", id);
                    return;
                }
                Err(e) => {
                    warn!("Dropping client {}: {}", id, e);
                    return;
                }
            },
        }
    }
}

/// How long a closed connection may keep writing what it was handed before
/// the close
const CLOSE_WRITE_GRACE: Duration = Duration::from_secs(1);

async fn write_loop<W>(
    id: ClientId,
    writer: W,
    mut rx: mpsc::UnboundedReceiver<Packet>,
    mut closed: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);

    loop {
        if *closed.borrow_and_update() {
            break;
        }
        let packet = tokio::select! {
            packet = rx.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
            changed = closed.changed() => {
                if changed.is_err() || *closed.borrow() {
                    break;
                }
                continue;
            }
        };

        let result = tokio::select! {
            result = write_batch(&mut writer, packet, &mut rx) => result,
            _ = closed_for(&mut closed, CLOSE_WRITE_GRACE) => {
                debug!("Client {} is not reading, dropping pending packets", id);
                return;
            }
        };
        if let Err(e) = result {
            debug!("Failed to write to client {}: {}", id, e);
            return;
        }
    }

    // Packets handed over before the close still go out, within the grace period
    let drain = async {
        while let Ok(packet) = rx.try_recv() {
            write_packet(&mut writer, &packet).await?;
        }
        writer.flush().await?;
        writer.shutdown().await?;
        Ok::<(), GateError>(())
    };
    match timeout(CLOSE_WRITE_GRACE, drain).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Failed to drain client {}: {}", id, e),
        Err(_) => debug!("Client {} is not reading, dropping pending packets", id),
    }
}

/// Writes `first` and everything already queued behind it, then flushes
async fn write_batch<W>(
    writer: &mut W,
    first: Packet,
    rx: &mut mpsc::UnboundedReceiver<Packet>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_packet(writer, &first).await?;
    while let Ok(packet) = rx.try_recv() {
        write_packet(writer, &packet).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Resolves `grace` after the connection has been closed
async fn closed_for(closed: &mut watch::Receiver<bool>, grace: Duration) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            break;
        }
    }
    sleep(grace).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{CALL_ENTITY_METHOD_ON_CLIENT, CALL_FILTERED_CLIENTS};

    fn channels() -> (
        mpsc::UnboundedSender<Packet>,
        mpsc::UnboundedReceiver<Packet>,
        watch::Sender<bool>,
        watch::Receiver<bool>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, closed_rx) = watch::channel(false);
        (tx, rx, closed, closed_rx)
    }

    /// Packets handed over before the close reach a reading client
    #[tokio::test]
    async fn test_write_loop_drains_after_close() {
        let (a, mut b) = tokio::io::duplex(4096);
        let (tx, rx, closed, closed_rx) = channels();

        tx.send(Packet::builder(CALL_ENTITY_METHOD_ON_CLIENT).build()).unwrap();
        tx.send(Packet::builder(CALL_FILTERED_CLIENTS).build()).unwrap();
        closed.send_replace(true);

        write_loop(ClientId::generate(), a, rx, closed_rx).await;

        let first = read_packet(&mut b).await.unwrap().unwrap();
        assert_eq!(first.msg_type(), CALL_ENTITY_METHOD_ON_CLIENT);
        let second = read_packet(&mut b).await.unwrap().unwrap();
        assert_eq!(second.msg_type(), CALL_FILTERED_CLIENTS);
        assert!(read_packet(&mut b).await.unwrap().is_none());
    }

    /// A closed client that never reads does not pin the writer
    #[tokio::test]
    async fn test_write_loop_gives_up_on_stalled_client() {
        let (a, _b) = tokio::io::duplex(64);
        let (tx, rx, closed, closed_rx) = channels();

        let big = Packet::builder(CALL_FILTERED_CLIENTS)
            .append_bytes(&[7u8; 64 * 1024])
            .build();
        tx.send(big.clone()).unwrap();

        let writer = tokio::spawn(write_loop(ClientId::generate(), a, rx, closed_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!writer.is_finished());

        tx.send(big).unwrap();
        closed.send_replace(true);

        let finished = timeout(CLOSE_WRITE_GRACE * 5, writer).await;
        assert!(finished.is_ok());
    }

    /// Same for packets still queued when the close arrives
    #[tokio::test]
    async fn test_drain_gives_up_on_stalled_client() {
        let (a, _b) = tokio::io::duplex(64);
        let (tx, rx, closed, closed_rx) = channels();

        for _ in 0..4 {
            tx.send(
                Packet::builder(CALL_FILTERED_CLIENTS)
                    .append_bytes(&[1u8; 16 * 1024])
                    .build(),
            )
            .unwrap();
        }
        closed.send_replace(true);

        let finished = timeout(
            CLOSE_WRITE_GRACE * 5,
            write_loop(ClientId::generate(), a, rx, closed_rx),
        )
        .await;
        assert!(finished.is_ok());
    }
}
