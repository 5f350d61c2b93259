//! Inbound packet queue from the dispatcher to the gate's packet routine
//!
//! Producers (the dispatcher reader, tests) never block: the queue is an
//! unbounded channel. Exactly one consumer drains it, which is what orders
//! every dispatcher-originated effect.

use shared::{MsgType, Packet};
use tokio::sync::mpsc;

#[derive(Debug)]
pub struct PacketQueueItem {
    pub msgtype: MsgType,
    pub packet: Packet,
}

/// Producer side; cheap to clone
#[derive(Debug, Clone)]
pub struct PacketQueue {
    tx: mpsc::UnboundedSender<PacketQueueItem>,
}

/// Consumer side; owned by the packet routine
#[derive(Debug)]
pub struct PacketQueueReceiver {
    rx: mpsc::UnboundedReceiver<PacketQueueItem>,
}

/// Creates a queue: a clonable producer and its single consumer
pub fn packet_queue() -> (PacketQueue, PacketQueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PacketQueue { tx }, PacketQueueReceiver { rx })
}

impl PacketQueue {
    /// Appends a packet. Returns false if the consumer has gone away.
    pub fn enqueue(&self, packet: Packet) -> bool {
        let item = PacketQueueItem {
            msgtype: packet.msg_type(),
            packet,
        };
        self.tx.send(item).is_ok()
    }
}

impl PacketQueueReceiver {
    /// Waits for the next item; `None` once every producer is dropped
    pub async fn pop(&mut self) -> Option<PacketQueueItem> {
        self.rx.recv().await
    }

    /// Takes the next packet if one is already queued
    pub fn try_pop(&mut self) -> Option<PacketQueueItem> {
        self.rx.try_recv().ok()
    }
}
