//! Core-side view of a client connection
//!
//! The transport owns the socket; the gate only needs an identity, a way to
//! hand a packet to the connection's send path and a way to close it. That
//! surface is the [`ClientConnection`] trait. [`ClientProxy`] wraps a
//! connection together with the filter properties the dispatcher has set on
//! it.

use parking_lot::{Mutex, MutexGuard};
use shared::{ClientId, Packet};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A live client connection provided by the transport
///
/// `send_packet` must be a non-blocking hand-off to the connection's own
/// writer; packets handed to the same connection must be written in the order
/// they were handed over. `close` must be idempotent from the transport's
/// point of view and eventually lead to `GateService::on_client_disconnected`.
pub trait ClientConnection: Send + Sync {
    fn client_id(&self) -> ClientId;

    fn send_packet(&self, packet: &Packet);

    fn close(&self);

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Filter properties of one client
///
/// Only mutated while the gate's filter index lock is held.
#[derive(Debug, Default)]
pub(crate) struct FilterProps {
    pub(crate) values: HashMap<String, String>,
    /// Set once the proxy has left the registry; no further index inserts
    pub(crate) detached: bool,
}

/// The gate's record of one client: its connection and filter properties
///
/// Proxies live in the registry from a successful connect until the
/// transport reports the disconnect.
pub struct ClientProxy {
    id: ClientId,
    conn: Arc<dyn ClientConnection>,
    filter_props: Mutex<FilterProps>,
    closed: AtomicBool,
}

impl ClientProxy {
    /// Wraps a connection; the proxy takes the connection's client id
    pub fn new(conn: Arc<dyn ClientConnection>) -> Self {
        Self {
            id: conn.client_id(),
            conn,
            filter_props: Mutex::new(FilterProps::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.peer_addr()
    }

    /// Hands a packet to the connection's writer without waiting
    pub fn send_packet(&self, packet: &Packet) {
        self.conn.send_packet(packet);
    }

    /// Closes the underlying connection. Only the first call reaches it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.conn.close();
        true
    }

    /// Whether [`close`](ClientProxy::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Copy of the current filter properties
    pub fn filter_props(&self) -> HashMap<String, String> {
        self.filter_props.lock().values.clone()
    }

    pub(crate) fn props(&self) -> MutexGuard<'_, FilterProps> {
        self.filter_props.lock()
    }
}

impl fmt::Display for ClientProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer_addr() {
            Some(addr) => write!(f, "ClientProxy<{}@{}>", self.id, addr),
            None => write!(f, "ClientProxy<{}>", self.id),
        }
    }
}

impl fmt::Debug for ClientProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientProxy")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
