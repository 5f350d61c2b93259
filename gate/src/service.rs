//! The gate service: client registry, filter index and dispatcher protocol
//!
//! ## Packet routine
//! Every packet from the dispatcher goes through one [`PacketQueue`] and is
//! handled by exactly one task, in arrival order. Filter property changes,
//! redirects and filtered broadcasts are therefore applied in the order the
//! dispatcher sent them.
//!
//! ## Lock order
//! Three kinds of locks are involved: the filter index mutex, the registry's
//! shard locks and each proxy's filter property mutex. They are only ever
//! nested in this order:
//!
//! filter index -> registry shard -> proxy filter props
//!
//! The broadcast path holds the filter index while looking proxies up in the
//! registry. The disconnect path removes the proxy from the registry first
//! and takes the filter index afterwards, never while a shard is held.

use crate::client_manager::{ClientManager, RegisterError};
use crate::client_proxy::{ClientConnection, ClientProxy};
use crate::config::GateConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{GateError, Result};
use crate::filter_tree::FilterIndex;
use crate::opmon::{Operation, OperationStats, OperationSummary};
use crate::packet_queue::{packet_queue, PacketQueue, PacketQueueItem, PacketQueueReceiver};
use crate::transport;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use shared::{
    is_redirect_to_gateproxy, ClientId, MsgType, Packet, CALL_FILTERED_CLIENTS,
    CLEAR_CLIENTPROXY_FILTER_PROPS, SET_CLIENTPROXY_FILTER_PROP,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Point-in-time view of the gate for operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateStats {
    pub clients: usize,
    pub filter_names: usize,
    pub packets: OperationSummary,
}

/// The gate core
///
/// Owns the client registry and the filter index, consumes the dispatcher
/// packet queue and coordinates termination. Shared as `Arc<GateService>`
/// between the transport, the packet routine and the binary.
pub struct GateService {
    config: GateConfig,
    dispatcher: Arc<dyn Dispatcher>,
    clients: ClientManager,
    filter_index: Mutex<FilterIndex>,
    queue: PacketQueue,
    queue_rx: Mutex<Option<PacketQueueReceiver>>,
    packet_stats: OperationStats,
    terminated: watch::Sender<bool>,
}

impl GateService {
    /// Creates a gate reporting to `dispatcher`
    ///
    /// Nothing runs until [`run`](GateService::run) or
    /// [`spawn_packet_routine`](GateService::spawn_packet_routine) is called;
    /// packets enqueued before that wait in the queue.
    pub fn new(config: GateConfig, dispatcher: Arc<dyn Dispatcher>) -> Arc<Self> {
        let (queue, queue_rx) = packet_queue();
        let (terminated, _) = watch::channel(false);

        Arc::new(Self {
            config,
            dispatcher,
            clients: ClientManager::new(),
            filter_index: Mutex::new(FilterIndex::new()),
            queue,
            queue_rx: Mutex::new(Some(queue_rx)),
            packet_stats: OperationStats::new(),
            terminated,
        })
    }

    /// Options the gate was started with
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Link used for notifications and relayed client packets
    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.dispatcher
    }

    /// Producer handle for packets coming from the dispatcher
    pub fn packet_queue(&self) -> PacketQueue {
        self.queue.clone()
    }

    /// Serves client connections on `listener` until [`terminate`] is called
    ///
    /// [`terminate`]: GateService::terminate
    pub async fn run(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        info!("{} listening on {}", self, listener.local_addr()?);

        let routine = self.spawn_packet_routine();
        transport::serve(Arc::clone(self), listener).await;

        if let Some(routine) = routine {
            if let Err(e) = routine.await {
                error!("{} packet routine failed: {}", self, e);
            }
        }

        let stats = self.stats();
        info!(
            "{} stopped: {} packets handled (avg {:?}, max {:?}, {} slow), {} clients left",
            self,
            stats.packets.count,
            stats.packets.average(),
            stats.packets.max,
            stats.packets.slow,
            stats.clients
        );
        Ok(())
    }

    /// Entry point for the transport once a client connection is ready
    ///
    /// Returns false if the connection was refused (the gate is terminating
    /// or the id is taken); the connection has then already been closed.
    pub fn on_client_connected(&self, conn: Arc<dyn ClientConnection>) -> bool {
        let proxy = Arc::new(ClientProxy::new(conn));

        match self.clients.register(Arc::clone(&proxy)) {
            Ok(()) => {
                self.dispatcher.notify_client_connected(proxy.id());
                debug!("{}: client {} connected", self, proxy);
                true
            }
            Err(RegisterError::Terminating) => {
                debug!("{}: terminating, refusing {}", self, proxy);
                proxy.close();
                false
            }
            Err(e) => {
                error!("{}: {}", self, e);
                proxy.close();
                false
            }
        }
    }

    /// Cleans up after a client connection ended
    ///
    /// Drops the client's filter properties from the index and tells the
    /// dispatcher. Returns false if the client was not registered.
    pub fn on_client_disconnected(&self, client_id: ClientId) -> bool {
        let Some(proxy) = self.clients.remove(&client_id) else {
            return false;
        };

        {
            let mut index = self.filter_index.lock();
            let mut props = proxy.props();
            props.detached = true;
            for (name, value) in props.values.drain() {
                debug!("drop client {} filter prop: {} = {}", proxy, name, value);
                index.remove(&name, &value, client_id);
            }
        }

        self.dispatcher.notify_client_disconnected(client_id);
        debug!("{}: client {} disconnected", self, proxy);
        true
    }

    /// Interprets one packet from the dispatcher
    pub fn handle_dispatcher_packet(&self, msgtype: MsgType, packet: &mut Packet) -> Result<()> {
        debug!(
            "{}.handle_dispatcher_packet: msgtype={}, payload_len={}",
            self,
            msgtype,
            packet.payload().len()
        );

        if is_redirect_to_gateproxy(msgtype) {
            let _sid = packet.read_u16()?;
            let client_id = packet.read_client_id()?;

            let Some(proxy) = self.clients.get(&client_id) else {
                // The backend still thinks this client is here
                debug!("{}: client {} already gone", self, client_id);
                self.dispatcher.notify_client_disconnected(client_id);
                return Ok(());
            };

            match msgtype {
                SET_CLIENTPROXY_FILTER_PROP => self.handle_set_client_filter_prop(&proxy, packet),
                CLEAR_CLIENTPROXY_FILTER_PROPS => {
                    self.handle_clear_client_filter_props(&proxy);
                    Ok(())
                }
                _ => {
                    proxy.send_packet(packet);
                    Ok(())
                }
            }
        } else if msgtype == CALL_FILTERED_CLIENTS {
            self.handle_call_filtered_clients(packet).map(|_| ())
        } else {
            Err(GateError::UnknownMsgType(msgtype))
        }
    }

    fn handle_set_client_filter_prop(&self, proxy: &ClientProxy, packet: &mut Packet) -> Result<()> {
        let name = packet.read_var_str()?;
        let value = packet.read_var_str()?;
        let client_id = proxy.id();

        let mut index = self.filter_index.lock();
        let mut props = proxy.props();
        if props.detached {
            debug!("ignore filter prop {} = {} for departed {}", name, value, proxy);
            return Ok(());
        }

        if let Some(old_value) = props.values.insert(name.clone(), value.clone()) {
            debug!("remove client {} filter prop: {} = {}", proxy, name, old_value);
            index.remove(&name, &old_value, client_id);
        }
        index.insert(&name, &value, client_id);
        debug!("set client {} filter prop: {} = {}", proxy, name, value);
        Ok(())
    }

    fn handle_clear_client_filter_props(&self, proxy: &ClientProxy) {
        let client_id = proxy.id();

        let mut index = self.filter_index.lock();
        let mut props = proxy.props();
        for (name, value) in props.values.drain() {
            index.remove(&name, &value, client_id);
        }
        debug!("clear client {} filter props", proxy);
    }

    /// Forwards the packet to every client matching its `(name, value)`;
    /// returns how many clients it was handed to
    fn handle_call_filtered_clients(&self, packet: &mut Packet) -> Result<usize> {
        let name = packet.read_var_str()?;
        let value = packet.read_var_str()?;
        let packet: &Packet = packet;

        let mut sent = 0;
        let index = self.filter_index.lock();
        index.visit(&name, &value, |client_id| {
            if let Some(proxy) = self.clients.get(&client_id) {
                proxy.send_packet(packet);
                sent += 1;
            }
        });
        drop(index);

        debug!("{}: call filtered {} = {} reached {} clients", self, name, value, sent);
        Ok(sent)
    }

    /// Spawns the single consumer of the packet queue
    ///
    /// Returns `None` if the routine was already started.
    pub fn spawn_packet_routine(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let Some(receiver) = self.queue_rx.lock().take() else {
            warn!("{}: packet routine already running", self);
            return None;
        };
        let gate = Arc::clone(self);
        Some(tokio::spawn(async move {
            gate.packet_routine(receiver).await;
        }))
    }

    async fn packet_routine(&self, mut receiver: PacketQueueReceiver) {
        loop {
            tokio::select! {
                biased;
                item = receiver.pop() => match item {
                    Some(item) => self.process_queue_item(item),
                    None => break,
                },
                _ = self.wait_terminated() => break,
            }
        }
        debug!("{}: packet routine stopped", self);
    }

    fn process_queue_item(&self, item: PacketQueueItem) {
        let PacketQueueItem {
            msgtype,
            mut packet,
        } = item;
        let threshold = self.config.slow_packet_threshold();

        let op = Operation::start("GateServiceHandlePacket");
        let result = self.handle_dispatcher_packet(msgtype, &mut packet);
        let elapsed = op.finish(threshold);
        self.packet_stats.record(elapsed, threshold);
        drop(packet);

        match result {
            Ok(()) => {}
            Err(e @ GateError::UnknownMsgType(_)) => {
                error!("{}: {}", self, e);
                if self.config.strict {
                    std::process::exit(2);
                }
            }
            Err(e) => warn!("{}: dropping packet msgtype={}: {}", self, msgtype, e),
        }
    }

    /// Refuses new connections, closes every connected client and signals
    /// termination. Only the first call does anything.
    pub fn terminate(&self) -> bool {
        let Some(proxies) = self.clients.begin_termination() else {
            return false;
        };

        info!("{} terminating, closing {} clients", self, proxies.len());
        for proxy in proxies {
            proxy.close();
        }

        self.terminated.send_replace(true);
        true
    }

    /// Whether termination has begun
    pub fn is_terminating(&self) -> bool {
        self.clients.is_terminating()
    }

    /// Whether termination has completed
    pub fn is_terminated(&self) -> bool {
        *self.terminated.borrow()
    }

    /// Resolves once [`terminate`](GateService::terminate) has finished
    pub async fn wait_terminated(&self) {
        let mut rx = self.terminated.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Looks up a registered client
    pub fn get_client(&self, client_id: &ClientId) -> Option<Arc<ClientProxy>> {
        self.clients.get(client_id)
    }

    /// Filter properties of a registered client
    pub fn filter_props(&self, client_id: &ClientId) -> Option<HashMap<String, String>> {
        self.clients.get(client_id).map(|proxy| proxy.filter_props())
    }

    /// Clients currently indexed under `name == value`
    pub fn filtered_clients(&self, name: &str, value: &str) -> Vec<ClientId> {
        self.filter_index.lock().matching(name, value)
    }

    /// Number of registered clients
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Current client count, filter property names and packet timings
    pub fn stats(&self) -> GateStats {
        GateStats {
            clients: self.clients.len(),
            filter_names: self.filter_index.lock().tree_count(),
            packets: self.packet_stats.summary(),
        }
    }
}

impl fmt::Display for GateService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GateService<{}@{}>",
            self.config.gate_id,
            self.config.listen_addr()
        )
    }
}
