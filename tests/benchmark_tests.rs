//! Performance benchmarks for the gate's hot paths

use gate::{ClientConnection, Dispatcher, FilterIndex, GateConfig, GateService};
use shared::{
    ClientId, Packet, CALL_ENTITY_METHOD_ON_CLIENT, CALL_FILTERED_CLIENTS,
    SET_CLIENTPROXY_FILTER_PROP,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_test::assert_ok;

struct NullDispatcher;

impl Dispatcher for NullDispatcher {
    fn notify_client_connected(&self, _client_id: ClientId) {}

    fn notify_client_disconnected(&self, _client_id: ClientId) {}

    fn forward_client_packet(&self, _client_id: ClientId, _packet: &Packet) {}
}

struct CountingConnection {
    id: ClientId,
    received: AtomicUsize,
}

impl ClientConnection for CountingConnection {
    fn client_id(&self) -> ClientId {
        self.id
    }

    fn send_packet(&self, _packet: &Packet) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    fn close(&self) {}
}

fn connect_clients(gate: &GateService, count: usize) -> Vec<Arc<CountingConnection>> {
    (0..count)
        .map(|_| {
            let conn = Arc::new(CountingConnection {
                id: ClientId::generate(),
                received: AtomicUsize::new(0),
            });
            assert!(gate.on_client_connected(conn.clone()));
            conn
        })
        .collect()
}

fn set_prop(id: ClientId, name: &str, value: &str) -> Packet {
    Packet::builder(SET_CLIENTPROXY_FILTER_PROP)
        .append_u16(0)
        .append_client_id(id)
        .append_var_str(name)
        .append_var_str(value)
        .build()
}

/// Benchmarks filter index insert and remove
#[test]
fn benchmark_filter_index_updates() {
    let ids: Vec<ClientId> = (0..10_000).map(|_| ClientId::generate()).collect();
    let mut index = FilterIndex::new();

    let start = Instant::now();
    for (i, id) in ids.iter().enumerate() {
        index.insert("zone", &format!("zone-{}", i % 100), *id);
    }
    for (i, id) in ids.iter().enumerate() {
        assert!(index.remove("zone", &format!("zone-{}", i % 100), *id));
    }
    let duration = start.elapsed();

    println!(
        "Filter index: {} inserts + removes in {:?} ({:.2} ns/op)",
        ids.len(),
        duration,
        duration.as_nanos() as f64 / (ids.len() * 2) as f64
    );

    assert!(index.matching("zone", "zone-0").is_empty());
    // Should complete in under 1 second
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks visiting one value bucket among many
#[test]
fn benchmark_filter_index_visit() {
    let mut index = FilterIndex::new();
    for i in 0..10_000 {
        index.insert("zone", &format!("zone-{}", i % 10), ClientId::generate());
    }

    let iterations = 1000;
    let start = Instant::now();
    let mut visited = 0;
    for _ in 0..iterations {
        index.visit("zone", "zone-3", |_| visited += 1);
    }
    let duration = start.elapsed();

    println!(
        "Filter index visit: {} visits in {:?} ({:.2} μs/visit)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert_eq!(visited, iterations * 1000);
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks filtered broadcast through the full packet handler
#[tokio::test]
async fn benchmark_filtered_broadcast() {
    let gate = GateService::new(GateConfig::default(), Arc::new(NullDispatcher));
    let clients = connect_clients(&gate, 1000);

    for (i, conn) in clients.iter().enumerate() {
        let zone = if i % 2 == 0 { "forest" } else { "desert" };
        let mut packet = set_prop(conn.id, "zone", zone);
        assert_ok!(gate.handle_dispatcher_packet(SET_CLIENTPROXY_FILTER_PROP, &mut packet));
    }

    let broadcast = Packet::builder(CALL_FILTERED_CLIENTS)
        .append_var_str("zone")
        .append_var_str("forest")
        .append_var_str("onRain")
        .build();

    let iterations = 200;
    let start = Instant::now();
    for _ in 0..iterations {
        let mut packet = broadcast.clone();
        assert_ok!(gate.handle_dispatcher_packet(CALL_FILTERED_CLIENTS, &mut packet));
    }
    let duration = start.elapsed();

    println!(
        "Filtered broadcast to 500 of 1000 clients: {} calls in {:?} ({:.2} μs/call)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    for (i, conn) in clients.iter().enumerate() {
        let expected = if i % 2 == 0 { iterations } else { 0 };
        assert_eq!(conn.received.load(Ordering::Relaxed), expected);
    }
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks single-client redirects
#[tokio::test]
async fn benchmark_redirect_to_client() {
    let gate = GateService::new(GateConfig::default(), Arc::new(NullDispatcher));
    let clients = connect_clients(&gate, 100);

    let packets: Vec<Packet> = clients
        .iter()
        .map(|conn| {
            Packet::builder(CALL_ENTITY_METHOD_ON_CLIENT)
                .append_u16(0)
                .append_client_id(conn.id)
                .append_var_str("onHit")
                .build()
        })
        .collect();

    let rounds = 100;
    let start = Instant::now();
    for _ in 0..rounds {
        for packet in &packets {
            let mut packet = packet.clone();
            assert_ok!(gate.handle_dispatcher_packet(CALL_ENTITY_METHOD_ON_CLIENT, &mut packet));
        }
    }
    let duration = start.elapsed();

    let total = rounds * packets.len();
    println!(
        "Redirects: {} packets in {:?} ({:.2} ns/packet)",
        total,
        duration,
        duration.as_nanos() as f64 / total as f64
    );

    for conn in &clients {
        assert_eq!(conn.received.load(Ordering::Relaxed), rounds);
    }
    assert!(duration.as_millis() < 2000);
}
