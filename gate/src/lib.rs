//! # Gate Server Library
//!
//! The gate is the client-facing tier of the game server cluster. It
//! terminates client connections, relays client traffic to the dispatcher and
//! routes dispatcher traffic back to one client or to every client whose
//! filter properties match.
//!
//! ## Core Responsibilities
//!
//! ### Client Registry
//! Every accepted connection is registered under a random [`ClientId`] and
//! announced to the dispatcher. When the connection ends its filter
//! properties are dropped and the dispatcher is told.
//!
//! ### Filtered Broadcast
//! The dispatcher can tag a client with string properties
//! (`zone = forest`) and later address every client holding a given value.
//! Each property name has its own inverted index, so a broadcast only touches
//! the clients it reaches.
//!
//! ### Ordered Packet Handling
//! Packets from the dispatcher go through a single queue drained by a single
//! task. Property changes and broadcasts are applied in exactly the order the
//! dispatcher sent them.
//!
//! ## Module Organization
//!
//! - `client_proxy`: the [`ClientConnection`] trait the transport implements,
//!   and the proxy holding a client's filter properties
//! - `client_manager`: concurrent registry of proxies and the terminating flag
//! - `filter_tree`: per-property inverted indexes
//! - `packet_queue`: inbound queue from the dispatcher
//! - `service`: [`GateService`], the dispatcher protocol and termination
//! - `dispatcher`: the [`Dispatcher`] trait and its TCP client
//! - `transport` / `framing`: TCP accept loop and length-prefixed frames
//! - `config`, `opmon`, `error`: command line options, latency monitoring,
//!   error types
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use gate::{DispatcherClient, GateConfig, GateService};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GateConfig::default();
//!     let (dispatcher, reader) = DispatcherClient::connect(&config.dispatcher, config.gate_id).await?;
//!
//!     let listener = TcpListener::bind(config.listen_addr()).await?;
//!     let gate = GateService::new(config, Arc::new(dispatcher));
//!     reader.spawn(gate.packet_queue());
//!
//!     // Serves clients until gate.terminate() is called
//!     gate.run(listener).await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod client_proxy;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod filter_tree;
pub mod framing;
pub mod opmon;
pub mod packet_queue;
pub mod service;
pub mod transport;

pub use client_manager::{ClientManager, RegisterError};
pub use client_proxy::{ClientConnection, ClientProxy};
pub use config::GateConfig;
pub use dispatcher::{Dispatcher, DispatcherClient, DispatcherReader};
pub use error::{GateError, Result};
pub use filter_tree::{FilterIndex, FilterTree};
pub use packet_queue::{packet_queue, PacketQueue, PacketQueueItem, PacketQueueReceiver};
pub use service::{GateService, GateStats};
pub use shared::ClientId;
