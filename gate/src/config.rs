//! Command line configuration for a gate process

use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(author, version, about = "Gate server relaying clients to the dispatcher")]
pub struct GateConfig {
    /// IP address to accept client connections on
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to accept client connections on
    #[arg(short, long, default_value_t = 15011)]
    pub port: u16,

    /// Dispatcher address
    #[arg(short, long, default_value = "127.0.0.1:13001")]
    pub dispatcher: String,

    /// Id announced to the dispatcher
    #[arg(short, long, default_value_t = 1)]
    pub gate_id: u16,

    /// Exit on protocol violations instead of dropping the packet
    #[arg(long)]
    pub strict: bool,

    /// Packet handling time (ms) above which a warning is logged
    #[arg(long, default_value_t = 100)]
    pub slow_packet_ms: u64,
}

impl GateConfig {
    /// `host:port` the client listener binds to
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Handling time above which a dispatcher packet is reported as slow
    pub fn slow_packet_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_packet_ms)
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self::parse_from(["gate"])
    }
}
