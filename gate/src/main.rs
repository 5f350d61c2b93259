use clap::Parser;
use gate::{DispatcherClient, GateConfig, GateService};
use log::{error, info};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Parses the command line, connects to the dispatcher and serves clients
/// until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let config = GateConfig::parse();
    info!("Starting gate {}", config.gate_id);
    info!("Dispatcher: {}", config.dispatcher);
    if config.strict {
        info!("Strict mode: protocol violations terminate the process");
    }

    let (dispatcher, dispatcher_reader) =
        DispatcherClient::connect(&config.dispatcher, config.gate_id).await?;
    let listener = TcpListener::bind(config.listen_addr()).await?;

    let gate = GateService::new(config, Arc::new(dispatcher));
    let reader_handle = dispatcher_reader.spawn(gate.packet_queue());

    let gate_handle = {
        let gate = Arc::clone(&gate);
        tokio::spawn(async move {
            if let Err(e) = gate.run(listener).await {
                error!("Gate stopped with error: {}", e);
            }
        })
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
        _ = reader_handle => {
            error!("Lost connection to the dispatcher, shutting down");
        }
    }

    gate.terminate();
    if let Err(e) = gate_handle.await {
        error!("Gate task panicked: {}", e);
    }

    info!("Gate stopped");
    Ok(())
}
