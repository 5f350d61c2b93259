use clap::Parser;
use gate::framing::{write_packet, PacketReader};
use shared::{Packet, CALL_ENTITY_METHOD_FROM_CLIENT, HEARTBEAT_FROM_CLIENT};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{interval, sleep, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about = "Connects to a gate and prints what it receives")]
struct Args {
    /// Gate address to connect to
    #[arg(short, long, default_value = "127.0.0.1:15011")]
    gate: String,

    /// How long to stay connected, in seconds
    #[arg(short, long, default_value_t = 10)]
    seconds: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    println!("Connecting to gate at {}", args.gate);
    let stream = TcpStream::connect(&args.gate).await?;
    println!("Connected from {}", stream.local_addr()?);
    let (reader, mut writer) = stream.into_split();
    let mut reader = PacketReader::new(reader);

    let hello = Packet::builder(CALL_ENTITY_METHOD_FROM_CLIENT)
        .append_var_str("hello")
        .build();
    write_packet(&mut writer, &hello).await?;
    println!("Sent {:?}", hello);

    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let mut heartbeat = interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = sleep(deadline.saturating_duration_since(Instant::now())) => break,
            _ = heartbeat.tick() => {
                let packet = Packet::builder(HEARTBEAT_FROM_CLIENT).build();
                write_packet(&mut writer, &packet).await?;
            }
            received = reader.next_packet() => match received? {
                Some(packet) => println!("Received {:?}: {:02x?}", packet, packet.payload()),
                None => {
                    println!("Gate closed the connection");
                    return Ok(());
                }
            },
        }
    }

    writer.shutdown().await?;
    println!("Test client finished");
    Ok(())
}
