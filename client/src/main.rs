use clap::Parser;
use log::{info, warn};
use std::time::Duration;
use uuid::Uuid;
use warden_client::network::{Client, ClientError, HandshakeOutcome};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Pre-shared server secret
    #[arg(short = 'k', long)]
    secret: String,

    /// Identity to claim, random when omitted
    #[arg(short = 'i', long)]
    identity: Option<Uuid>,

    /// Heartbeats to send after connecting, one per second
    #[arg(short = 'b', long, default_value = "0")]
    heartbeats: u32,
}

#[tokio::main]
async fn main() -> Result<(), ClientError> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let identity = args.identity.unwrap_or_else(Uuid::new_v4);

    info!("Starting client...");
    info!("Connecting to: {}", args.server);

    let mut client = Client::new(&args.server, identity, &args.secret).await?;

    match client.handshake().await? {
        HandshakeOutcome::Connected { session_hash } => {
            println!("Connected as {} (session {})", identity, session_hash);
        }
        HandshakeOutcome::Rejected { reason } => {
            println!("Rejected: {}", reason);
            std::process::exit(1);
        }
        HandshakeOutcome::TimedOut => {
            println!("No response from {}", args.server);
            std::process::exit(2);
        }
    }

    for beat in 0..args.heartbeats {
        tokio::time::sleep(Duration::from_secs(1)).await;
        client.heartbeat().await?;
        if let Some(packet) = client.recv_packet(Duration::from_millis(100)).await? {
            warn!("Server replied to heartbeat {}: {:?}", beat + 1, packet);
            std::process::exit(1);
        }
    }

    client.disconnect().await?;
    info!("Disconnected");
    Ok(())
}
