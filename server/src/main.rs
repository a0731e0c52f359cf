use clap::Parser;
use log::{error, info, warn};
use std::sync::Arc;
use warden_server::clock::SystemClock;
use warden_server::config::SecurityConfig;
use warden_server::engine::Warden;
use warden_server::events::{forward_alerts, AlertFilter, AuditSink, ChannelSink, LogSink, MultiSink};
use warden_server::network::{Server, ServerError, ServerMessage};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// YAML security configuration
    #[arg(short, long)]
    config: Option<String>,

    /// Pre-shared server secret, overrides the config file
    #[arg(short, long)]
    secret: Option<String>,

    /// Maximum number of connected clients
    #[arg(short, long, default_value = "32")]
    max_clients: usize,
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path);
            SecurityConfig::load(path)?
        }
        None => {
            warn!("No configuration file given, using defaults");
            SecurityConfig::default()
        }
    };
    if let Some(secret) = args.secret {
        config.handshake.secret_key = secret;
    }

    let (alerts, alert_rx) = ChannelSink::new();
    tokio::spawn(forward_alerts(alert_rx));
    let sink = MultiSink::new(vec![
        Arc::new(LogSink) as Arc<dyn AuditSink>,
        Arc::new(AlertFilter::new(alerts)),
    ]);

    let warden = match Warden::new(&config, Arc::new(SystemClock), Arc::new(sink)) {
        Ok(warden) => Arc::new(warden),
        Err(e) => {
            error!("Refusing to start: {}", e);
            return Err(e.into());
        }
    };

    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::new(
        &address,
        warden,
        config.response_timeout(),
        args.max_clients,
    )
    .await?;

    let control = server.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down");
            let _ = control.send(ServerMessage::Shutdown);
        }
    });

    server.run().await
}
