use bincode::{deserialize, serialize};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use uuid::Uuid;
use warden_shared::{ChallengePayload, Packet, PROTOCOL_VERSION};

pub type ClientError = Box<dyn std::error::Error + Send + Sync>;

/// How long to wait for each server reply during the handshake.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Connected { session_hash: String },
    Rejected { reason: String },
    TimedOut,
}

pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    identity: Uuid,
    secret: String,
    protocol_version: u32,
    reply_timeout: Duration,
    session_hash: Option<String>,
}

impl Client {
    /// Creates a client bound to an ephemeral local port
    pub async fn new(server_addr: &str, identity: Uuid, secret: &str) -> Result<Self, ClientError> {
        let server_addr: SocketAddr = server_addr.parse()?;
        let bind = if server_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;

        Ok(Client {
            socket,
            server_addr,
            identity,
            secret: secret.to_string(),
            protocol_version: PROTOCOL_VERSION,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            session_hash: None,
        })
    }

    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    /// Claims a different protocol version than the one compiled in.
    pub fn with_protocol_version(mut self, protocol_version: u32) -> Self {
        self.protocol_version = protocol_version;
        self
    }

    pub fn identity(&self) -> Uuid {
        self.identity
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn session_hash(&self) -> Option<&str> {
        self.session_hash.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.session_hash.is_some()
    }

    /// Serializes and sends a packet to the server
    pub async fn send_packet(&self, packet: &Packet) -> Result<(), ClientError> {
        let data = serialize(packet)?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    /// Announces the identity and protocol version
    pub async fn send_connect(&self) -> Result<(), ClientError> {
        self.send_packet(&Packet::Connect {
            identity: self.identity,
            protocol_version: self.protocol_version,
        })
        .await
    }

    /// Sends the solved challenge
    pub async fn send_answer(&self, answer: &str) -> Result<(), ClientError> {
        self.send_packet(&Packet::ChallengeResponse {
            answer: answer.to_string(),
        })
        .await
    }

    /// Next packet from the server, or `None` when nothing arrives in time.
    /// Datagrams from other senders and undecodable ones are skipped.
    pub async fn recv_packet(&self, wait: Duration) -> Result<Option<Packet>, ClientError> {
        let mut buffer = [0u8; 2048];
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let (len, from) = match timeout(remaining, self.socket.recv_from(&mut buffer)).await {
                Ok(result) => result?,
                Err(_) => return Ok(None),
            };
            if from != self.server_addr {
                debug!("Ignoring datagram from {}", from);
                continue;
            }
            match deserialize::<Packet>(&buffer[0..len]) {
                Ok(packet) => return Ok(Some(packet)),
                Err(e) => warn!("Failed to deserialize packet: {}", e),
            }
        }
    }

    /// Runs the connect/challenge/answer exchange to completion.
    pub async fn handshake(&mut self) -> Result<HandshakeOutcome, ClientError> {
        info!("Connecting to {} as {}", self.server_addr, self.identity);
        self.send_connect().await?;

        loop {
            let packet = match self.recv_packet(self.reply_timeout).await? {
                Some(packet) => packet,
                None => return Ok(HandshakeOutcome::TimedOut),
            };

            match packet {
                Packet::Challenge { payload } => match ChallengePayload::parse(&payload) {
                    Some(challenge) => {
                        debug!("Received challenge with difficulty {}", challenge.difficulty);
                        let answer = challenge.solve(&self.secret);
                        self.send_answer(&answer).await?;
                    }
                    None => {
                        warn!("Malformed challenge payload: {}", payload);
                        return Ok(HandshakeOutcome::Rejected {
                            reason: "malformed challenge".to_string(),
                        });
                    }
                },
                Packet::Connected { session_hash } => {
                    info!("Connected! Session hash: {}", session_hash);
                    self.session_hash = Some(session_hash.clone());
                    return Ok(HandshakeOutcome::Connected { session_hash });
                }
                Packet::Rejected { reason } => {
                    warn!("Rejected: {}", reason);
                    self.session_hash = None;
                    return Ok(HandshakeOutcome::Rejected { reason });
                }
                other => {
                    warn!("Unexpected packet type during handshake: {:?}", other);
                }
            }
        }
    }

    /// Tells the server the client is still alive
    pub async fn heartbeat(&self) -> Result<(), ClientError> {
        self.send_packet(&Packet::Heartbeat).await
    }

    /// Leaves gracefully so the server starts the session grace period
    pub async fn disconnect(&mut self) -> Result<(), ClientError> {
        self.send_packet(&Packet::Disconnect).await?;
        self.session_hash = None;
        Ok(())
    }
}
