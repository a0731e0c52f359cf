//! UDP host adapter driving the warden engine

use crate::admission::{AdmissionDecision, ResponseOutcome};
use crate::client_manager::ClientManager;
use crate::engine::Warden;
use crate::guardian::SessionDecision;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;
use uuid::Uuid;
use warden_shared::{Origin, Packet, PROTOCOL_VERSION, REJECTION_MESSAGE};

pub type ServerError = Box<dyn std::error::Error + Send + Sync>;

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    ClientTimeout { identity: Uuid },
    Shutdown,
}

/// Messages sent from the main loop to the sender task
#[derive(Debug)]
pub enum OutboundMessage {
    SendPacket { packet: Packet, addr: SocketAddr },
}

pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    warden: Arc<Warden>,
    handshake_timeout: Duration,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    out_tx: mpsc::UnboundedSender<OutboundMessage>,
    out_rx: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl Server {
    /// Binds the UDP socket. Nothing runs until [`Server::run`] is called.
    pub async fn new(
        addr: &str,
        warden: Arc<Warden>,
        handshake_timeout: Duration,
        max_clients: usize,
    ) -> Result<Self, ServerError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new(max_clients))),
            warden,
            handshake_timeout,
            server_tx,
            server_rx,
            out_tx,
            out_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    /// Sender that stops [`Server::run`] when given [`ServerMessage::Shutdown`].
    pub fn control(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Shared handle to the connected clients
    pub fn clients(&self) -> Arc<RwLock<ClientManager>> {
        Arc::clone(&self.clients)
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let mut out_rx = std::mem::replace(&mut self.out_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                match message {
                    OutboundMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                }
            }
        });
    }

    /// Spawns task that drops silent clients and abandoned handshakes
    fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();
        let handshake_timeout = self.handshake_timeout.saturating_mul(2);

        tokio::spawn(async move {
            let mut interval = interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    let expired = clients_guard.expire_pending(handshake_timeout);
                    if expired > 0 {
                        debug!("Dropped {} abandoned handshakes", expired);
                    }
                    clients_guard.check_timeouts()
                };

                for client in timed_out {
                    let message = ServerMessage::ClientTimeout {
                        identity: client.identity,
                    };
                    if let Err(e) = server_tx.send(message) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    /// Spawns task running the engine's periodic expiry pass
    fn spawn_sweeper(&self) {
        let warden = Arc::clone(&self.warden);

        tokio::spawn(async move {
            let mut interval = interval(warden.sweep_interval());
            // The first tick completes immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let report = warden.sweep();
                debug!(
                    "Sweep: {} challenges, {} verifications, {} lockouts, {} bans, {} sessions",
                    report.admission.challenges,
                    report.admission.verifications,
                    report.admission.lockouts,
                    report.bans,
                    report.sessions
                );
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.out_tx.send(OutboundMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn reject(&self, addr: SocketAddr) {
        self.send_packet(
            Packet::Rejected {
                reason: REJECTION_MESSAGE.to_string(),
            },
            addr,
        );
    }

    /// Processes one inbound packet
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        let origin = Origin::from(addr.ip());
        if self.warden.bans.is_blocked(&origin) {
            debug!("Dropping packet from blocked origin {}", origin);
            return;
        }

        match packet {
            Packet::Connect {
                identity,
                protocol_version,
            } => {
                info!(
                    "Client {} connecting from {} (version: {})",
                    identity, addr, protocol_version
                );
                self.handle_connect(addr, origin, identity, protocol_version)
                    .await;
            }

            Packet::ChallengeResponse { answer } => {
                let pending = {
                    let mut clients = self.clients.write().await;
                    clients.take_pending(addr)
                };

                match self.warden.admission.check_response(origin, &answer) {
                    ResponseOutcome::Verified => match pending {
                        Some(pending) => {
                            self.complete_login(
                                addr,
                                origin,
                                pending.identity,
                                pending.protocol_version,
                            )
                            .await;
                        }
                        None => {
                            warn!("Verified answer from {} without an identity claim", addr);
                            self.reject(addr);
                        }
                    },
                    ResponseOutcome::Failed {
                        result,
                        failures,
                        locked_out,
                    } => {
                        info!(
                            "Handshake from {} failed: {:?} (failures: {}, locked out: {})",
                            addr, result, failures, locked_out
                        );
                        self.reject(addr);
                    }
                    ResponseOutcome::Ignored => {
                        debug!("Ignoring unsolicited answer from {}", addr);
                    }
                }
            }

            Packet::Heartbeat => {
                let client = {
                    let mut clients = self.clients.write().await;
                    match clients.find_client_by_addr(addr) {
                        Some(id) => {
                            clients.touch(id);
                            clients.get(&id).map(|c| (id, c.identity))
                        }
                        None => None,
                    }
                };

                if let Some((client_id, identity)) = client {
                    if !self
                        .warden
                        .guardian
                        .validate_session(identity, &origin.to_string())
                    {
                        warn!("Session binding lost for client {} ({})", client_id, identity);
                        let mut clients = self.clients.write().await;
                        clients.remove_client(&client_id);
                        drop(clients);
                        self.warden.guardian.on_disconnect(identity);
                        self.reject(addr);
                    }
                }
            }

            Packet::Disconnect => {
                let removed = {
                    let mut clients = self.clients.write().await;
                    clients.take_pending(addr);
                    clients
                        .find_client_by_addr(addr)
                        .and_then(|id| clients.remove_client(&id))
                };

                if let Some(client) = removed {
                    self.warden.guardian.on_disconnect(client.identity);
                }
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    async fn handle_connect(
        &mut self,
        addr: SocketAddr,
        origin: Origin,
        identity: Uuid,
        protocol_version: u32,
    ) {
        if protocol_version != PROTOCOL_VERSION {
            warn!(
                "Rejecting {} with unsupported protocol version {}",
                addr, protocol_version
            );
            self.reject(addr);
            return;
        }

        // A fresh Connect replaces whatever this address had before.
        let previous = {
            let mut clients = self.clients.write().await;
            let previous = clients
                .find_client_by_addr(addr)
                .and_then(|id| clients.remove_client(&id));
            if clients.is_full() {
                drop(clients);
                info!("Rejecting {}: server full", addr);
                self.reject(addr);
                return;
            }
            previous
        };
        if let Some(previous) = previous {
            self.warden.guardian.on_disconnect(previous.identity);
        }

        match self.warden.admission.check_attempt(origin) {
            AdmissionDecision::Reject(reason) => {
                info!("Connection from {} rejected: {:?}", addr, reason);
                self.reject(addr);
            }
            AdmissionDecision::Challenge(payload) => {
                {
                    let mut clients = self.clients.write().await;
                    clients.begin_handshake(addr, identity, protocol_version);
                }
                self.send_packet(
                    Packet::Challenge {
                        payload: payload.to_wire(),
                    },
                    addr,
                );
            }
            AdmissionDecision::Allow => {
                self.complete_login(addr, origin, identity, protocol_version)
                    .await;
            }
        }
    }

    /// Hands an admitted origin to the session guardian and registers the client
    async fn complete_login(
        &mut self,
        addr: SocketAddr,
        origin: Origin,
        identity: Uuid,
        protocol_version: u32,
    ) {
        let fingerprint = match self.warden.guardian.admit(identity, origin, protocol_version) {
            SessionDecision::Created(fp) | SessionDecision::Resumed(fp) => fp,
            SessionDecision::Denied(reason) => {
                info!("Session for {} from {} denied: {:?}", identity, addr, reason);
                self.reject(addr);
                return;
            }
        };

        let client_id = {
            let mut clients = self.clients.write().await;
            // Same identity on a new port of the same origin replaces the old entry.
            if let Some(stale) = clients.find_client_by_identity(identity) {
                clients.remove_client(&stale);
            }
            clients.add_client(
                addr,
                identity,
                protocol_version,
                fingerprint.protocol_hash().to_string(),
            )
        };

        match client_id {
            Some(_) => {
                self.warden.guardian.ensure_session(
                    identity,
                    &origin.to_string(),
                    protocol_version,
                );
                self.send_packet(
                    Packet::Connected {
                        session_hash: fingerprint.protocol_hash().to_string(),
                    },
                    addr,
                );
            }
            None => {
                info!("Rejecting {}: server full", addr);
                // Let the binding made by `admit` run out its grace period.
                self.warden.guardian.on_disconnect(identity);
                self.reject(addr);
            }
        }
    }

    /// Main server loop
    pub async fn run(&mut self) -> Result<(), ServerError> {
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();
        self.spawn_sweeper();

        let mut status_interval = interval(Duration::from_secs(60));

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(ServerMessage::ClientTimeout { identity }) => {
                            self.warden.guardian.on_disconnect(identity);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = status_interval.tick() => {
                    let client_count = {
                        let clients = self.clients.read().await;
                        clients.len()
                    };
                    if client_count > 0 {
                        debug!(
                            "{} clients, {} sessions, {} pending challenges, {} bans",
                            client_count,
                            self.warden.guardian.active_session_count(),
                            self.warden.admission.challenges().pending_count(),
                            self.warden.bans.len()
                        );
                    }
                },
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::config::SecurityConfig;
    use crate::events::MemorySink;
    use std::net::{IpAddr, Ipv4Addr};
    use warden_shared::ChallengePayload;

    const SECRET: &str = "MySecureKey12345!";

    fn test_config() -> SecurityConfig {
        let mut config = SecurityConfig::default();
        config.handshake.secret_key = SECRET.to_string();
        config
    }

    fn warden() -> Arc<Warden> {
        Arc::new(
            Warden::new(&test_config(), Arc::new(SystemClock), Arc::new(MemorySink::new()))
                .unwrap(),
        )
    }

    fn next_packet(server: &mut Server) -> (Packet, SocketAddr) {
        match server.out_rx.try_recv().unwrap() {
            OutboundMessage::SendPacket { packet, addr } => (packet, addr),
        }
    }

    async fn connect(server: &mut Server, addr: SocketAddr, identity: Uuid) -> ChallengePayload {
        server
            .handle_packet(
                Packet::Connect {
                    identity,
                    protocol_version: PROTOCOL_VERSION,
                },
                addr,
            )
            .await;
        match next_packet(server) {
            (Packet::Challenge { payload }, _) => ChallengePayload::parse(&payload).unwrap(),
            (other, _) => panic!("expected challenge, got {:?}", other),
        }
    }

    async fn answer(server: &mut Server, addr: SocketAddr, payload: &ChallengePayload) -> Packet {
        server
            .handle_packet(
                Packet::ChallengeResponse {
                    answer: payload.solve(SECRET),
                },
                addr,
            )
            .await;
        next_packet(server).0
    }

    #[test]
    fn test_server_message_creation() {
        let identity = Uuid::new_v4();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8080);
        let msg = ServerMessage::PacketReceived {
            packet: Packet::Connect {
                identity,
                protocol_version: PROTOCOL_VERSION,
            },
            addr,
        };

        match msg {
            ServerMessage::PacketReceived { packet, addr: a } => {
                assert_eq!(a, addr);
                assert_eq!(
                    packet,
                    Packet::Connect {
                        identity,
                        protocol_version: PROTOCOL_VERSION
                    }
                );
            }
            _ => panic!("Unexpected message type"),
        }
    }

    #[tokio::test]
    async fn test_server_binds_ephemeral_port() {
        let server = Server::new("127.0.0.1:0", warden(), Duration::from_secs(3), 4)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(server.clients().read().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_run() {
        let mut server = Server::new("127.0.0.1:0", warden(), Duration::from_secs(3), 4)
            .await
            .unwrap();
        let control = server.control();
        control.send(ServerMessage::Shutdown).unwrap();
        tokio_test::assert_ok!(server.run().await);
    }

    #[tokio::test]
    async fn test_wrong_version_rejected() {
        let mut server = Server::new("127.0.0.1:0", warden(), Duration::from_secs(3), 4)
            .await
            .unwrap();
        let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        server
            .handle_packet(
                Packet::Connect {
                    identity: Uuid::new_v4(),
                    protocol_version: PROTOCOL_VERSION + 1,
                },
                addr,
            )
            .await;

        match server.out_rx.try_recv().unwrap() {
            OutboundMessage::SendPacket { packet, addr: to } => {
                assert_eq!(to, addr);
                assert_eq!(
                    packet,
                    Packet::Rejected {
                        reason: REJECTION_MESSAGE.to_string()
                    }
                );
            }
        }
    }

    #[tokio::test]
    async fn test_connect_issues_challenge_and_records_claim() {
        let mut server = Server::new("127.0.0.1:0", warden(), Duration::from_secs(3), 4)
            .await
            .unwrap();
        let addr: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        server
            .handle_packet(
                Packet::Connect {
                    identity: Uuid::new_v4(),
                    protocol_version: PROTOCOL_VERSION,
                },
                addr,
            )
            .await;

        match server.out_rx.try_recv().unwrap() {
            OutboundMessage::SendPacket { packet, .. } => match packet {
                Packet::Challenge { payload } => {
                    assert!(warden_shared::ChallengePayload::parse(&payload).is_some());
                }
                other => panic!("expected challenge, got {:?}", other),
            },
        }
        assert_eq!(server.clients.read().await.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_login_rejected_when_full_releases_session() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let warden = Arc::new(
            Warden::new(&test_config(), clock.clone(), Arc::new(MemorySink::new())).unwrap(),
        );
        let mut server = Server::new("127.0.0.1:0", Arc::clone(&warden), Duration::from_secs(3), 1)
            .await
            .unwrap();

        let first_addr: SocketAddr = "127.0.0.1:40010".parse().unwrap();
        let second_addr: SocketAddr = "127.0.0.2:40011".parse().unwrap();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        // Both handshakes start while there is still room.
        let first_payload = connect(&mut server, first_addr, first).await;
        let second_payload = connect(&mut server, second_addr, second).await;

        assert!(matches!(
            answer(&mut server, first_addr, &first_payload).await,
            Packet::Connected { .. }
        ));
        assert!(matches!(
            answer(&mut server, second_addr, &second_payload).await,
            Packet::Rejected { .. }
        ));
        assert_eq!(server.clients.read().await.len(), 1);

        clock.advance(Duration::from_secs(24 * 60 * 60));
        let report = warden.sweep();
        assert_eq!(report.sessions, 1);
        assert!(warden.guardian.fingerprint(second).is_none());
        assert!(warden.guardian.fingerprint(first).is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_with_lost_binding_releases_session() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let mut config = test_config();
        config.session.enforce_ip_lock = false;
        let warden = Arc::new(
            Warden::new(&config, clock.clone(), Arc::new(MemorySink::new())).unwrap(),
        );
        let mut server = Server::new("127.0.0.1:0", Arc::clone(&warden), Duration::from_secs(3), 4)
            .await
            .unwrap();

        let addr: SocketAddr = "127.0.0.1:40020".parse().unwrap();
        let identity = Uuid::new_v4();
        let payload = connect(&mut server, addr, identity).await;
        assert!(matches!(
            answer(&mut server, addr, &payload).await,
            Packet::Connected { .. }
        ));

        // The identity gets rebound elsewhere behind the connected client's back.
        let elsewhere = Origin::parse("198.51.100.9").unwrap();
        warden
            .guardian
            .admit(identity, elsewhere, PROTOCOL_VERSION);

        server.handle_packet(Packet::Heartbeat, addr).await;
        assert!(matches!(next_packet(&mut server).0, Packet::Rejected { .. }));
        assert!(server.clients.read().await.is_empty());

        clock.advance(test_config().session_grace());
        assert_eq!(warden.sweep().sessions, 1);
        assert!(warden.guardian.fingerprint(identity).is_none());
    }
}
