//! Connection bookkeeping for the UDP host
//!
//! This module tracks two kinds of peers, keyed by socket address:
//! - Pending handshakes: a `Connect` was answered with a challenge and the
//!   server is waiting for the proof
//! - Connected clients: the proof was accepted and the session guardian bound
//!   the identity to its origin
//!
//! Nothing in here makes security decisions. Admission and session binding
//! live in the engine; the client manager only remembers who is where and
//! when they were last heard from.

use log::info;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Silence after which a connected client is dropped.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected, admitted client
#[derive(Debug, Clone)]
pub struct Client {
    /// Server-assigned connection number, unique for the process lifetime
    pub id: u32,
    pub addr: SocketAddr,
    /// Identity the session guardian bound to this address
    pub identity: Uuid,
    pub protocol_version: u32,
    /// Non-secret digest handed back in `Connected`
    pub session_hash: String,
    /// Last time we received any packet from this client
    pub last_seen: Instant,
}

impl Client {
    pub fn new(
        id: u32,
        addr: SocketAddr,
        identity: Uuid,
        protocol_version: u32,
        session_hash: String,
    ) -> Self {
        Self {
            id,
            addr,
            identity,
            protocol_version,
            session_hash,
            last_seen: Instant::now(),
        }
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Identity claim waiting on a challenge answer
#[derive(Debug, Clone)]
pub struct PendingHandshake {
    pub identity: Uuid,
    pub protocol_version: u32,
    pub started: Instant,
}

pub struct ClientManager {
    clients: HashMap<u32, Client>,
    pending: HashMap<SocketAddr, PendingHandshake>,
    next_client_id: u32,
    max_clients: usize,
    timeout: Duration,
}

impl ClientManager {
    /// Creates a manager with the default client timeout
    pub fn new(max_clients: usize) -> Self {
        Self::with_timeout(max_clients, CLIENT_TIMEOUT)
    }

    pub fn with_timeout(max_clients: usize, timeout: Duration) -> Self {
        Self {
            clients: HashMap::new(),
            pending: HashMap::new(),
            next_client_id: 1,
            max_clients,
            timeout,
        }
    }

    /// Remembers the identity claimed by `addr` until its answer arrives.
    /// A second `Connect` from the same address replaces the first.
    pub fn begin_handshake(&mut self, addr: SocketAddr, identity: Uuid, protocol_version: u32) {
        self.pending.insert(
            addr,
            PendingHandshake {
                identity,
                protocol_version,
                started: Instant::now(),
            },
        );
    }

    /// Removes and returns the identity claim made by `addr`, if any
    pub fn take_pending(&mut self, addr: SocketAddr) -> Option<PendingHandshake> {
        self.pending.remove(&addr)
    }

    /// Drops handshakes that have waited longer than `max_age`.
    pub fn expire_pending(&mut self, max_age: Duration) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, p| p.started.elapsed() <= max_age);
        before - self.pending.len()
    }

    /// Registers an admitted client. Returns `None` when the server is full.
    pub fn add_client(
        &mut self,
        addr: SocketAddr,
        identity: Uuid,
        protocol_version: u32,
        session_hash: String,
    ) -> Option<u32> {
        if self.is_full() {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        info!("Client {} ({}) connected from {}", client_id, identity, addr);
        self.clients.insert(
            client_id,
            Client::new(client_id, addr, identity, protocol_version, session_hash),
        );
        Some(client_id)
    }

    /// Removes a client and returns it
    pub fn remove_client(&mut self, client_id: &u32) -> Option<Client> {
        let removed = self.clients.remove(client_id);
        if let Some(client) = &removed {
            info!("Client {} ({}) disconnected", client.id, client.identity);
        }
        removed
    }

    /// Finds client ID by socket address
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<u32> {
        self.clients
            .iter()
            .find(|(_, client)| client.addr == addr)
            .map(|(id, _)| *id)
    }

    /// Finds client ID by claimed identity
    pub fn find_client_by_identity(&self, identity: Uuid) -> Option<u32> {
        self.clients
            .iter()
            .find(|(_, client)| client.identity == identity)
            .map(|(id, _)| *id)
    }

    pub fn get(&self, client_id: &u32) -> Option<&Client> {
        self.clients.get(client_id)
    }

    /// Refreshes liveness. Returns false for an unknown client.
    pub fn touch(&mut self, client_id: u32) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(client) => {
                client.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Removes and returns every client silent for longer than the timeout.
    pub fn check_timeouts(&mut self) -> Vec<Client> {
        let timeout = self.timeout;
        let timed_out: Vec<u32> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(timeout))
            .map(|(id, _)| *id)
            .collect();

        timed_out
            .iter()
            .filter_map(|client_id| self.remove_client(client_id))
            .collect()
    }

    /// Checks if server has reached maximum capacity
    pub fn is_full(&self) -> bool {
        self.clients.len() >= self.max_clients
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}
