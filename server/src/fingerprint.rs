//! Per-identity session fingerprint.

use crate::clock::elapsed_millis;
use crate::validation::generate_secure_token;
use sha2::{Digest, Sha256};
use std::time::Duration;
use uuid::Uuid;
use warden_shared::Origin;

pub const SUSPICIOUS_THRESHOLD: u32 = 5;
pub const COMPROMISED_THRESHOLD: u32 = 10;

/// Ordered by severity. A session only ever moves up this ladder until an
/// operator clears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionStatus {
    Active,
    Suspicious,
    UnderInvestigation,
    Compromised,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFingerprint {
    identity: Uuid,
    bound_origin: Option<Origin>,
    protocol_hash: String,
    created_at: u64,
    protocol_version: u32,
    suspicion: u32,
    status: SessionStatus,
}

impl SessionFingerprint {
    /// Fingerprint for a raw, unvalidated origin.
    ///
    /// An origin that fails validation leaves the fingerprint unbound: it
    /// starts with one point of suspicion and never matches any origin.
    pub fn new(identity: Uuid, raw_origin: &str, protocol_version: u32, now: u64) -> Self {
        match Origin::parse(raw_origin) {
            Some(origin) => Self::bound(identity, origin, protocol_version, now),
            None => {
                let mut fingerprint = Self::build(identity, None, protocol_version, now);
                fingerprint.suspicion = 1;
                fingerprint
            }
        }
    }

    /// Fingerprint for an origin that has already been validated.
    pub fn bound(identity: Uuid, origin: Origin, protocol_version: u32, now: u64) -> Self {
        Self::build(identity, Some(origin), protocol_version, now)
    }

    fn build(identity: Uuid, bound_origin: Option<Origin>, protocol_version: u32, now: u64) -> Self {
        Self {
            identity,
            bound_origin,
            protocol_hash: protocol_hash(identity, bound_origin, protocol_version, now),
            created_at: now,
            protocol_version,
            suspicion: 0,
            status: SessionStatus::Active,
        }
    }

    /// False when either side is not a valid address, strict equality otherwise.
    pub fn validate_origin(&self, candidate: &str) -> bool {
        match Origin::parse(candidate) {
            Some(origin) => self.matches(&origin),
            None => false,
        }
    }

    /// Exact comparison against the bound origin. Unbound never matches.
    pub fn matches(&self, origin: &Origin) -> bool {
        self.bound_origin.as_ref() == Some(origin)
    }

    /// Adds suspicion and escalates the status when a threshold is crossed.
    /// The status never goes down here.
    pub fn increment_suspicion(&mut self, amount: u32) {
        self.suspicion = self.suspicion.saturating_add(amount);
        let derived = if self.suspicion >= COMPROMISED_THRESHOLD {
            SessionStatus::Compromised
        } else if self.suspicion >= SUSPICIOUS_THRESHOLD {
            SessionStatus::Suspicious
        } else {
            SessionStatus::Active
        };
        self.status = self.status.max(derived);
    }

    /// Raises the status to under investigation unless it is already higher.
    pub fn mark_investigated(&mut self) {
        self.status = self.status.max(SessionStatus::UnderInvestigation);
    }

    /// Operator reset. The only path back to [`SessionStatus::Active`].
    pub fn clear_suspicion(&mut self) {
        self.suspicion = 0;
        self.status = SessionStatus::Active;
    }

    pub fn identity(&self) -> Uuid {
        self.identity
    }

    pub fn bound_origin(&self) -> Option<Origin> {
        self.bound_origin
    }

    pub fn protocol_hash(&self) -> &str {
        &self.protocol_hash
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn protocol_version(&self) -> u32 {
        self.protocol_version
    }

    pub fn suspicion(&self) -> u32 {
        self.suspicion
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Time since the fingerprint was created.
    pub fn session_duration(&self, now: u64) -> Duration {
        Duration::from_millis(elapsed_millis(now, self.created_at))
    }
}

/// First 8 bytes of SHA-256 over identity, origin, version, creation time and
/// a fresh entropy token, hex encoded. Not a secret.
fn protocol_hash(identity: Uuid, origin: Option<Origin>, protocol_version: u32, now: u64) -> String {
    let origin = origin
        .map(|o| o.to_string())
        .unwrap_or_else(|| "INVALID".to_string());
    let mut hasher = Sha256::new();
    hasher.update(identity.to_string().as_bytes());
    hasher.update(origin.as_bytes());
    hasher.update(protocol_version.to_string().as_bytes());
    hasher.update(now.to_string().as_bytes());
    hasher.update(generate_secure_token(8).as_bytes());
    hex::encode(&hasher.finalize()[..8])
}
