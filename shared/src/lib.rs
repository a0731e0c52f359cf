//! Wire protocol and proof primitives shared by the warden server and client.
//!
//! Everything in here is pure: no clocks, no randomness, no sockets. The server
//! uses these functions to build and check challenges, the client uses the very
//! same functions to answer them, so both sides agree byte-for-byte on the
//! payload layout and the digest input.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::IpAddr;
use uuid::Uuid;

pub const PROTOCOL_VERSION: u32 = 1;

/// Length of a hex encoded SHA-256 answer.
pub const ANSWER_HEX_LEN: usize = 64;

pub const PAYLOAD_DELIMITER: char = ':';

/// Generic rejection text sent to remote parties. Diagnostic detail never
/// leaves the server.
pub const REJECTION_MESSAGE: &str = "Connection rejected.";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect {
        identity: Uuid,
        protocol_version: u32,
    },
    ChallengeResponse {
        answer: String,
    },
    Heartbeat,
    Disconnect,

    Challenge {
        payload: String,
    },
    Connected {
        session_hash: String,
    },
    Rejected {
        reason: String,
    },
}

/// A validated network-layer address of a connecting client.
///
/// The only way to obtain an `Origin` from text is [`Origin::parse`], so any
/// value of this type is a well-formed IPv4 or IPv6 literal in canonical form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Origin(IpAddr);

impl Origin {
    /// Parses and canonicalises an address literal.
    ///
    /// Surrounding whitespace is ignored. Host names, ports, empty strings and
    /// out-of-range octets are rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        trimmed.parse::<IpAddr>().ok().map(Origin)
    }

    pub fn ip(&self) -> IpAddr {
        self.0
    }

    /// True for loopback, private and link-local ranges.
    pub fn is_private(&self) -> bool {
        match self.0 {
            IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
            IpAddr::V6(v6) => {
                let first = v6.segments()[0];
                v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
            }
        }
    }
}

impl From<IpAddr> for Origin {
    fn from(addr: IpAddr) -> Self {
        Origin(addr)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The public part of a challenge as it travels to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengePayload {
    pub nonce: u64,
    pub difficulty: u32,
    pub entropy_token: String,
}

impl ChallengePayload {
    /// Encodes as `nonce:difficulty:entropy_token`.
    pub fn to_wire(&self) -> String {
        format!(
            "{}{d}{}{d}{}",
            self.nonce,
            self.difficulty,
            self.entropy_token,
            d = PAYLOAD_DELIMITER
        )
    }

    pub fn parse(wire: &str) -> Option<Self> {
        let mut parts = wire.split(PAYLOAD_DELIMITER);
        let nonce = parts.next()?.parse().ok()?;
        let difficulty = parts.next()?.parse().ok()?;
        let entropy_token = parts.next()?;
        if parts.next().is_some() || entropy_token.is_empty() {
            return None;
        }
        if !entropy_token.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self {
            nonce,
            difficulty,
            entropy_token: entropy_token.to_string(),
        })
    }

    /// Answers this payload with the pre-shared secret.
    pub fn solve(&self, secret: &str) -> String {
        compute_answer(self.nonce, secret, self.difficulty, &self.entropy_token)
    }
}

/// `SHA-256(nonce ∥ secret ∥ difficulty ∥ entropy_token)` as lowercase hex.
///
/// Numbers are rendered in decimal before hashing.
pub fn compute_answer(nonce: u64, secret: &str, difficulty: u32, entropy_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(nonce.to_string().as_bytes());
    hasher.update(secret.as_bytes());
    hasher.update(difficulty.to_string().as_bytes());
    hasher.update(entropy_token.as_bytes());
    hex::encode(hasher.finalize())
}

/// True when `response` is exactly [`ANSWER_HEX_LEN`] hex digits.
///
/// Case is not significant; callers lowercase before comparing.
pub fn is_well_formed_answer(response: &str) -> bool {
    response.len() == ANSWER_HEX_LEN && response.bytes().all(|b| b.is_ascii_hexdigit())
}
