//! # Warden Server Library
//!
//! This library provides a zero-trust admission and session-integrity engine
//! together with a UDP host that puts it in front of a connection-oriented
//! service. Every connecting origin must prove knowledge of a pre-shared
//! secret before it is let through, and every admitted identity is pinned to
//! the address it first arrived from.
//!
//! ## Core Responsibilities
//!
//! ### Challenge/Response Admission
//! A new origin receives a single-use challenge (random nonce, entropy token,
//! difficulty) and must answer with a SHA-256 digest that mixes in the server
//! secret. Answers are checked in constant time and each challenge is spent
//! on its first answer, right or wrong.
//!
//! ### Failure Accounting and Lockout
//! Failed answers are counted per origin. Reaching the configured maximum
//! locks the origin out for a fixed period and asks the enforcement layer to
//! block it. Successful origins stay verified for a configurable window.
//!
//! ### Session Binding
//! After admission the session guardian binds the claimed identity to its
//! origin. The same identity arriving from another origin is a session swap:
//! the attempt is denied, the original session is marked compromised and the
//! newcomer is temporarily banned.
//!
//! ## Architecture Design
//!
//! ### Sharded Per-Key Stores
//! Every store (pending challenges, failure counts, lockouts, verifications,
//! rate-limit windows, sessions) is a sharded map with one lock per shard.
//! State transitions are atomic per key and never take a global lock.
//!
//! ### Injected Collaborators
//! Time, audit output and enforcement are traits (`Clock`, `AuditSink`,
//! `Enforcer`). The engine never logs, sleeps or blocks on its own, which
//! keeps it deterministic under test.
//!
//! ### Fail Closed
//! A weak or unset secret is a configuration error. The engine refuses to
//! construct, and the binary exits non-zero.
//!
//! ## Module Organization
//!
//! ### Engine (`challenge`, `admission`, `fingerprint`, `guardian`, `engine`)
//! The admission state machine and session guardian, assembled by `Warden`.
//!
//! ### Support (`config`, `events`, `enforcement`, `clock`, `store`,
//! `rate_limit`, `validation`)
//! YAML configuration, audit events and sinks, the in-process ban list, time,
//! the sharded map, the per-origin rate limiter and input hygiene helpers.
//!
//! ### Host (`network`, `client_manager`)
//! UDP socket handling, the packet flow and connection bookkeeping.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use warden_server::clock::SystemClock;
//! use warden_server::config::SecurityConfig;
//! use warden_server::engine::Warden;
//! use warden_server::events::LogSink;
//! use warden_server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let config = SecurityConfig::load("warden.yml")?;
//!     let warden = Arc::new(Warden::new(&config, Arc::new(SystemClock), Arc::new(LogSink))?);
//!
//!     let mut server = Server::new("127.0.0.1:8080", warden, config.response_timeout(), 32).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! The server runs several internal async tasks:
//! - **Network Receiver**: Continuously listens for incoming packets
//! - **Network Sender**: Processes the outgoing packet queue
//! - **Timeout Checker**: Drops silent clients and abandoned handshakes
//! - **Sweeper**: Expires challenges, verifications, lockouts, bans and sessions
//!
//! ## Security Considerations
//!
//! ### Generic Rejections
//! Remote parties only ever see one rejection message. Why a connection was
//! refused is recorded in the audit trail, never sent on the wire.
//!
//! ### Untrusted Input
//! Origins are parsed into a validated type before they reach any store, and
//! free text is sanitised before it is written to the log.

pub mod admission;
pub mod challenge;
pub mod client_manager;
pub mod clock;
pub mod config;
pub mod enforcement;
pub mod engine;
pub mod events;
pub mod fingerprint;
pub mod guardian;
pub mod network;
pub mod rate_limit;
pub mod store;
pub mod validation;
