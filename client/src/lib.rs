//! # Warden Client Library
//!
//! Client side of the warden admission handshake. A client announces its
//! identity, receives a challenge payload (`nonce:difficulty:entropy_token`),
//! answers it with the digest computed from the pre-shared secret, and is
//! either connected with a session hash or rejected.
//!
//! The digest itself comes from `warden_shared`, so client and server always
//! agree on the exact bytes that are hashed.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use uuid::Uuid;
//! use warden_client::network::{Client, HandshakeOutcome};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let mut client = Client::new("127.0.0.1:8080", Uuid::new_v4(), "MySecureKey12345!").await?;
//!
//!     match client.handshake().await? {
//!         HandshakeOutcome::Connected { session_hash } => println!("in: {}", session_hash),
//!         HandshakeOutcome::Rejected { reason } => println!("out: {}", reason),
//!         HandshakeOutcome::TimedOut => println!("no answer"),
//!     }
//!
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod network;
