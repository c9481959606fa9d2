//! # pairlink
//!
//! Pairing and session negotiation between two peers over an untrusted
//! store-and-forward relay.
//!
//! ## Features
//!
//! - **Pairing handshake** over X25519 with a topic derived from the shared secret
//! - **Sessions** scoped to chains and JSON-RPC methods, proposed over a pairing
//! - **Encrypted envelopes** (ChaCha20-Poly1305, topic bound) on every settled topic
//! - **Pluggable transport** and persistence (in-memory and WebSocket included)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pairlink::transport::memory::MemoryRelay;
//! use pairlink::{AppMetadata, Client, ClientConfig, MemoryKeyStore, MemoryKeyValueStore, SessionPermissions};
//! use std::sync::Arc;
//!
//! # async fn demo() -> pairlink::Result<()> {
//! let hub = MemoryRelay::new();
//! let (transport, transport_events) = hub.connect();
//! let (dapp, mut events) = Client::new(
//!     ClientConfig::new(AppMetadata::named("dapp"), false),
//!     Arc::new(transport),
//!     transport_events,
//!     Arc::new(MemoryKeyStore::new()),
//!     Arc::new(MemoryKeyValueStore::new()),
//! );
//!
//! let permissions = SessionPermissions::new(["eip155:1"], ["eth_sign"]);
//! let uri = dapp.connect(permissions, None).await?;
//! println!("share this: {}", uri.unwrap_or_default());
//!
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                   CLIENT                    │
//! │        connect | pair | approve | ...       │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │                  ENGINES                    │
//! │   Pairing | Session  (+ SequenceStore)      │
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │                   RELAY                     │
//! │  Subscriber | Codec | id correlation | dedup│
//! └─────────────────────┬───────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────┐
//! │                 TRANSPORT                   │
//! │          In-memory hub | WebSocket          │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod codec;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod jsonrpc;
pub mod relay;
pub mod store;
pub mod transport;
pub mod types;

// Re-export main types at crate root
pub use client::{Client, ClientConfig, ClientEvent};
pub use crypto::{CryptoError, CryptoResult, KeyStore, MemoryKeyStore};
pub use error::{Error, Result};
pub use jsonrpc::{JsonRpcError, JsonRpcErrorResponse, JsonRpcResponse, RpcResponse};
pub use store::{KeyValueStore, MemoryKeyValueStore};
pub use types::{
    AppMetadata, Pairing, PairingUri, PayloadRequestParams, Reason, Session, SessionPermissions,
    SessionProposal, SessionRequest,
};
