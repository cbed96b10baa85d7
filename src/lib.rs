//! # Postmaster
//!
//! A WAMP v1 message broker carried over WebSocket text frames.
//!
//! This crate provides:
//! - Remote procedure calls and topic-based publish/subscribe multiplexed
//!   on a single connection
//! - WAMP-CRA challenge/response authentication (HMAC-SHA256, optional
//!   PBKDF2 key derivation) gating both interaction patterns
//! - Per-connection permissions resolved by the embedding application
//! - A bounded per-connection send queue so a slow client cannot cause
//!   unbounded memory growth
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Broker                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌───────────┐  ┌───────────┐  ┌───────────┐                │
//! │  │ Session   │  │ Session   │  │ Session   │   ...          │
//! │  │ recv+send │  │ recv+send │  │ recv+send │                │
//! │  └─────┬─────┘  └─────┬─────┘  └─────┬─────┘                │
//! │        │              │              │                      │
//! │        └──────────────┼──────────────┘                      │
//! │                       ▼                                     │
//! │  ┌───────────────────────────────────────────────────────┐  │
//! │  │ Connection registry + subscription index              │  │
//! │  │ - auth state machine per session                      │  │
//! │  │ - topic URI -> subscriber set                         │  │
//! │  │ - RPC dispatch tables (pre-auth and authenticated)    │  │
//! │  └───────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Authentication
//!
//! Clients authenticate with the two reserved procedures:
//!
//! 1. `CALL http://api.wamp.ws/procedure#authreq (authKey, authExtra?)`
//!    returns a serialized challenge.
//! 2. The client signs the challenge with
//!    `base64(HMAC-SHA256(key, challenge))` and sends
//!    `CALL http://api.wamp.ws/procedure#auth (signature)`, which returns
//!    the session's permissions.
//!
//! Secrets and permissions come from the [`BrokerHooks`] capability trait
//! installed at broker construction.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use postmaster::{Broker, BrokerConfig, BrokerHooks, HookError, Permissions};
//!
//! struct Hooks;
//!
//! impl BrokerHooks for Hooks {
//!     fn auth_secret(&self, auth_key: &str) -> Result<String, HookError> {
//!         match auth_key {
//!             "alice" => Ok("s3cret".to_string()),
//!             _ => Err(HookError::new("unknown key")),
//!         }
//!     }
//!
//!     fn auth_permissions(
//!         &self,
//!         _auth_key: &str,
//!         _auth_extra: Option<&serde_json::Value>,
//!     ) -> Result<Permissions, HookError> {
//!         Ok(Permissions::default())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let broker = Arc::new(Broker::new(BrokerConfig::default(), Arc::new(Hooks)));
//!     let app = axum::Router::new()
//!         .route("/ws", axum::routing::any(postmaster::ws_handler))
//!         .with_state(broker);
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod auth;
pub mod broker;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod hooks;
pub mod message;
pub mod subscription;

pub use auth::{Permissions, PubSubPermission};
pub use broker::{Broker, RpcHandler};
pub use config::BrokerConfig;
pub use connection::{ConnectionId, SessionInfo};
pub use error::{BrokerError, CodecError, HookError, RpcError};
pub use handler::ws_handler;
pub use hooks::BrokerHooks;
pub use message::{ClientMessage, MessageType, PublishMsg, ServerMessage};
