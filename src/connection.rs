//! Connection state and registry.
//!
//! This module provides the per-session connection record including:
//! - Connection identifiers (random UUIDs, rendered canonically)
//! - The authentication state machine
//! - The bounded outbound frame queue
//! - The registry used by publish fan-out to reach live connections

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::Permissions;

/// Unique connection identifier, valid for the lifetime of the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generates a new random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authentication state of a session.
///
/// Advances monotonically except for the single reset transition taken
/// when a challenge is answered with an invalid signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    /// Session established, no handshake started.
    Unauthenticated,
    /// authreq answered, waiting for the signature.
    ChallengeIssued,
    /// Handshake completed.
    Authenticated,
    /// Session torn down.
    Closed,
}

/// Transient handshake state between authreq and auth.
#[derive(Debug, Clone)]
pub struct PendingAuth {
    /// Auth key supplied to authreq.
    pub auth_key: String,
    /// Extra handshake parameters supplied to authreq.
    pub auth_extra: Option<Value>,
    /// Signature the client must produce.
    pub expected_signature: String,
    /// The serialized challenge (also the signed bytes).
    pub challenge: String,
    /// Permissions resolved at authreq time, committed on success.
    pub permissions: Permissions,
}

/// State of a single session.
///
/// All mutations happen on the session's receiver task; publish fan-out
/// from other tasks only reads the sender handle.
#[derive(Debug)]
pub struct SessionState {
    /// Connection ID.
    pub id: ConnectionId,
    /// Outbound frame queue. Bounded; a full queue blocks the enqueuer.
    pub sender: mpsc::Sender<String>,
    /// Authentication state.
    pub auth: AuthState,
    /// Handshake scratchpad, present iff `auth` is `ChallengeIssued`.
    pub pending: Option<PendingAuth>,
    /// Lowercase auth key, present iff authenticated.
    pub username: Option<String>,
    /// Auth key as supplied by the client, present iff authenticated.
    pub auth_key: Option<String>,
    /// Extra handshake parameters, retained for the disconnect callback.
    pub auth_extra: Option<Value>,
    /// Resolved permissions, present iff authenticated.
    pub permissions: Option<Permissions>,
}

impl SessionState {
    /// Creates a fresh unauthenticated session.
    #[must_use]
    pub fn new(id: ConnectionId, sender: mpsc::Sender<String>) -> Self {
        Self {
            id,
            sender,
            auth: AuthState::Unauthenticated,
            pending: None,
            username: None,
            auth_key: None,
            auth_extra: None,
            permissions: None,
        }
    }

    /// Returns true if the handshake has completed.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.auth == AuthState::Authenticated
    }

    /// Returns true if this session may publish on the topic.
    #[must_use]
    pub fn can_publish(&self, topic_uri: &str) -> bool {
        self.permissions
            .as_ref()
            .is_some_and(|p| p.can_publish(topic_uri))
    }

    /// Returns true if this session may subscribe to the topic.
    #[must_use]
    pub fn can_subscribe(&self, topic_uri: &str) -> bool {
        self.permissions
            .as_ref()
            .is_some_and(|p| p.can_subscribe(topic_uri))
    }

    /// Records an issued challenge and advances to `ChallengeIssued`.
    pub fn issue_challenge(&mut self, pending: PendingAuth) {
        self.pending = Some(pending);
        self.auth = AuthState::ChallengeIssued;
    }

    /// Commits a verified handshake and advances to `Authenticated`.
    ///
    /// Consumes the pending scratchpad; the username becomes the lowercase
    /// form of the auth key.
    pub fn commit_auth(&mut self, pending: PendingAuth) {
        self.username = Some(pending.auth_key.to_lowercase());
        self.auth_key = Some(pending.auth_key);
        self.auth_extra = pending.auth_extra;
        self.permissions = Some(pending.permissions);
        self.pending = None;
        self.auth = AuthState::Authenticated;
    }

    /// Discards a failed handshake and returns to `Unauthenticated`.
    pub fn reset_auth(&mut self) {
        self.pending = None;
        self.auth = AuthState::Unauthenticated;
    }

    /// Returns a snapshot of the session identity for handlers and hooks.
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            username: self.username.clone(),
            permissions: self.permissions.clone(),
        }
    }
}

/// Snapshot of a session's identity, handed to RPC handlers and hooks.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Connection ID.
    pub id: ConnectionId,
    /// Lowercase auth key, if authenticated.
    pub username: Option<String>,
    /// Resolved permissions, if authenticated.
    pub permissions: Option<Permissions>,
}

/// Registry of live connections.
///
/// Publish fan-out on any task reads this map; session start and teardown
/// write it.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<RwLock<SessionState>>>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session and returns the shared handle to it.
    pub fn register(&self, state: SessionState) -> Arc<RwLock<SessionState>> {
        let id = state.id;
        let state = Arc::new(RwLock::new(state));
        self.connections.insert(id, state.clone());
        state
    }

    /// Unregisters a session. Idempotent.
    pub fn unregister(&self, id: ConnectionId) {
        self.connections.remove(&id);
    }

    /// Looks up a live session by ID.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Arc<RwLock<SessionState>>> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    /// Returns the number of live connections.
    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }
}
