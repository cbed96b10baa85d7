//! Embedding-application callbacks.
//!
//! The broker is policy-free: secrets, permissions, and publish vetoes
//! come from the embedding application through a single capability trait
//! installed at broker construction. Optional hooks default to no-ops so
//! applications implement only what they need.

use axum::http::HeaderMap;
use serde_json::Value;

use crate::auth::Permissions;
use crate::connection::SessionInfo;
use crate::error::HookError;
use crate::message::PublishMsg;

/// Application-supplied policy and lifecycle callbacks.
///
/// `auth_secret` and `auth_permissions` are consulted during the
/// challenge/response handshake and must be implemented. The remaining
/// hooks are optional. Handlers are expected to be fast; the handshake
/// path blocks on them.
pub trait BrokerHooks: Send + Sync + 'static {
    /// Returns the shared secret (or derivation base) for an auth key.
    ///
    /// # Errors
    ///
    /// Any error is surfaced to the client as an unknown-auth-key
    /// CALLERROR.
    fn auth_secret(&self, auth_key: &str) -> Result<String, HookError>;

    /// Resolves the permissions a key would receive on successful
    /// authentication.
    ///
    /// Called at challenge time; the result is committed only when the
    /// signature verifies.
    ///
    /// # Errors
    ///
    /// Any error aborts the challenge and is surfaced to the client as a
    /// CALLERROR.
    fn auth_permissions(
        &self,
        auth_key: &str,
        auth_extra: Option<&Value>,
    ) -> Result<Permissions, HookError>;

    /// Invoked once per successful handshake, on a detached task.
    fn on_authenticated(
        &self,
        _auth_key: &str,
        _auth_extra: Option<&Value>,
        _permissions: &Permissions,
    ) {
    }

    /// Invoked once when an authenticated session ends.
    fn on_disconnect(&self, _auth_key: &str, _auth_extra: Option<&Value>) {}

    /// Veto hook for client publishes. Returning false drops the event
    /// before fan-out.
    fn message_to_publish(&self, _publisher: &SessionInfo, _msg: &PublishMsg) -> bool {
        true
    }

    /// Gate consulted before the WebSocket upgrade completes. Returning
    /// false refuses the connection.
    fn verify_connect(&self, _headers: &HeaderMap) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionId;

    struct MinimalHooks;

    impl BrokerHooks for MinimalHooks {
        fn auth_secret(&self, auth_key: &str) -> Result<String, HookError> {
            match auth_key {
                "alice" => Ok("s3cret".to_string()),
                _ => Err(HookError::new("no such key")),
            }
        }

        fn auth_permissions(
            &self,
            _auth_key: &str,
            _auth_extra: Option<&Value>,
        ) -> Result<Permissions, HookError> {
            Ok(Permissions::default())
        }
    }

    #[test]
    fn test_optional_hooks_default_to_allow() {
        let hooks = MinimalHooks;
        let publisher = SessionInfo {
            id: ConnectionId::generate(),
            username: None,
            permissions: None,
        };

        assert!(hooks.message_to_publish(&publisher, &PublishMsg::default()));
        assert!(hooks.verify_connect(&HeaderMap::new()));
        hooks.on_authenticated("alice", None, &Permissions::default());
        hooks.on_disconnect("alice", None);
    }

    #[test]
    fn test_required_hooks() {
        let hooks = MinimalHooks;
        assert_eq!(hooks.auth_secret("alice").unwrap(), "s3cret");
        assert!(hooks.auth_secret("mallory").is_err());
        assert!(hooks.auth_permissions("alice", None).is_ok());
    }
}
