//! WAMP-CRA challenge/response authentication.
//!
//! This module provides the cryptographic half of the handshake:
//! - Challenge construction (the serialized challenge is both the value
//!   returned to the client and the bytes that get signed)
//! - Signature computation, base64(HMAC-SHA256(key, challenge))
//! - Optional PBKDF2 key derivation when the client supplies a salt
//! - Constant-time signature verification
//!
//! The handshake state machine itself lives in the session loop; the
//! functions here are pure and deterministic given their inputs.

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::connection::ConnectionId;
use crate::error::AuthError;

type HmacSha256 = Hmac<Sha256>;

/// Per-topic publish/subscribe rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubSubPermission {
    /// May publish events on the topic.
    pub can_publish: bool,
    /// May subscribe to the topic.
    pub can_subscribe: bool,
}

/// Resolved permissions for an authenticated session.
///
/// Topics absent from `pubsub` deny both publish and subscribe.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Permissions {
    /// Procedure URI to call right. Not enforced at dispatch time.
    pub rpc: HashMap<String, bool>,
    /// Topic URI to pub/sub rights.
    pub pubsub: HashMap<String, PubSubPermission>,
}

impl Permissions {
    /// Returns true if publishing on the topic is allowed.
    #[must_use]
    pub fn can_publish(&self, topic_uri: &str) -> bool {
        self.pubsub.get(topic_uri).is_some_and(|p| p.can_publish)
    }

    /// Returns true if subscribing to the topic is allowed.
    #[must_use]
    pub fn can_subscribe(&self, topic_uri: &str) -> bool {
        self.pubsub.get(topic_uri).is_some_and(|p| p.can_subscribe)
    }
}

/// Challenge object serialized to the client.
///
/// Field order is part of the wire contract: the canonical serialization
/// is the signed message. The embedded empty permissions are vestigial but
/// required by Autobahn WAMP clients.
#[derive(Debug, Serialize)]
struct Challenge<'a> {
    authid: String,
    authkey: &'a str,
    timestamp: String,
    sessionid: String,
    extra: Value,
    permissions: ChallengePermissions,
}

#[derive(Debug, Serialize)]
struct ChallengePermissions {
    pubsub: Vec<Value>,
    rpc: Vec<Value>,
}

/// Builds and serializes a fresh challenge for the given auth key.
///
/// # Errors
///
/// Returns [`AuthError::Challenge`] if serialization fails.
pub fn build_challenge(
    session_id: ConnectionId,
    auth_key: &str,
    auth_extra: Option<&Value>,
) -> Result<String, AuthError> {
    let challenge = Challenge {
        authid: Uuid::new_v4().to_string(),
        authkey: auth_key,
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        sessionid: session_id.to_string(),
        extra: auth_extra.cloned().unwrap_or(Value::Null),
        permissions: ChallengePermissions {
            pubsub: Vec::new(),
            rpc: Vec::new(),
        },
    };

    Ok(serde_json::to_string(&challenge)?)
}

/// Resolves the HMAC signing key for a handshake.
///
/// With `authExtra.salt` present the key is
/// `base64(PBKDF2-HMAC-SHA256(secret, salt, iterations, keylen))`;
/// iteration count and key length come from `authExtra` when given,
/// otherwise from the broker defaults. Without a salt the raw secret is
/// the key.
#[must_use]
pub fn signing_key(secret: &str, auth_extra: Option<&Value>, config: &BrokerConfig) -> String {
    let Some(salt) = auth_extra
        .and_then(|extra| extra.get("salt"))
        .and_then(Value::as_str)
    else {
        return secret.to_string();
    };

    let iterations = auth_extra
        .and_then(|extra| extra.get("iterations"))
        .and_then(Value::as_u64)
        .map_or(config.pbkdf2_iterations, |n| n as u32);
    let keylen = auth_extra
        .and_then(|extra| extra.get("keylen"))
        .and_then(Value::as_u64)
        .map_or(config.pbkdf2_keylen, |n| n as usize);

    let mut derived = vec![0u8; keylen];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), salt.as_bytes(), iterations, &mut derived);
    BASE64.encode(derived)
}

/// Computes the signature for a challenge.
///
/// The result is `base64(HMAC-SHA256(key, challenge))` where the key is
/// resolved by [`signing_key`].
///
/// # Errors
///
/// Returns [`AuthError::InvalidKey`] if the HMAC cannot be keyed.
pub fn auth_signature(
    challenge: &str,
    secret: &str,
    auth_extra: Option<&Value>,
    config: &BrokerConfig,
) -> Result<String, AuthError> {
    let key = signing_key(secret, auth_extra, config);

    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| AuthError::InvalidKey(e.to_string()))?;
    mac.update(challenge.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

/// Compares a client-supplied signature against the expected one in
/// constant time.
#[must_use]
pub fn verify_signature(expected: &str, provided: &str) -> bool {
    expected.as_bytes().ct_eq(provided.as_bytes()).into()
}
