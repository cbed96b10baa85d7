//! Broker error types.
//!
//! This module provides error types for the broker layers:
//! - Codec errors for malformed or misdirected frames
//! - RPC errors carried back to clients as CALLERROR frames
//! - Hook errors raised by embedding-application callbacks
//! - Broker API errors

use serde_json::Value;
use thiserror::Error;

use crate::config::WAMP_ERROR_URI;
use crate::message::MessageType;

/// Frame decode error.
///
/// Codec errors never terminate a session; the offending frame is logged
/// and dropped.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A URI or identifier field was missing or not a string.
    #[error("invalid URI")]
    InvalidUri,

    /// The frame array had the wrong number of elements for its type.
    #[error("invalid number of arguments in message")]
    InvalidNumArgs,

    /// The leading type tag was absent, non-integer, or unknown.
    #[error("unsupported protocol")]
    UnsupportedProtocol,

    /// A server-to-client frame type arrived inbound.
    #[error("server -> client message type {0} received from client")]
    WrongDirection(MessageType),

    /// The payload was not a JSON array at all.
    #[error("invalid message format: {0}")]
    InvalidFrame(#[from] serde_json::Error),
}

/// Error returned by an RPC handler, delivered to the client as a
/// CALLERROR frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    /// Error identifier URI.
    pub uri: String,
    /// Human-readable description.
    pub description: String,
    /// Optional structured details.
    pub details: Option<Value>,
}

impl RpcError {
    /// Creates an error with the given URI and description.
    #[must_use]
    pub fn new(uri: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            description: description.into(),
            details: None,
        }
    }

    /// Attaches structured details to the error.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    fn kind(kind: &str, description: impl Into<String>) -> Self {
        Self::new(format!("{WAMP_ERROR_URI}{kind}"), description)
    }

    /// CALL to a procedure URI with no registered handler.
    #[must_use]
    pub fn not_implemented(proc_uri: &str) -> Self {
        Self::new("error:notimplemented", "RPC call not implemented")
            .with_details(Value::String(proc_uri.to_string()))
    }

    /// Auth procedure called on an already-authenticated session.
    #[must_use]
    pub fn already_authenticated() -> Self {
        Self::kind("already-authenticated", "session is already authenticated")
    }

    /// authreq called while a challenge is outstanding.
    #[must_use]
    pub fn auth_pending() -> Self {
        Self::kind("auth-pending", "authentication request already issued")
    }

    /// auth called with no outstanding challenge.
    #[must_use]
    pub fn no_pending_auth() -> Self {
        Self::kind("no-pending-auth", "no authentication request issued")
    }

    /// Secret or permission lookup failed for the supplied auth key.
    #[must_use]
    pub fn unknown_auth_key(detail: impl Into<String>) -> Self {
        Self::kind("unknown-auth-key", detail)
    }

    /// Client signature did not match the expected signature.
    #[must_use]
    pub fn invalid_signature() -> Self {
        Self::kind("invalid-signature", "signature is invalid")
    }

    /// Auth procedure called with malformed arguments.
    #[must_use]
    pub fn invalid_num_args() -> Self {
        Self::kind("invalid-num-args", "invalid number of arguments")
    }

    /// Broker-side failure while servicing a call.
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::kind("internal-error", detail)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.uri, self.description)
    }
}

impl std::error::Error for RpcError {}

/// Authentication handshake construction error.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The HMAC key could not be constructed.
    #[error("failed to create HMAC: {0}")]
    InvalidKey(String),

    /// The challenge object could not be serialized.
    #[error("failed to serialize challenge: {0}")]
    Challenge(#[from] serde_json::Error),
}

/// Error raised by an embedding-application callback.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HookError {
    message: String,
}

impl HookError {
    /// Creates a hook error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Broker API error.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Attempted to register a handler on a reserved auth procedure URI.
    #[error("procedure URI is reserved: {0}")]
    ReservedUri(String),
}
