//! Broker configuration and protocol constants.
//!
//! This module provides configuration for the broker including:
//! - Per-connection send queue capacity
//! - PBKDF2 key-derivation defaults
//!
//! Protocol-level identity (server ident, protocol version, reserved URIs)
//! is fixed by the wire contract and exposed as constants.

use serde::{Deserialize, Serialize};

/// Server identity advertised in the WELCOME frame.
pub const SERVER_IDENT: &str = "postmaster-0.2.0";

/// WAMP protocol version advertised in the WELCOME frame.
pub const PROTOCOL_VERSION: u64 = 1;

/// Base URI for the reserved WAMP-CRA procedures.
pub const WAMP_PROCEDURE_URI: &str = "http://api.wamp.ws/procedure#";

/// Reserved procedure URI for initiating the authentication handshake.
pub const URI_AUTHREQ: &str = "http://api.wamp.ws/procedure#authreq";

/// Reserved procedure URI for completing the authentication handshake.
pub const URI_AUTH: &str = "http://api.wamp.ws/procedure#auth";

/// Base URI for CALLERROR error identifiers raised by the broker itself.
pub const WAMP_ERROR_URI: &str = "http://api.wamp.ws/error#";

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Maximum number of queued outbound frames per connection.
    ///
    /// A full queue blocks the enqueueing task until the sender drains a
    /// slot, coupling slow consumers to fast producers.
    #[serde(default = "default_send_backlog")]
    pub send_backlog: usize,

    /// Default PBKDF2 iteration count for salted key derivation.
    #[serde(default = "default_pbkdf2_iterations")]
    pub pbkdf2_iterations: u32,

    /// Default PBKDF2 derived-key length in bytes.
    #[serde(default = "default_pbkdf2_keylen")]
    pub pbkdf2_keylen: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            send_backlog: default_send_backlog(),
            pbkdf2_iterations: default_pbkdf2_iterations(),
            pbkdf2_keylen: default_pbkdf2_keylen(),
        }
    }
}

fn default_send_backlog() -> usize {
    6
}

fn default_pbkdf2_iterations() -> u32 {
    10_000
}

fn default_pbkdf2_keylen() -> usize {
    32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = BrokerConfig::default();
        assert_eq!(config.send_backlog, 6);
        assert_eq!(config.pbkdf2_iterations, 10_000);
        assert_eq!(config.pbkdf2_keylen, 32);
    }

    #[test]
    fn test_config_deserialize_empty() {
        let config: BrokerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.send_backlog, 6);
        assert_eq!(config.pbkdf2_iterations, 10_000);
    }

    #[test]
    fn test_config_deserialize_override() {
        let config: BrokerConfig =
            serde_json::from_str(r#"{"send_backlog": 16, "pbkdf2_iterations": 1000}"#).unwrap();
        assert_eq!(config.send_backlog, 16);
        assert_eq!(config.pbkdf2_iterations, 1000);
        assert_eq!(config.pbkdf2_keylen, 32);
    }

    #[test]
    fn test_reserved_uris() {
        assert_eq!(URI_AUTHREQ, "http://api.wamp.ws/procedure#authreq");
        assert_eq!(URI_AUTH, "http://api.wamp.ws/procedure#auth");
    }
}
