//! WAMP v1 message codec.
//!
//! This module defines the wire frames for WAMP v1 over WebSocket text
//! frames. Every frame is a JSON array whose first element is an integer
//! type tag:
//!
//! ```text
//! [0, sessionId, protocolVersion, serverIdent]          WELCOME
//! [2, callId, procURI, ...args]                         CALL
//! [3, callId, result]                                   CALLRESULT
//! [4, callId, errorURI, errorDesc, errorDetails?]       CALLERROR
//! [5, topicURI]                                         SUBSCRIBE
//! [6, topicURI]                                         UNSUBSCRIBE
//! [7, topicURI, event, excludeMe?|excludeList?, eligibleList?]  PUBLISH
//! [8, topicURI, event]                                  EVENT
//! ```
//!
//! Client frames are decoded with [`ClientMessage::decode`]; server frames
//! are built with [`ServerMessage::encode`]. Server-to-client frame types
//! arriving inbound decode to [`CodecError::WrongDirection`] so the session
//! loop can log and drop them without closing the connection.

use serde_json::{Value, json};

use crate::config::{PROTOCOL_VERSION, SERVER_IDENT};
use crate::error::{CodecError, RpcError};

/// WAMP v1 frame type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Server greeting, first frame of every session.
    Welcome,
    /// CURIE prefix declaration (unsupported, dropped).
    Prefix,
    /// RPC invocation.
    Call,
    /// Successful RPC result.
    CallResult,
    /// Failed RPC result.
    CallError,
    /// Topic subscription.
    Subscribe,
    /// Topic unsubscription.
    Unsubscribe,
    /// Event publication.
    Publish,
    /// Event delivery.
    Event,
}

impl MessageType {
    /// Maps a wire tag to a message type.
    #[must_use]
    pub const fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            0 => Some(Self::Welcome),
            1 => Some(Self::Prefix),
            2 => Some(Self::Call),
            3 => Some(Self::CallResult),
            4 => Some(Self::CallError),
            5 => Some(Self::Subscribe),
            6 => Some(Self::Unsubscribe),
            7 => Some(Self::Publish),
            8 => Some(Self::Event),
            _ => None,
        }
    }

    /// Returns the wire tag for this message type.
    #[must_use]
    pub const fn tag(self) -> u64 {
        match self {
            Self::Welcome => 0,
            Self::Prefix => 1,
            Self::Call => 2,
            Self::CallResult => 3,
            Self::CallError => 4,
            Self::Subscribe => 5,
            Self::Unsubscribe => 6,
            Self::Publish => 7,
            Self::Event => 8,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Welcome => "WELCOME",
            Self::Prefix => "PREFIX",
            Self::Call => "CALL",
            Self::CallResult => "CALLRESULT",
            Self::CallError => "CALLERROR",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Publish => "PUBLISH",
            Self::Event => "EVENT",
        };
        write!(f, "{name}")
    }
}

/// RPC invocation frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CallMsg {
    /// Client-chosen correlation identifier, echoed in the reply.
    pub call_id: String,
    /// Procedure URI to invoke.
    pub proc_uri: String,
    /// Call arguments, zero or more.
    pub args: Vec<Value>,
}

/// Topic subscription frame.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeMsg {
    /// Topic URI to subscribe to.
    pub topic_uri: String,
}

/// Topic unsubscription frame.
#[derive(Debug, Clone, PartialEq)]
pub struct UnsubscribeMsg {
    /// Topic URI to unsubscribe from.
    pub topic_uri: String,
}

/// Event publication frame.
///
/// The fourth element of the wire frame is polymorphic: a boolean is
/// `excludeMe`, an array is `excludeList` (with an optional fifth-element
/// `eligibleList`). The lists are parsed and carried but only publisher
/// self-suppression is enforced by the publish pipeline.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PublishMsg {
    /// Topic URI to publish on.
    pub topic_uri: String,
    /// Event payload.
    pub event: Value,
    /// Suppress delivery back to the publisher.
    pub exclude_me: bool,
    /// Connection IDs to exclude from delivery.
    pub exclude: Vec<String>,
    /// Connection IDs eligible for delivery.
    pub eligible: Vec<String>,
}

/// Client-to-server frames.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// RPC invocation.
    Call(CallMsg),
    /// Topic subscription.
    Subscribe(SubscribeMsg),
    /// Topic unsubscription.
    Unsubscribe(UnsubscribeMsg),
    /// Event publication.
    Publish(PublishMsg),
}

impl ClientMessage {
    /// Decodes a raw text frame into a client message.
    ///
    /// Leading whitespace before the array is tolerated. Server-to-client
    /// frame types decode to [`CodecError::WrongDirection`]; unknown or
    /// missing type tags decode to [`CodecError::UnsupportedProtocol`].
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] describing why the frame was rejected.
    pub fn decode(raw: &str) -> Result<Self, CodecError> {
        let data: Vec<Value> = serde_json::from_str(raw)?;

        let tag = data
            .first()
            .and_then(Value::as_u64)
            .ok_or(CodecError::UnsupportedProtocol)?;
        let typ = MessageType::from_tag(tag).ok_or(CodecError::UnsupportedProtocol)?;

        match typ {
            MessageType::Call => Ok(Self::Call(decode_call(&data)?)),
            MessageType::Subscribe => Ok(Self::Subscribe(SubscribeMsg {
                topic_uri: decode_topic(&data)?,
            })),
            MessageType::Unsubscribe => Ok(Self::Unsubscribe(UnsubscribeMsg {
                topic_uri: decode_topic(&data)?,
            })),
            MessageType::Publish => Ok(Self::Publish(decode_publish(&data)?)),
            MessageType::Welcome
            | MessageType::Prefix
            | MessageType::CallResult
            | MessageType::CallError
            | MessageType::Event => Err(CodecError::WrongDirection(typ)),
        }
    }

    /// Returns the frame type of this message.
    #[must_use]
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::Call(_) => MessageType::Call,
            Self::Subscribe(_) => MessageType::Subscribe,
            Self::Unsubscribe(_) => MessageType::Unsubscribe,
            Self::Publish(_) => MessageType::Publish,
        }
    }
}

fn decode_call(data: &[Value]) -> Result<CallMsg, CodecError> {
    if data.len() < 3 {
        return Err(CodecError::InvalidNumArgs);
    }
    let call_id = as_string(&data[1])?;
    let proc_uri = as_string(&data[2])?;
    Ok(CallMsg {
        call_id,
        proc_uri,
        args: data[3..].to_vec(),
    })
}

fn decode_topic(data: &[Value]) -> Result<String, CodecError> {
    if data.len() != 2 {
        return Err(CodecError::InvalidNumArgs);
    }
    as_string(&data[1])
}

fn decode_publish(data: &[Value]) -> Result<PublishMsg, CodecError> {
    if !(3..=5).contains(&data.len()) {
        return Err(CodecError::InvalidNumArgs);
    }

    let mut msg = PublishMsg {
        topic_uri: as_string(&data[1])?,
        event: data[2].clone(),
        ..PublishMsg::default()
    };

    match data.get(3) {
        None | Some(Value::Null) => {}
        Some(Value::Bool(exclude_me)) => msg.exclude_me = *exclude_me,
        Some(Value::Array(exclude)) => {
            msg.exclude = as_string_list(exclude)?;
            if let Some(eligible) = data.get(4) {
                let eligible = eligible.as_array().ok_or(CodecError::InvalidUri)?;
                msg.eligible = as_string_list(eligible)?;
            }
        }
        Some(_) => return Err(CodecError::InvalidUri),
    }

    Ok(msg)
}

fn as_string(value: &Value) -> Result<String, CodecError> {
    value
        .as_str()
        .map(String::from)
        .ok_or(CodecError::InvalidUri)
}

fn as_string_list(values: &[Value]) -> Result<Vec<String>, CodecError> {
    values.iter().map(as_string).collect()
}

/// Server-to-client frames.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Session greeting; always the first frame delivered.
    Welcome {
        /// Connection identifier assigned to the session.
        session_id: String,
    },
    /// Successful RPC reply.
    CallResult {
        /// Correlation identifier from the CALL frame.
        call_id: String,
        /// Result value.
        result: Value,
    },
    /// Failed RPC reply.
    CallError {
        /// Correlation identifier from the CALL frame.
        call_id: String,
        /// Error returned by the handler or the broker.
        error: RpcError,
    },
    /// Event delivery to a subscriber.
    Event {
        /// Topic URI the event was published on.
        topic_uri: String,
        /// Event payload.
        event: Value,
    },
}

impl ServerMessage {
    /// Encodes this message to its wire frame.
    ///
    /// CALLERROR frames omit the details element when the error carries
    /// none.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidFrame`] if JSON serialization fails.
    pub fn encode(&self) -> Result<String, CodecError> {
        let frame = match self {
            Self::Welcome { session_id } => {
                json!([MessageType::Welcome.tag(), session_id, PROTOCOL_VERSION, SERVER_IDENT])
            }
            Self::CallResult { call_id, result } => {
                json!([MessageType::CallResult.tag(), call_id, result])
            }
            Self::CallError { call_id, error } => match &error.details {
                Some(details) => json!([
                    MessageType::CallError.tag(),
                    call_id,
                    error.uri,
                    error.description,
                    details
                ]),
                None => json!([
                    MessageType::CallError.tag(),
                    call_id,
                    error.uri,
                    error.description
                ]),
            },
            Self::Event { topic_uri, event } => {
                json!([MessageType::Event.tag(), topic_uri, event])
            }
        };

        serde_json::to_string(&frame).map_err(CodecError::from)
    }
}
