//! Session loop and WebSocket transport adapter.
//!
//! Each accepted socket runs two cooperating tasks:
//! - a **sender** that drains the session's bounded frame queue and writes
//!   to the socket strictly in enqueue order
//! - a **receiver** (this module's loop) that reads frames, decodes them,
//!   enforces auth gating, and dispatches to the handlers
//!
//! All per-session state mutations happen on the receiver task; publish
//! fan-out from other sessions only enqueues onto the frame queue. The
//! WELCOME frame is always the first frame a client sees.
//!
//! The frame router is socket-free: [`route_frame`] takes the broker, the
//! shared session state, and the raw text frame, so the protocol logic is
//! drivable without a transport.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::auth;
use crate::broker::Broker;
use crate::config::{URI_AUTH, URI_AUTHREQ};
use crate::connection::{AuthState, ConnectionId, PendingAuth, SessionState};
use crate::error::{CodecError, RpcError};
use crate::message::{CallMsg, ClientMessage, ServerMessage, SubscribeMsg, UnsubscribeMsg};

/// WebSocket upgrade handler.
///
/// Consults the application's connection-verification hook before
/// upgrading; refused connections get a 403.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(broker): State<Arc<Broker>>,
) -> Response {
    if !broker.hooks().verify_connect(&headers) {
        warn!("connection refused by verification hook");
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, broker))
        .into_response()
}

/// Runs a session for the lifetime of a socket.
async fn handle_socket(socket: WebSocket, broker: Arc<Broker>) {
    let id = ConnectionId::generate();

    let welcome = match (ServerMessage::Welcome {
        session_id: id.to_string(),
    })
    .encode()
    {
        Ok(frame) => frame,
        Err(e) => {
            error!(conn_id = %id, error = %e, "failed to encode welcome frame");
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // WELCOME is the first frame on the wire, ahead of the queue.
    if ws_sender.send(Message::Text(welcome.into())).await.is_err() {
        warn!(conn_id = %id, "failed to send welcome, aborting connection");
        return;
    }
    info!(conn_id = %id, "client connected");

    let (tx, mut rx) = mpsc::channel::<String>(broker.config().send_backlog);
    let session = broker.registry.register(SessionState::new(id, tx));

    // Sender task: exits after draining once the queue closes, i.e. when
    // the session state (holding the last sender handle) is dropped.
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => route_frame(&broker, &session, &text).await,
            Ok(Message::Binary(_)) => {
                debug!(conn_id = %id, "binary frame ignored");
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                debug!(conn_id = %id, "close requested");
                break;
            }
            Err(e) => {
                error!(conn_id = %id, error = %e, "error receiving message, aborting connection");
                break;
            }
        }
    }

    teardown_session(&broker, &session);
}

/// Tears a session down: unregisters it, marks it closed, and fires the
/// disconnect callback iff the session had authenticated. Idempotent.
pub(crate) fn teardown_session(broker: &Broker, session: &Arc<RwLock<SessionState>>) {
    let (id, disconnect) = {
        let mut state = session.write();
        if state.auth == AuthState::Closed {
            return;
        }
        let disconnect = if state.is_authenticated() {
            state
                .auth_key
                .clone()
                .map(|key| (key, state.auth_extra.clone()))
        } else {
            None
        };
        state.auth = AuthState::Closed;
        (state.id, disconnect)
    };

    broker.registry.unregister(id);
    info!(conn_id = %id, "client disconnected");

    if let Some((auth_key, auth_extra)) = disconnect {
        broker.hooks().on_disconnect(&auth_key, auth_extra.as_ref());
    }
}

/// Decodes one inbound text frame and dispatches it.
///
/// Codec failures (including misdirected server-to-client frames) are
/// logged and dropped; they never terminate the session.
pub(crate) async fn route_frame(broker: &Broker, session: &Arc<RwLock<SessionState>>, raw: &str) {
    let conn_id = session.read().id;

    let msg = match ClientMessage::decode(raw) {
        Ok(msg) => msg,
        Err(e @ CodecError::WrongDirection(_)) => {
            warn!(%conn_id, error = %e, "misdirected frame dropped");
            return;
        }
        Err(e) => {
            warn!(%conn_id, error = %e, "invalid frame dropped");
            return;
        }
    };

    match msg {
        ClientMessage::Call(call) => handle_call(broker, session, call).await,
        ClientMessage::Subscribe(sub) => handle_subscribe(broker, session, &sub),
        ClientMessage::Unsubscribe(unsub) => handle_unsubscribe(broker, session, &unsub),
        ClientMessage::Publish(publish) => {
            let (authenticated, info) = {
                let state = session.read();
                (state.is_authenticated(), state.info())
            };
            if !authenticated {
                debug!(%conn_id, topic = %publish.topic_uri, "unauthenticated publish dropped");
                return;
            }
            broker.publish_from_client(&info, publish).await;
        }
    }
}

/// Handles a CALL frame.
///
/// The two auth procedures are matched ahead of the dispatch tables;
/// everything else goes to the table matching the session's auth state.
async fn handle_call(broker: &Broker, session: &Arc<RwLock<SessionState>>, msg: CallMsg) {
    let reply = match msg.proc_uri.as_str() {
        URI_AUTHREQ => to_reply(&msg, handle_authreq(broker, session, &msg.args)),
        URI_AUTH => to_reply(&msg, handle_auth(broker, session, &msg.args)),
        _ => {
            let (info, authenticated) = {
                let state = session.read();
                (state.info(), state.is_authenticated())
            };
            broker.dispatch_call(&info, &msg, authenticated)
        }
    };

    send_frame(session, &reply).await;
}

fn to_reply(msg: &CallMsg, result: Result<Value, RpcError>) -> ServerMessage {
    match result {
        Ok(result) => ServerMessage::CallResult {
            call_id: msg.call_id.clone(),
            result,
        },
        Err(error) => ServerMessage::CallError {
            call_id: msg.call_id.clone(),
            error,
        },
    }
}

/// Enqueues a reply frame on the session's own queue.
async fn send_frame(session: &Arc<RwLock<SessionState>>, reply: &ServerMessage) {
    match reply.encode() {
        Ok(frame) => {
            let sender = session.read().sender.clone();
            if sender.send(frame).await.is_err() {
                debug!("reply dropped, send queue closed");
            }
        }
        Err(e) => {
            error!(error = %e, "failed to encode reply frame");
        }
    }
}

/// The authreq procedure: issues a fresh challenge.
fn handle_authreq(
    broker: &Broker,
    session: &Arc<RwLock<SessionState>>,
    args: &[Value],
) -> Result<Value, RpcError> {
    let (id, state) = {
        let session = session.read();
        (session.id, session.auth)
    };
    match state {
        AuthState::Authenticated => return Err(RpcError::already_authenticated()),
        AuthState::ChallengeIssued => return Err(RpcError::auth_pending()),
        AuthState::Unauthenticated | AuthState::Closed => {}
    }

    let auth_key = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(RpcError::invalid_num_args)?;
    let auth_extra = match args.get(1) {
        None | Some(Value::Null) => None,
        Some(extra @ Value::Object(_)) => Some(extra.clone()),
        Some(_) => return Err(RpcError::invalid_num_args()),
    };

    let secret = broker
        .hooks()
        .auth_secret(auth_key)
        .map_err(|e| RpcError::unknown_auth_key(e.to_string()))?;

    let challenge = auth::build_challenge(id, auth_key, auth_extra.as_ref())
        .map_err(|e| RpcError::internal(e.to_string()))?;
    let expected_signature =
        auth::auth_signature(&challenge, &secret, auth_extra.as_ref(), broker.config())
            .map_err(|e| RpcError::internal(e.to_string()))?;

    // Resolved now, committed only when the signature verifies.
    let permissions = broker
        .hooks()
        .auth_permissions(auth_key, auth_extra.as_ref())
        .map_err(|e| RpcError::unknown_auth_key(e.to_string()))?;

    session.write().issue_challenge(PendingAuth {
        auth_key: auth_key.to_string(),
        auth_extra,
        expected_signature,
        challenge: challenge.clone(),
        permissions,
    });

    info!(conn_id = %id, authkey = %auth_key, "authentication challenge issued");
    Ok(Value::String(challenge))
}

/// The auth procedure: verifies the signature and commits the handshake.
fn handle_auth(
    broker: &Broker,
    session: &Arc<RwLock<SessionState>>,
    args: &[Value],
) -> Result<Value, RpcError> {
    let signature = args
        .first()
        .and_then(Value::as_str)
        .ok_or_else(RpcError::invalid_num_args)?;

    let mut state = session.write();
    match state.auth {
        AuthState::Authenticated => return Err(RpcError::already_authenticated()),
        AuthState::Unauthenticated | AuthState::Closed => {
            return Err(RpcError::no_pending_auth());
        }
        AuthState::ChallengeIssued => {}
    }
    let Some(pending) = state.pending.take() else {
        return Err(RpcError::no_pending_auth());
    };

    if !auth::verify_signature(&pending.expected_signature, signature) {
        debug!(
            conn_id = %state.id,
            challenge = %pending.challenge,
            "signature mismatch, resetting handshake"
        );
        state.reset_auth();
        return Err(RpcError::invalid_signature());
    }

    let result = match serde_json::to_value(&pending.permissions) {
        Ok(result) => result,
        Err(e) => {
            state.reset_auth();
            return Err(RpcError::internal(e.to_string()));
        }
    };

    let auth_key = pending.auth_key.clone();
    let auth_extra = pending.auth_extra.clone();
    let permissions = pending.permissions.clone();
    state.commit_auth(pending);
    info!(conn_id = %state.id, username = %auth_key.to_lowercase(), "client authenticated");
    drop(state);

    // Detached so a slow application callback cannot stall the handshake
    // reply.
    let hooks = broker.hooks().clone();
    tokio::spawn(async move {
        hooks.on_authenticated(&auth_key, auth_extra.as_ref(), &permissions);
    });

    Ok(result)
}

fn handle_subscribe(broker: &Broker, session: &Arc<RwLock<SessionState>>, msg: &SubscribeMsg) {
    let (id, authenticated, allowed) = {
        let state = session.read();
        (
            state.id,
            state.is_authenticated(),
            state.can_subscribe(&msg.topic_uri),
        )
    };

    if !authenticated {
        debug!(conn_id = %id, topic = %msg.topic_uri, "unauthenticated subscribe dropped");
        return;
    }
    if !allowed {
        debug!(conn_id = %id, topic = %msg.topic_uri, "subscribe denied");
        return;
    }

    broker.subscriptions.add(&msg.topic_uri, id);
    debug!(conn_id = %id, topic = %msg.topic_uri, "subscribed");
}

fn handle_unsubscribe(broker: &Broker, session: &Arc<RwLock<SessionState>>, msg: &UnsubscribeMsg) {
    let (id, authenticated) = {
        let state = session.read();
        (state.id, state.is_authenticated())
    };

    if !authenticated {
        debug!(conn_id = %id, topic = %msg.topic_uri, "unauthenticated unsubscribe dropped");
        return;
    }

    broker.subscriptions.remove(&msg.topic_uri, id);
    debug!(conn_id = %id, topic = %msg.topic_uri, "unsubscribed");
}
