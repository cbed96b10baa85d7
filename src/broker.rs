//! Broker state and external API.
//!
//! The [`Broker`] owns the connection registry, the subscription index,
//! and the two RPC dispatch tables (one for authenticated sessions, one
//! for the pre-auth window). It is shared behind an `Arc` between the
//! transport handler and the embedding application.
//!
//! The publish pipeline lives here: permission check, application veto,
//! single serialization of the EVENT frame, subscriber snapshot, fan-out
//! with publisher self-suppression and lazy pruning of dead subscribers.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::config::{BrokerConfig, URI_AUTH, URI_AUTHREQ};
use crate::connection::{ConnectionId, ConnectionRegistry, SessionInfo};
use crate::error::{BrokerError, RpcError};
use crate::hooks::BrokerHooks;
use crate::message::{CallMsg, PublishMsg, ServerMessage};
use crate::subscription::SubscriptionIndex;

/// RPC handler invoked with the calling session, the procedure URI, and
/// the call arguments.
pub type RpcHandler =
    Arc<dyn Fn(&SessionInfo, &str, &[Value]) -> Result<Value, RpcError> + Send + Sync>;

/// The session broker.
pub struct Broker {
    config: BrokerConfig,
    hooks: Arc<dyn BrokerHooks>,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) subscriptions: SubscriptionIndex,
    rpc: DashMap<String, RpcHandler>,
    unauth_rpc: DashMap<String, RpcHandler>,
}

impl Broker {
    /// Creates a broker with the given configuration and application
    /// hooks.
    #[must_use]
    pub fn new(config: BrokerConfig, hooks: Arc<dyn BrokerHooks>) -> Self {
        Self {
            config,
            hooks,
            registry: ConnectionRegistry::new(),
            subscriptions: SubscriptionIndex::new(),
            rpc: DashMap::new(),
            unauth_rpc: DashMap::new(),
        }
    }

    /// Returns the broker configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub(crate) fn hooks(&self) -> &Arc<dyn BrokerHooks> {
        &self.hooks
    }

    /// Returns the number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.count()
    }

    /// Registers an RPC handler callable by authenticated sessions.
    ///
    /// Registration is expected at configuration time, before sessions
    /// start.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ReservedUri`] for the built-in auth
    /// procedure URIs.
    pub fn register_rpc(&self, uri: &str, handler: RpcHandler) -> Result<(), BrokerError> {
        Self::check_reserved(uri)?;
        self.rpc.insert(uri.to_string(), handler);
        Ok(())
    }

    /// Removes an authenticated-table RPC handler. Idempotent.
    pub fn unregister_rpc(&self, uri: &str) {
        self.rpc.remove(uri);
    }

    /// Registers an RPC handler callable before authentication.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ReservedUri`] for the built-in auth
    /// procedure URIs.
    pub fn register_unauth_rpc(&self, uri: &str, handler: RpcHandler) -> Result<(), BrokerError> {
        Self::check_reserved(uri)?;
        self.unauth_rpc.insert(uri.to_string(), handler);
        Ok(())
    }

    /// Removes a pre-auth RPC handler. Idempotent.
    pub fn unregister_unauth_rpc(&self, uri: &str) {
        self.unauth_rpc.remove(uri);
    }

    fn check_reserved(uri: &str) -> Result<(), BrokerError> {
        if uri == URI_AUTHREQ || uri == URI_AUTH {
            return Err(BrokerError::ReservedUri(uri.to_string()));
        }
        Ok(())
    }

    /// Dispatches a CALL to the table matching the session's auth state
    /// and produces the reply frame.
    pub(crate) fn dispatch_call(
        &self,
        caller: &SessionInfo,
        msg: &CallMsg,
        authenticated: bool,
    ) -> ServerMessage {
        let table = if authenticated { &self.rpc } else { &self.unauth_rpc };

        let Some(handler) = table.get(&msg.proc_uri).map(|entry| entry.value().clone()) else {
            warn!(conn_id = %caller.id, proc_uri = %msg.proc_uri, "RPC call not registered");
            return ServerMessage::CallError {
                call_id: msg.call_id.clone(),
                error: RpcError::not_implemented(&msg.proc_uri),
            };
        };

        match handler(caller, &msg.proc_uri, &msg.args) {
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

    /// Runs the client publish pipeline.
    ///
    /// Drops silently (logged) when the publisher lacks publish rights on
    /// the topic or the application veto declines the event. The event is
    /// never echoed back to the publisher.
    pub(crate) async fn publish_from_client(&self, publisher: &SessionInfo, msg: PublishMsg) {
        let allowed = publisher
            .permissions
            .as_ref()
            .is_some_and(|p| p.can_publish(&msg.topic_uri));
        if !allowed {
            debug!(conn_id = %publisher.id, topic = %msg.topic_uri, "publish denied");
            return;
        }

        if !self.hooks.message_to_publish(publisher, &msg) {
            debug!(conn_id = %publisher.id, topic = %msg.topic_uri, "event vetoed by application");
            return;
        }

        self.deliver(&msg.topic_uri, msg.event, Some(publisher.id)).await;
    }

    /// Publishes a server-originated event on a topic.
    ///
    /// Bypasses the permission check, the application veto, and publisher
    /// self-suppression.
    pub async fn publish_event(&self, topic_uri: &str, event: Value) {
        self.deliver(topic_uri, event, None).await;
    }

    /// Serializes the EVENT frame once and fans it out to the topic's
    /// subscribers.
    ///
    /// Subscriber IDs without a live connection are pruned from the topic
    /// before this returns.
    async fn deliver(&self, topic_uri: &str, event: Value, skip: Option<ConnectionId>) {
        let frame = match (ServerMessage::Event {
            topic_uri: topic_uri.to_string(),
            event,
        })
        .encode()
        {
            Ok(frame) => frame,
            Err(e) => {
                error!(topic = %topic_uri, error = %e, "failed to encode event frame");
                return;
            }
        };

        for id in self.subscriptions.find(topic_uri) {
            if skip == Some(id) {
                continue;
            }
            match self.registry.get(id) {
                Some(session) => {
                    let sender = session.read().sender.clone();
                    if sender.send(frame.clone()).await.is_err() {
                        debug!(conn_id = %id, "send queue closed during fan-out");
                    }
                }
                None => {
                    // Subscriber's connection is gone; prune it.
                    self.subscriptions.remove(topic_uri, id);
                }
            }
        }
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("config", &self.config)
            .field("connections", &self.registry.count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Permissions, PubSubPermission};
    use crate::connection::SessionState;
    use crate::error::HookError;
    use crate::hooks::BrokerHooks;
    use parking_lot::RwLock;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct NoopHooks {
        veto: bool,
    }

    impl BrokerHooks for NoopHooks {
        fn auth_secret(&self, _auth_key: &str) -> Result<String, HookError> {
            Ok("secret".to_string())
        }

        fn auth_permissions(
            &self,
            _auth_key: &str,
            _auth_extra: Option<&Value>,
        ) -> Result<Permissions, HookError> {
            Ok(Permissions::default())
        }

        fn message_to_publish(&self, _publisher: &SessionInfo, _msg: &PublishMsg) -> bool {
            !self.veto
        }
    }

    fn test_broker() -> Broker {
        Broker::new(BrokerConfig::default(), Arc::new(NoopHooks { veto: false }))
    }

    fn attach_session(broker: &Broker) -> (Arc<RwLock<SessionState>>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(broker.config().send_backlog);
        let session = broker
            .registry
            .register(SessionState::new(ConnectionId::generate(), tx));
        (session, rx)
    }

    fn publisher_info(id: ConnectionId, topic: &str) -> SessionInfo {
        let mut permissions = Permissions::default();
        permissions.pubsub.insert(
            topic.to_string(),
            PubSubPermission {
                can_publish: true,
                can_subscribe: true,
            },
        );
        SessionInfo {
            id,
            username: Some("alice".to_string()),
            permissions: Some(permissions),
        }
    }

    #[test]
    fn test_register_reserved_uri_refused() {
        let broker = test_broker();
        let handler: RpcHandler = Arc::new(|_, _, _| Ok(Value::Null));

        let err = broker.register_rpc(URI_AUTHREQ, handler.clone()).unwrap_err();
        assert!(matches!(err, BrokerError::ReservedUri(_)));
        let err = broker.register_unauth_rpc(URI_AUTH, handler).unwrap_err();
        assert!(matches!(err, BrokerError::ReservedUri(_)));
    }

    #[test]
    fn test_dispatch_call_unknown_uri() {
        let broker = test_broker();
        let caller = publisher_info(ConnectionId::generate(), "news");
        let msg = CallMsg {
            call_id: "c1".to_string(),
            proc_uri: "app:missing".to_string(),
            args: Vec::new(),
        };

        let reply = broker.dispatch_call(&caller, &msg, true);
        let ServerMessage::CallError { call_id, error } = reply else {
            panic!("expected CALLERROR");
        };
        assert_eq!(call_id, "c1");
        assert_eq!(error.uri, "error:notimplemented");
    }

    #[test]
    fn test_dispatch_call_result_and_error() {
        let broker = test_broker();
        broker
            .register_rpc(
                "app:add",
                Arc::new(|_, _, args| {
                    let a = args[0].as_i64().unwrap_or(0);
                    let b = args[1].as_i64().unwrap_or(0);
                    Ok(json!(a + b))
                }),
            )
            .unwrap();
        broker
            .register_rpc(
                "app:fail",
                Arc::new(|_, _, _| Err(RpcError::new("app:error", "boom"))),
            )
            .unwrap();

        let caller = publisher_info(ConnectionId::generate(), "news");
        let msg = CallMsg {
            call_id: "c1".to_string(),
            proc_uri: "app:add".to_string(),
            args: vec![json!(2), json!(3)],
        };
        let reply = broker.dispatch_call(&caller, &msg, true);
        assert_eq!(
            reply,
            ServerMessage::CallResult {
                call_id: "c1".to_string(),
                result: json!(5),
            }
        );

        let msg = CallMsg {
            call_id: "c2".to_string(),
            proc_uri: "app:fail".to_string(),
            args: Vec::new(),
        };
        let ServerMessage::CallError { error, .. } = broker.dispatch_call(&caller, &msg, true)
        else {
            panic!("expected CALLERROR");
        };
        assert_eq!(error.uri, "app:error");
    }

    #[test]
    fn test_dispatch_tables_are_disjoint() {
        let broker = test_broker();
        broker
            .register_unauth_rpc("app:probe", Arc::new(|_, _, _| Ok(json!("pre-auth"))))
            .unwrap();

        let caller = publisher_info(ConnectionId::generate(), "news");
        let msg = CallMsg {
            call_id: "c1".to_string(),
            proc_uri: "app:probe".to_string(),
            args: Vec::new(),
        };

        // Registered only in the unauth table.
        assert!(matches!(
            broker.dispatch_call(&caller, &msg, false),
            ServerMessage::CallResult { .. }
        ));
        assert!(matches!(
            broker.dispatch_call(&caller, &msg, true),
            ServerMessage::CallError { .. }
        ));
    }

    #[test]
    fn test_unregister_rpc() {
        let broker = test_broker();
        broker
            .register_rpc("app:tmp", Arc::new(|_, _, _| Ok(Value::Null)))
            .unwrap();
        broker.unregister_rpc("app:tmp");
        broker.unregister_rpc("app:tmp");

        let caller = publisher_info(ConnectionId::generate(), "news");
        let msg = CallMsg {
            call_id: "c1".to_string(),
            proc_uri: "app:tmp".to_string(),
            args: Vec::new(),
        };
        assert!(matches!(
            broker.dispatch_call(&caller, &msg, true),
            ServerMessage::CallError { .. }
        ));
    }

    #[tokio::test]
    async fn test_publish_event_fan_out() {
        let broker = test_broker();
        let (session_a, mut rx_a) = attach_session(&broker);
        let (session_b, mut rx_b) = attach_session(&broker);
        broker.subscriptions.add("news", session_a.read().id);
        broker.subscriptions.add("news", session_b.read().id);

        broker.publish_event("news", json!("hello")).await;

        assert_eq!(rx_a.recv().await.unwrap(), r#"[8,"news","hello"]"#);
        assert_eq!(rx_b.recv().await.unwrap(), r#"[8,"news","hello"]"#);
    }

    #[tokio::test]
    async fn test_client_publish_suppresses_echo() {
        let broker = test_broker();
        let (publisher, mut rx_pub) = attach_session(&broker);
        let (subscriber, mut rx_sub) = attach_session(&broker);
        let publisher_id = publisher.read().id;
        broker.subscriptions.add("news", publisher_id);
        broker.subscriptions.add("news", subscriber.read().id);

        let info = publisher_info(publisher_id, "news");
        broker
            .publish_from_client(
                &info,
                PublishMsg {
                    topic_uri: "news".to_string(),
                    event: json!("hello"),
                    ..PublishMsg::default()
                },
            )
            .await;

        assert_eq!(rx_sub.recv().await.unwrap(), r#"[8,"news","hello"]"#);
        assert!(rx_pub.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_client_publish_denied_without_permission() {
        let broker = test_broker();
        let (publisher, _rx_pub) = attach_session(&broker);
        let (subscriber, mut rx_sub) = attach_session(&broker);
        let publisher_id = publisher.read().id;
        broker.subscriptions.add("news", subscriber.read().id);

        // Authenticated but with no grant on the topic.
        let info = SessionInfo {
            id: publisher_id,
            username: Some("alice".to_string()),
            permissions: Some(Permissions::default()),
        };
        broker
            .publish_from_client(
                &info,
                PublishMsg {
                    topic_uri: "news".to_string(),
                    event: json!("x"),
                    ..PublishMsg::default()
                },
            )
            .await;

        assert!(rx_sub.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_client_publish_vetoed() {
        let broker = Broker::new(BrokerConfig::default(), Arc::new(NoopHooks { veto: true }));
        let (publisher, _rx_pub) = attach_session(&broker);
        let (subscriber, mut rx_sub) = attach_session(&broker);
        let publisher_id = publisher.read().id;
        broker.subscriptions.add("news", subscriber.read().id);

        let info = publisher_info(publisher_id, "news");
        broker
            .publish_from_client(
                &info,
                PublishMsg {
                    topic_uri: "news".to_string(),
                    event: json!("x"),
                    ..PublishMsg::default()
                },
            )
            .await;

        assert!(rx_sub.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_prunes_dead_subscribers() {
        let broker = test_broker();
        let (live, mut rx_live) = attach_session(&broker);
        let live_id = live.read().id;
        let dead_id = ConnectionId::generate();
        broker.subscriptions.add("news", live_id);
        broker.subscriptions.add("news", dead_id);

        broker.publish_event("news", json!(1)).await;

        assert!(rx_live.recv().await.is_some());
        assert!(!broker.subscriptions.contains("news", dead_id));
        assert!(broker.subscriptions.contains("news", live_id));
    }

    #[tokio::test]
    async fn test_publish_blocks_on_full_queue_and_resumes() {
        let broker = test_broker();
        let (session, mut rx) = attach_session(&broker);
        let id = session.read().id;
        broker.subscriptions.add("news", id);

        // Fill the subscriber's queue to capacity.
        let sender = session.read().sender.clone();
        for i in 0..broker.config().send_backlog {
            sender.send(format!("frame-{i}")).await.unwrap();
        }

        let broker = Arc::new(broker);
        let publish = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.publish_event("news", json!("queued")).await })
        };

        // The publish cannot complete while the queue is full.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!publish.is_finished());

        // Draining one slot unblocks it.
        assert_eq!(rx.recv().await.unwrap(), "frame-0");
        publish.await.unwrap();

        for i in 1..broker.config().send_backlog {
            assert_eq!(rx.recv().await.unwrap(), format!("frame-{i}"));
        }
        assert_eq!(rx.recv().await.unwrap(), r#"[8,"news","queued"]"#);
    }

    #[tokio::test]
    async fn test_event_order_preserved_per_subscriber() {
        let broker = test_broker();
        let (session, mut rx) = attach_session(&broker);
        broker.subscriptions.add("news", session.read().id);

        for i in 0..5 {
            broker.publish_event("news", json!(i)).await;
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap(), format!(r#"[8,"news",{i}]"#));
        }
    }
}
