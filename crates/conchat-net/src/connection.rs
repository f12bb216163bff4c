//! Broker connection manager.
//!
//! One dedicated tokio task owns the [`BrokerTransport`] and the session
//! state.  The rest of the client talks to it through a typed command
//! channel ([`ConnectionHandle`]) and reads [`ConnectionNotification`]s back.
//!
//! State machine:
//!
//! ```text
//! disconnected --connect--> connecting --accepted--> connected
//!      ^                        |                        |
//!      |                     refused                   lost
//!      |                        v                        v
//!      +------disconnect------ offline <-----------------+
//!                               |  ^
//!                        backoff elapsed (fixed delay)
//!                               v  |
//!                            connecting
//! ```

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use conchat_shared::constants::DEFAULT_RECONNECT_MS;
use conchat_shared::types::{ConnectionStatus, Topic};

use crate::subscriptions::SubscriptionSet;
use crate::transport::{BrokerTransport, SessionOptions, TransportError, TransportEvent};

// ---------------------------------------------------------------------------
// Command / notification types
// ---------------------------------------------------------------------------

/// Commands sent *into* the connection task.
#[derive(Debug)]
pub enum ConnectionCommand {
    /// Open a session (no-op when already connecting or connected).
    Connect,
    /// Replace the desired topic set.
    SetTopics(BTreeSet<Topic>),
    /// Publish `payload` on `topic`.  `id` is echoed back in the
    /// acknowledgement or failure notification.
    Publish {
        id: Uuid,
        topic: Topic,
        payload: Vec<u8>,
    },
    /// Close the session and forget the local topic sets.  The broker keeps
    /// the persistent session's subscriptions.
    Disconnect,
    /// Snapshot of the current status.
    GetStatus(oneshot::Sender<ConnectionStatus>),
    /// Stop the task.
    Shutdown,
}

/// Notifications sent *from* the connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionNotification {
    StatusChanged(ConnectionStatus),
    MessageReceived {
        topic: String,
        payload: Vec<u8>,
    },
    PublishAcked {
        id: Uuid,
    },
    PublishFailed {
        id: Uuid,
        error: TransportError,
    },
    SubscribeFailed {
        topic: Topic,
        error: TransportError,
    },
    /// The broker refused our credentials.  No retry is scheduled.
    AuthRejected,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub options: SessionOptions,
    /// Fixed delay between a connection loss and the next attempt.
    pub reconnect_backoff: Duration,
    pub command_buffer: usize,
}

impl ConnectionConfig {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            options,
            reconnect_backoff: Duration::from_millis(DEFAULT_RECONNECT_MS),
            command_buffer: 256,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Connection task is gone")]
    ChannelClosed,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cheap, cloneable front for the connection task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::Sender<ConnectionCommand>,
}

impl ConnectionHandle {
    async fn send(&self, cmd: ConnectionCommand) -> Result<(), ConnectionError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| ConnectionError::ChannelClosed)
    }

    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.send(ConnectionCommand::Connect).await
    }

    pub async fn set_topics(&self, topics: BTreeSet<Topic>) -> Result<(), ConnectionError> {
        self.send(ConnectionCommand::SetTopics(topics)).await
    }

    pub async fn publish(
        &self,
        id: Uuid,
        topic: Topic,
        payload: Vec<u8>,
    ) -> Result<(), ConnectionError> {
        self.send(ConnectionCommand::Publish { id, topic, payload })
            .await
    }

    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.send(ConnectionCommand::Disconnect).await
    }

    pub async fn status(&self) -> Result<ConnectionStatus, ConnectionError> {
        let (tx, rx) = oneshot::channel();
        self.send(ConnectionCommand::GetStatus(tx)).await?;
        rx.await.map_err(|_| ConnectionError::ChannelClosed)
    }

    pub async fn shutdown(&self) -> Result<(), ConnectionError> {
        self.send(ConnectionCommand::Shutdown).await
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Spawn the connection manager in a background tokio task.
///
/// The task starts `disconnected`; call [`ConnectionHandle::connect`] to
/// open the session.  Notifications are unbounded: the consumer also feeds
/// this task's command queue, and a bounded pair could deadlock.
pub fn spawn_connection<T: BrokerTransport>(
    transport: T,
    config: ConnectionConfig,
) -> (
    ConnectionHandle,
    mpsc::UnboundedReceiver<ConnectionNotification>,
) {
    let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer.max(1));
    let (notif_tx, notif_rx) = mpsc::unbounded_channel();

    let actor = ConnectionActor {
        transport,
        config,
        status: ConnectionStatus::Disconnected,
        subscriptions: SubscriptionSet::new(),
        pending: HashMap::new(),
        next_packet_id: 1,
        retry_at: None,
        attempts: 0,
        notif_tx,
    };
    tokio::spawn(actor.run(cmd_rx));

    (ConnectionHandle { cmd_tx }, notif_rx)
}

struct ConnectionActor<T> {
    transport: T,
    config: ConnectionConfig,
    status: ConnectionStatus,
    subscriptions: SubscriptionSet,
    /// packet id -> caller's publish id, for publishes awaiting a broker ack.
    pending: HashMap<u64, Uuid>,
    next_packet_id: u64,
    retry_at: Option<Instant>,
    attempts: u32,
    notif_tx: mpsc::UnboundedSender<ConnectionNotification>,
}

impl<T: BrokerTransport> ConnectionActor<T> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ConnectionCommand>) {
        info!(client_id = %self.config.options.client_id, "Connection task started");

        loop {
            let polling = self.status == ConnectionStatus::Connected;
            let retry_at = self.retry_at;

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ConnectionCommand::Shutdown) => {
                            info!("Connection shutdown requested");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            info!("Command channel closed, shutting down connection");
                            break;
                        }
                    }
                }

                event = self.transport.next_event(), if polling => {
                    self.handle_transport_event(event).await;
                }

                _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.retry_at = None;
                    info!(attempt = self.attempts, "Reconnecting to broker");
                    self.open_session().await;
                }
            }
        }

        if self.status != ConnectionStatus::Disconnected {
            self.transport.disconnect().await;
        }
        info!("Connection event loop terminated");
    }

    async fn handle_command(&mut self, cmd: ConnectionCommand) {
        match cmd {
            ConnectionCommand::Connect => match self.status {
                ConnectionStatus::Disconnected | ConnectionStatus::Offline => {
                    self.retry_at = None;
                    self.open_session().await;
                }
                ConnectionStatus::Connecting | ConnectionStatus::Connected => {
                    debug!(status = %self.status, "Connect ignored");
                }
            },

            ConnectionCommand::SetTopics(topics) => {
                let diff = self.subscriptions.replace_desired(topics);
                if self.status != ConnectionStatus::Connected {
                    return;
                }
                for topic in diff.removed {
                    self.unsubscribe(topic).await;
                }
                for topic in diff.added {
                    if !self.subscribe(topic).await {
                        break;
                    }
                }
            }

            ConnectionCommand::Publish { id, topic, payload } => {
                self.publish(id, topic, payload).await;
            }

            // Broker-side subscriptions stay in place so the persistent
            // session keeps queueing until the next login.
            ConnectionCommand::Disconnect => {
                if self.status != ConnectionStatus::Disconnected {
                    self.transport.disconnect().await;
                }
                if !self.pending.is_empty() {
                    debug!(count = self.pending.len(), "Dropping in-flight publishes");
                }
                self.pending.clear();
                self.subscriptions.clear();
                self.retry_at = None;
                self.attempts = 0;
                self.set_status(ConnectionStatus::Disconnected);
            }

            ConnectionCommand::GetStatus(reply) => {
                let _ = reply.send(self.status);
            }

            // Handled by the event loop.
            ConnectionCommand::Shutdown => {}
        }
    }

    async fn handle_transport_event(&mut self, event: Result<TransportEvent, TransportError>) {
        match event {
            Ok(TransportEvent::Message { topic, payload }) => {
                debug!(topic = %topic, len = payload.len(), "Broker message received");
                self.notify(ConnectionNotification::MessageReceived { topic, payload });
            }

            Ok(TransportEvent::PublishAck { packet_id }) => match self.pending.remove(&packet_id) {
                Some(id) => {
                    debug!(packet_id, id = %id, "Publish acknowledged");
                    self.notify(ConnectionNotification::PublishAcked { id });
                }
                None => debug!(packet_id, "Ack for unknown packet"),
            },

            Ok(TransportEvent::PublishRejected { packet_id, reason }) => {
                if let Some(id) = self.pending.remove(&packet_id) {
                    warn!(packet_id, id = %id, reason = %reason, "Publish rejected by broker");
                    self.notify(ConnectionNotification::PublishFailed {
                        id,
                        error: TransportError::PublishRejected(reason),
                    });
                }
            }

            Ok(TransportEvent::Closed) => {
                self.go_offline(TransportError::ConnectionLost("closed by broker".into()));
            }

            Err(e) => self.go_offline(e),
        }
    }

    async fn open_session(&mut self) {
        self.set_status(ConnectionStatus::Connecting);

        match self.transport.connect(&self.config.options).await {
            Ok(()) => {
                info!(
                    client_id = %self.config.options.client_id,
                    broker = %self.config.options.broker_url,
                    "Connected to broker"
                );
                self.attempts = 0;

                for topic in self.subscriptions.pending() {
                    if !self.subscribe(topic).await {
                        return;
                    }
                }
                self.set_status(ConnectionStatus::Connected);
            }
            Err(TransportError::NotAuthorized) => {
                warn!("Broker rejected credentials");
                self.set_status(ConnectionStatus::Disconnected);
                self.notify(ConnectionNotification::AuthRejected);
            }
            Err(e) => {
                warn!(error = %e, "Broker connection attempt failed");
                self.go_offline(e);
            }
        }
    }

    /// Returns `false` when the session died underneath us.
    async fn subscribe(&mut self, topic: Topic) -> bool {
        match self.transport.subscribe(&topic.to_string()).await {
            Ok(()) => {
                debug!(topic = %topic, "Subscribed");
                self.subscriptions.on_subscribed(topic);
                true
            }
            Err(e @ TransportError::ConnectionLost(_)) => {
                self.go_offline(e);
                false
            }
            Err(error) => {
                warn!(topic = %topic, error = %error, "Subscribe failed");
                self.notify(ConnectionNotification::SubscribeFailed { topic, error });
                true
            }
        }
    }

    async fn unsubscribe(&mut self, topic: Topic) {
        if let Err(e) = self.transport.unsubscribe(&topic.to_string()).await {
            warn!(topic = %topic, error = %e, "Unsubscribe failed");
        }
        self.subscriptions.on_unsubscribed(&topic);
    }

    async fn publish(&mut self, id: Uuid, topic: Topic, payload: Vec<u8>) {
        if self.status != ConnectionStatus::Connected {
            debug!(id = %id, status = %self.status, "Publish while not connected");
            self.notify(ConnectionNotification::PublishFailed {
                id,
                error: TransportError::NotConnected,
            });
            return;
        }

        let packet_id = self.next_packet_id;
        self.next_packet_id += 1;
        self.pending.insert(packet_id, id);

        debug!(topic = %topic, packet_id, len = payload.len(), "Publishing");
        if let Err(e) = self
            .transport
            .publish(packet_id, &topic.to_string(), payload)
            .await
        {
            self.pending.remove(&packet_id);
            warn!(id = %id, error = %e, "Publish failed");
            self.notify(ConnectionNotification::PublishFailed {
                id,
                error: e.clone(),
            });
            if matches!(e, TransportError::ConnectionLost(_)) {
                self.go_offline(e);
            }
        }
    }

    /// Fail everything in flight and schedule the next attempt.
    fn go_offline(&mut self, reason: TransportError) {
        warn!(error = %reason, backoff = ?self.config.reconnect_backoff, "Broker connection lost");

        for (_, id) in self.pending.drain() {
            self.notif_tx
                .send(ConnectionNotification::PublishFailed {
                    id,
                    error: reason.clone(),
                })
                .ok();
        }

        self.subscriptions.clear_active();
        self.attempts += 1;
        self.retry_at = Some(Instant::now() + self.config.reconnect_backoff);
        self.set_status(ConnectionStatus::Offline);
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status == status {
            return;
        }
        debug!(from = %self.status, to = %status, "Connection status changed");
        self.status = status;
        self.notify(ConnectionNotification::StatusChanged(status));
    }

    fn notify(&self, notification: ConnectionNotification) {
        if self.notif_tx.send(notification).is_err() {
            debug!("Notification receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use conchat_shared::types::UserId;

    const WAIT: Duration = Duration::from_secs(2);

    fn config(user: &UserId) -> ConnectionConfig {
        let options = SessionOptions::for_identity(user, "memory://", Duration::from_secs(60));
        ConnectionConfig::new(options).with_backoff(Duration::from_millis(20))
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ConnectionNotification>) -> ConnectionNotification {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("notification timed out")
            .expect("channel closed")
    }

    async fn wait_for_status(
        rx: &mut mpsc::UnboundedReceiver<ConnectionNotification>,
        wanted: ConnectionStatus,
    ) {
        loop {
            if let ConnectionNotification::StatusChanged(s) = next(rx).await {
                if s == wanted {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_connect_subscribe_and_receive() {
        let broker = MemoryBroker::new();
        let me = UserId::new();
        let (handle, mut rx) = spawn_connection(broker.transport(), config(&me));

        handle
            .set_topics([Topic::Direct(me)].into_iter().collect())
            .await
            .unwrap();
        handle.connect().await.unwrap();

        assert_eq!(next(&mut rx).await, ConnectionNotification::StatusChanged(ConnectionStatus::Connecting));
        assert_eq!(next(&mut rx).await, ConnectionNotification::StatusChanged(ConnectionStatus::Connected));
        assert_eq!(handle.status().await.unwrap(), ConnectionStatus::Connected);

        broker.inject(&format!("/dms/{me}"), b"hello".to_vec());
        match next(&mut rx).await {
            ConnectionNotification::MessageReceived { topic, payload } => {
                assert_eq!(topic, format!("/dms/{me}"));
                assert_eq!(payload, b"hello");
            }
            other => panic!("unexpected {other:?}"),
        }

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_is_acked() {
        let broker = MemoryBroker::new();
        let me = UserId::new();
        let (handle, mut rx) = spawn_connection(broker.transport(), config(&me));
        handle.connect().await.unwrap();
        wait_for_status(&mut rx, ConnectionStatus::Connected).await;

        let id = Uuid::new_v4();
        handle
            .publish(id, Topic::Direct(UserId::new()), b"x".to_vec())
            .await
            .unwrap();
        assert_eq!(next(&mut rx).await, ConnectionNotification::PublishAcked { id });
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_fails() {
        let broker = MemoryBroker::new();
        let me = UserId::new();
        let (handle, mut rx) = spawn_connection(broker.transport(), config(&me));

        let id = Uuid::new_v4();
        handle
            .publish(id, Topic::Direct(me), b"x".to_vec())
            .await
            .unwrap();
        assert_eq!(
            next(&mut rx).await,
            ConnectionNotification::PublishFailed {
                id,
                error: TransportError::NotConnected
            }
        );
    }

    #[tokio::test]
    async fn test_rejected_publish_reports_failure() {
        let broker = MemoryBroker::new();
        let me = UserId::new();
        let (handle, mut rx) = spawn_connection(broker.transport(), config(&me));
        handle.connect().await.unwrap();
        wait_for_status(&mut rx, ConnectionStatus::Connected).await;

        broker.set_reject_publishes(true);
        let id = Uuid::new_v4();
        handle
            .publish(id, Topic::Direct(me), b"x".to_vec())
            .await
            .unwrap();
        match next(&mut rx).await {
            ConnectionNotification::PublishFailed { id: got, error } => {
                assert_eq!(got, id);
                assert!(matches!(error, TransportError::PublishRejected(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reconnects_and_resubscribes_after_loss() {
        let broker = MemoryBroker::new();
        let me = UserId::new();
        let cfg = config(&me);
        let client_id = cfg.options.client_id.clone();
        let (handle, mut rx) = spawn_connection(broker.transport(), cfg);

        handle
            .set_topics([Topic::Direct(me), Topic::User(me)].into_iter().collect())
            .await
            .unwrap();
        handle.connect().await.unwrap();
        wait_for_status(&mut rx, ConnectionStatus::Connected).await;

        assert!(broker.drop_connection(&client_id));
        wait_for_status(&mut rx, ConnectionStatus::Offline).await;
        wait_for_status(&mut rx, ConnectionStatus::Connected).await;

        let mut subs = broker.subscriptions(&client_id);
        subs.sort();
        let mut expected = vec![format!("/dms/{me}"), format!("/users/{me}")];
        expected.sort();
        assert_eq!(subs, expected);
    }

    #[tokio::test]
    async fn test_auth_rejection_does_not_retry() {
        let broker = MemoryBroker::new();
        let me = UserId::new();
        let cfg = config(&me);
        broker.deny_client(&cfg.options.client_id);
        let (handle, mut rx) = spawn_connection(broker.transport(), cfg);

        handle.connect().await.unwrap();
        assert_eq!(next(&mut rx).await, ConnectionNotification::StatusChanged(ConnectionStatus::Connecting));
        assert_eq!(next(&mut rx).await, ConnectionNotification::StatusChanged(ConnectionStatus::Disconnected));
        assert_eq!(next(&mut rx).await, ConnectionNotification::AuthRejected);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(handle.status().await.unwrap(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_keeps_broker_session() {
        let broker = MemoryBroker::new();
        let me = UserId::new();
        let cfg = config(&me);
        let client_id = cfg.options.client_id.clone();
        let (handle, mut rx) = spawn_connection(broker.transport(), cfg.clone());

        handle
            .set_topics([Topic::Direct(me)].into_iter().collect())
            .await
            .unwrap();
        handle.connect().await.unwrap();
        wait_for_status(&mut rx, ConnectionStatus::Connected).await;

        handle.disconnect().await.unwrap();
        wait_for_status(&mut rx, ConnectionStatus::Disconnected).await;
        assert!(!broker.is_connected(&client_id));
        assert_eq!(broker.subscriptions(&client_id), vec![format!("/dms/{me}")]);

        assert_eq!(broker.inject(&format!("/dms/{me}"), b"later".to_vec()), 0);
        assert_eq!(broker.backlog_len(&client_id), 1);
        handle.shutdown().await.unwrap();

        let (handle, mut rx) = spawn_connection(broker.transport(), cfg);
        handle
            .set_topics([Topic::Direct(me)].into_iter().collect())
            .await
            .unwrap();
        handle.connect().await.unwrap();
        wait_for_status(&mut rx, ConnectionStatus::Connected).await;
        assert_eq!(
            next(&mut rx).await,
            ConnectionNotification::MessageReceived {
                topic: format!("/dms/{me}"),
                payload: b"later".to_vec(),
            }
        );
    }

    #[tokio::test]
    async fn test_connection_loss_fails_unacked_publishes() {
        let (transport, control) = SilentTransport::new();
        let me = UserId::new();
        let (handle, mut rx) = spawn_connection(transport, config(&me));
        handle.connect().await.unwrap();
        wait_for_status(&mut rx, ConnectionStatus::Connected).await;

        let id = Uuid::new_v4();
        handle
            .publish(id, Topic::Direct(UserId::new()), b"x".to_vec())
            .await
            .unwrap();
        control
            .send(Err(TransportError::ConnectionLost("link down".into())))
            .unwrap();

        assert_eq!(
            next(&mut rx).await,
            ConnectionNotification::PublishFailed {
                id,
                error: TransportError::ConnectionLost("link down".into()),
            }
        );
        assert_eq!(
            next(&mut rx).await,
            ConnectionNotification::StatusChanged(ConnectionStatus::Offline)
        );
        handle.shutdown().await.unwrap();
    }

    /// Accepts everything and never acks; events come from the test.
    struct SilentTransport {
        events: mpsc::UnboundedReceiver<Result<TransportEvent, TransportError>>,
    }

    impl SilentTransport {
        fn new() -> (
            Self,
            mpsc::UnboundedSender<Result<TransportEvent, TransportError>>,
        ) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Self { events: rx }, tx)
        }
    }

    #[async_trait::async_trait]
    impl BrokerTransport for SilentTransport {
        async fn connect(&mut self, _options: &SessionOptions) -> Result<(), TransportError> {
            Ok(())
        }

        async fn subscribe(&mut self, _topic: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn unsubscribe(&mut self, _topic: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn publish(
            &mut self,
            _packet_id: u64,
            _topic: &str,
            _payload: Vec<u8>,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn next_event(&mut self) -> Result<TransportEvent, TransportError> {
            match self.events.recv().await {
                Some(event) => event,
                None => std::future::pending().await,
            }
        }

        async fn disconnect(&mut self) {}
    }
}
