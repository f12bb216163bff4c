//! Broker transport contract.
//!
//! The connection manager only needs connect / subscribe / publish /
//! receive from a broker.  Wire security, authentication handshakes and the
//! concrete protocol live behind [`BrokerTransport`].

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use conchat_shared::constants::CLIENT_ID_PREFIX;
use conchat_shared::types::UserId;

/// Parameters of one broker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Broker endpoint, e.g. `ws://localhost:8083/mqtt`.
    pub broker_url: String,
    /// Stable per-identity client id, so a reconnect resumes the broker-side
    /// session instead of opening a second one.
    pub client_id: String,
    /// `false` asks the broker to keep subscriptions and queue undelivered
    /// events while the client is away.
    pub clean_session: bool,
    pub keep_alive: Duration,
}

impl SessionOptions {
    /// Persistent session options for `user`.
    pub fn for_identity(user: &UserId, broker_url: impl Into<String>, keep_alive: Duration) -> Self {
        Self {
            broker_url: broker_url.into(),
            client_id: format!("{CLIENT_ID_PREFIX}{user}"),
            clean_session: false,
            keep_alive,
        }
    }
}

/// Something the broker pushed to us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// An application message on a subscribed topic.
    Message { topic: String, payload: Vec<u8> },
    /// The broker acknowledged the publish with this packet id.
    PublishAck { packet_id: u64 },
    /// The broker refused the publish with this packet id.
    PublishRejected { packet_id: u64, reason: String },
    /// The broker closed the session.
    Closed,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection refused: {0}")]
    ConnectRefused(String),

    #[error("Not authorized")]
    NotAuthorized,

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Publish rejected: {0}")]
    PublishRejected(String),

    #[error("Subscribe to {topic} rejected: {reason}")]
    SubscribeRejected { topic: String, reason: String },

    #[error("Not connected")]
    NotConnected,
}

/// A broker session driven by the connection manager.
///
/// Implementations are owned by a single task; methods are never called
/// concurrently.
#[async_trait]
pub trait BrokerTransport: Send + 'static {
    /// Open a session.  Resolves once the broker accepted it.
    async fn connect(&mut self, options: &SessionOptions) -> Result<(), TransportError>;

    /// Subscribe with at-least-once delivery.
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Hand a message to the broker.  Completion is reported later through
    /// [`TransportEvent::PublishAck`] or [`TransportEvent::PublishRejected`]
    /// carrying the same `packet_id`.
    async fn publish(
        &mut self,
        packet_id: u64,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;

    /// Next event from the broker.  An `Err` means the session is gone.
    ///
    /// Must be cancel-safe: it is raced against other work in `select!`.
    async fn next_event(&mut self) -> Result<TransportEvent, TransportError>;

    /// Close the session.  Idempotent.
    async fn disconnect(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_is_stable_per_identity() {
        let user = UserId::new();
        let a = SessionOptions::for_identity(&user, "ws://broker", Duration::from_secs(60));
        let b = SessionOptions::for_identity(&user, "ws://other", Duration::from_secs(5));

        assert_eq!(a.client_id, b.client_id);
        assert_eq!(a.client_id, format!("web_{user}"));
        assert!(!a.clean_session);
    }
}
