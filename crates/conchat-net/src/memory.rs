//! In-process broker.
//!
//! Behaves like the production broker as far as the client can observe:
//! persistent sessions keyed by client id, subscriptions that survive a
//! reconnect, queued delivery for offline persistent sessions, publish
//! acknowledgements and self-echo of published messages.  Used by tests and
//! local demos; fault injection helpers simulate drops and refusals.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::{BrokerTransport, SessionOptions, TransportError, TransportEvent};

type Outbox = mpsc::UnboundedSender<Result<TransportEvent, TransportError>>;
type Inbox = mpsc::UnboundedReceiver<Result<TransportEvent, TransportError>>;

#[derive(Default)]
struct ClientSession {
    subscriptions: HashSet<String>,
    outbox: Option<Outbox>,
    /// Messages queued while a persistent session had no live connection.
    backlog: VecDeque<TransportEvent>,
    persistent: bool,
}

#[derive(Default)]
struct BrokerState {
    sessions: HashMap<String, ClientSession>,
    denied: HashSet<String>,
    refuse_connections: bool,
    reject_publishes: bool,
}

impl BrokerState {
    fn fan_out(&mut self, topic: &str, payload: &[u8]) -> usize {
        let mut delivered = 0;
        for session in self.sessions.values_mut() {
            if !session.subscriptions.contains(topic) {
                continue;
            }
            let event = TransportEvent::Message {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            };
            match &session.outbox {
                Some(tx) => {
                    if tx.send(Ok(event)).is_ok() {
                        delivered += 1;
                    }
                }
                None if session.persistent => session.backlog.push_back(event),
                None => {}
            }
        }
        delivered
    }
}

/// Shared in-memory broker.  Clone freely; all clones see the same state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A fresh client transport attached to this broker.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            client_id: None,
            inbox: None,
        }
    }

    /// Publish from outside any client session (backend-originated events).
    pub fn inject(&self, topic: &str, payload: Vec<u8>) -> usize {
        self.lock().fan_out(topic, &payload)
    }

    /// Sever the live connection of `client_id` as if the network dropped.
    /// The broker-side session is kept.
    pub fn drop_connection(&self, client_id: &str) -> bool {
        let mut state = self.lock();
        let Some(session) = state.sessions.get_mut(client_id) else {
            return false;
        };
        match session.outbox.take() {
            Some(tx) => {
                let _ = tx.send(Err(TransportError::ConnectionLost(
                    "connection reset".into(),
                )));
                debug!(client_id, "Dropped client connection");
                true
            }
            None => false,
        }
    }

    /// Refuse future connects of `client_id` as unauthorized.
    pub fn deny_client(&self, client_id: &str) {
        self.lock().denied.insert(client_id.to_string());
    }

    pub fn allow_client(&self, client_id: &str) {
        self.lock().denied.remove(client_id);
    }

    /// Refuse every connect as if the broker were unreachable.
    pub fn set_refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Answer every publish with a rejection instead of an ack.
    pub fn set_reject_publishes(&self, reject: bool) {
        self.lock().reject_publishes = reject;
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.lock()
            .sessions
            .get(client_id)
            .is_some_and(|s| s.outbox.is_some())
    }

    pub fn subscriptions(&self, client_id: &str) -> Vec<String> {
        self.lock()
            .sessions
            .get(client_id)
            .map(|s| s.subscriptions.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of messages queued for an offline persistent session.
    pub fn backlog_len(&self, client_id: &str) -> usize {
        self.lock()
            .sessions
            .get(client_id)
            .map_or(0, |s| s.backlog.len())
    }
}

/// One client's view of a [`MemoryBroker`].
pub struct MemoryTransport {
    broker: MemoryBroker,
    client_id: Option<String>,
    inbox: Option<Inbox>,
}

impl MemoryTransport {
    fn connected_id(&self) -> Result<&str, TransportError> {
        match (&self.client_id, &self.inbox) {
            (Some(id), Some(_)) => Ok(id.as_str()),
            _ => Err(TransportError::NotConnected),
        }
    }
}

#[async_trait]
impl BrokerTransport for MemoryTransport {
    async fn connect(&mut self, options: &SessionOptions) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        if state.refuse_connections {
            return Err(TransportError::ConnectRefused("broker unreachable".into()));
        }
        if state.denied.contains(&options.client_id) {
            return Err(TransportError::NotAuthorized);
        }

        let session = state.sessions.entry(options.client_id.clone()).or_default();
        if options.clean_session {
            session.subscriptions.clear();
            session.backlog.clear();
        }
        session.persistent = !options.clean_session;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(previous) = session.outbox.take() {
            let _ = previous.send(Err(TransportError::ConnectionLost(
                "session taken over".into(),
            )));
        }
        let queued = session.backlog.len();
        for event in session.backlog.drain(..) {
            let _ = tx.send(Ok(event));
        }
        session.outbox = Some(tx);
        drop(state);

        debug!(client_id = %options.client_id, queued, "Memory session opened");
        self.client_id = Some(options.client_id.clone());
        self.inbox = Some(rx);
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let client_id = self.connected_id()?.to_string();
        let mut state = self.broker.lock();
        let session = state
            .sessions
            .get_mut(&client_id)
            .ok_or(TransportError::NotConnected)?;
        session.subscriptions.insert(topic.to_string());
        Ok(())
    }

    async fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        let client_id = self.connected_id()?.to_string();
        if let Some(session) = self.broker.lock().sessions.get_mut(&client_id) {
            session.subscriptions.remove(topic);
        }
        Ok(())
    }

    async fn publish(
        &mut self,
        packet_id: u64,
        topic: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let client_id = self.connected_id()?.to_string();
        let mut state = self.broker.lock();

        let Some(own) = state.sessions.get(&client_id).and_then(|s| s.outbox.clone()) else {
            return Err(TransportError::ConnectionLost("session closed".into()));
        };

        if state.reject_publishes {
            let _ = own.send(Ok(TransportEvent::PublishRejected {
                packet_id,
                reason: "not permitted".into(),
            }));
            return Ok(());
        }

        // The ack reaches the publisher before its own echo.
        let _ = own.send(Ok(TransportEvent::PublishAck { packet_id }));
        state.fan_out(topic, &payload);
        Ok(())
    }

    async fn next_event(&mut self) -> Result<TransportEvent, TransportError> {
        match self.inbox.as_mut() {
            Some(rx) => match rx.recv().await {
                Some(event) => event,
                None => {
                    self.inbox = None;
                    Err(TransportError::ConnectionLost("broker closed the stream".into()))
                }
            },
            None => std::future::pending().await,
        }
    }

    async fn disconnect(&mut self) {
        self.inbox = None;
        let Some(client_id) = self.client_id.take() else {
            return;
        };
        let mut state = self.broker.lock();
        let remove = match state.sessions.get_mut(&client_id) {
            Some(session) => {
                session.outbox = None;
                !session.persistent
            }
            None => false,
        };
        if remove {
            state.sessions.remove(&client_id);
        }
        debug!(client_id = %client_id, "Memory session closed");
    }
}
