//! Signed-in session.
//!
//! [`Session::start`] spawns the connection manager plus one session task.
//! The session task is the only owner of the [`SyncEngine`] and the
//! [`SocialReducer`]; UI intents, inbound broker events and publish outcomes
//! are all processed there, one at a time, on a single `select!` loop.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use conchat_net::messages::try_decode_notification;
use conchat_net::{spawn_connection, BrokerTransport, ConnectionHandle, ConnectionNotification};
use conchat_shared::protocol::{Event, FriendAction};
use conchat_shared::types::{ConversationRef, GroupId, MessageId, Topic, UserId};
use conchat_store::Database;

use crate::config::ClientConfig;
use crate::engine::SyncEngine;
use crate::error::{DirectoryError, SendError, SessionError};
use crate::events::{emit_event, ClientEvent};
use crate::social::{SocialDirectory, SocialOutcome, SocialReducer};

/// Requests sent *into* the session task.
#[derive(Debug)]
pub enum SessionIntent {
    SendMessage {
        conversation: ConversationRef,
        content: String,
        reply: oneshot::Sender<Result<MessageId, SendError>>,
    },
    OpenConversation(ConversationRef),
    CloseConversation,
    JoinGroup(GroupId),
    RespondToFriendRequest {
        requester: UserId,
        action: FriendAction,
        reply: oneshot::Sender<Result<(), DirectoryError>>,
    },
    Logout(oneshot::Sender<()>),
}

/// Cloneable front for a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    identity: UserId,
    intent_tx: mpsc::Sender<SessionIntent>,
}

impl SessionHandle {
    pub fn identity(&self) -> UserId {
        self.identity
    }

    async fn send(&self, intent: SessionIntent) -> Result<(), SessionError> {
        self.intent_tx
            .send(intent)
            .await
            .map_err(|_| SessionError::Closed)
    }

    /// Store the message locally and start publishing it.  Resolves once the
    /// optimistic entry is written, not when the broker acknowledges.
    pub async fn send_message(
        &self,
        conversation: ConversationRef,
        content: impl Into<String>,
    ) -> Result<MessageId, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionIntent::SendMessage {
            conversation,
            content: content.into(),
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| SessionError::Closed)??)
    }

    pub async fn open_conversation(&self, conversation: ConversationRef) -> Result<(), SessionError> {
        self.send(SessionIntent::OpenConversation(conversation)).await
    }

    pub async fn close_conversation(&self) -> Result<(), SessionError> {
        self.send(SessionIntent::CloseConversation).await
    }

    pub async fn join_group(&self, group: GroupId) -> Result<(), SessionError> {
        self.send(SessionIntent::JoinGroup(group)).await
    }

    pub async fn respond_to_friend_request(
        &self,
        requester: UserId,
        action: FriendAction,
    ) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionIntent::RespondToFriendRequest {
            requester,
            action,
            reply,
        })
        .await?;
        Ok(rx.await.map_err(|_| SessionError::Closed)??)
    }

    /// Disconnect from the broker and stop the session.  Publishes still in
    /// flight are dropped without a status change.  The broker keeps the
    /// identity's subscriptions, so messages sent in the meantime arrive at
    /// the next login.
    pub async fn logout(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionIntent::Logout(reply)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}

pub struct Session;

impl Session {
    /// Bring up a session for `identity` and return its handle plus the
    /// stream of UI events.
    pub async fn start<T, D>(
        config: &ClientConfig,
        identity: UserId,
        db: Database,
        transport: T,
        directory: D,
    ) -> anyhow::Result<(SessionHandle, mpsc::UnboundedReceiver<ClientEvent>)>
    where
        T: BrokerTransport,
        D: SocialDirectory,
    {
        let engine = SyncEngine::new(db, identity)
            .map_err(|e| anyhow::anyhow!("Failed to load conversations: {e}"))?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (connection, notif_rx) =
            spawn_connection(transport, config.connection_config(&identity));

        connection.set_topics(engine.topics()).await?;
        connection.connect().await?;

        let mut social = SocialReducer::new();
        match directory.pending_friend_requests().await {
            Ok(pending) => social.seed(pending),
            Err(e) => warn!(error = %e, "Could not fetch pending friend requests"),
        }

        emit_event(
            &event_tx,
            ClientEvent::ConversationsChanged {
                conversations: engine.conversations().to_vec(),
            },
        );
        emit_event(
            &event_tx,
            ClientEvent::FriendRequestsChanged {
                pending: social.pending().to_vec(),
                badge: social.badge(),
            },
        );

        let (intent_tx, intent_rx) = mpsc::channel(64);
        let task = SessionTask {
            engine,
            social,
            connection,
            directory: Arc::new(directory),
            event_tx,
        };
        tokio::spawn(task.run(intent_rx, notif_rx));

        info!(
            user = %identity,
            broker = %config.broker_url,
            api = %config.api_base_url,
            "Session started"
        );

        Ok((
            SessionHandle {
                identity,
                intent_tx,
            },
            event_rx,
        ))
    }
}

struct SessionTask<D> {
    engine: SyncEngine,
    social: SocialReducer,
    connection: ConnectionHandle,
    directory: Arc<D>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
}

impl<D: SocialDirectory> SessionTask<D> {
    async fn run(
        mut self,
        mut intent_rx: mpsc::Receiver<SessionIntent>,
        mut notif_rx: mpsc::UnboundedReceiver<ConnectionNotification>,
    ) {
        loop {
            tokio::select! {
                intent = intent_rx.recv() => {
                    match intent {
                        Some(SessionIntent::Logout(reply)) => {
                            self.logout().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(intent) => self.handle_intent(intent).await,
                        None => {
                            info!("All session handles dropped, logging out");
                            self.logout().await;
                            break;
                        }
                    }
                }

                notification = notif_rx.recv() => {
                    match notification {
                        Some(n) => self.handle_notification(n).await,
                        None => {
                            warn!("Connection task ended");
                            break;
                        }
                    }
                }
            }
        }

        info!("Session task terminated");
    }

    fn emit_all(&self, events: Vec<ClientEvent>) {
        for event in events {
            emit_event(&self.event_tx, event);
        }
    }

    async fn sync_topics(&mut self) {
        if self
            .connection
            .set_topics(self.engine.topics())
            .await
            .is_err()
        {
            warn!("Connection task gone, topics not updated");
        }
    }

    async fn handle_intent(&mut self, intent: SessionIntent) {
        match intent {
            SessionIntent::SendMessage {
                conversation,
                content,
                reply,
            } => {
                let result = self.send_message(conversation, &content).await;
                let _ = reply.send(result);
            }

            SessionIntent::OpenConversation(conversation) => {
                let before = self.engine.topics();
                let events = self.engine.open_conversation(conversation);
                self.emit_all(events);
                if self.engine.topics() != before {
                    self.sync_topics().await;
                }
            }

            SessionIntent::CloseConversation => {
                if let Some(conversation) = self.engine.close_conversation() {
                    debug!(conversation = %conversation, "Conversation closed");
                }
            }

            SessionIntent::JoinGroup(group) => {
                if self.engine.join_group(group) {
                    self.emit_all(vec![ClientEvent::ConversationsChanged {
                        conversations: self.engine.conversations().to_vec(),
                    }]);
                    self.sync_topics().await;
                }
            }

            SessionIntent::RespondToFriendRequest {
                requester,
                action,
                reply,
            } => {
                let result = self.respond_to_friend_request(requester, action).await;
                let _ = reply.send(result);
            }

            // Handled by the event loop.
            SessionIntent::Logout(_) => {}
        }
    }

    async fn send_message(
        &mut self,
        conversation: ConversationRef,
        content: &str,
    ) -> Result<MessageId, SendError> {
        let (outgoing, events) = self.engine.prepare_send(conversation, content)?;
        self.emit_all(events);

        let id = outgoing.id;
        if self
            .connection
            .publish(id.0, outgoing.topic, outgoing.payload)
            .await
            .is_err()
        {
            let events = self.engine.on_publish_failed(id.0, "connection task gone");
            self.emit_all(events);
        }
        Ok(id)
    }

    async fn respond_to_friend_request(
        &mut self,
        requester: UserId,
        action: FriendAction,
    ) -> Result<(), DirectoryError> {
        self.directory
            .respond_to_friend_request(requester, action)
            .await?;

        self.social.resolve(&requester);
        self.emit_friend_requests();
        if action == FriendAction::Accept {
            self.refresh_friends().await;
        }
        Ok(())
    }

    fn emit_friend_requests(&self) {
        emit_event(
            &self.event_tx,
            ClientEvent::FriendRequestsChanged {
                pending: self.social.pending().to_vec(),
                badge: self.social.badge(),
            },
        );
    }

    async fn refresh_friends(&mut self) {
        match self.directory.friends().await {
            Ok(friends) => emit_event(&self.event_tx, ClientEvent::FriendsRefreshed { friends }),
            Err(e) => {
                warn!(error = %e, "Friend list refresh failed");
                emit_event(
                    &self.event_tx,
                    ClientEvent::Error {
                        message: format!("Could not refresh friends: {e}"),
                    },
                );
            }
        }
    }

    async fn handle_notification(&mut self, notification: ConnectionNotification) {
        match notification {
            ConnectionNotification::StatusChanged(status) => {
                emit_event(&self.event_tx, ClientEvent::ConnectionChanged { status });
            }

            ConnectionNotification::MessageReceived { .. } => {
                if let Some((topic, event)) = try_decode_notification(&notification) {
                    self.handle_inbound(topic, event).await;
                }
            }

            ConnectionNotification::PublishAcked { id } => {
                let events = self.engine.on_publish_acked(id);
                self.emit_all(events);
            }

            ConnectionNotification::PublishFailed { id, error } => {
                let events = self.engine.on_publish_failed(id, &error.to_string());
                self.emit_all(events);
            }

            ConnectionNotification::SubscribeFailed { topic, error } => {
                emit_event(
                    &self.event_tx,
                    ClientEvent::Error {
                        message: format!("Could not subscribe to {topic}: {error}"),
                    },
                );
            }

            ConnectionNotification::AuthRejected => {
                warn!("Broker session rejected, sign-in required");
                emit_event(&self.event_tx, ClientEvent::SessionExpired);
            }
        }
    }

    async fn handle_inbound(&mut self, topic: Topic, event: Event) {
        match topic {
            Topic::User(owner) if owner == self.engine.identity() => {
                match self.social.apply(&event) {
                    SocialOutcome::PendingChanged => self.emit_friend_requests(),
                    SocialOutcome::RefreshFriends => self.refresh_friends().await,
                    SocialOutcome::Ignored => {}
                }
            }
            Topic::User(owner) => {
                warn!(owner = %owner, "Event on another user's topic");
            }
            _ => {
                let events = self.engine.apply_inbound(topic, event);
                self.emit_all(events);
            }
        }
    }

    async fn logout(&mut self) {
        info!(user = %self.engine.identity(), "Logging out");
        self.engine.forget_in_flight();
        let _ = self.connection.disconnect().await;
        // Commands are handled in order, so this returns after the disconnect.
        let _ = self.connection.status().await;
        let _ = self.connection.shutdown().await;
    }
}
