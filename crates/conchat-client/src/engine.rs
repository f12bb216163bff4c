//! Message synchronization engine.
//!
//! Reconciles three sources of truth for every message: the optimistic local
//! entry written at send time, the broker's publish acknowledgement, and the
//! broker echoing the message back to subscribers (the sender included).
//!
//! The engine is synchronous and owns the [`Database`].  It never talks to
//! the network: sends produce an [`OutgoingPublish`] for the caller to hand
//! to the connection manager, and publish outcomes are fed back in through
//! [`SyncEngine::on_publish_acked`] / [`SyncEngine::on_publish_failed`].
//! Every mutating call returns the [`ClientEvent`]s the UI should see.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use conchat_shared::protocol::{Event, EventBody, NewMessagePayload};
use conchat_shared::types::{
    ConversationKind, ConversationRef, GroupId, MessageId, MessageStatus, Topic, UserId,
};
use conchat_store::{Database, Message, StatusChange};

use crate::chats::{ConversationIndex, ConversationSummary};
use crate::error::SendError;
use crate::events::ClientEvent;

/// A publish the caller must hand to the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingPublish {
    pub id: MessageId,
    pub topic: Topic,
    pub payload: Vec<u8>,
}

pub struct SyncEngine {
    db: Database,
    me: UserId,
    index: ConversationIndex,
    open: Option<ConversationRef>,
    groups: BTreeSet<GroupId>,
    /// Publishes awaiting an outcome, keyed by message id.
    in_flight: HashMap<Uuid, ConversationRef>,
}

impl SyncEngine {
    pub fn new(db: Database, me: UserId) -> conchat_store::Result<Self> {
        let stored = db.conversations()?;
        let groups = stored
            .iter()
            .filter(|c| c.conversation.kind == ConversationKind::Group)
            .map(|c| GroupId(c.conversation.id))
            .collect();

        info!(user = %me, conversations = stored.len(), "Sync engine ready");

        Ok(Self {
            db,
            me,
            index: ConversationIndex::from_stored(stored),
            open: None,
            groups,
            in_flight: HashMap::new(),
        })
    }

    pub fn identity(&self) -> UserId {
        self.me
    }

    pub fn open_conversation_ref(&self) -> Option<ConversationRef> {
        self.open
    }

    pub fn conversations(&self) -> &[ConversationSummary] {
        self.index.summaries()
    }

    pub fn unread(&self, conversation: &ConversationRef) -> u32 {
        self.index.unread(conversation)
    }

    pub fn messages(&self, conversation: &ConversationRef) -> conchat_store::Result<Vec<Message>> {
        self.db.conversation_log(conversation)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Topics this identity must be subscribed to: its DM inbox, its user
    /// topic and every joined group.
    pub fn topics(&self) -> BTreeSet<Topic> {
        let mut topics = BTreeSet::new();
        topics.insert(Topic::Direct(self.me));
        topics.insert(Topic::User(self.me));
        topics.extend(self.groups.iter().map(|g| Topic::Group(*g)));
        topics
    }

    pub fn join_group(&mut self, group: GroupId) -> bool {
        let added = self.groups.insert(group);
        if added {
            info!(group = %group, "Joined group");
            self.index.ensure(ConversationRef::group(group));
        }
        added
    }

    fn conversations_changed(&self) -> ClientEvent {
        ClientEvent::ConversationsChanged {
            conversations: self.index.summaries().to_vec(),
        }
    }

    // -----------------------------------------------------------------------
    // Send path
    // -----------------------------------------------------------------------

    /// Validate and store a new outgoing message with status `sending`.
    ///
    /// The local entry is never rolled back: a later failure only flips its
    /// status to `failed`.
    pub fn prepare_send(
        &mut self,
        conversation: ConversationRef,
        content: &str,
    ) -> Result<(OutgoingPublish, Vec<ClientEvent>), SendError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(SendError::EmptyMessage);
        }
        if conversation.kind == ConversationKind::Group
            && !self.groups.contains(&GroupId(conversation.id))
        {
            return Err(SendError::NoSuchConversation(conversation));
        }

        let message = Message::new(
            MessageId::new(),
            conversation,
            self.me,
            content,
            Utc::now(),
            MessageStatus::Sending,
        );

        let event = Event {
            from: self.me,
            timestamp: message.timestamp,
            body: EventBody::MessageNew(NewMessagePayload {
                message_id: message.id,
                content: message.content.clone(),
            }),
        };
        let payload = event.encode()?;

        self.db.append_message(&message)?;
        self.in_flight.insert(message.id.0, conversation);
        self.index.record_activity(&message, false);

        debug!(
            msg_id = %message.id,
            conversation = %conversation,
            len = message.content.len(),
            "Message queued for publish"
        );

        let outgoing = OutgoingPublish {
            id: message.id,
            topic: conversation.topic(),
            payload,
        };
        let events = vec![
            ClientEvent::MessageAdded { message },
            self.conversations_changed(),
        ];
        Ok((outgoing, events))
    }

    pub fn on_publish_acked(&mut self, id: Uuid) -> Vec<ClientEvent> {
        match self.in_flight.remove(&id) {
            Some(conversation) => self.advance(conversation, MessageId(id), MessageStatus::Sent),
            None => {
                debug!(id = %id, "Ack for unknown publish");
                Vec::new()
            }
        }
    }

    pub fn on_publish_failed(&mut self, id: Uuid, reason: &str) -> Vec<ClientEvent> {
        let Some(conversation) = self.in_flight.remove(&id) else {
            debug!(id = %id, "Failure for unknown publish");
            return Vec::new();
        };

        let message_id = MessageId(id);
        let mut events = self.advance(conversation, message_id, MessageStatus::Failed);
        if !events.is_empty() {
            warn!(msg_id = %message_id, reason, "Message send failed");
            events.push(ClientEvent::SendFailed {
                conversation,
                message_id,
                reason: reason.to_string(),
            });
        }
        events
    }

    /// Drop every in-flight publish without touching stored statuses.
    pub fn forget_in_flight(&mut self) {
        if !self.in_flight.is_empty() {
            debug!(count = self.in_flight.len(), "Discarding in-flight publishes");
        }
        self.in_flight.clear();
    }

    // -----------------------------------------------------------------------
    // Receive path
    // -----------------------------------------------------------------------

    /// Apply an event that arrived on a conversation topic.
    pub fn apply_inbound(&mut self, topic: Topic, event: Event) -> Vec<ClientEvent> {
        let conversation = match topic {
            Topic::Direct(owner) if owner == self.me => ConversationRef::direct(event.from),
            Topic::Group(group) => ConversationRef::group(group),
            Topic::Direct(owner) => {
                warn!(topic = %topic, owner = %owner, "Event on another user's inbox");
                return Vec::new();
            }
            Topic::User(_) => {
                debug!(topic = %topic, "Not a conversation topic");
                return Vec::new();
            }
        };

        match event.body {
            EventBody::MessageNew(payload) => {
                self.on_new_message(conversation, event.from, event.timestamp, payload)
            }
            EventBody::MessageDelivered(receipt) => {
                self.advance(conversation, receipt.message_id, MessageStatus::Delivered)
            }
            EventBody::MessageRead(receipt) => {
                self.advance(conversation, receipt.message_id, MessageStatus::Read)
            }
            EventBody::MessageEdited(payload) => {
                info!(msg_id = %payload.message_id, conversation = %conversation, "Edit received, not applied");
                Vec::new()
            }
            EventBody::MessageDeleted(receipt) => {
                info!(msg_id = %receipt.message_id, conversation = %conversation, "Delete received, not applied");
                Vec::new()
            }
            EventBody::FriendRequestReceived(_) | EventBody::FriendStatusUpdate(_) => {
                warn!(topic = %topic, "Social event on a conversation topic");
                Vec::new()
            }
            EventBody::Unrecognized { event_type } => {
                debug!(event_type = %event_type, topic = %topic, "Ignoring unrecognized event");
                Vec::new()
            }
        }
    }

    fn on_new_message(
        &mut self,
        conversation: ConversationRef,
        from: UserId,
        timestamp: DateTime<Utc>,
        payload: NewMessagePayload,
    ) -> Vec<ClientEvent> {
        let message = Message::new(
            payload.message_id,
            conversation,
            from,
            &payload.content,
            timestamp,
            MessageStatus::Delivered,
        );

        match self.db.append_message(&message) {
            Ok(true) => {}
            Ok(false) if from == self.me => {
                // Our own message came back from the broker.
                return self.advance(conversation, message.id, MessageStatus::Delivered);
            }
            Ok(false) => {
                debug!(msg_id = %message.id, "Duplicate delivery discarded");
                return Vec::new();
            }
            Err(e) => return self.store_failure("append", e),
        }

        debug!(msg_id = %message.id, conversation = %conversation, from = %from, "Message received");

        let is_open = self.open == Some(conversation);
        let mut events = Vec::with_capacity(2);
        if !is_open {
            self.index.record_activity(&message, from != self.me);
        }
        events.push(ClientEvent::MessageAdded { message });
        if !is_open {
            events.push(self.conversations_changed());
        }
        events
    }

    fn advance(
        &mut self,
        conversation: ConversationRef,
        message_id: MessageId,
        status: MessageStatus,
    ) -> Vec<ClientEvent> {
        match self
            .db
            .advance_message_status(&conversation, message_id, status)
        {
            Ok(StatusChange::Applied { from }) => {
                debug!(msg_id = %message_id, from = %from, to = %status, "Status advanced");
                vec![ClientEvent::MessageStatusChanged {
                    conversation,
                    message_id,
                    status,
                }]
            }
            Ok(StatusChange::Rejected { current }) => {
                debug!(msg_id = %message_id, current = %current, requested = %status, "Stale status ignored");
                Vec::new()
            }
            Ok(StatusChange::NotFound) => {
                debug!(msg_id = %message_id, conversation = %conversation, "Status for unknown message");
                Vec::new()
            }
            Err(e) => self.store_failure("status update", e),
        }
    }

    fn store_failure(&self, op: &str, e: conchat_store::StoreError) -> Vec<ClientEvent> {
        error!(op, error = %e, "Store operation failed");
        vec![ClientEvent::Error {
            message: format!("Local storage error: {e}"),
        }]
    }

    // -----------------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------------

    /// Make `conversation` the open one: reset its unread counter and return
    /// its stored log.  Opening a group joins it.
    pub fn open_conversation(&mut self, conversation: ConversationRef) -> Vec<ClientEvent> {
        if conversation.kind == ConversationKind::Group {
            self.join_group(GroupId(conversation.id));
        }
        self.open = Some(conversation);
        self.index.ensure(conversation);
        self.index.mark_read(&conversation);

        let messages = match self.db.conversation_log(&conversation) {
            Ok(log) => log,
            Err(e) => {
                let mut events = self.store_failure("load", e);
                events.push(self.conversations_changed());
                return events;
            }
        };

        debug!(conversation = %conversation, messages = messages.len(), "Conversation opened");
        vec![
            ClientEvent::ConversationOpened {
                conversation,
                messages,
            },
            self.conversations_changed(),
        ]
    }

    /// Clear the open conversation.  In-flight publishes still complete.
    pub fn close_conversation(&mut self) -> Option<ConversationRef> {
        self.open.take()
    }
}
