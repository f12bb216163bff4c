use serde::Serialize;
use tokio::sync::mpsc;

use conchat_shared::types::{ConnectionStatus, ConversationRef, MessageId, MessageStatus};
use conchat_store::Message;

use crate::chats::ConversationSummary;
use crate::social::{Friend, PendingFriendRequest};

/// Events pushed to the UI layer.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ClientEvent {
    MessageAdded {
        message: Message,
    },
    MessageStatusChanged {
        conversation: ConversationRef,
        message_id: MessageId,
        status: MessageStatus,
    },
    SendFailed {
        conversation: ConversationRef,
        message_id: MessageId,
        reason: String,
    },
    ConversationOpened {
        conversation: ConversationRef,
        messages: Vec<Message>,
    },
    ConversationsChanged {
        conversations: Vec<ConversationSummary>,
    },
    ConnectionChanged {
        status: ConnectionStatus,
    },
    FriendRequestsChanged {
        pending: Vec<PendingFriendRequest>,
        badge: u32,
    },
    FriendsRefreshed {
        friends: Vec<Friend>,
    },
    /// The broker refused our credentials; the UI should sign out.
    SessionExpired,
    Error {
        message: String,
    },
}

pub fn emit_event(tx: &mpsc::UnboundedSender<ClientEvent>, event: ClientEvent) {
    if let Err(e) = tx.send(event) {
        tracing::debug!(event = ?e.0, "Event receiver dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let json = serde_json::to_value(ClientEvent::ConnectionChanged {
            status: ConnectionStatus::Offline,
        })
        .unwrap();
        assert_eq!(json["type"], "connection-changed");
        assert_eq!(json["payload"]["status"], "offline");

        let json = serde_json::to_value(ClientEvent::SessionExpired).unwrap();
        assert_eq!(json["type"], "session-expired");
    }
}
