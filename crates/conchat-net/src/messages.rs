use tracing::warn;

use conchat_shared::protocol::{decode_or_drop, Event};
use conchat_shared::types::Topic;

use crate::connection::ConnectionNotification;

/// Checks if a notification is an inbound broker message on a known topic,
/// and decodes its envelope if so.  Malformed input is logged and dropped.
pub fn try_decode_notification(notification: &ConnectionNotification) -> Option<(Topic, Event)> {
    match notification {
        ConnectionNotification::MessageReceived { topic, payload } => {
            let parsed: Topic = match topic.parse() {
                Ok(t) => t,
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Message on unrecognized topic");
                    return None;
                }
            };
            decode_or_drop(topic, payload).map(|event| (parsed, event))
        }
        _ => None,
    }
}
