//! Wire envelope codec.
//!
//! Every broker payload is a JSON envelope
//! `{ "type", "from", "payload", "timestamp" }`.  Inbound envelopes are
//! decoded into the closed [`EventBody`] union; a payload that does not match
//! the shape declared by its `type` is rejected with a [`CodecError`].
//! Unknown `type` values decode to [`EventBody::Unrecognized`].

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::*;
use crate::error::CodecError;
use crate::types::{MessageId, UserId};

/// Raw envelope as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub from: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: String,
}

/// `MESSAGE_NEW` / `MESSAGE_EDIT` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessagePayload {
    /// Older clients send the id under `id`.
    #[serde(alias = "id")]
    pub message_id: MessageId,
    pub content: String,
}

/// Payload of events that only reference an existing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptPayload {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendRequestPayload {
    pub requester_id: UserId,
    pub requester_username: String,
    pub requester_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requester_pfp_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FriendAction {
    Accept,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FriendStatusPayload {
    pub action: FriendAction,
    pub user_id: UserId,
    pub username: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pfp_url: Option<String>,
}

/// Typed event body, one variant per wire `type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventBody {
    MessageNew(NewMessagePayload),
    MessageDelivered(ReceiptPayload),
    MessageRead(ReceiptPayload),
    MessageEdited(NewMessagePayload),
    MessageDeleted(ReceiptPayload),
    FriendRequestReceived(FriendRequestPayload),
    FriendStatusUpdate(FriendStatusPayload),
    Unrecognized { event_type: String },
}

impl EventBody {
    pub fn event_type(&self) -> &str {
        match self {
            Self::MessageNew(_) => EVENT_MESSAGE_NEW,
            Self::MessageDelivered(_) => EVENT_MESSAGE_DELIVERED,
            Self::MessageRead(_) => EVENT_MESSAGE_READ,
            Self::MessageEdited(_) => EVENT_MESSAGE_EDIT,
            Self::MessageDeleted(_) => EVENT_MESSAGE_DELETED,
            Self::FriendRequestReceived(_) => EVENT_FRIEND_REQUEST_RECEIVED,
            Self::FriendStatusUpdate(_) => EVENT_FRIEND_STATUS_UPDATE,
            Self::Unrecognized { event_type } => event_type.as_str(),
        }
    }

    fn payload_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::MessageNew(p) | Self::MessageEdited(p) => serde_json::to_value(p),
            Self::MessageDelivered(p) | Self::MessageRead(p) | Self::MessageDeleted(p) => {
                serde_json::to_value(p)
            }
            Self::FriendRequestReceived(p) => serde_json::to_value(p),
            Self::FriendStatusUpdate(p) => serde_json::to_value(p),
            Self::Unrecognized { .. } => Ok(serde_json::Value::Object(Default::default())),
        }
    }
}

/// A decoded wire event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub from: UserId,
    pub timestamp: DateTime<Utc>,
    pub body: EventBody,
}

impl Event {
    /// Build an event stamped with the current time.
    pub fn new(from: UserId, body: EventBody) -> Self {
        Self {
            from,
            timestamp: Utc::now(),
            body,
        }
    }

    /// Serialize to the JSON envelope.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let envelope = Envelope {
            event_type: self.body.event_type().to_string(),
            from: self.from.to_string(),
            payload: self.body.payload_value()?,
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Parse and validate a JSON envelope.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() > MAX_ENVELOPE_SIZE {
            return Err(CodecError::TooLarge {
                size: data.len(),
                max: MAX_ENVELOPE_SIZE,
            });
        }

        let envelope: Envelope = serde_json::from_slice(data)?;

        let from = UserId::parse(&envelope.from).map_err(CodecError::InvalidSender)?;
        let timestamp = DateTime::parse_from_rfc3339(&envelope.timestamp)?.with_timezone(&Utc);

        let Envelope {
            event_type,
            payload,
            ..
        } = envelope;

        let body = match event_type.as_str() {
            EVENT_MESSAGE_NEW => EventBody::MessageNew(payload_as(&event_type, payload)?),
            EVENT_MESSAGE_DELIVERED => {
                EventBody::MessageDelivered(payload_as(&event_type, payload)?)
            }
            EVENT_MESSAGE_READ => EventBody::MessageRead(payload_as(&event_type, payload)?),
            EVENT_MESSAGE_EDIT => EventBody::MessageEdited(payload_as(&event_type, payload)?),
            EVENT_MESSAGE_DELETED => EventBody::MessageDeleted(payload_as(&event_type, payload)?),
            EVENT_FRIEND_REQUEST_RECEIVED => {
                EventBody::FriendRequestReceived(payload_as(&event_type, payload)?)
            }
            EVENT_FRIEND_STATUS_UPDATE => {
                EventBody::FriendStatusUpdate(payload_as(&event_type, payload)?)
            }
            _ => EventBody::Unrecognized { event_type },
        };

        Ok(Self {
            from,
            timestamp,
            body,
        })
    }
}

fn payload_as<T: DeserializeOwned>(
    event_type: &str,
    payload: serde_json::Value,
) -> Result<T, CodecError> {
    serde_json::from_value(payload).map_err(|source| CodecError::Payload {
        event_type: event_type.to_string(),
        source,
    })
}

/// Decode an inbound payload, logging and dropping it if malformed.
///
/// This is the only decode entry point the sync engine uses: a bad payload
/// never propagates past this function.
pub fn decode_or_drop(topic: &str, data: &[u8]) -> Option<Event> {
    match Event::decode(data) {
        Ok(event) => {
            debug!(
                topic = %topic,
                event_type = event.body.event_type(),
                from = %event.from,
                "Decoded inbound event"
            );
            Some(event)
        }
        Err(e) => {
            warn!(topic = %topic, len = data.len(), error = %e, "Dropping malformed event");
            None
        }
    }
}
