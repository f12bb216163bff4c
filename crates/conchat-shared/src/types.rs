use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::STORAGE_KEY_PREFIX;
use crate::error::TopicParseError;

// User identity = backend-assigned UUID
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct GroupId(pub Uuid);

impl GroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-generated message identifier, stable for the message's lifetime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConversationKind {
    #[serde(rename = "dm")]
    Direct,
    #[serde(rename = "group")]
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "dm",
            Self::Group => "group",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "dm" => Some(Self::Direct),
            "group" => Some(Self::Group),
            _ => None,
        }
    }
}

/// A `(kind, id)` pair naming one conversation.
///
/// For direct conversations `id` is the *peer's* user id; for groups it is
/// the group id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConversationRef {
    pub kind: ConversationKind,
    pub id: Uuid,
}

impl ConversationRef {
    pub fn direct(peer: UserId) -> Self {
        Self {
            kind: ConversationKind::Direct,
            id: peer.0,
        }
    }

    pub fn group(group: GroupId) -> Self {
        Self {
            kind: ConversationKind::Group,
            id: group.0,
        }
    }

    /// Key of the persisted log row, e.g. `conchat_messages_dm_<uuid>`.
    pub fn storage_key(&self) -> String {
        format!("{}_{}_{}", STORAGE_KEY_PREFIX, self.kind.as_str(), self.id)
    }

    /// Topic that outgoing messages for this conversation are published on.
    pub fn topic(&self) -> Topic {
        match self.kind {
            ConversationKind::Direct => Topic::Direct(UserId(self.id)),
            ConversationKind::Group => Topic::Group(GroupId(self.id)),
        }
    }
}

impl fmt::Display for ConversationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Broker topic namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// `/dms/{userId}`: direct messages addressed to a user.
    Direct(UserId),
    /// `/groups/{groupId}`: group traffic, both directions.
    Group(GroupId),
    /// `/users/{userId}`: out-of-band social events for a user.
    User(UserId),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct(id) => write!(f, "/dms/{id}"),
            Self::Group(id) => write!(f, "/groups/{id}"),
            Self::User(id) => write!(f, "/users/{id}"),
        }
    }
}

impl FromStr for Topic {
    type Err = TopicParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, rest) = s
            .strip_prefix('/')
            .and_then(|t| t.split_once('/'))
            .ok_or_else(|| TopicParseError::UnknownPattern(s.to_string()))?;

        let id = Uuid::parse_str(rest).map_err(|source| TopicParseError::InvalidId {
            topic: s.to_string(),
            source,
        })?;

        match prefix {
            "dms" => Ok(Self::Direct(UserId(id))),
            "groups" => Ok(Self::Group(GroupId(id))),
            "users" => Ok(Self::User(UserId(id))),
            _ => Err(TopicParseError::UnknownPattern(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery status
// ---------------------------------------------------------------------------

/// Delivery status of a message.
///
/// Transitions only move forward: `sending < sent < delivered < read`, with
/// `failed` reachable from `sending` alone and terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    fn rank(self) -> Option<u8> {
        match self {
            Self::Sending => Some(0),
            Self::Sent => Some(1),
            Self::Delivered => Some(2),
            Self::Read => Some(3),
            Self::Failed => None,
        }
    }

    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        match (self, next) {
            (Self::Sending, Self::Failed) => true,
            (Self::Failed, _) | (_, Self::Failed) => false,
            (current, next) => next.rank() > current.rank(),
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Connection status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Offline,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Longest prefix of `s` holding at most `max` characters.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel");
        assert_eq!(truncate_chars("ããããã", 2), "ãã");
        assert_eq!(truncate_chars("", 0), "");
    }

    #[test]
    fn test_topic_display_and_parse() {
        let user = UserId::new();
        let group = GroupId::new();

        for topic in [Topic::Direct(user), Topic::Group(group), Topic::User(user)] {
            let parsed: Topic = topic.to_string().parse().unwrap();
            assert_eq!(parsed, topic);
        }

        assert_eq!(Topic::Direct(user).to_string(), format!("/dms/{}", user.0));
    }

    #[test]
    fn test_topic_parse_is_case_insensitive() {
        let id = Uuid::new_v4();
        let upper = format!("/groups/{}", id.to_string().to_uppercase());
        assert_eq!(upper.parse::<Topic>().unwrap(), Topic::Group(GroupId(id)));
    }

    #[test]
    fn test_topic_parse_rejects_unknown_patterns() {
        assert!("/channels/abc".parse::<Topic>().is_err());
        assert!("/dms/not-a-uuid".parse::<Topic>().is_err());
        assert!("dms".parse::<Topic>().is_err());
        assert!(format!("/dms/{}/extra", Uuid::new_v4()).parse::<Topic>().is_err());
    }

    #[test]
    fn test_storage_key_and_topic() {
        let peer = UserId::new();
        let conv = ConversationRef::direct(peer);
        assert_eq!(conv.storage_key(), format!("conchat_messages_dm_{}", peer.0));
        assert_eq!(conv.topic(), Topic::Direct(peer));

        let group = GroupId::new();
        let conv = ConversationRef::group(group);
        assert_eq!(conv.storage_key(), format!("conchat_messages_group_{}", group.0));
        assert_eq!(conv.topic(), Topic::Group(group));
    }

    #[test]
    fn test_status_forward_only() {
        use MessageStatus::*;

        assert!(Sending.can_advance_to(Sent));
        assert!(Sending.can_advance_to(Failed));
        assert!(Sending.can_advance_to(Delivered));
        assert!(Sent.can_advance_to(Delivered));
        assert!(Delivered.can_advance_to(Read));

        assert!(!Sent.can_advance_to(Sending));
        assert!(!Sent.can_advance_to(Failed));
        assert!(!Delivered.can_advance_to(Sent));
        assert!(!Read.can_advance_to(Delivered));
        assert!(!Failed.can_advance_to(Sent));
        assert!(!Failed.can_advance_to(Delivered));
        assert!(!Sent.can_advance_to(Sent));
    }

    #[test]
    fn test_status_serde_lowercase() {
        let json = serde_json::to_string(&MessageStatus::Delivered).unwrap();
        assert_eq!(json, "\"delivered\"");
    }
}
