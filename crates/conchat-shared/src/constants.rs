/// Maximum message content length, in characters
pub const MAX_CONTENT_CHARS: usize = 2000;

/// Maximum number of messages retained per conversation log
pub const MAX_LOG_LEN: usize = 500;

/// Length of the last-message preview cached for the chat list, in characters
pub const PREVIEW_CHARS: usize = 48;

/// Maximum accepted size of an inbound wire payload in bytes (256 KiB)
pub const MAX_ENVELOPE_SIZE: usize = 262_144;

/// Prefix of persisted conversation log keys
pub const STORAGE_KEY_PREFIX: &str = "conchat_messages";

/// Prefix of the stable per-identity broker client id
pub const CLIENT_ID_PREFIX: &str = "web_";

/// Default broker endpoint (MQTT over WebSocket)
pub const DEFAULT_BROKER_URL: &str = "ws://localhost:8083/mqtt";

/// Default REST API base URL
pub const DEFAULT_API_URL: &str = "http://localhost:8000/api/v1";

/// Fixed delay between reconnect attempts, in milliseconds
pub const DEFAULT_RECONNECT_MS: u64 = 1000;

/// Broker keep-alive interval in seconds
pub const DEFAULT_KEEPALIVE_SECS: u64 = 60;

/// Wire event types
pub const EVENT_MESSAGE_NEW: &str = "MESSAGE_NEW";
pub const EVENT_MESSAGE_DELIVERED: &str = "MESSAGE_DELIVERED";
pub const EVENT_MESSAGE_READ: &str = "MESSAGE_READ";
pub const EVENT_MESSAGE_EDIT: &str = "MESSAGE_EDIT";
pub const EVENT_MESSAGE_DELETED: &str = "MESSAGE_DELETED";
pub const EVENT_FRIEND_REQUEST_RECEIVED: &str = "FRIENDREQUEST_RECEIVED";
pub const EVENT_FRIEND_STATUS_UPDATE: &str = "FRIENDSTATUS_UPDATE";
