use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Malformed envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error("Payload too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Invalid sender id: {0}")]
    InvalidSender(#[source] uuid::Error),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(#[from] chrono::ParseError),

    #[error("Invalid {event_type} payload: {source}")]
    Payload {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum TopicParseError {
    #[error("Topic does not match any known pattern: {0}")]
    UnknownPattern(String),

    #[error("Invalid id in topic {topic}: {source}")]
    InvalidId {
        topic: String,
        #[source]
        source: uuid::Error,
    },
}
