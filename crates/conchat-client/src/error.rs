use thiserror::Error;

use conchat_shared::error::CodecError;
use conchat_shared::types::ConversationRef;
use conchat_store::StoreError;

#[derive(Error, Debug)]
pub enum SendError {
    #[error("Message is empty")]
    EmptyMessage,

    #[error("Not a member of conversation {0}")]
    NoSuchConversation(ConversationRef),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Encoding error: {0}")]
    Codec(#[from] CodecError),
}

/// Failures of the REST friend directory.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Session is no longer authorized")]
    Unauthorized,

    #[error("No pending request from that user")]
    NotFound,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session has ended")]
    Closed,

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),
}
