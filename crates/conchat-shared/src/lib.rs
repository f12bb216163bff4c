//! Vocabulary shared by every Conchat crate: identifiers, conversation and
//! topic naming, the message status machine, and the wire envelope codec.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{CodecError, TopicParseError};
pub use protocol::{Event, EventBody};
pub use types::{
    ConnectionStatus, ConversationKind, ConversationRef, GroupId, MessageId, MessageStatus, Topic,
    UserId,
};
