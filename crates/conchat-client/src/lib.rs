//! # conchat-client
//!
//! Real-time message and presence sync for a Conchat client: optimistic
//! sends reconciled against broker acknowledgements and self-echo, bounded
//! local conversation logs, unread counters and friend-request state.

pub mod chats;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod session;
pub mod social;

use tracing_subscriber::{fmt, EnvFilter};

pub use config::ClientConfig;
pub use engine::SyncEngine;
pub use error::{DirectoryError, SendError, SessionError};
pub use events::ClientEvent;
pub use session::{Session, SessionHandle};
pub use social::{MemoryDirectory, SocialDirectory};

/// Install the global `tracing` subscriber.  `RUST_LOG` overrides the
/// default filter.  Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("conchat_client=debug,conchat_net=debug,conchat_store=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();

    tracing::info!("Conchat client tracing initialised");
}
