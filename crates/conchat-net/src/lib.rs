//! # conchat-net
//!
//! Broker connectivity for the Conchat client.
//!
//! A single tokio task owns the broker session ([`connection`]) and exposes
//! it through command / notification channels.  The broker itself sits
//! behind the [`transport::BrokerTransport`] trait; [`memory::MemoryBroker`]
//! is an in-process implementation.

pub mod connection;
pub mod memory;
pub mod messages;
pub mod subscriptions;
pub mod transport;

pub use connection::{
    spawn_connection, ConnectionCommand, ConnectionConfig, ConnectionError, ConnectionHandle,
    ConnectionNotification,
};
pub use memory::{MemoryBroker, MemoryTransport};
pub use transport::{BrokerTransport, SessionOptions, TransportError, TransportEvent};
