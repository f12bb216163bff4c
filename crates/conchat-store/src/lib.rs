//! # conchat-store
//!
//! Local durable storage for Conchat conversation logs, backed by SQLite.
//!
//! Each conversation owns one bounded, insertion-ordered log of messages.
//! The crate exposes a synchronous `Database` handle wrapping a
//! `rusqlite::Connection`; every write is committed before the call returns,
//! so a crash loses at most the write in flight.

pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
