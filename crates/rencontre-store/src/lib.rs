//! # rencontre-store
//!
//! Durable storage for the Rencontre chat core, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for every domain
//! model.  Async callers are expected to drive it through `spawn_blocking`.

pub mod chats;
pub mod database;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod questions;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
