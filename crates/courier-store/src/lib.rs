//! # courier-store
//!
//! SQLite storage and the message engine for Courier.
//!
//! Entity helpers (`users`, `blocks`, `conversations`, `groups`, `messages`,
//! `feed`) are methods on [`UnitOfWork`], so every multi-entity write made by
//! the [`engine`] commits or rolls back as one. [`StorePool`] exposes the
//! synchronous [`Database`] to async callers.

pub mod blocks;
pub mod conversations;
pub mod database;
pub mod engine;
pub mod feed;
pub mod groups;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod pool;
pub mod users;

mod error;
mod sql;

pub use database::{Database, UnitOfWork};
pub use engine::{
    normalize_text, DeleteOutcome, EditOutcome, GroupCreated, GroupJoined, GroupSendOutcome,
    PairFeed, ReadOutcome, SendOutcome,
};
pub use error::{Result, StoreError};
pub use models::*;
pub use pool::StorePool;
