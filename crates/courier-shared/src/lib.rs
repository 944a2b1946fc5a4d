//! # courier-shared
//!
//! Types shared by the store and the server: identifiers, enums, the
//! denormalized views returned by the message engine, and the JSON events
//! exchanged over live connections.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;
pub mod views;

pub use error::IdError;
