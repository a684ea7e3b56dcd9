//! Core data models for the segment store.
//!
//! A `File` is the logical object a client wrote; its content lives in the
//! blob store as an ordered set of `Segment`s. Both map to SQLite tables via
//! `sqlx::FromRow` and serialize as JSON via `serde`.

pub mod file;
pub mod segment;
