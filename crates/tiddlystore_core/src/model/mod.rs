//! Document model for stored tiddlers.
//!
//! # Responsibility
//! - Define the in-memory tiddler shape shared by every storage backend.
//! - Own the wire JSON rules (metadata/text split, skinny/fat encoding).
//!
//! # Invariants
//! - Every tiddler is identified by a non-empty title (`key`).
//! - The revision number lives inside the metadata object.

pub mod tiddler;
