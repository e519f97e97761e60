//! Core use-case services.
//!
//! # Responsibility
//! - Adapt request-shaped input into storage engine calls.
//! - Keep hosts decoupled from backend details.

pub mod tiddler_service;
