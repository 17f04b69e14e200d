//! Exchange request aggregate - domain model, state transitions and viewer redaction.
//!
//! This module re-exports types from `domain::exchange`, `domain::book` and
//! `domain::redaction`. See those modules for the actual implementations.

pub use crate::domain::book::*;
pub use crate::domain::exchange::state::*;
pub use crate::domain::redaction::ExchangeView;
