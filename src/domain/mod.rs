//! Core domain types for the exchange engine.
//!
//! This module contains pure domain types with no persistence dependencies:
//! - Books, owners and identifiers
//! - Exchange request typestate machine
//! - Viewer-dependent redaction

pub mod book;
pub mod exchange;
pub mod redaction;

#[cfg(test)]
pub(crate) mod test_support;
