//! Exchange request aggregate - domain model and state transitions.
//!
//! - Request types and states (typestate pattern)
//! - State transition methods

pub mod state;
pub mod transitions;

pub use state::*;
