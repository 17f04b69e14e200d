//! Error types for the exchange engine.
//!
//! Precondition failures ([`ExchangeError::InvalidOperation`],
//! [`ExchangeError::Conflict`], [`ExchangeError::NotFoundOrForbidden`],
//! [`ExchangeError::BookNotFound`]) and store failures ([`ExchangeError::Internal`])
//! mean the operation did not take effect. [`ExchangeError::PartiallyApplied`] is the
//! only variant returned after the primary state change has been committed; check
//! [`ExchangeError::is_committed`] before deciding to retry.

use thiserror::Error;

use crate::domain::book::{BookId, UserId};
use crate::domain::exchange::ExchangeId;
use crate::domain::redaction::ExchangeView;

/// Result type alias using the exchange error type.
pub type Result<T> = std::result::Result<T, ExchangeError>;

#[derive(Error, Debug)]
pub enum ExchangeError {
    /// The request is not allowed in the current situation (self-request,
    /// transition from the wrong state, ownership mismatch).
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Another live request or a lock on a book prevents the operation.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The request does not exist, or the caller may not act on it.
    ///
    /// The two cases are deliberately indistinguishable so that non-participants
    /// cannot probe for request ids.
    #[error("Exchange request not found: {0}")]
    NotFoundOrForbidden(ExchangeId),

    #[error("Book not found: {0}")]
    BookNotFound(BookId),

    /// The primary state change is durable, but some follow-up effects failed.
    #[error(
        "Exchange request {} was committed but {} side effect(s) failed",
        .0.exchange_id,
        .0.failures.len()
    )]
    PartiallyApplied(Box<PartialFailure>),

    /// Store failure; nothing was committed.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ExchangeError {
    pub(crate) fn conflict(message: &str) -> Self {
        ExchangeError::Conflict(message.to_string())
    }

    pub(crate) fn invalid(message: &str) -> Self {
        ExchangeError::InvalidOperation(message.to_string())
    }

    /// True when the caller's action took effect despite the error.
    pub fn is_committed(&self) -> bool {
        matches!(self, ExchangeError::PartiallyApplied(_))
    }

    /// Side effects that failed, if the action itself was committed.
    pub fn partial_failure(&self) -> Option<&PartialFailure> {
        match self {
            ExchangeError::PartiallyApplied(partial) => Some(partial),
            _ => None,
        }
    }
}

/// Details of an operation that committed but did not complete all side effects.
#[derive(Debug, Clone)]
pub struct PartialFailure {
    /// The request the caller acted on.
    pub exchange_id: ExchangeId,
    /// The request as the caller would have received it on success, for operations
    /// that return one.
    pub view: Option<ExchangeView>,
    pub failures: Vec<SideEffectFailure>,
}

/// A follow-up effect that failed after the primary commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffectFailure {
    /// Could not look up rival requests referencing a newly locked book.
    CascadeLookup { book: BookId, error: String },
    /// A rival request could not be declined; it is still pending.
    CascadeDecline { exchange_id: ExchangeId, error: String },
    /// A notification was not accepted by the sink.
    Notification { recipient: UserId, error: String },
}

impl std::fmt::Display for SideEffectFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SideEffectFailure::CascadeLookup { book, error } => {
                write!(f, "looking up pending requests for book {}: {}", book, error)
            }
            SideEffectFailure::CascadeDecline { exchange_id, error } => {
                write!(f, "declining exchange request {}: {}", exchange_id, error)
            }
            SideEffectFailure::Notification { recipient, error } => {
                write!(f, "notifying user {}: {}", recipient, error)
            }
        }
    }
}

impl SideEffectFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            SideEffectFailure::CascadeLookup { .. } => "cascade_lookup",
            SideEffectFailure::CascadeDecline { .. } => "cascade_decline",
            SideEffectFailure::Notification { .. } => "notification",
        }
    }
}
