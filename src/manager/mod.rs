//! Storage traits for exchange requests and book availability.
//!
//! Reads go straight to the [`ExchangeStore`]. Every write goes through a
//! [`StoreTransaction`] obtained from [`ExchangeStore::begin`], so that a status
//! change and the book eligibility changes it implies are committed as one unit.
//! Dropping a transaction without calling [`StoreTransaction::commit`] rolls it back.

use async_trait::async_trait;

use crate::domain::book::{Book, BookId, UserId};
use crate::domain::exchange::{AnyExchange, Exchange, ExchangeId, ExchangeState, Pending};
use crate::error::Result;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
mod row;

pub use memory::InMemoryExchangeStore;

/// Book eligibility flag, scoped to a store transaction.
///
/// Changes made here become visible to other callers only when the enclosing
/// transaction commits, together with the exchange status change that caused them.
#[async_trait]
pub trait BookAvailabilityGuard: Send {
    /// Lock the given books' rows for the rest of the transaction.
    ///
    /// Callers pass ids in ascending order (see [`crate::ExchangeData::book_ids`]) so
    /// that concurrent transactions always lock in the same order.
    ///
    /// # Errors
    /// [`crate::ExchangeError::BookNotFound`] if any of the books is unknown.
    async fn lock_books(&mut self, books: &[BookId]) -> Result<()>;

    /// Whether the book may take part in a new exchange.
    async fn is_eligible(&mut self, book: BookId) -> Result<bool>;

    async fn set_eligible(&mut self, book: BookId, eligible: bool) -> Result<()>;
}

/// A single atomic unit of work against the store.
///
/// All reads made through a transaction see the latest committed state plus the
/// transaction's own writes.
#[async_trait]
pub trait StoreTransaction: BookAvailabilityGuard + Send {
    /// Serialise against other transactions working on the same ordered pair.
    /// Held until commit or rollback.
    async fn lock_pair(&mut self, requested_by: UserId, requested_to: UserId) -> Result<()>;

    /// Whether a Pending or Accepted request exists for the ordered pair.
    async fn live_exchange_exists(
        &mut self,
        requested_by: UserId,
        requested_to: UserId,
    ) -> Result<bool>;

    /// Load a request and lock its row for the rest of the transaction.
    async fn get_for_update(&mut self, id: ExchangeId) -> Result<Option<AnyExchange>>;

    /// Whether a request other than `excluding` keeps `book` locked
    /// (see [`AnyExchange::holds_book_lock`]).
    async fn lock_holder_exists(&mut self, book: BookId, excluding: ExchangeId) -> Result<bool>;

    async fn insert(&mut self, exchange: &Exchange<Pending>) -> Result<()>;

    /// Replace the stored state of an existing request.
    ///
    /// # Errors
    /// [`crate::ExchangeError::NotFoundOrForbidden`] if the request does not exist.
    async fn persist<T: ExchangeState + Clone>(&mut self, exchange: &Exchange<T>) -> Result<()>
    where
        AnyExchange: From<Exchange<T>>;

    /// # Errors
    /// [`crate::ExchangeError::NotFoundOrForbidden`] if the request does not exist.
    async fn delete(&mut self, id: ExchangeId) -> Result<()>;

    async fn commit(self) -> Result<()>;
}

/// Persistence for exchange requests.
#[async_trait]
pub trait ExchangeStore: Send + Sync {
    type Tx: StoreTransaction + 'static;

    /// Start a write transaction.
    async fn begin(&self) -> Result<Self::Tx>;

    /// Register a book (and its owner) or refresh its catalogue fields.
    ///
    /// The eligibility flag of an already known book is left untouched: only the
    /// engine changes it.
    async fn upsert_book(&self, book: &Book) -> Result<()>;

    /// Committed eligibility of a book.
    async fn is_eligible(&self, book: BookId) -> Result<bool>;

    async fn get_exchange(&self, id: ExchangeId) -> Result<Option<AnyExchange>>;

    /// Requests initiated by `user`, oldest first.
    async fn list_by_initiator(&self, user: UserId) -> Result<Vec<AnyExchange>>;

    /// Requests addressed to `user`, oldest first.
    async fn list_by_counterparty(&self, user: UserId) -> Result<Vec<AnyExchange>>;

    /// Requests where `user` is either party, oldest first.
    async fn list_by_party(&self, user: UserId) -> Result<Vec<AnyExchange>>;

    /// Requests referencing `book` where `user` is either party.
    async fn list_by_book_and_party(&self, book: BookId, user: UserId)
    -> Result<Vec<AnyExchange>>;

    /// Pending requests referencing `book` as either the requested or the offered
    /// book. Always reads committed state from the primary.
    async fn list_pending_referencing_book(&self, book: BookId) -> Result<Vec<Exchange<Pending>>>;

    /// Whether a Pending or Accepted request exists for the ordered pair.
    /// Always reads committed state from the primary.
    async fn live_exchange_exists(&self, requested_by: UserId, requested_to: UserId)
    -> Result<bool>;
}
