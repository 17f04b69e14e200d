//! In-process implementation of [`ExchangeStore`].
//!
//! Committed state sits behind a read/write lock so reads never wait on writers.
//! Write transactions are serialised by a single async mutex: a transaction takes
//! the mutex, works on a private copy of the committed state and swaps it in on
//! commit. That makes every transaction trivially serialisable, which is all the
//! pair and book locks of the PostgreSQL store are there to approximate.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;

use super::row::ExchangeRow;
use super::{BookAvailabilityGuard, ExchangeStore, StoreTransaction};
use crate::domain::book::{Book, BookId, UserId};
use crate::domain::exchange::{
    AnyExchange, Exchange, ExchangeId, ExchangeState, ExchangeStatus, Pending,
};
use crate::error::{ExchangeError, Result};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    books: HashMap<BookId, Book>,
    /// Insertion order doubles as creation order.
    exchanges: Vec<ExchangeRow>,
}

impl MemoryState {
    fn book(&self, id: BookId) -> Result<&Book> {
        self.books.get(&id).ok_or(ExchangeError::BookNotFound(id))
    }

    fn resolve(&self, row: &ExchangeRow) -> Result<AnyExchange> {
        let requested_book = self.book(row.requested_book_id)?.clone();
        let offered_book = self.book(row.offered_book_id)?.clone();
        row.clone().into_exchange(requested_book, offered_book)
    }

    fn select(&self, filter: impl Fn(&ExchangeRow) -> bool) -> Result<Vec<AnyExchange>> {
        self.exchanges
            .iter()
            .filter(|row| filter(row))
            .map(|row| self.resolve(row))
            .collect()
    }

    fn position(&self, id: ExchangeId) -> Option<usize> {
        self.exchanges.iter().position(|row| row.id == id)
    }
}

/// Exchange store kept entirely in memory.
///
/// Cheap to clone; clones share the same state.
///
/// # Example
/// ```ignore
/// let store = Arc::new(InMemoryExchangeStore::new());
/// store.upsert_book(&book).await?;
/// let engine = ExchangeEngine::new(store, Arc::new(LoggingNotificationSink));
/// ```
#[derive(Clone, Default)]
pub struct InMemoryExchangeStore {
    committed: Arc<RwLock<MemoryState>>,
    writer: Arc<tokio::sync::Mutex<()>>,
    failing_writes: Arc<Mutex<HashSet<ExchangeId>>>,
}

impl InMemoryExchangeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write touching `id` fail with an internal error.
    ///
    /// Used to exercise partial-failure paths of the engine.
    pub fn fail_writes_for(&self, id: ExchangeId) {
        self.failing_writes.lock().insert(id);
    }

    /// Undo [`Self::fail_writes_for`].
    pub fn clear_write_failures(&self) {
        self.failing_writes.lock().clear();
    }

    /// Number of stored exchange requests, in any state.
    pub fn exchange_count(&self) -> usize {
        self.committed.read().exchanges.len()
    }
}

#[async_trait]
impl ExchangeStore for InMemoryExchangeStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<InMemoryTransaction> {
        let guard = self.writer.clone().lock_owned().await;
        let staged = self.committed.read().clone();
        Ok(InMemoryTransaction {
            _guard: guard,
            staged,
            committed: self.committed.clone(),
            failing_writes: self.failing_writes.clone(),
        })
    }

    async fn upsert_book(&self, book: &Book) -> Result<()> {
        let _writer = self.writer.lock().await;
        let mut state = self.committed.write();
        match state.books.get_mut(&book.id) {
            Some(existing) => {
                existing.title = book.title.clone();
                existing.owner = book.owner.clone();
                existing.pickup_location = book.pickup_location.clone();
            }
            None => {
                state.books.insert(book.id, book.clone());
            }
        }
        Ok(())
    }

    async fn is_eligible(&self, book: BookId) -> Result<bool> {
        Ok(self.committed.read().book(book)?.eligible)
    }

    async fn get_exchange(&self, id: ExchangeId) -> Result<Option<AnyExchange>> {
        let state = self.committed.read();
        state
            .position(id)
            .map(|index| state.resolve(&state.exchanges[index]))
            .transpose()
    }

    async fn list_by_initiator(&self, user: UserId) -> Result<Vec<AnyExchange>> {
        self.committed.read().select(|row| row.requested_by == user)
    }

    async fn list_by_counterparty(&self, user: UserId) -> Result<Vec<AnyExchange>> {
        self.committed.read().select(|row| row.requested_to == user)
    }

    async fn list_by_party(&self, user: UserId) -> Result<Vec<AnyExchange>> {
        self.committed.read().select(|row| row.is_participant(user))
    }

    async fn list_by_book_and_party(
        &self,
        book: BookId,
        user: UserId,
    ) -> Result<Vec<AnyExchange>> {
        self.committed
            .read()
            .select(|row| row.references_book(book) && row.is_participant(user))
    }

    async fn list_pending_referencing_book(&self, book: BookId) -> Result<Vec<Exchange<Pending>>> {
        let pending = self
            .committed
            .read()
            .select(|row| row.references_book(book) && row.status == ExchangeStatus::Pending)?;
        Ok(pending
            .into_iter()
            .filter_map(AnyExchange::into_pending)
            .collect())
    }

    async fn live_exchange_exists(
        &self,
        requested_by: UserId,
        requested_to: UserId,
    ) -> Result<bool> {
        Ok(self.committed.read().exchanges.iter().any(|row| {
            row.requested_by == requested_by && row.requested_to == requested_to && row.is_live()
        }))
    }
}

/// Write transaction of an [`InMemoryExchangeStore`].
///
/// Holds the store's writer lock until committed or dropped.
pub struct InMemoryTransaction {
    _guard: OwnedMutexGuard<()>,
    staged: MemoryState,
    committed: Arc<RwLock<MemoryState>>,
    failing_writes: Arc<Mutex<HashSet<ExchangeId>>>,
}

impl InMemoryTransaction {
    fn check_injected_failure(&self, id: ExchangeId) -> Result<()> {
        if self.failing_writes.lock().contains(&id) {
            return Err(ExchangeError::Internal(anyhow!(
                "injected write failure for exchange {}",
                id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BookAvailabilityGuard for InMemoryTransaction {
    async fn lock_books(&mut self, books: &[BookId]) -> Result<()> {
        // The writer lock already covers every book; only existence is checked.
        for book in books {
            self.staged.book(*book)?;
        }
        Ok(())
    }

    async fn is_eligible(&mut self, book: BookId) -> Result<bool> {
        Ok(self.staged.book(book)?.eligible)
    }

    async fn set_eligible(&mut self, book: BookId, eligible: bool) -> Result<()> {
        self.staged
            .books
            .get_mut(&book)
            .ok_or(ExchangeError::BookNotFound(book))?
            .eligible = eligible;
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn lock_pair(&mut self, _requested_by: UserId, _requested_to: UserId) -> Result<()> {
        Ok(())
    }

    async fn live_exchange_exists(
        &mut self,
        requested_by: UserId,
        requested_to: UserId,
    ) -> Result<bool> {
        Ok(self.staged.exchanges.iter().any(|row| {
            row.requested_by == requested_by && row.requested_to == requested_to && row.is_live()
        }))
    }

    async fn get_for_update(&mut self, id: ExchangeId) -> Result<Option<AnyExchange>> {
        self.staged
            .position(id)
            .map(|index| self.staged.resolve(&self.staged.exchanges[index]))
            .transpose()
    }

    async fn lock_holder_exists(&mut self, book: BookId, excluding: ExchangeId) -> Result<bool> {
        Ok(self
            .staged
            .exchanges
            .iter()
            .any(|row| row.id != excluding && row.references_book(book) && row.holds_book_lock()))
    }

    async fn insert(&mut self, exchange: &Exchange<Pending>) -> Result<()> {
        self.check_injected_failure(exchange.data.id)?;
        let row = ExchangeRow::from(&AnyExchange::from(exchange.clone()));
        if self.staged.position(row.id).is_some() {
            return Err(ExchangeError::Internal(anyhow!(
                "exchange {} already exists",
                row.id
            )));
        }
        self.staged.book(row.requested_book_id)?;
        self.staged.book(row.offered_book_id)?;
        self.staged.exchanges.push(row);
        Ok(())
    }

    async fn persist<T: ExchangeState + Clone>(&mut self, exchange: &Exchange<T>) -> Result<()>
    where
        AnyExchange: From<Exchange<T>>,
    {
        self.check_injected_failure(exchange.data.id)?;
        let row = ExchangeRow::from(&AnyExchange::from(exchange.clone()));
        let index = self
            .staged
            .position(row.id)
            .ok_or(ExchangeError::NotFoundOrForbidden(row.id))?;
        self.staged.exchanges[index] = row;
        Ok(())
    }

    async fn delete(&mut self, id: ExchangeId) -> Result<()> {
        self.check_injected_failure(id)?;
        let index = self
            .staged
            .position(id)
            .ok_or(ExchangeError::NotFoundOrForbidden(id))?;
        self.staged.exchanges.remove(index);
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        *self.committed.write() = self.staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::exchange::DeclineReason;
    use crate::domain::test_support::{sample_book, sample_data, seeded_store};

    #[tokio::test]
    async fn upsert_book_never_overwrites_eligibility() {
        let store = InMemoryExchangeStore::new();
        let mut book = sample_book(7, "Dune", "Alice");
        store.upsert_book(&book).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.set_eligible(book.id, false).await.unwrap();
        tx.commit().await.unwrap();

        book.title = "Dune Messiah".to_string();
        book.eligible = true;
        store.upsert_book(&book).await.unwrap();

        assert!(!store.is_eligible(book.id).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_book_is_reported() {
        let store = InMemoryExchangeStore::new();
        let err = store.is_eligible(BookId(42)).await.unwrap_err();
        assert!(matches!(err, ExchangeError::BookNotFound(BookId(42))));

        let mut tx = store.begin().await.unwrap();
        let err = tx.lock_books(&[BookId(42)]).await.unwrap_err();
        assert!(matches!(err, ExchangeError::BookNotFound(BookId(42))));
    }

    #[tokio::test]
    async fn queries_filter_by_party_book_and_status() {
        let data = sample_data();
        let store = seeded_store(&data).await;

        let mut tx = store.begin().await.unwrap();
        Exchange::<Pending>::create(data.clone(), &mut tx)
            .await
            .unwrap();
        assert!(
            tx.live_exchange_exists(data.requested_by, data.requested_to)
                .await
                .unwrap()
        );
        tx.commit().await.unwrap();

        assert!(
            store
                .live_exchange_exists(data.requested_by, data.requested_to)
                .await
                .unwrap()
        );
        // Ordered pair: the reverse direction is a different pair
        assert!(
            !store
                .live_exchange_exists(data.requested_to, data.requested_by)
                .await
                .unwrap()
        );

        assert_eq!(store.list_by_initiator(data.requested_by).await.unwrap().len(), 1);
        assert!(store.list_by_initiator(data.requested_to).await.unwrap().is_empty());
        assert_eq!(store.list_by_counterparty(data.requested_to).await.unwrap().len(), 1);
        assert_eq!(store.list_by_party(data.requested_to).await.unwrap().len(), 1);
        assert_eq!(
            store
                .list_by_book_and_party(data.offered_book.id, data.requested_by)
                .await
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            store
                .list_pending_referencing_book(data.offered_book.id)
                .await
                .unwrap()
                .len(),
            1
        );

        let mut tx = store.begin().await.unwrap();
        let pending = tx
            .get_for_update(data.id)
            .await
            .unwrap()
            .and_then(AnyExchange::into_pending)
            .unwrap();
        pending
            .decline(DeclineReason::Counterparty, &mut tx)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(
            store
                .list_pending_referencing_book(data.offered_book.id)
                .await
                .unwrap()
                .is_empty()
        );
        assert!(
            !store
                .live_exchange_exists(data.requested_by, data.requested_to)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn injected_failure_blocks_writes() {
        let data = sample_data();
        let store = seeded_store(&data).await;
        store.fail_writes_for(data.id);

        let mut tx = store.begin().await.unwrap();
        let err = Exchange::<Pending>::create(data.clone(), &mut tx)
            .await
            .unwrap_err();
        assert!(matches!(err, ExchangeError::Internal(_)));
        drop(tx);

        store.clear_write_failures();
        let mut tx = store.begin().await.unwrap();
        Exchange::<Pending>::create(data, &mut tx).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.exchange_count(), 1);
    }
}
