//! The exchange negotiation engine.
//!
//! One method per user action. Each write runs its preconditions and its state
//! change inside a single [`StoreTransaction`]; side effects (cascade declines and
//! notifications) run after that transaction has committed and are reported, never
//! rolled back, when they fail.

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;

use crate::config::EngineConfig;
use crate::domain::book::{Book, BookId, UserId};
use crate::domain::exchange::{
    AnyExchange, DeclineReason, Exchange, ExchangeData, ExchangeId, Party, Pending,
};
use crate::domain::redaction::ExchangeView;
use crate::error::{ExchangeError, PartialFailure, Result, SideEffectFailure};
use crate::manager::{BookAvailabilityGuard, ExchangeStore, StoreTransaction};
use crate::notification::NotificationSink;

mod cascade;

/// Input of [`ExchangeEngine::request_exchange`].
#[derive(Debug, Clone)]
pub struct NewExchange {
    /// The authenticated caller.
    pub initiator: UserId,
    pub counterparty: UserId,
    /// The book the initiator wants; must belong to `counterparty`.
    pub requested_book: Book,
    /// The book the initiator gives; must belong to `initiator`.
    pub offered_book: Book,
}

/// Drives exchange requests through their lifecycle.
///
/// Cheap to clone; clones share the store and the notification sink.
///
/// # Example
/// ```ignore
/// let engine = ExchangeEngine::new(Arc::new(store), Arc::new(LoggingNotificationSink));
/// let view = engine.request_exchange(NewExchange { .. }).await?;
/// engine.accept(view.id, counterparty).await?;
/// ```
pub struct ExchangeEngine<S: ExchangeStore, N: NotificationSink> {
    store: Arc<S>,
    notifier: Arc<N>,
    config: EngineConfig,
}

impl<S: ExchangeStore, N: NotificationSink> Clone for ExchangeEngine<S, N> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            notifier: self.notifier.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: ExchangeStore, N: NotificationSink> ExchangeEngine<S, N> {
    pub fn new(store: Arc<S>, notifier: Arc<N>) -> Self {
        Self {
            store,
            notifier,
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// Open a new request from `initiator` to `counterparty`.
    ///
    /// The duplicate check and the insert hold the ordered-pair lock, so two
    /// concurrent identical requests can never both succeed. Eligibility is read
    /// from the store under the book row locks; the `eligible` field of the
    /// caller's snapshots is ignored.
    ///
    /// Returns the new request as the initiator sees it.
    #[tracing::instrument(skip(self, request), fields(
        initiator = %request.initiator,
        counterparty = %request.counterparty,
        requested_book = %request.requested_book.id,
        offered_book = %request.offered_book.id,
    ))]
    pub async fn request_exchange(&self, request: NewExchange) -> Result<ExchangeView> {
        let NewExchange {
            initiator,
            counterparty,
            mut requested_book,
            mut offered_book,
        } = request;

        if initiator == counterparty {
            tracing::debug!("Rejected exchange request with self");
            return Err(ExchangeError::invalid(
                "cannot request an exchange with yourself",
            ));
        }
        if offered_book.owner.id != initiator {
            return Err(ExchangeError::invalid(
                "offered book does not belong to the initiator",
            ));
        }
        if requested_book.owner.id != counterparty {
            return Err(ExchangeError::invalid(
                "requested book does not belong to the counterparty",
            ));
        }

        let mut tx = self.store.begin().await?;
        tx.lock_pair(initiator, counterparty).await?;
        if tx.live_exchange_exists(initiator, counterparty).await? {
            tracing::debug!("Rejected duplicate exchange request");
            return Err(ExchangeError::conflict("duplicate request"));
        }

        let mut books = [requested_book.id, offered_book.id];
        books.sort();
        tx.lock_books(&books).await?;
        for book in [requested_book.id, offered_book.id] {
            if !tx.is_eligible(book).await? {
                tracing::debug!(book = %book, "Rejected exchange request for locked book");
                return Err(ExchangeError::conflict("book locked"));
            }
        }
        requested_book.eligible = true;
        offered_book.eligible = true;

        let data = ExchangeData {
            id: ExchangeId::new(),
            requested_by: initiator,
            requested_to: counterparty,
            requested_book,
            offered_book,
            created_at: Utc::now(),
        };
        let exchange = Exchange::<Pending>::create(data, &mut tx).await?;
        tx.commit().await?;

        let id = exchange.data.id;
        tracing::info!(exchange_id = %id, "Exchange request created");

        let message = format!(
            "You have new exchange request for your book {}.",
            exchange.data.requested_book.title
        );
        let view = AnyExchange::from(exchange).view_for(initiator);

        let failures = self.notify(counterparty, message).await.into_iter().collect();
        self.settle(id, Some(view.clone()), failures)?;
        Ok(view)
    }

    /// Accept a pending request. Only the counterparty may accept.
    ///
    /// Both books are locked and re-checked for eligibility before the status
    /// changes, so of two accepts racing for a shared book exactly one wins; the
    /// other fails with [`ExchangeError::Conflict`]. After the commit every other
    /// pending request referencing either book is declined.
    #[tracing::instrument(skip(self), fields(exchange_id = %id, actor = %actor))]
    pub async fn accept(&self, id: ExchangeId, actor: UserId) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let (exchange, party) = load_as(&mut tx, id, actor).await?;
        if party != Party::RequestedTo {
            tracing::debug!("Only the counterparty may accept");
            return Err(ExchangeError::NotFoundOrForbidden(id));
        }
        let pending = exchange
            .into_pending()
            .ok_or_else(|| ExchangeError::invalid("request already accepted or declined"))?;

        let books = pending.data.book_ids();
        tx.lock_books(&books).await?;
        for book in books {
            if !tx.is_eligible(book).await? {
                tracing::debug!(book = %book, "Book already locked by another exchange");
                return Err(ExchangeError::conflict("book locked"));
            }
        }

        let accepted = pending.accept(&mut tx).await?;
        tx.commit().await?;
        tracing::info!("Exchange request accepted");

        let mut failures = self.cascade_decline(&accepted.data).await;
        let message = format!(
            "Your Exchange Request For Book {} is accepted.",
            accepted.data.requested_book.title
        );
        failures.extend(self.notify(accepted.data.requested_by, message).await);

        self.settle(id, None, failures)
    }

    /// Decline a pending request. Only the counterparty may decline.
    #[tracing::instrument(skip(self), fields(exchange_id = %id, actor = %actor))]
    pub async fn decline(&self, id: ExchangeId, actor: UserId) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let (exchange, party) = load_as(&mut tx, id, actor).await?;
        if party != Party::RequestedTo {
            tracing::debug!("Only the counterparty may decline");
            return Err(ExchangeError::NotFoundOrForbidden(id));
        }
        let pending = exchange
            .into_pending()
            .ok_or_else(|| ExchangeError::invalid("request already accepted or declined"))?;

        let declined = pending.decline(DeclineReason::Counterparty, &mut tx).await?;
        tx.commit().await?;
        tracing::info!("Exchange request declined");

        let message = format!(
            "Your Exchange Request For Book {} is declined.",
            declined.data.requested_book.title
        );
        let failures = self
            .notify(declined.data.requested_by, message)
            .await
            .into_iter()
            .collect();
        self.settle(id, None, failures)
    }

    /// Confirm the hand-over of an accepted request on the caller's side.
    ///
    /// The request becomes exchanged once both parties have confirmed.
    #[tracing::instrument(skip(self), fields(exchange_id = %id, actor = %actor))]
    pub async fn confirm(&self, id: ExchangeId, actor: UserId) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let (exchange, party) = load_as(&mut tx, id, actor).await?;
        let accepted = match exchange {
            AnyExchange::Accepted(accepted) => accepted,
            AnyExchange::Exchanged(_) => {
                return Err(ExchangeError::invalid("request is already exchanged"));
            }
            AnyExchange::Declined(_) => {
                return Err(ExchangeError::invalid("request is already declined"));
            }
            AnyExchange::Pending(_) => {
                return Err(ExchangeError::invalid("request is not accepted"));
            }
        };

        let repeated = accepted.state.is_confirmed_by(party);
        let outcome = accepted.confirm(party, &mut tx).await?;
        tx.commit().await?;

        if repeated {
            tracing::debug!(party = ?party, "Side already confirmed");
            if !self.config.renotify_on_repeat_confirm {
                return Ok(());
            }
        } else if outcome.is_exchanged() {
            tracing::info!("Exchange completed");
        } else {
            tracing::info!(party = ?party, "Exchange confirmed by one side");
        }

        let data = outcome.data();
        let message = format!("{} confirmed the exchange request.", data.first_name(party));
        let recipient = data.user(party.other());
        let failures = self.notify(recipient, message).await.into_iter().collect();
        self.settle(id, None, failures)
    }

    /// Remove a pending or declined request. Only the initiator may delete.
    ///
    /// A referenced book that is ineligible becomes eligible again, unless another
    /// accepted or exchanged request still holds it.
    #[tracing::instrument(skip(self), fields(exchange_id = %id, actor = %actor))]
    pub async fn delete(&self, id: ExchangeId, actor: UserId) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let (exchange, party) = load_as(&mut tx, id, actor).await?;
        if party != Party::RequestedBy {
            tracing::debug!("Only the initiator may delete");
            return Err(ExchangeError::NotFoundOrForbidden(id));
        }

        let books = exchange.data().book_ids();
        tx.lock_books(&books).await?;

        match exchange {
            AnyExchange::Pending(pending) => pending.delete(&mut tx).await?,
            AnyExchange::Declined(declined) => declined.delete(&mut tx).await?,
            AnyExchange::Accepted(_) | AnyExchange::Exchanged(_) => {
                return Err(ExchangeError::invalid(
                    "only pending requests can be deleted",
                ));
            }
        };

        let mut released = Vec::new();
        for book in books {
            if !tx.is_eligible(book).await? && !tx.lock_holder_exists(book, id).await? {
                tx.set_eligible(book, true).await?;
                released.push(book);
            }
        }
        tx.commit().await?;

        tracing::info!(released_books = ?released, "Exchange request deleted");
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// A single request, if `viewer` is one of its parties.
    #[tracing::instrument(skip(self), fields(exchange_id = %id, viewer = %viewer))]
    pub async fn get(&self, id: ExchangeId, viewer: UserId) -> Result<ExchangeView> {
        match self.store.get_exchange(id).await? {
            Some(exchange) if exchange.data().is_participant(viewer) => {
                Ok(exchange.view_for(viewer))
            }
            _ => Err(ExchangeError::NotFoundOrForbidden(id)),
        }
    }

    /// Requests `viewer` initiated.
    #[tracing::instrument(skip(self), fields(viewer = %viewer))]
    pub async fn list_sent(&self, viewer: UserId) -> Result<Vec<ExchangeView>> {
        let exchanges = self.store.list_by_initiator(viewer).await?;
        Ok(views_for(exchanges, viewer))
    }

    /// Requests addressed to `viewer`.
    #[tracing::instrument(skip(self), fields(viewer = %viewer))]
    pub async fn list_received(&self, viewer: UserId) -> Result<Vec<ExchangeView>> {
        let exchanges = self.store.list_by_counterparty(viewer).await?;
        Ok(views_for(exchanges, viewer))
    }

    /// Every request `viewer` is a party to.
    #[tracing::instrument(skip(self), fields(viewer = %viewer))]
    pub async fn list_for_user(&self, viewer: UserId) -> Result<Vec<ExchangeView>> {
        let exchanges = self.store.list_by_party(viewer).await?;
        Ok(views_for(exchanges, viewer))
    }

    /// Requests referencing `book` that `viewer` is a party to.
    #[tracing::instrument(skip(self), fields(book = %book, viewer = %viewer))]
    pub async fn list_for_book(&self, book: BookId, viewer: UserId) -> Result<Vec<ExchangeView>> {
        let exchanges = self.store.list_by_book_and_party(book, viewer).await?;
        Ok(views_for(exchanges, viewer))
    }

    // ========================================================================
    // Side effects
    // ========================================================================

    async fn notify(&self, recipient: UserId, message: String) -> Option<SideEffectFailure> {
        match self
            .notifier
            .send(recipient, &self.config.notification_category, &message)
            .await
        {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!(recipient = %recipient, error = %e, "Failed to send notification");
                Some(SideEffectFailure::Notification {
                    recipient,
                    error: e.to_string(),
                })
            }
        }
    }

    /// Turn the failures collected after a commit into the operation's result.
    fn settle(
        &self,
        exchange_id: ExchangeId,
        view: Option<ExchangeView>,
        failures: Vec<SideEffectFailure>,
    ) -> Result<()> {
        if failures.is_empty() {
            return Ok(());
        }
        for failure in &failures {
            counter!("bookswap_side_effect_failures_total", "kind" => failure.kind())
                .increment(1);
        }
        tracing::warn!(
            exchange_id = %exchange_id,
            failed = failures.len(),
            "Exchange request committed with failed side effects"
        );
        Err(ExchangeError::PartiallyApplied(Box::new(PartialFailure {
            exchange_id,
            view,
            failures,
        })))
    }
}

/// Load a request under lock and work out which side `actor` is on.
///
/// Missing requests and non-participants produce the same error.
async fn load_as<T: StoreTransaction>(
    tx: &mut T,
    id: ExchangeId,
    actor: UserId,
) -> Result<(AnyExchange, Party)> {
    let exchange = tx
        .get_for_update(id)
        .await?
        .ok_or(ExchangeError::NotFoundOrForbidden(id))?;
    let party = exchange
        .data()
        .party(actor)
        .ok_or(ExchangeError::NotFoundOrForbidden(id))?;
    Ok((exchange, party))
}

fn views_for(exchanges: Vec<AnyExchange>, viewer: UserId) -> Vec<ExchangeView> {
    exchanges
        .iter()
        .map(|exchange| exchange.view_for(viewer))
        .collect()
}
