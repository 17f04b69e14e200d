//! State transitions for exchange requests using the typestate pattern.
//!
//! ```text
//! create() ──> Exchange<Pending> ──accept()──> Exchange<Accepted> ──confirm()──> Exchange<Accepted>
//!                    │                                                  └──confirm()──> Exchange<Exchanged>
//!                    ├──decline()──> Exchange<Declined> ──delete()──> (removed)
//!                    └──delete()──> (removed)
//! ```
//!
//! Every transition writes through a [`StoreTransaction`], so the status change and
//! any book eligibility change commit (or roll back) together. Precondition checks
//! that depend on who is calling live in the engine; the types here only guarantee
//! that a transition is legal for the current state.
//!
//! ## Pending → Accepted
//!
//! Both referenced books are marked ineligible in the same transaction.
//!
//! ## Accepted → Accepted | Exchanged
//!
//! A confirmation sets one party's flag. The request only becomes `Exchanged` when
//! the second flag is set, so a single confirmation can never complete an exchange.

use chrono::Utc;
use metrics::counter;

use crate::error::Result;
use crate::manager::StoreTransaction;

use super::state::{
    Accepted, ConfirmOutcome, DeclineReason, Declined, Exchange, ExchangeData, Exchanged, Party,
    Pending,
};

impl Exchange<Pending> {
    /// Insert a brand new pending request.
    pub async fn create<T: StoreTransaction>(
        data: ExchangeData,
        tx: &mut T,
    ) -> Result<Exchange<Pending>> {
        let exchange = Exchange {
            state: Pending {},
            data,
        };
        tx.insert(&exchange).await?;
        counter!("bookswap_exchange_transitions_total", "transition" => "created").increment(1);
        Ok(exchange)
    }

    pub async fn accept<T: StoreTransaction>(self, tx: &mut T) -> Result<Exchange<Accepted>> {
        let mut data = self.data;

        for book in data.book_ids() {
            tx.set_eligible(book, false).await?;
        }
        data.requested_book.eligible = false;
        data.offered_book.eligible = false;

        let exchange = Exchange {
            data,
            state: Accepted {
                accepted_at: Utc::now(),
                requested_by_confirmed: false,
                requested_to_confirmed: false,
            },
        };
        tx.persist(&exchange).await?;
        counter!("bookswap_exchange_transitions_total", "transition" => "accepted").increment(1);
        Ok(exchange)
    }

    pub async fn decline<T: StoreTransaction>(
        self,
        reason: DeclineReason,
        tx: &mut T,
    ) -> Result<Exchange<Declined>> {
        let exchange = Exchange {
            data: self.data,
            state: Declined {
                declined_at: Utc::now(),
                reason,
            },
        };
        tx.persist(&exchange).await?;
        let transition = match reason {
            DeclineReason::Counterparty => "declined",
            DeclineReason::Superseded { .. } => "superseded",
        };
        counter!("bookswap_exchange_transitions_total", "transition" => transition).increment(1);
        Ok(exchange)
    }

    pub async fn delete<T: StoreTransaction>(self, tx: &mut T) -> Result<ExchangeData> {
        tx.delete(self.data.id).await?;
        counter!("bookswap_exchange_transitions_total", "transition" => "deleted").increment(1);
        Ok(self.data)
    }
}

impl Exchange<Declined> {
    pub async fn delete<T: StoreTransaction>(self, tx: &mut T) -> Result<ExchangeData> {
        tx.delete(self.data.id).await?;
        counter!("bookswap_exchange_transitions_total", "transition" => "deleted").increment(1);
        Ok(self.data)
    }
}

impl Exchange<Accepted> {
    /// Record `party`'s confirmation.
    ///
    /// Confirming a side that is already confirmed persists nothing and returns the
    /// request unchanged.
    pub async fn confirm<T: StoreTransaction>(
        self,
        party: Party,
        tx: &mut T,
    ) -> Result<ConfirmOutcome> {
        if self.state.is_confirmed_by(party) {
            return Ok(ConfirmOutcome::Accepted(self));
        }

        let mut state = self.state;
        match party {
            Party::RequestedBy => state.requested_by_confirmed = true,
            Party::RequestedTo => state.requested_to_confirmed = true,
        }

        if state.requested_by_confirmed && state.requested_to_confirmed {
            let exchange = Exchange {
                data: self.data,
                state: Exchanged {
                    accepted_at: state.accepted_at,
                    exchanged_at: Utc::now(),
                },
            };
            tx.persist(&exchange).await?;
            counter!("bookswap_exchange_transitions_total", "transition" => "exchanged")
                .increment(1);
            Ok(ConfirmOutcome::Exchanged(exchange))
        } else {
            let exchange = Exchange {
                data: self.data,
                state,
            };
            tx.persist(&exchange).await?;
            counter!("bookswap_exchange_transitions_total", "transition" => "confirmed")
                .increment(1);
            Ok(ConfirmOutcome::Accepted(exchange))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::exchange::{AnyExchange, ExchangeStatus};
    use crate::domain::test_support::{sample_data, seeded_store};
    use crate::manager::{BookAvailabilityGuard, ExchangeStore};

    #[tokio::test]
    async fn accept_locks_both_books_in_one_commit() {
        let data = sample_data();
        let store = seeded_store(&data).await;

        let mut tx = store.begin().await.unwrap();
        let pending = Exchange::<Pending>::create(data.clone(), &mut tx).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let accepted = pending.accept(&mut tx).await.unwrap();
        assert!(!accepted.data.requested_book.eligible);
        assert!(!accepted.data.offered_book.eligible);

        // Nothing visible before commit
        assert!(store.is_eligible(data.requested_book.id).await.unwrap());
        tx.commit().await.unwrap();

        assert!(!store.is_eligible(data.requested_book.id).await.unwrap());
        assert!(!store.is_eligible(data.offered_book.id).await.unwrap());
        let stored = store.get_exchange(data.id).await.unwrap().unwrap();
        assert_eq!(stored.status(), ExchangeStatus::Accepted);
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back_accept() {
        let data = sample_data();
        let store = seeded_store(&data).await;

        let mut tx = store.begin().await.unwrap();
        let pending = Exchange::<Pending>::create(data.clone(), &mut tx).await.unwrap();
        tx.commit().await.unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            pending.accept(&mut tx).await.unwrap();
            assert!(!tx.is_eligible(data.offered_book.id).await.unwrap());
        }

        assert!(store.is_eligible(data.offered_book.id).await.unwrap());
        assert!(store.get_exchange(data.id).await.unwrap().unwrap().is_pending());
    }

    #[tokio::test]
    async fn single_confirmation_never_completes_exchange() {
        let data = sample_data();
        let store = seeded_store(&data).await;

        let mut tx = store.begin().await.unwrap();
        let accepted = Exchange::<Pending>::create(data.clone(), &mut tx)
            .await
            .unwrap()
            .accept(&mut tx)
            .await
            .unwrap();

        let outcome = accepted.confirm(Party::RequestedBy, &mut tx).await.unwrap();
        let ConfirmOutcome::Accepted(accepted) = outcome else {
            panic!("one confirmation must not complete the exchange");
        };
        assert!(accepted.state.requested_by_confirmed);
        assert!(!accepted.state.requested_to_confirmed);

        // Same side again changes nothing
        let outcome = accepted.confirm(Party::RequestedBy, &mut tx).await.unwrap();
        let ConfirmOutcome::Accepted(accepted) = outcome else {
            panic!("repeat confirmation must not complete the exchange");
        };

        let outcome = accepted.confirm(Party::RequestedTo, &mut tx).await.unwrap();
        assert!(outcome.is_exchanged());
        tx.commit().await.unwrap();

        let stored = store.get_exchange(data.id).await.unwrap().unwrap();
        assert!(matches!(stored, AnyExchange::Exchanged(_)));
        assert!(stored.requested_by_confirmed() && stored.requested_to_confirmed());
    }

    #[tokio::test]
    async fn delete_removes_record() {
        let data = sample_data();
        let store = seeded_store(&data).await;

        let mut tx = store.begin().await.unwrap();
        let declined = Exchange::<Pending>::create(data.clone(), &mut tx)
            .await
            .unwrap()
            .decline(DeclineReason::Counterparty, &mut tx)
            .await
            .unwrap();
        let removed = declined.delete(&mut tx).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(removed.id, data.id);
        assert!(store.get_exchange(data.id).await.unwrap().is_none());
    }
}
