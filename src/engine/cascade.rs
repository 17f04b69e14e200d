//! Declining the rivals of a freshly accepted request.
//!
//! Runs after the accept has committed. Each rival is declined in its own
//! transaction, so one failure leaves the others declined and the accepted
//! request untouched.

use std::collections::HashSet;

use futures::future::join_all;
use metrics::counter;

use super::ExchangeEngine;
use crate::domain::exchange::{
    AnyExchange, DeclineReason, Exchange, ExchangeData, ExchangeId, Pending,
};
use crate::error::{Result, SideEffectFailure};
use crate::manager::{ExchangeStore, StoreTransaction};
use crate::notification::NotificationSink;

impl<S: ExchangeStore, N: NotificationSink> ExchangeEngine<S, N> {
    /// Decline every pending request that references a book of `accepted`, then
    /// tell each rival's initiator.
    pub(super) async fn cascade_decline(&self, accepted: &ExchangeData) -> Vec<SideEffectFailure> {
        let mut failures = Vec::new();
        let mut seen = HashSet::from([accepted.id]);
        let mut rivals: Vec<Exchange<Pending>> = Vec::new();

        for book in accepted.book_ids() {
            match self.store.list_pending_referencing_book(book).await {
                Ok(found) => rivals.extend(found.into_iter().filter(|r| seen.insert(r.data.id))),
                Err(e) => {
                    tracing::warn!(book = %book, error = %e, "Failed to look up rival requests");
                    failures.push(SideEffectFailure::CascadeLookup {
                        book,
                        error: e.to_string(),
                    });
                }
            }
        }

        let mut declined = Vec::new();
        for rival in rivals {
            let rival_id = rival.data.id;
            match self.decline_superseded(rival_id, accepted.id).await {
                Ok(Some(data)) => declined.push(data),
                Ok(None) => {
                    tracing::debug!(rival = %rival_id, "Rival no longer pending");
                }
                Err(e) => {
                    tracing::warn!(rival = %rival_id, error = %e, "Failed to decline rival request");
                    failures.push(SideEffectFailure::CascadeDecline {
                        exchange_id: rival_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        if !declined.is_empty() {
            tracing::info!(count = declined.len(), "Declined rival exchange requests");
            counter!("bookswap_cascade_declines_total").increment(declined.len() as u64);
        }

        let notifications = declined.iter().map(|data| {
            let message = format!(
                "Your Exchange Request For Book {} is declined.",
                data.requested_book.title
            );
            self.notify(data.requested_by, message)
        });
        failures.extend(join_all(notifications).await.into_iter().flatten());

        failures
    }

    /// Decline `rival` in its own transaction if it is still pending.
    async fn decline_superseded(
        &self,
        rival: ExchangeId,
        by: ExchangeId,
    ) -> Result<Option<ExchangeData>> {
        let mut tx = self.store.begin().await?;
        let pending = match tx.get_for_update(rival).await? {
            Some(AnyExchange::Pending(pending)) => pending,
            Some(_) | None => return Ok(None),
        };

        let declined = pending
            .decline(DeclineReason::Superseded { by }, &mut tx)
            .await?;
        tx.commit().await?;
        Ok(Some(declined.data))
    }
}
