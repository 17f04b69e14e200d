//! Flat, storage-shaped exchange record shared by the store implementations.
//!
//! The stored row only references books by id; books are resolved to their current
//! snapshot whenever a request is read.

use anyhow::anyhow;
use chrono::{DateTime, Utc};

use crate::domain::book::{Book, BookId, UserId};
use crate::domain::exchange::{
    Accepted, AnyExchange, DeclineReason, Declined, Exchange, ExchangeData, ExchangeId,
    ExchangeStatus, Exchanged, Pending,
};
use crate::error::{ExchangeError, Result};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ExchangeRow {
    pub id: ExchangeId,
    pub requested_by: UserId,
    pub requested_to: UserId,
    pub requested_book_id: BookId,
    pub offered_book_id: BookId,
    pub status: ExchangeStatus,
    pub requested_by_confirmed: bool,
    pub requested_to_confirmed: bool,
    pub decline_reason: Option<DeclineReason>,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub declined_at: Option<DateTime<Utc>>,
    pub exchanged_at: Option<DateTime<Utc>>,
}

impl ExchangeRow {
    pub fn is_live(&self) -> bool {
        matches!(
            self.status,
            ExchangeStatus::Pending | ExchangeStatus::Accepted
        )
    }

    pub fn holds_book_lock(&self) -> bool {
        self.status == ExchangeStatus::Accepted
    }

    pub fn references_book(&self, book: BookId) -> bool {
        self.requested_book_id == book || self.offered_book_id == book
    }

    pub fn is_participant(&self, user: UserId) -> bool {
        self.requested_by == user || self.requested_to == user
    }

    /// Rebuild the typed request from the row and the current book snapshots.
    pub fn into_exchange(self, requested_book: Book, offered_book: Book) -> Result<AnyExchange> {
        let missing = |column: &str| {
            ExchangeError::Internal(anyhow!(
                "exchange {} has status '{}' but no {}",
                self.id,
                self.status,
                column
            ))
        };

        let data = ExchangeData {
            id: self.id,
            requested_by: self.requested_by,
            requested_to: self.requested_to,
            requested_book,
            offered_book,
            created_at: self.created_at,
        };

        Ok(match self.status {
            ExchangeStatus::Pending => AnyExchange::Pending(Exchange {
                state: Pending {},
                data,
            }),
            ExchangeStatus::Accepted => AnyExchange::Accepted(Exchange {
                state: Accepted {
                    accepted_at: self.accepted_at.ok_or_else(|| missing("accepted_at"))?,
                    requested_by_confirmed: self.requested_by_confirmed,
                    requested_to_confirmed: self.requested_to_confirmed,
                },
                data,
            }),
            ExchangeStatus::Declined => AnyExchange::Declined(Exchange {
                state: Declined {
                    declined_at: self.declined_at.ok_or_else(|| missing("declined_at"))?,
                    reason: self.decline_reason.ok_or_else(|| missing("decline_reason"))?,
                },
                data,
            }),
            ExchangeStatus::Exchanged => AnyExchange::Exchanged(Exchange {
                state: Exchanged {
                    accepted_at: self.accepted_at.ok_or_else(|| missing("accepted_at"))?,
                    exchanged_at: self.exchanged_at.ok_or_else(|| missing("exchanged_at"))?,
                },
                data,
            }),
        })
    }
}

impl From<&AnyExchange> for ExchangeRow {
    fn from(exchange: &AnyExchange) -> Self {
        let data = exchange.data();
        let mut row = ExchangeRow {
            id: data.id,
            requested_by: data.requested_by,
            requested_to: data.requested_to,
            requested_book_id: data.requested_book.id,
            offered_book_id: data.offered_book.id,
            status: exchange.status(),
            requested_by_confirmed: exchange.requested_by_confirmed(),
            requested_to_confirmed: exchange.requested_to_confirmed(),
            decline_reason: exchange.decline_reason(),
            created_at: data.created_at,
            accepted_at: None,
            declined_at: None,
            exchanged_at: None,
        };
        match exchange {
            AnyExchange::Pending(_) => {}
            AnyExchange::Accepted(e) => row.accepted_at = Some(e.state.accepted_at),
            AnyExchange::Declined(e) => row.declined_at = Some(e.state.declined_at),
            AnyExchange::Exchanged(e) => {
                row.accepted_at = Some(e.state.accepted_at);
                row.exchanged_at = Some(e.state.exchanged_at);
            }
        }
        row
    }
}
