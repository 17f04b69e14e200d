//! Viewer-dependent presentation of exchange requests.
//!
//! Every request handed back to a caller goes through [`ExchangeView::for_viewer`].
//! Redaction only ever touches the view, never the stored record.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::book::{Book, UserId};
use super::exchange::{AnyExchange, DeclineReason, ExchangeId, ExchangeStatus, Party};

/// An exchange request as seen by one particular user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExchangeView {
    pub id: ExchangeId,
    pub requested_by: UserId,
    pub requested_to: UserId,
    pub requested_book: Book,
    pub offered_book: Book,
    pub status: ExchangeStatus,
    pub requested_by_confirmed: bool,
    pub requested_to_confirmed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decline_reason: Option<DeclineReason>,
    pub created_at: DateTime<Utc>,
}

impl ExchangeView {
    /// Build the view of `exchange` for `viewer`.
    ///
    /// Until the request is accepted, owner roles are stripped from both books and
    /// the viewer does not see the contact details and precise pickup point of the
    /// other party's book; their own book is shown as is. From acceptance onwards
    /// redaction is skipped and both parties see everything.
    pub fn for_viewer(exchange: &AnyExchange, viewer: UserId) -> Self {
        let data = exchange.data();
        let mut view = ExchangeView {
            id: data.id,
            requested_by: data.requested_by,
            requested_to: data.requested_to,
            requested_book: data.requested_book.clone(),
            offered_book: data.offered_book.clone(),
            status: exchange.status(),
            requested_by_confirmed: exchange.requested_by_confirmed(),
            requested_to_confirmed: exchange.requested_to_confirmed(),
            decline_reason: exchange.decline_reason(),
            created_at: data.created_at,
        };

        if exchange.shares_contact_details() {
            return view;
        }

        view.requested_book.owner.role = None;
        view.offered_book.owner.role = None;

        match data.party(viewer) {
            Some(Party::RequestedBy) => hide_contact(&mut view.requested_book),
            Some(Party::RequestedTo) => hide_contact(&mut view.offered_book),
            None => {}
        }
        view
    }
}

fn hide_contact(book: &mut Book) {
    book.owner.email = None;
    book.owner.phone = None;
    book.pickup_location.coordinates = None;
}

impl AnyExchange {
    pub fn view_for(&self, viewer: UserId) -> ExchangeView {
        ExchangeView::for_viewer(self, viewer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::exchange::{Accepted, Declined, Exchange, Pending};
    use crate::domain::test_support::sample_data;

    fn pending() -> AnyExchange {
        AnyExchange::from(Exchange {
            state: Pending {},
            data: sample_data(),
        })
    }

    #[test]
    fn initiator_does_not_see_counterparty_contact() {
        let exchange = pending();
        let view = exchange.view_for(exchange.data().requested_by);

        assert_eq!(view.requested_book.owner.email, None);
        assert_eq!(view.requested_book.owner.phone, None);
        assert_eq!(view.requested_book.pickup_location.coordinates, None);
        // Address stays visible
        assert!(!view.requested_book.pickup_location.address.is_empty());

        // Own book untouched apart from the role
        assert!(view.offered_book.owner.email.is_some());
        assert!(view.offered_book.pickup_location.coordinates.is_some());
        assert_eq!(view.offered_book.owner.role, None);
        assert_eq!(view.requested_book.owner.role, None);
    }

    #[test]
    fn counterparty_does_not_see_initiator_contact() {
        let exchange = pending();
        let view = exchange.view_for(exchange.data().requested_to);

        assert_eq!(view.offered_book.owner.email, None);
        assert_eq!(view.offered_book.pickup_location.coordinates, None);
        assert!(view.requested_book.owner.phone.is_some());
        assert!(view.requested_book.pickup_location.coordinates.is_some());
    }

    #[test]
    fn declined_requests_stay_redacted() {
        let data = sample_data();
        let viewer = data.requested_by;
        let exchange = AnyExchange::from(Exchange {
            state: Declined {
                declined_at: Utc::now(),
                reason: DeclineReason::Counterparty,
            },
            data,
        });
        let view = exchange.view_for(viewer);
        assert_eq!(view.requested_book.owner.email, None);
        assert_eq!(view.decline_reason, Some(DeclineReason::Counterparty));
    }

    #[test]
    fn accepted_requests_share_everything() {
        let data = sample_data();
        let viewer = data.requested_by;
        let exchange = AnyExchange::from(Exchange {
            state: Accepted {
                accepted_at: Utc::now(),
                requested_by_confirmed: false,
                requested_to_confirmed: false,
            },
            data: data.clone(),
        });
        let view = exchange.view_for(viewer);
        assert_eq!(view.requested_book, data.requested_book);
        assert_eq!(view.offered_book, data.offered_book);
    }

    #[test]
    fn redaction_never_touches_the_record() {
        let exchange = pending();
        let _ = exchange.view_for(exchange.data().requested_by);
        assert!(exchange.data().requested_book.owner.email.is_some());
        assert!(exchange.data().requested_book.owner.role.is_some());
    }
}
