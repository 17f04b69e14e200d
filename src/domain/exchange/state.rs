//! Exchange request types using the typestate pattern.
//!
//! Each exchange request progresses through distinct states, enforced at compile
//! time. Transitions live in [`super::transitions`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::book::{Book, BookId, UserId};

/// Status values as stored in the `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeStatus {
    Pending,
    Accepted,
    Declined,
    Exchanged,
}

impl ExchangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeStatus::Pending => "pending",
            ExchangeStatus::Accepted => "accepted",
            ExchangeStatus::Declined => "declined",
            ExchangeStatus::Exchanged => "exchanged",
        }
    }
}

impl std::fmt::Display for ExchangeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExchangeStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ExchangeStatus::Pending),
            "accepted" => Ok(ExchangeStatus::Accepted),
            "declined" => Ok(ExchangeStatus::Declined),
            "exchanged" => Ok(ExchangeStatus::Exchanged),
            other => Err(format!("unknown exchange status '{}'", other)),
        }
    }
}

/// Marker trait for valid exchange states.
pub trait ExchangeState: Send + Sync {}

/// An exchange request between two book owners.
///
/// The generic parameter `T` is the current state of the request; only the
/// transitions valid for that state are available on it.
#[derive(Debug, Clone, Serialize)]
pub struct Exchange<T: ExchangeState> {
    /// The current state of the request.
    pub state: T,
    /// The parties and books, fixed at creation.
    pub data: ExchangeData,
}

/// Immutable part of an exchange request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExchangeData {
    pub id: ExchangeId,
    /// The initiator.
    pub requested_by: UserId,
    /// The counterparty, owner of `requested_book`.
    pub requested_to: UserId,
    /// Book the initiator wants; owned by `requested_to`.
    pub requested_book: Book,
    /// Book the initiator gives in return; owned by `requested_by`.
    pub offered_book: Book,
    pub created_at: DateTime<Utc>,
}

impl ExchangeData {
    /// Which side of the exchange `user` is on, if any.
    pub fn party(&self, user: UserId) -> Option<Party> {
        if user == self.requested_by {
            Some(Party::RequestedBy)
        } else if user == self.requested_to {
            Some(Party::RequestedTo)
        } else {
            None
        }
    }

    pub fn is_participant(&self, user: UserId) -> bool {
        self.party(user).is_some()
    }

    /// Both referenced books, in ascending id order (the row lock order).
    pub fn book_ids(&self) -> [BookId; 2] {
        let (a, b) = (self.requested_book.id, self.offered_book.id);
        if a <= b { [a, b] } else { [b, a] }
    }

    pub fn references_book(&self, book: BookId) -> bool {
        self.requested_book.id == book || self.offered_book.id == book
    }

    /// User id of the given side.
    pub fn user(&self, party: Party) -> UserId {
        match party {
            Party::RequestedBy => self.requested_by,
            Party::RequestedTo => self.requested_to,
        }
    }

    /// First name of the given side, taken from the book that side owns.
    pub fn first_name(&self, party: Party) -> &str {
        match party {
            Party::RequestedBy => &self.offered_book.owner.first_name,
            Party::RequestedTo => &self.requested_book.owner.first_name,
        }
    }
}

/// One side of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    RequestedBy,
    RequestedTo,
}

impl Party {
    pub fn other(self) -> Party {
        match self {
            Party::RequestedBy => Party::RequestedTo,
            Party::RequestedTo => Party::RequestedBy,
        }
    }
}

// ============================================================================
// Exchange States
// ============================================================================

/// Waiting for the counterparty to accept or decline.
#[derive(Debug, Clone, Serialize)]
pub struct Pending {}

impl ExchangeState for Pending {}

/// Accepted by the counterparty; both books are locked. Waiting for both parties
/// to confirm the hand-over.
#[derive(Debug, Clone, Serialize)]
pub struct Accepted {
    pub accepted_at: DateTime<Utc>,
    pub requested_by_confirmed: bool,
    pub requested_to_confirmed: bool,
}

impl Accepted {
    pub fn is_confirmed_by(&self, party: Party) -> bool {
        match party {
            Party::RequestedBy => self.requested_by_confirmed,
            Party::RequestedTo => self.requested_to_confirmed,
        }
    }
}

impl ExchangeState for Accepted {}

/// Why a request ended up declined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeclineReason {
    /// The counterparty declined it.
    Counterparty,
    /// Another request referencing one of its books was accepted.
    Superseded { by: ExchangeId },
}

/// Declined, either explicitly or by cascade. Terminal apart from deletion.
#[derive(Debug, Clone, Serialize)]
pub struct Declined {
    pub declined_at: DateTime<Utc>,
    pub reason: DeclineReason,
}

impl ExchangeState for Declined {}

/// Both parties confirmed the hand-over. Terminal.
#[derive(Debug, Clone, Serialize)]
pub struct Exchanged {
    pub accepted_at: DateTime<Utc>,
    pub exchanged_at: DateTime<Utc>,
}

impl ExchangeState for Exchanged {}

/// Unique identifier for an exchange request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExchangeId(pub Uuid);

impl ExchangeId {
    pub fn new() -> Self {
        ExchangeId(Uuid::new_v4())
    }
}

impl Default for ExchangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for ExchangeId {
    fn from(uuid: Uuid) -> Self {
        ExchangeId(uuid)
    }
}

impl std::ops::Deref for ExchangeId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ============================================================================
// Unified Exchange Representation
// ============================================================================

/// Result of a confirmation: either still waiting on the other side, or done.
#[derive(Debug)]
pub enum ConfirmOutcome {
    Accepted(Exchange<Accepted>),
    Exchanged(Exchange<Exchanged>),
}

impl ConfirmOutcome {
    pub fn data(&self) -> &ExchangeData {
        match self {
            ConfirmOutcome::Accepted(e) => &e.data,
            ConfirmOutcome::Exchanged(e) => &e.data,
        }
    }

    pub fn is_exchanged(&self) -> bool {
        matches!(self, ConfirmOutcome::Exchanged(_))
    }
}

/// Enum that can hold an exchange request in any state.
///
/// Used for storage and read paths where requests are handled uniformly.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", content = "request", rename_all = "lowercase")]
pub enum AnyExchange {
    Pending(Exchange<Pending>),
    Accepted(Exchange<Accepted>),
    Declined(Exchange<Declined>),
    Exchanged(Exchange<Exchanged>),
}

impl AnyExchange {
    pub fn id(&self) -> ExchangeId {
        self.data().id
    }

    pub fn status(&self) -> ExchangeStatus {
        match self {
            AnyExchange::Pending(_) => ExchangeStatus::Pending,
            AnyExchange::Accepted(_) => ExchangeStatus::Accepted,
            AnyExchange::Declined(_) => ExchangeStatus::Declined,
            AnyExchange::Exchanged(_) => ExchangeStatus::Exchanged,
        }
    }

    pub fn data(&self) -> &ExchangeData {
        match self {
            AnyExchange::Pending(e) => &e.data,
            AnyExchange::Accepted(e) => &e.data,
            AnyExchange::Declined(e) => &e.data,
            AnyExchange::Exchanged(e) => &e.data,
        }
    }

    pub fn requested_by_confirmed(&self) -> bool {
        match self {
            AnyExchange::Accepted(e) => e.state.requested_by_confirmed,
            AnyExchange::Exchanged(_) => true,
            AnyExchange::Pending(_) | AnyExchange::Declined(_) => false,
        }
    }

    pub fn requested_to_confirmed(&self) -> bool {
        match self {
            AnyExchange::Accepted(e) => e.state.requested_to_confirmed,
            AnyExchange::Exchanged(_) => true,
            AnyExchange::Pending(_) | AnyExchange::Declined(_) => false,
        }
    }

    pub fn decline_reason(&self) -> Option<DeclineReason> {
        match self {
            AnyExchange::Declined(e) => Some(e.state.reason),
            _ => None,
        }
    }

    /// Pending or Accepted: counts against the one-live-request-per-pair rule.
    pub fn is_live(&self) -> bool {
        matches!(self, AnyExchange::Pending(_) | AnyExchange::Accepted(_))
    }

    /// Accepted: the only state that keeps its books out of other requests.
    pub fn holds_book_lock(&self) -> bool {
        matches!(self, AnyExchange::Accepted(_))
    }

    /// Full contact details are shared once the counterparty has accepted.
    pub fn shares_contact_details(&self) -> bool {
        matches!(self, AnyExchange::Accepted(_) | AnyExchange::Exchanged(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, AnyExchange::Pending(_))
    }

    pub fn into_pending(self) -> Option<Exchange<Pending>> {
        match self {
            AnyExchange::Pending(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_accepted(self) -> Option<Exchange<Accepted>> {
        match self {
            AnyExchange::Accepted(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Exchange<Pending>> for AnyExchange {
    fn from(e: Exchange<Pending>) -> Self {
        AnyExchange::Pending(e)
    }
}

impl From<Exchange<Accepted>> for AnyExchange {
    fn from(e: Exchange<Accepted>) -> Self {
        AnyExchange::Accepted(e)
    }
}

impl From<Exchange<Declined>> for AnyExchange {
    fn from(e: Exchange<Declined>) -> Self {
        AnyExchange::Declined(e)
    }
}

impl From<Exchange<Exchanged>> for AnyExchange {
    fn from(e: Exchange<Exchanged>) -> Self {
        AnyExchange::Exchanged(e)
    }
}

impl From<ConfirmOutcome> for AnyExchange {
    fn from(outcome: ConfirmOutcome) -> Self {
        match outcome {
            ConfirmOutcome::Accepted(e) => e.into(),
            ConfirmOutcome::Exchanged(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::test_support::sample_data;

    #[test]
    fn status_round_trips_through_column_values() {
        for status in [
            ExchangeStatus::Pending,
            ExchangeStatus::Accepted,
            ExchangeStatus::Declined,
            ExchangeStatus::Exchanged,
        ] {
            assert_eq!(status.as_str().parse::<ExchangeStatus>(), Ok(status));
        }
        assert!("cancelled".parse::<ExchangeStatus>().is_err());
    }

    #[test]
    fn party_lookup() {
        let data = sample_data();
        assert_eq!(data.party(data.requested_by), Some(Party::RequestedBy));
        assert_eq!(data.party(data.requested_to), Some(Party::RequestedTo));
        assert_eq!(data.party(UserId(Uuid::new_v4())), None);
        assert_eq!(data.user(Party::RequestedBy.other()), data.requested_to);
        assert_eq!(data.first_name(Party::RequestedBy), "Alice");
        assert_eq!(data.first_name(Party::RequestedTo), "Bob");
    }

    #[test]
    fn book_ids_are_sorted() {
        let data = sample_data();
        let [a, b] = data.book_ids();
        assert!(a < b);
        assert!(data.references_book(a));
        assert!(data.references_book(b));
        assert!(!data.references_book(BookId(999)));
    }

    #[test]
    fn confirmation_flags_by_state() {
        let data = sample_data();
        let pending = AnyExchange::from(Exchange {
            state: Pending {},
            data: data.clone(),
        });
        assert!(pending.is_live());
        assert!(!pending.holds_book_lock());
        assert!(!pending.requested_by_confirmed());

        let accepted = AnyExchange::from(Exchange {
            state: Accepted {
                accepted_at: Utc::now(),
                requested_by_confirmed: true,
                requested_to_confirmed: false,
            },
            data: data.clone(),
        });
        assert!(accepted.is_live());
        assert!(accepted.holds_book_lock());
        assert!(accepted.requested_by_confirmed());
        assert!(!accepted.requested_to_confirmed());

        let exchanged = AnyExchange::from(Exchange {
            state: Exchanged {
                accepted_at: Utc::now(),
                exchanged_at: Utc::now(),
            },
            data,
        });
        assert!(!exchanged.is_live());
        assert!(!exchanged.holds_book_lock());
        assert!(exchanged.shares_contact_details());
        assert!(exchanged.requested_by_confirmed() && exchanged.requested_to_confirmed());
    }
}
