//! Books, their owners, and the identifiers the exchange engine passes around.
//!
//! Books are owned by the catalogue collaborator; the engine only sees snapshots of
//! them. The one field the engine itself mutates is the eligibility flag, and it only
//! does so through [`crate::manager::BookAvailabilityGuard`].

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of an authenticated user (a book owner / exchange party).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for UserId {
    fn from(uuid: Uuid) -> Self {
        UserId(uuid)
    }
}

impl std::ops::Deref for UserId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Identifier of a book in the catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookId(pub i64);

impl std::fmt::Display for BookId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for BookId {
    fn from(id: i64) -> Self {
        BookId(id)
    }
}

/// Public profile of a book owner.
///
/// Contact fields are `Option` so that redaction can remove them from a view
/// without inventing placeholder values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Account role ("admin", "user"). Never shown to the other party.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Precise pickup point of a book.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Where a book can be collected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PickupLocation {
    /// Free-form address, shown to both parties.
    pub address: String,
    /// Hidden from the counterparty until the exchange is accepted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
}

/// Snapshot of a book as resolved at the time it was read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    pub title: String,
    pub owner: UserProfile,
    pub pickup_location: PickupLocation,
    /// Whether the book may be offered or requested in a new exchange.
    pub eligible: bool,
}
