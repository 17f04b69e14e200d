//! Fixtures shared by the unit tests.

use chrono::Utc;
use uuid::Uuid;

use super::book::{Book, BookId, Coordinates, PickupLocation, UserId, UserProfile};
use super::exchange::{ExchangeData, ExchangeId};
use crate::manager::{ExchangeStore, InMemoryExchangeStore};

pub(crate) fn sample_owner(first_name: &str) -> UserProfile {
    UserProfile {
        id: UserId(Uuid::new_v4()),
        first_name: first_name.to_string(),
        last_name: "Reader".to_string(),
        email: Some(format!("{}@example.com", first_name.to_lowercase())),
        phone: Some("+977-9800000000".to_string()),
        role: Some("user".to_string()),
    }
}

pub(crate) fn sample_book(id: i64, title: &str, owner_first_name: &str) -> Book {
    book_owned_by(id, title, &sample_owner(owner_first_name))
}

pub(crate) fn book_owned_by(id: i64, title: &str, owner: &UserProfile) -> Book {
    Book {
        id: BookId(id),
        title: title.to_string(),
        owner: owner.clone(),
        pickup_location: PickupLocation {
            address: "Thamel, Kathmandu".to_string(),
            coordinates: Some(Coordinates {
                latitude: 27.7154,
                longitude: 85.3123,
            }),
        },
        eligible: true,
    }
}

/// Alice (initiator) offers book 1 for Bob's book 2.
pub(crate) fn sample_data() -> ExchangeData {
    let offered_book = sample_book(1, "Norwegian Wood", "Alice");
    let requested_book = sample_book(2, "Kafka on the Shore", "Bob");
    ExchangeData {
        id: ExchangeId::new(),
        requested_by: offered_book.owner.id,
        requested_to: requested_book.owner.id,
        requested_book,
        offered_book,
        created_at: Utc::now(),
    }
}

pub(crate) async fn seeded_store(data: &ExchangeData) -> InMemoryExchangeStore {
    let store = InMemoryExchangeStore::new();
    store.upsert_book(&data.requested_book).await.unwrap();
    store.upsert_book(&data.offered_book).await.unwrap();
    store
}
