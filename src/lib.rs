//! Negotiation engine for swapping books between their owners.
//!
//! An exchange request moves through `Pending`, then `Accepted` or `Declined`, and
//! finally `Exchanged` once both parties confirm the hand-over. The
//! [`ExchangeEngine`] validates every transition, keeps each book's eligibility
//! flag consistent across competing requests, declines rivals when a request is
//! accepted, and notifies the other party of each step.
//!
//! Storage sits behind [`manager::ExchangeStore`]: an in-memory store ships for
//! tests and embedding, and a PostgreSQL store behind the `postgres` feature.

pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod manager;
pub mod notification;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::{ExchangeEngine, NewExchange};
pub use error::{ExchangeError, PartialFailure, Result, SideEffectFailure};
pub use exchange::*;
pub use manager::memory::{InMemoryExchangeStore, InMemoryTransaction};
#[cfg(feature = "postgres")]
pub use manager::postgres::{PgStoreTransaction, PoolProvider, PostgresExchangeStore, TestDbPools};
pub use manager::{BookAvailabilityGuard, ExchangeStore, StoreTransaction};
#[cfg(feature = "postgres")]
pub use notification::PgNotificationSink;
pub use notification::{
    LoggingNotificationSink, MockNotificationSink, NotificationSink, SentNotification,
};

/// Get the bookswap database migrator
///
/// Returns a migrator that can be run against a connection pool.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
