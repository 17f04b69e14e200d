//! PostgreSQL implementation of [`ExchangeStore`].
//!
//! Every write transaction runs on the primary pool with a transaction-local
//! `lock_timeout`. Rows are locked in a fixed order (the request row, then book rows
//! by ascending id) and requests for the same ordered pair are serialised with a
//! transaction-scoped advisory lock.

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::postgres::{PgRow, Postgres};
use sqlx::{Row, Transaction};
use uuid::Uuid;

use super::row::ExchangeRow;
use super::{BookAvailabilityGuard, ExchangeStore, StoreTransaction};
use crate::domain::book::{Book, BookId, Coordinates, PickupLocation, UserId, UserProfile};
use crate::domain::exchange::{
    AnyExchange, DeclineReason, Exchange, ExchangeId, ExchangeState, ExchangeStatus, Pending,
};
use crate::error::{ExchangeError, Result};

mod pool_provider;

pub use pool_provider::{PoolProvider, TestDbPools};

/// Default upper bound on how long a statement waits for a row or advisory lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

const SELECT_EXCHANGE: &str = r#"
    SELECT
        e.id, e.requested_by, e.requested_to, e.requested_book_id, e.offered_book_id,
        e.status, e.requested_by_confirmed, e.requested_to_confirmed,
        e.decline_reason, e.superseded_by,
        e.created_at, e.accepted_at, e.declined_at, e.exchanged_at,
        rb.title AS rb_title, rb.address AS rb_address, rb.latitude AS rb_latitude,
        rb.longitude AS rb_longitude, rb.is_eligible AS rb_is_eligible,
        ru.id AS ru_id, ru.first_name AS ru_first_name, ru.last_name AS ru_last_name,
        ru.email AS ru_email, ru.phone AS ru_phone, ru.role AS ru_role,
        ob.title AS ob_title, ob.address AS ob_address, ob.latitude AS ob_latitude,
        ob.longitude AS ob_longitude, ob.is_eligible AS ob_is_eligible,
        ou.id AS ou_id, ou.first_name AS ou_first_name, ou.last_name AS ou_last_name,
        ou.email AS ou_email, ou.phone AS ou_phone, ou.role AS ou_role
    FROM exchange_requests e
    JOIN books rb ON rb.id = e.requested_book_id
    JOIN users ru ON ru.id = rb.owner_id
    JOIN books ob ON ob.id = e.offered_book_id
    JOIN users ou ON ou.id = ob.owner_id
"#;

/// Exchange store backed by PostgreSQL.
///
/// Lists and single-request lookups may be served by a read replica; everything
/// the engine uses to decide a transition reads from the primary.
///
/// # Example
/// ```ignore
/// let pool = PgPool::connect("postgresql://localhost/bookswap").await?;
/// bookswap::migrator().run(&pool).await?;
/// let store = PostgresExchangeStore::new(pool)
///     .with_lock_timeout(Duration::from_secs(2));
/// ```
#[derive(Clone)]
pub struct PostgresExchangeStore<P: PoolProvider = sqlx::PgPool> {
    pools: P,
    lock_timeout: Duration,
}

impl<P: PoolProvider> PostgresExchangeStore<P> {
    pub fn new(pools: P) -> Self {
        Self {
            pools,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Set how long a transaction waits for a lock before failing.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn pools(&self) -> &P {
        &self.pools
    }

    async fn select_many(
        &self,
        filter: &str,
        binds: &[Uuid],
        book: Option<BookId>,
    ) -> Result<Vec<AnyExchange>> {
        let sql = format!("{SELECT_EXCHANGE} WHERE {filter} ORDER BY e.created_at, e.id");
        let mut query = sqlx::query(&sql);
        for bind in binds {
            query = query.bind(*bind);
        }
        if let Some(book) = book {
            query = query.bind(book.0);
        }
        let rows = query
            .fetch_all(self.pools.read())
            .await
            .map_err(|e| ExchangeError::Internal(anyhow!("Failed to list exchanges: {}", e)))?;
        rows.iter().map(exchange_from_row).collect()
    }
}

#[async_trait]
impl<P: PoolProvider> ExchangeStore for PostgresExchangeStore<P> {
    type Tx = PgStoreTransaction;

    async fn begin(&self) -> Result<PgStoreTransaction> {
        let mut tx = self
            .pools
            .write()
            .begin()
            .await
            .map_err(|e| ExchangeError::Internal(anyhow!("Failed to begin transaction: {}", e)))?;

        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(|e| ExchangeError::Internal(anyhow!("Failed to set lock timeout: {}", e)))?;

        Ok(PgStoreTransaction { tx })
    }

    #[tracing::instrument(skip(self, book), fields(book = %book.id))]
    async fn upsert_book(&self, book: &Book) -> Result<()> {
        let mut tx = self
            .pools
            .write()
            .begin()
            .await
            .map_err(|e| ExchangeError::Internal(anyhow!("Failed to begin transaction: {}", e)))?;

        let owner = &book.owner;
        sqlx::query(
            r#"
            INSERT INTO users (id, first_name, last_name, email, phone, role)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                first_name = EXCLUDED.first_name,
                last_name = EXCLUDED.last_name,
                email = EXCLUDED.email,
                phone = EXCLUDED.phone,
                role = EXCLUDED.role
            "#,
        )
        .bind(owner.id.0)
        .bind(&owner.first_name)
        .bind(&owner.last_name)
        .bind(&owner.email)
        .bind(&owner.phone)
        .bind(&owner.role)
        .execute(&mut *tx)
        .await
        .map_err(|e| ExchangeError::Internal(anyhow!("Failed to upsert book owner: {}", e)))?;

        let coordinates = book.pickup_location.coordinates;
        // is_eligible is only written for new books
        sqlx::query(
            r#"
            INSERT INTO books (id, title, owner_id, address, latitude, longitude, is_eligible)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                title = EXCLUDED.title,
                owner_id = EXCLUDED.owner_id,
                address = EXCLUDED.address,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude
            "#,
        )
        .bind(book.id.0)
        .bind(&book.title)
        .bind(owner.id.0)
        .bind(&book.pickup_location.address)
        .bind(coordinates.map(|c| c.latitude))
        .bind(coordinates.map(|c| c.longitude))
        .bind(book.eligible)
        .execute(&mut *tx)
        .await
        .map_err(|e| ExchangeError::Internal(anyhow!("Failed to upsert book: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| ExchangeError::Internal(anyhow!("Failed to commit transaction: {}", e)))
    }

    async fn is_eligible(&self, book: BookId) -> Result<bool> {
        sqlx::query("SELECT is_eligible FROM books WHERE id = $1")
            .bind(book.0)
            .fetch_optional(self.pools.write())
            .await
            .map_err(|e| ExchangeError::Internal(anyhow!("Failed to read book: {}", e)))?
            .map(|row| row.get::<bool, _>("is_eligible"))
            .ok_or(ExchangeError::BookNotFound(book))
    }

    #[tracing::instrument(skip(self), fields(exchange_id = %id))]
    async fn get_exchange(&self, id: ExchangeId) -> Result<Option<AnyExchange>> {
        let sql = format!("{SELECT_EXCHANGE} WHERE e.id = $1");
        sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(self.pools.read())
            .await
            .map_err(|e| ExchangeError::Internal(anyhow!("Failed to fetch exchange: {}", e)))?
            .as_ref()
            .map(exchange_from_row)
            .transpose()
    }

    async fn list_by_initiator(&self, user: UserId) -> Result<Vec<AnyExchange>> {
        self.select_many("e.requested_by = $1", &[user.0], None).await
    }

    async fn list_by_counterparty(&self, user: UserId) -> Result<Vec<AnyExchange>> {
        self.select_many("e.requested_to = $1", &[user.0], None).await
    }

    async fn list_by_party(&self, user: UserId) -> Result<Vec<AnyExchange>> {
        self.select_many("(e.requested_by = $1 OR e.requested_to = $1)", &[user.0], None)
            .await
    }

    async fn list_by_book_and_party(
        &self,
        book: BookId,
        user: UserId,
    ) -> Result<Vec<AnyExchange>> {
        self.select_many(
            "(e.requested_by = $1 OR e.requested_to = $1) \
             AND (e.requested_book_id = $2 OR e.offered_book_id = $2)",
            &[user.0],
            Some(book),
        )
        .await
    }

    #[tracing::instrument(skip(self), fields(book = %book))]
    async fn list_pending_referencing_book(&self, book: BookId) -> Result<Vec<Exchange<Pending>>> {
        let sql = format!(
            "{SELECT_EXCHANGE} WHERE e.status = 'pending' \
             AND (e.requested_book_id = $1 OR e.offered_book_id = $1) \
             ORDER BY e.created_at, e.id"
        );
        let rows = sqlx::query(&sql)
            .bind(book.0)
            .fetch_all(self.pools.write())
            .await
            .map_err(|e| {
                ExchangeError::Internal(anyhow!("Failed to list pending exchanges: {}", e))
            })?;

        let mut pending = Vec::with_capacity(rows.len());
        for row in &rows {
            if let AnyExchange::Pending(exchange) = exchange_from_row(row)? {
                pending.push(exchange);
            }
        }
        Ok(pending)
    }

    async fn live_exchange_exists(
        &self,
        requested_by: UserId,
        requested_to: UserId,
    ) -> Result<bool> {
        sqlx::query(LIVE_EXCHANGE_EXISTS)
            .bind(requested_by.0)
            .bind(requested_to.0)
            .fetch_one(self.pools.write())
            .await
            .map(|row| row.get::<bool, _>(0))
            .map_err(|e| ExchangeError::Internal(anyhow!("Failed to check live exchanges: {}", e)))
    }
}

const LIVE_EXCHANGE_EXISTS: &str = r#"
    SELECT EXISTS (
        SELECT 1 FROM exchange_requests
        WHERE requested_by = $1 AND requested_to = $2 AND status IN ('pending', 'accepted')
    )
"#;

/// Write transaction of a [`PostgresExchangeStore`].
///
/// Rolled back by sqlx when dropped without [`StoreTransaction::commit`].
pub struct PgStoreTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl BookAvailabilityGuard for PgStoreTransaction {
    async fn lock_books(&mut self, books: &[BookId]) -> Result<()> {
        let ids: Vec<i64> = books.iter().map(|b| b.0).collect();
        let locked: Vec<i64> =
            sqlx::query("SELECT id FROM books WHERE id = ANY($1) ORDER BY id FOR UPDATE")
                .bind(ids)
                .fetch_all(&mut *self.tx)
                .await
                .map_err(|e| ExchangeError::Internal(anyhow!("Failed to lock books: {}", e)))?
                .iter()
                .map(|row| row.get::<i64, _>("id"))
                .collect();

        match books.iter().find(|book| !locked.contains(&book.0)) {
            Some(missing) => Err(ExchangeError::BookNotFound(*missing)),
            None => Ok(()),
        }
    }

    async fn is_eligible(&mut self, book: BookId) -> Result<bool> {
        sqlx::query("SELECT is_eligible FROM books WHERE id = $1")
            .bind(book.0)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| ExchangeError::Internal(anyhow!("Failed to read book: {}", e)))?
            .map(|row| row.get::<bool, _>("is_eligible"))
            .ok_or(ExchangeError::BookNotFound(book))
    }

    async fn set_eligible(&mut self, book: BookId, eligible: bool) -> Result<()> {
        let result = sqlx::query("UPDATE books SET is_eligible = $2 WHERE id = $1")
            .bind(book.0)
            .bind(eligible)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| ExchangeError::Internal(anyhow!("Failed to update book: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(ExchangeError::BookNotFound(book));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for PgStoreTransaction {
    async fn lock_pair(&mut self, requested_by: UserId, requested_to: UserId) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1 || ':' || $2, 0))")
            .bind(requested_by.0.to_string())
            .bind(requested_to.0.to_string())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| ExchangeError::Internal(anyhow!("Failed to lock pair: {}", e)))?;
        Ok(())
    }

    async fn live_exchange_exists(
        &mut self,
        requested_by: UserId,
        requested_to: UserId,
    ) -> Result<bool> {
        sqlx::query(LIVE_EXCHANGE_EXISTS)
            .bind(requested_by.0)
            .bind(requested_to.0)
            .fetch_one(&mut *self.tx)
            .await
            .map(|row| row.get::<bool, _>(0))
            .map_err(|e| ExchangeError::Internal(anyhow!("Failed to check live exchanges: {}", e)))
    }

    async fn get_for_update(&mut self, id: ExchangeId) -> Result<Option<AnyExchange>> {
        let sql = format!("{SELECT_EXCHANGE} WHERE e.id = $1 FOR UPDATE OF e");
        sqlx::query(&sql)
            .bind(id.0)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| ExchangeError::Internal(anyhow!("Failed to lock exchange: {}", e)))?
            .as_ref()
            .map(exchange_from_row)
            .transpose()
    }

    async fn lock_holder_exists(&mut self, book: BookId, excluding: ExchangeId) -> Result<bool> {
        sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM exchange_requests
                WHERE id <> $2
                  AND (requested_book_id = $1 OR offered_book_id = $1)
                  AND status = 'accepted'
            )
            "#,
        )
        .bind(book.0)
        .bind(excluding.0)
        .fetch_one(&mut *self.tx)
        .await
        .map(|row| row.get::<bool, _>(0))
        .map_err(|e| ExchangeError::Internal(anyhow!("Failed to check book lock holders: {}", e)))
    }

    async fn insert(&mut self, exchange: &Exchange<Pending>) -> Result<()> {
        let data = &exchange.data;
        sqlx::query(
            r#"
            INSERT INTO exchange_requests (
                id, requested_by, requested_to, requested_book_id, offered_book_id,
                status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, 'pending', $6, $6)
            "#,
        )
        .bind(data.id.0)
        .bind(data.requested_by.0)
        .bind(data.requested_to.0)
        .bind(data.requested_book.id.0)
        .bind(data.offered_book.id.0)
        .bind(data.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                ExchangeError::conflict("duplicate request")
            }
            _ => ExchangeError::Internal(anyhow!("Failed to insert exchange: {}", e)),
        })?;
        Ok(())
    }

    async fn persist<T: ExchangeState + Clone>(&mut self, exchange: &Exchange<T>) -> Result<()>
    where
        AnyExchange: From<Exchange<T>>,
    {
        let row = ExchangeRow::from(&AnyExchange::from(exchange.clone()));
        let (decline_reason, superseded_by) = match row.decline_reason {
            Some(DeclineReason::Counterparty) => (Some("counterparty"), None),
            Some(DeclineReason::Superseded { by }) => (Some("superseded"), Some(by.0)),
            None => (None, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE exchange_requests SET
                status = $2,
                requested_by_confirmed = $3,
                requested_to_confirmed = $4,
                decline_reason = $5,
                superseded_by = $6,
                accepted_at = $7,
                declined_at = $8,
                exchanged_at = $9,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(row.id.0)
        .bind(row.status.as_str())
        .bind(row.requested_by_confirmed)
        .bind(row.requested_to_confirmed)
        .bind(decline_reason)
        .bind(superseded_by)
        .bind(row.accepted_at)
        .bind(row.declined_at)
        .bind(row.exchanged_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| ExchangeError::Internal(anyhow!("Failed to persist exchange: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(ExchangeError::NotFoundOrForbidden(row.id));
        }
        Ok(())
    }

    async fn delete(&mut self, id: ExchangeId) -> Result<()> {
        let result = sqlx::query("DELETE FROM exchange_requests WHERE id = $1")
            .bind(id.0)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| ExchangeError::Internal(anyhow!("Failed to delete exchange: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(ExchangeError::NotFoundOrForbidden(id));
        }
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| ExchangeError::Internal(anyhow!("Failed to commit transaction: {}", e)))
    }
}

fn exchange_from_row(row: &PgRow) -> Result<AnyExchange> {
    let (exchange, requested_book, offered_book) = decode_exchange(row)
        .map_err(|e| ExchangeError::Internal(anyhow!("Failed to decode exchange: {}", e)))?;
    exchange.into_exchange(requested_book, offered_book)
}

fn decode_exchange(row: &PgRow) -> std::result::Result<(ExchangeRow, Book, Book), sqlx::Error> {
    let id: Uuid = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let status: ExchangeStatus = status.parse().map_err(|e: String| sqlx::Error::ColumnDecode {
        index: "status".to_string(),
        source: e.into(),
    })?;

    let decline_reason: Option<String> = row.try_get("decline_reason")?;
    let superseded_by: Option<Uuid> = row.try_get("superseded_by")?;
    let decline_reason = match (decline_reason.as_deref(), superseded_by) {
        (None, _) => None,
        (Some("counterparty"), _) => Some(DeclineReason::Counterparty),
        (Some("superseded"), Some(by)) => Some(DeclineReason::Superseded {
            by: ExchangeId(by),
        }),
        (Some(other), _) => {
            return Err(sqlx::Error::ColumnDecode {
                index: "decline_reason".to_string(),
                source: format!("invalid decline reason '{other}' for exchange {id}").into(),
            });
        }
    };

    let exchange = ExchangeRow {
        id: ExchangeId(id),
        requested_by: UserId(row.try_get("requested_by")?),
        requested_to: UserId(row.try_get("requested_to")?),
        requested_book_id: BookId(row.try_get("requested_book_id")?),
        offered_book_id: BookId(row.try_get("offered_book_id")?),
        status,
        requested_by_confirmed: row.try_get("requested_by_confirmed")?,
        requested_to_confirmed: row.try_get("requested_to_confirmed")?,
        decline_reason,
        created_at: row.try_get("created_at")?,
        accepted_at: row.try_get("accepted_at")?,
        declined_at: row.try_get("declined_at")?,
        exchanged_at: row.try_get("exchanged_at")?,
    };
    let requested_book = decode_book(row, exchange.requested_book_id, "rb", "ru")?;
    let offered_book = decode_book(row, exchange.offered_book_id, "ob", "ou")?;
    Ok((exchange, requested_book, offered_book))
}

fn decode_book(
    row: &PgRow,
    id: BookId,
    book: &str,
    owner: &str,
) -> std::result::Result<Book, sqlx::Error> {
    let column = |prefix: &str, name: &str| format!("{prefix}_{name}");

    let latitude: Option<f64> = row.try_get(column(book, "latitude").as_str())?;
    let longitude: Option<f64> = row.try_get(column(book, "longitude").as_str())?;
    let coordinates = latitude
        .zip(longitude)
        .map(|(latitude, longitude)| Coordinates {
            latitude,
            longitude,
        });

    Ok(Book {
        id,
        title: row.try_get(column(book, "title").as_str())?,
        owner: UserProfile {
            id: UserId(row.try_get(column(owner, "id").as_str())?),
            first_name: row.try_get(column(owner, "first_name").as_str())?,
            last_name: row.try_get(column(owner, "last_name").as_str())?,
            email: row.try_get(column(owner, "email").as_str())?,
            phone: row.try_get(column(owner, "phone").as_str())?,
            role: row.try_get(column(owner, "role").as_str())?,
        },
        pickup_location: PickupLocation {
            address: row.try_get(column(book, "address").as_str())?,
            coordinates,
        },
        eligible: row.try_get(column(book, "is_eligible").as_str())?,
    })
}
