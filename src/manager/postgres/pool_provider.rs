//! Read/write pool routing for [`super::PostgresExchangeStore`].
//!
//! The store sends display reads (`get_exchange` and the `list_by_*` family) to
//! [`PoolProvider::read`]. Everything that feeds a transition decision goes to
//! [`PoolProvider::write`]: every transaction, `is_eligible`,
//! `list_pending_referencing_book` and `live_exchange_exists`. A lagging replica
//! can therefore show a stale list but can never let a duplicate request through
//! or leave a rival pending after an accept.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Source of the pools a [`super::PostgresExchangeStore`] talks to.
///
/// A bare [`PgPool`] serves both sides. Deployments with a replica implement this
/// for their own pool set.
///
/// # Example
///
/// ```ignore
/// #[derive(Clone)]
/// struct Cluster {
///     primary: PgPool,
///     replica: Option<PgPool>,
/// }
///
/// impl PoolProvider for Cluster {
///     fn read(&self) -> &PgPool {
///         self.replica.as_ref().unwrap_or(&self.primary)
///     }
///
///     fn write(&self) -> &PgPool {
///         &self.primary
///     }
/// }
/// ```
pub trait PoolProvider: Clone + Send + Sync + 'static {
    /// Pool for reads that only feed views. May lag the primary.
    fn read(&self) -> &PgPool;

    /// The primary. Used for transactions, row and advisory locks, and any read
    /// a transition depends on.
    fn write(&self) -> &PgPool;
}

/// A single pool serves both reads and writes.
impl PoolProvider for PgPool {
    fn read(&self) -> &PgPool {
        self
    }

    fn write(&self) -> &PgPool {
        self
    }
}

/// Pools for `#[sqlx::test]`: the test database as primary plus a second pool on
/// the same database whose sessions are read-only.
///
/// A write routed through `read()` fails with "cannot execute ... in a read-only
/// transaction".
#[derive(Clone, Debug)]
pub struct TestDbPools {
    primary: PgPool,
    replica: PgPool,
}

impl TestDbPools {
    pub async fn new(pool: PgPool) -> Result<Self, sqlx::Error> {
        let replica = read_only_pool(&pool).await?;
        Ok(Self {
            primary: pool,
            replica,
        })
    }
}

impl PoolProvider for TestDbPools {
    fn read(&self) -> &PgPool {
        &self.replica
    }

    fn write(&self) -> &PgPool {
        &self.primary
    }
}

async fn read_only_pool(pool: &PgPool) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(pool.options().get_max_connections())
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("SET default_transaction_read_only = on")
                    .execute(&mut *conn)
                    .await
                    .map(|_| ())
            })
        })
        .connect_with(pool.connect_options().as_ref().clone())
        .await
}
