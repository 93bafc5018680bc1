//! Durable diff metrics storage.

use exn::ResultExt;
use sqlx::SqliteConnection;
use sqlx::pool::PoolConnectionMetadata;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use tracing::instrument;

use crate::error::{ErrorKind, Result};
use crate::models::{DiffId, DiffMetrics};

/// Embedded migrations that are run automatically on connect.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
// Lookups fan out from every cache worker; writes are rare by comparison.
const MAX_CONNECTIONS: u32 = 5;

/// Durable `DiffId → DiffMetrics` store backed by a single SQLite file.
///
/// WAL mode gives one writer and many concurrent readers. Every save is a
/// single-row upsert, so a crash never leaves a half-written record.
#[derive(Debug, Clone)]
pub struct MetricsStore {
    pool: SqlitePool,
}

impl MetricsStore {
    async fn new(options: SqliteConnectOptions, max: Option<u32>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            // Apply the query-based PRAGMAs to every pooled connection, not
            // just the first one.
            .after_connect(|conn, meta| Box::pin(async move { Self::apply_pragmas(conn, meta).await }))
            .max_connections(max.unwrap_or(MAX_CONNECTIONS))
            .connect_with(options)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Open the metrics database at the given path.
    ///
    /// Creates the database file if it doesn't exist and runs migrations.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = Self::base_options().filename(path.as_ref()).create_if_missing(true);
        Self::new(options, None).await
    }

    /// Open an in-memory database.
    ///
    /// Not `#[cfg(test)]`: other crates use this in their tests too.
    pub async fn connect_in_memory() -> Result<Self> {
        let options = Self::base_options().filename(":memory:");
        // Every in-memory connection is its own database, so stick to one.
        Self::new(options, Some(1)).await
    }

    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            // A burst of cache misses can queue many writers behind each other.
            .busy_timeout(std::time::Duration::from_millis(5000))
    }

    /// Apply additional PRAGMA settings that aren't exposed via SqliteConnectOptions.
    async fn apply_pragmas(conn: &mut SqliteConnection, _meta: PoolConnectionMetadata) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                PRAGMA wal_autocheckpoint = 1000;
                PRAGMA cache_size = -8192;
                PRAGMA temp_store = MEMORY;
            "#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    #[instrument("performing database migrations", skip_all)]
    async fn migrate(&self) -> Result<()> {
        MIGRATOR.run(&self.pool).await.or_raise(|| ErrorKind::Migration)
    }

    /// Load the metrics stored for `id`, if any.
    pub async fn load(&self, id: &DiffId) -> Result<Option<DiffMetrics>> {
        let value: Option<String> = sqlx::query_scalar(include_str!("../queries/load_metrics.sql"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        value.map(|json| serde_json::from_str(&json).or_raise(|| ErrorKind::InvalidData)).transpose()
    }

    /// Store the metrics for `id`, replacing any previous record.
    pub async fn save(&self, id: &DiffId, metrics: &DiffMetrics) -> Result<()> {
        let json = serde_json::to_string(metrics).or_raise(|| ErrorKind::InvalidData)?;
        sqlx::query(include_str!("../queries/save_metrics.sql"))
            .bind(id.as_str())
            .bind(json)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tracing::trace!(%id, "Saved diff metrics");
        Ok(())
    }

    /// Close the connection pool, waiting for in-flight queries.
    pub async fn close(&self) {
        // Let SQLite update query planner statistics
        _ = sqlx::query("PRAGMA optimize").execute(&self.pool).await;
        self.pool.close().await;
    }
}
