//! Shared live query registry on `PostgreSQL` for multi-process deployments.
//!
//! Table layout:
//!
//! ```sql
//! live_queries(id TEXT PRIMARY KEY, entity_key TEXT, owner_client_id TEXT,
//!              data TEXT, last_touched BIGINT)
//! ```
//!
//! `data` holds the JSON-encoded [`RegisteredQuery`]; the `last_touched`
//! column is authoritative over the copy inside `data`. Housekeeping only
//! reads the plain columns, so an undecodable `data` never blocks it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use livesync_core::{ClockSource, RowId, SystemClock};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::warn;

use super::{LiveQueryStorage, RegisteredQuery};
use crate::live_query::error::RegistryError;

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS live_queries (
    id TEXT PRIMARY KEY,
    entity_key TEXT NOT NULL,
    owner_client_id TEXT NOT NULL DEFAULT '',
    data TEXT NOT NULL,
    last_touched BIGINT NOT NULL
)";

const ADD_OWNER_COLUMN: &str =
    "ALTER TABLE live_queries ADD COLUMN IF NOT EXISTS owner_client_id TEXT NOT NULL DEFAULT ''";

const CREATE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS live_queries_entity_key ON live_queries (entity_key)";

fn pg_err(err: sqlx::Error) -> RegistryError {
    RegistryError::unavailable(err)
}

fn millis(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn decode(id: &str, data: &str, last_touched: i64) -> Result<RegisteredQuery, RegistryError> {
    let mut query: RegisteredQuery =
        serde_json::from_str(data).map_err(|source| RegistryError::Corrupt {
            id: id.to_string(),
            source,
        })?;
    query.last_touched = u64::try_from(last_touched).unwrap_or(0);
    Ok(query)
}

/// Decodes listed rows, skipping the ones that are corrupt.
fn decode_listing(rows: &[(String, String, i64)]) -> Vec<RegisteredQuery> {
    rows.iter()
        .filter_map(|(id, data, touched)| match decode(id, data, *touched) {
            Ok(query) => Some(query),
            Err(err) => {
                warn!(error = %err, "skipping corrupt live query entry");
                None
            }
        })
        .collect()
}

/// Registry stored in a `PostgreSQL` table shared by all server processes.
pub struct PostgresLiveQueryStorage {
    pool: PgPool,
    clock: Arc<dyn ClockSource>,
}

impl PostgresLiveQueryStorage {
    /// Connects to `database_url` and creates the table if missing.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unavailable`] if the connection or the
    /// schema setup fails.
    pub async fn connect(database_url: &str) -> Result<Self, RegistryError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(pg_err)?;
        Self::from_pool(pool, Arc::new(SystemClock)).await
    }

    /// Wraps an existing pool and creates the table if missing.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unavailable`] if the schema setup fails.
    pub async fn from_pool(pool: PgPool, clock: Arc<dyn ClockSource>) -> Result<Self, RegistryError> {
        sqlx::query(CREATE_TABLE).execute(&pool).await.map_err(pg_err)?;
        sqlx::query(ADD_OWNER_COLUMN).execute(&pool).await.map_err(pg_err)?;
        sqlx::query(CREATE_INDEX).execute(&pool).await.map_err(pg_err)?;
        Ok(Self { pool, clock })
    }
}

#[async_trait]
impl LiveQueryStorage for PostgresLiveQueryStorage {
    async fn add(&self, mut query: RegisteredQuery) -> Result<(), RegistryError> {
        query.last_touched = self.clock.now();
        let data = serde_json::to_string(&query).map_err(RegistryError::unavailable)?;
        sqlx::query(
            "INSERT INTO live_queries (id, entity_key, owner_client_id, data, last_touched)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO UPDATE SET entity_key = EXCLUDED.entity_key,
                 owner_client_id = EXCLUDED.owner_client_id,
                 data = EXCLUDED.data, last_touched = EXCLUDED.last_touched",
        )
        .bind(&query.id)
        .bind(&query.entity_key)
        .bind(&query.owner_client_id)
        .bind(data)
        .bind(millis(query.last_touched))
        .execute(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RegistryError> {
        sqlx::query("DELETE FROM live_queries WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(pg_err)?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<RegisteredQuery>, RegistryError> {
        let row = sqlx::query_as::<_, (String, i64)>(
            "SELECT data, last_touched FROM live_queries WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(pg_err)?;
        row.map(|(data, touched)| decode(id, &data, touched)).transpose()
    }

    async fn queries_for_entity(
        &self,
        entity_key: &str,
    ) -> Result<Vec<RegisteredQuery>, RegistryError> {
        let rows = sqlx::query_as::<_, (String, String, i64)>(
            "SELECT id, data, last_touched FROM live_queries WHERE entity_key = $1",
        )
        .bind(entity_key)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(decode_listing(&rows))
    }

    async fn set_data(&self, id: &str, last_known_ids: Vec<RowId>) -> Result<bool, RegistryError> {
        let mut tx = self.pool.begin().await.map_err(pg_err)?;
        let row = sqlx::query_as::<_, (String, i64)>(
            "SELECT data, last_touched FROM live_queries WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(pg_err)?;

        let Some((data, touched)) = row else {
            return Ok(false);
        };
        let mut query = decode(id, &data, touched)?;
        query.last_known_ids = last_known_ids;
        let data = serde_json::to_string(&query).map_err(RegistryError::unavailable)?;

        sqlx::query("UPDATE live_queries SET data = $2 WHERE id = $1")
            .bind(id)
            .bind(data)
            .execute(&mut *tx)
            .await
            .map_err(pg_err)?;
        tx.commit().await.map_err(pg_err)?;
        Ok(true)
    }

    async fn keep_alive_and_return_unknown_query_ids(
        &self,
        ids: &[String],
    ) -> Result<Vec<String>, RegistryError> {
        let touched: Vec<String> = sqlx::query_scalar(
            "UPDATE live_queries SET last_touched = $1 WHERE id = ANY($2) RETURNING id",
        )
        .bind(millis(self.clock.now()))
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)?;
        Ok(ids
            .iter()
            .filter(|id| !touched.contains(id))
            .cloned()
            .collect())
    }

    async fn remove_expired(&self, ttl: Duration) -> Result<Vec<String>, RegistryError> {
        let ttl = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let cutoff = millis(self.clock.now().saturating_sub(ttl));
        sqlx::query_scalar("DELETE FROM live_queries WHERE last_touched < $1 RETURNING id")
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .map_err(pg_err)
    }

    async fn remove_for_client(&self, client_id: &str) -> Result<Vec<String>, RegistryError> {
        sqlx::query_scalar(
            "DELETE FROM live_queries WHERE owner_client_id = $1 RETURNING id",
        )
        .bind(client_id)
        .fetch_all(&self.pool)
        .await
        .map_err(pg_err)
    }

    async fn count(&self) -> Result<usize, RegistryError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM live_queries")
            .fetch_one(&self.pool)
            .await
            .map_err(pg_err)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_touch_overrides_payload() {
        let query = RegisteredQuery::new(
            livesync_core::RequestContext::new("c1", None),
            "tasks",
            livesync_core::FindOptions::default(),
            vec![],
        );
        let data = serde_json::to_string(&query).unwrap();
        let decoded = decode(&query.id, &data, 42).unwrap();
        assert_eq!(decoded.last_touched, 42);
        assert_eq!(decoded.entity_key, "tasks");
    }

    #[test]
    fn corrupt_payload_names_the_query() {
        let err = decode("q1", "{", 0).unwrap_err();
        assert!(matches!(err, RegistryError::Corrupt { ref id, .. } if id == "q1"));
    }

    #[test]
    fn listing_skips_corrupt_rows() {
        let query = RegisteredQuery::new(
            livesync_core::RequestContext::new("c1", None),
            "tasks",
            livesync_core::FindOptions::default(),
            vec!["a".to_string()],
        );
        let rows = vec![
            ("bad".to_string(), "not json".to_string(), 1),
            (query.id.clone(), serde_json::to_string(&query).unwrap(), 7),
        ];
        let listed = decode_listing(&rows);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, query.id);
        assert_eq!(listed[0].last_touched, 7);
    }

    #[test]
    fn millis_saturates() {
        assert_eq!(millis(u64::MAX), i64::MAX);
        assert_eq!(millis(5), 5);
    }
}
