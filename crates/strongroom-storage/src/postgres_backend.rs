//! PostgreSQL storage, for deployments that already run a database.
//!
//! Everything lives in one `strongroom_kv (key TEXT PRIMARY KEY, value
//! BYTEA)` table. Conditional writes are single statements, so the row
//! lock PostgreSQL takes for them picks the winner of a race.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::{StorageBackend, StorageError};

const SCHEMA: [&str; 2] = [
    "CREATE TABLE IF NOT EXISTS strongroom_kv (key TEXT PRIMARY KEY, value BYTEA NOT NULL)",
    "CREATE INDEX IF NOT EXISTS strongroom_kv_key_pattern ON strongroom_kv (key text_pattern_ops)",
];

const SELECT_VALUE: &str = "SELECT value FROM strongroom_kv WHERE key = $1";
const UPSERT: &str = "INSERT INTO strongroom_kv (key, value) VALUES ($1, $2) \
                      ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value";
const INSERT_IF_ABSENT: &str = "INSERT INTO strongroom_kv (key, value) VALUES ($1, $2) \
                                ON CONFLICT (key) DO NOTHING";
const UPDATE_IF_EQUAL: &str = "UPDATE strongroom_kv SET value = $2 WHERE key = $1 AND value = $3";
const DELETE: &str = "DELETE FROM strongroom_kv WHERE key = $1";
const SELECT_PREFIX: &str = "SELECT key FROM strongroom_kv \
                             WHERE left(key, char_length($1)) = $1 ORDER BY key";
const SELECT_EXISTS: &str = "SELECT EXISTS (SELECT 1 FROM strongroom_kv WHERE key = $1)";

/// [`StorageBackend`] over a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBackend")
            .field("pool_size", &self.pool.size())
            .finish_non_exhaustive()
    }
}

impl PostgresBackend {
    /// Connect and make sure the schema exists.
    ///
    /// # Errors
    ///
    /// [`StorageError::Open`] if connecting or creating the schema fails.
    /// The URL is left out of the error since it may carry a password.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let open_failed = |e: sqlx::Error| StorageError::Open {
            path: "postgres".to_owned(),
            reason: e.to_string(),
        };

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(open_failed)?;
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(open_failed)?;
        }
        Ok(Self { pool })
    }
}

fn read_err(key: &str) -> impl FnOnce(sqlx::Error) -> StorageError {
    move |e| StorageError::Read {
        key: key.to_owned(),
        reason: e.to_string(),
    }
}

fn write_err(key: &str) -> impl FnOnce(sqlx::Error) -> StorageError {
    move |e| StorageError::Write {
        key: key.to_owned(),
        reason: e.to_string(),
    }
}

#[async_trait::async_trait]
impl StorageBackend for PostgresBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        sqlx::query_scalar::<_, Vec<u8>>(SELECT_VALUE)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_err(key))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        sqlx::query(UPSERT)
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(write_err(key))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query(DELETE)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Delete {
                key: key.to_owned(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        sqlx::query_scalar::<_, String>(SELECT_PREFIX)
            .bind(prefix)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::List {
                prefix: prefix.to_owned(),
                reason: e.to_string(),
            })
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: &[u8],
    ) -> Result<bool, StorageError> {
        let query = match expected {
            None => sqlx::query(INSERT_IF_ABSENT).bind(key).bind(new),
            Some(expected) => sqlx::query(UPDATE_IF_EQUAL).bind(key).bind(new).bind(expected),
        };
        let done = query.execute(&self.pool).await.map_err(write_err(key))?;
        Ok(done.rows_affected() == 1)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        sqlx::query_scalar::<_, bool>(SELECT_EXISTS)
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .map_err(read_err(key))
    }
}
