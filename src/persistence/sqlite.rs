//! SQLite-backed implementation of [`StateRepository`].

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};

use super::error::PersistenceError;
use super::traits::StateRepository;
use crate::project::dynamic::DynamicDsRecord;

/// SQLite-backed metadata repository.
#[derive(Debug, Clone)]
pub struct SqliteStateRepository {
    pool: SqlitePool,
}

impl SqliteStateRepository {
    /// Connects to `database_url` (e.g. `sqlite://clio.db?mode=rwc` or
    /// `sqlite::memory:`).
    pub async fn new(database_url: &str) -> Result<Self, PersistenceError> {
        // An in-memory database exists per connection; pooling more than
        // one would scatter the schema.
        let options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = options.connect(database_url).await?;
        Ok(Self { pool })
    }

    /// Applies any pending embedded migrations.
    pub async fn run_migrations(&self) -> Result<(), PersistenceError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn ensure_row(&self, chain: &str) -> Result<(), PersistenceError> {
        sqlx::query("INSERT OR IGNORE INTO engine_state (chain) VALUES (?)")
            .bind(chain)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StateRepository for SqliteStateRepository {
    async fn last_processed_height(
        &self,
        chain: &str,
    ) -> Result<Option<u64>, PersistenceError> {
        let row =
            sqlx::query("SELECT last_processed_height FROM engine_state WHERE chain = ?")
                .bind(chain)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|r| r.get::<Option<i64>, _>(0)).map(|h| h as u64))
    }

    async fn set_last_processed_height(
        &self,
        chain: &str,
        height: u64,
        block_hash: &str,
    ) -> Result<(), PersistenceError> {
        self.ensure_row(chain).await?;
        sqlx::query(
            "UPDATE engine_state SET last_processed_height = ?, last_processed_hash = ? WHERE chain = ?",
        )
        .bind(height as i64)
        .bind(block_hash)
        .bind(chain)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn genesis_hash(&self, chain: &str) -> Result<Option<String>, PersistenceError> {
        let row = sqlx::query("SELECT genesis_hash FROM engine_state WHERE chain = ?")
            .bind(chain)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| r.get::<Option<String>, _>(0)))
    }

    async fn set_genesis_hash(
        &self,
        chain: &str,
        genesis_hash: &str,
    ) -> Result<(), PersistenceError> {
        self.ensure_row(chain).await?;
        sqlx::query("UPDATE engine_state SET genesis_hash = ? WHERE chain = ?")
            .bind(genesis_hash)
            .bind(chain)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn dynamic_datasources(
        &self,
        chain: &str,
    ) -> Result<Vec<DynamicDsRecord>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT name, args, created_at_height, created_at_timestamp \
             FROM dynamic_datasources WHERE chain = ? ORDER BY id",
        )
        .bind(chain)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let args: String = row.get(1);
                Ok(DynamicDsRecord {
                    name: row.get(0),
                    args: serde_json::from_str(&args)?,
                    created_at_height: row.get::<i64, _>(2) as u64,
                    created_at_timestamp: row.get::<i64, _>(3) as u64,
                })
            })
            .collect()
    }

    async fn add_dynamic_datasource(
        &self,
        chain: &str,
        record: &DynamicDsRecord,
    ) -> Result<(), PersistenceError> {
        let args = serde_json::to_string(&record.args)?;
        sqlx::query(
            "INSERT INTO dynamic_datasources (chain, name, args, created_at_height, created_at_timestamp) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(chain)
        .bind(&record.name)
        .bind(args)
        .bind(record.created_at_height as i64)
        .bind(record.created_at_timestamp as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_dynamic_datasources(
        &self,
        chain: &str,
        from_height: u64,
    ) -> Result<u64, PersistenceError> {
        let result =
            sqlx::query("DELETE FROM dynamic_datasources WHERE chain = ? AND created_at_height >= ?")
                .bind(chain)
                .bind(from_height as i64)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> SqliteStateRepository {
        let repo = SqliteStateRepository::new("sqlite::memory:")
            .await
            .expect("Failed to connect to in-memory db");
        repo.run_migrations().await.expect("Failed to run migrations");
        repo
    }

    #[tokio::test]
    async fn last_processed_height_round_trips() {
        let repo = setup().await;
        assert_eq!(repo.last_processed_height("mainnet").await.unwrap(), None);

        repo.set_last_processed_height("mainnet", 123, "H123").await.unwrap();
        assert_eq!(repo.last_processed_height("mainnet").await.unwrap(), Some(123));

        // Other chains are unaffected.
        assert_eq!(repo.last_processed_height("testnet").await.unwrap(), None);
    }

    #[tokio::test]
    async fn genesis_hash_round_trips() {
        let repo = setup().await;
        assert_eq!(repo.genesis_hash("mainnet").await.unwrap(), None);

        repo.set_genesis_hash("mainnet", "0xAAA").await.unwrap();
        assert_eq!(repo.genesis_hash("mainnet").await.unwrap(), Some("0xAAA".into()));
    }

    #[tokio::test]
    async fn dynamic_datasource_log_survives_and_rewinds() {
        let repo = setup().await;

        for (name, height) in [("a", 100u64), ("b", 200), ("c", 300)] {
            repo.add_dynamic_datasource(
                "mainnet",
                &DynamicDsRecord {
                    name: name.into(),
                    args: serde_json::json!({ "contract": name }),
                    created_at_height: height,
                    created_at_timestamp: height * 1_000,
                },
            )
            .await
            .unwrap();
        }

        let records = repo.dynamic_datasources("mainnet").await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].name, "a");
        assert_eq!(records[0].args, serde_json::json!({ "contract": "a" }));

        // Rewinding to 200 removes the records created at or above it.
        let removed = repo.delete_dynamic_datasources("mainnet", 200).await.unwrap();
        assert_eq!(removed, 2);
        let records = repo.dynamic_datasources("mainnet").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "a");
    }
}
