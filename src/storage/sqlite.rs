use async_trait::async_trait;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use super::{
    parse_timestamp, ChainNode, ConditionAtomId, FunctionCallId, FunctionCallRecord,
    ObservationRecord, Storage, VerdictId, VerdictRecord,
};
use crate::chain;
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed store handle.
///
/// Constructed once at startup and passed to every component; cloning shares
/// the underlying pool.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Create an in-memory store for tests.
    ///
    /// Every pooled connection to `sqlite::memory:` would see its own empty
    /// database, so the pool is pinned to a single connection that is never
    /// recycled.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a write transaction.
    ///
    /// Dropping the transaction without committing rolls every write back.
    pub async fn begin(&self) -> StorageResult<Transaction<'static, Sqlite>> {
        self.pool
            .begin()
            .await
            .map_err(|e| StorageError::classify("transaction", e))
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn get_function_call(
        &self,
        id: FunctionCallId,
    ) -> StorageResult<Option<FunctionCallRecord>> {
        let row: Option<FunctionCallRow> = sqlx::query_as(
            r#"
            SELECT id, function, time_of_call, http_request
            FROM function_call
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn load_chain(&self, function_call: FunctionCallId) -> StorageResult<Vec<ChainNode>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| StorageError::classify("path_chain_node", e))?;
        chain::load_chain(&mut *conn, function_call).await
    }

    async fn condition_text(&self, id: ConditionAtomId) -> StorageResult<Option<String>> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| StorageError::classify("condition_atom", e))?;
        crate::conditions::text_of(&mut *conn, id).await
    }

    async fn verdicts_for_call(
        &self,
        function_call: FunctionCallId,
    ) -> StorageResult<Vec<VerdictRecord>> {
        let rows: Vec<VerdictRow> = sqlx::query_as(
            r#"
            SELECT verdict.id, verdict.binding, verdict.verdict, verdict.time_obtained,
                   verdict.function_call, verdict.collapsing_atom,
                   binding.binding_statement_lines
            FROM verdict
            INNER JOIN binding ON verdict.binding = binding.id
            WHERE verdict.function_call = ?
            ORDER BY verdict.id ASC
            "#,
        )
        .bind(function_call)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn observations_for_verdict(
        &self,
        verdict: VerdictId,
    ) -> StorageResult<Vec<ObservationRecord>> {
        let rows: Vec<ObservationRow> = sqlx::query_as(
            r#"
            SELECT id, instrumentation_point, verdict, observed_value, previous_condition, atom_index
            FROM observation
            WHERE verdict = ?
            ORDER BY id ASC
            "#,
        )
        .bind(verdict)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct FunctionCallRow {
    id: i64,
    function: i64,
    time_of_call: String,
    http_request: i64,
}

impl From<FunctionCallRow> for FunctionCallRecord {
    fn from(row: FunctionCallRow) -> Self {
        Self {
            id: FunctionCallId(row.id),
            function: super::FunctionId(row.function),
            time_of_call: parse_timestamp(&row.time_of_call),
            http_request: super::HttpRequestId(row.http_request),
        }
    }
}

#[derive(sqlx::FromRow)]
struct VerdictRow {
    id: i64,
    binding: i64,
    verdict: bool,
    time_obtained: String,
    function_call: i64,
    collapsing_atom: i64,
    binding_statement_lines: String,
}

impl From<VerdictRow> for VerdictRecord {
    fn from(row: VerdictRow) -> Self {
        Self {
            id: VerdictId(row.id),
            binding: super::BindingId(row.binding),
            outcome: row.verdict,
            time_obtained: parse_timestamp(&row.time_obtained),
            function_call: FunctionCallId(row.function_call),
            collapsing_atom: row.collapsing_atom,
            binding_statement_lines: serde_json::from_str(&row.binding_statement_lines)
                .unwrap_or(serde_json::Value::String(row.binding_statement_lines)),
        }
    }
}

#[derive(sqlx::FromRow)]
struct ObservationRow {
    id: i64,
    instrumentation_point: i64,
    verdict: i64,
    observed_value: String,
    previous_condition: i64,
    atom_index: i64,
}

impl From<ObservationRow> for ObservationRecord {
    fn from(row: ObservationRow) -> Self {
        Self {
            id: super::ObservationId(row.id),
            instrumentation_point: super::InstrumentationPointId(row.instrumentation_point),
            verdict: VerdictId(row.verdict),
            observed_value: serde_json::from_str(&row.observed_value)
                .unwrap_or(serde_json::Value::String(row.observed_value)),
            chain_node: super::ChainNodeId(row.previous_condition),
            atom_index: row.atom_index,
        }
    }
}
