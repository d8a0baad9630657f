//! # Verdict Store
//!
//! Persistence for runtime-verification verdicts over SQLite.
//!
//! Instrumented code reports, for each monitored function call, which branch
//! conditions were taken before each monitored point was evaluated. The store
//! keeps those as one linear chain of nodes per call, shares condition text
//! across all calls, and records every verdict with one observation per point
//! pointing at the chain node that point had reached.
//!
//! ## Components
//!
//! - **Condition registry** ([`conditions`]): deduplicated condition strings
//! - **Path chain store** ([`chain`]): per-call chains, extended by walk-then-splice
//! - **Verdict recorder** ([`verdicts`]): verdict and observation rows
//! - **Ingest pipeline** ([`ingest`]): one transaction per insertion behind a
//!   single-writer gate
//!
//! ## Architecture
//!
//! ```text
//! Instrumentation → JSON-RPC (stdio) / CLI → VerdictIngestor
//!                                                 ↓
//!                                           SQLite (sqlx)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use verdict_store::{Config, VerdictIngestor};
//! use verdict_store::storage::SqliteStorage;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let storage = SqliteStorage::new(&config.database).await?;
//!     let ingestor = VerdictIngestor::new(storage, config.ingest.clone());
//!     let payload = serde_json::from_str(&std::fs::read_to_string("verdict.json")?)?;
//!     let inserted = ingestor.insert(&payload).await?;
//!     println!("verdict {}", inserted.verdict);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

/// Path chain store: per-call condition chains.
pub mod chain;
/// Command-line interface.
pub mod cli;
/// Condition registry.
pub mod conditions;
/// Configuration management.
pub mod config;
/// Error types and result aliases for the application.
pub mod error;
/// Verdict insertion pipeline.
pub mod ingest;
/// Registration of properties, functions, bindings and instrumentation points.
pub mod registry;
/// JSON-RPC server implementation and request handling.
pub mod server;
/// SQLite storage layer for persistence.
pub mod storage;
/// Verdict recorder.
pub mod verdicts;

pub use config::Config;
pub use error::{AppError, AppResult, StorageError, StorageResult};
pub use ingest::{InsertedVerdict, VerdictIngestor, VerdictPayload};
pub use server::{AppState, McpServer, SharedState};
