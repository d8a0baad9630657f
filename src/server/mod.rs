//! Server module for the JSON-RPC stdio interface.
//!
//! This module provides:
//! - MCP server implementation over stdio
//! - Tool call handlers and routing
//! - Shared application state management

mod handlers;
mod mcp;

pub use handlers::*;
pub use mcp::*;

use std::sync::Arc;

use crate::config::Config;
use crate::ingest::VerdictIngestor;
use crate::registry::Registry;
use crate::storage::SqliteStorage;

/// Application state shared across handlers.
///
/// Every component is built over the same store handle; the ingestor owns the
/// single-writer gate, so all verdict insertions from the server go through it.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// SQLite storage backend.
    pub storage: SqliteStorage,
    /// Entity registration front end.
    pub registry: Registry,
    /// Verdict insertion pipeline.
    pub ingestor: VerdictIngestor,
}

impl AppState {
    /// Create new application state
    pub fn new(config: Config, storage: SqliteStorage) -> Self {
        let registry = Registry::new(storage.clone());
        let ingestor = VerdictIngestor::new(storage.clone(), config.ingest.clone());

        tracing::debug!(
            max_retries = config.ingest.max_retries,
            retry_delay_ms = config.ingest.retry_delay_ms,
            "AppState initialized"
        );

        Self {
            config,
            storage,
            registry,
            ingestor,
        }
    }
}

/// Shared application state handle
pub type SharedState = Arc<AppState>;
