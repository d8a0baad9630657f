use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid or unparseable configuration.
    #[error("Configuration error: {message}")]
    Config {
        /// What was wrong, including the variable name.
        message: String,
    },

    /// Failure from the storage layer.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// The database could not be opened.
    #[error("Database connection failed: {message}")]
    Connection {
        /// Underlying error text.
        message: String,
    },

    /// Schema migrations failed to apply.
    #[error("Migration failed: {message}")]
    Migration {
        /// Underlying error text.
        message: String,
    },

    /// A row the caller's contract requires (function, binding) is absent.
    #[error("Missing prerequisite {entity}: {key}")]
    MissingPrerequisite {
        /// Kind of entity looked up.
        entity: &'static str,
        /// Key it was looked up by.
        key: String,
    },

    /// Uniqueness violation on insert.
    #[error("Duplicate key in {table}: {message}")]
    DuplicateKey {
        /// Table the insert targeted.
        table: &'static str,
        /// Driver message naming the constraint.
        message: String,
    },

    /// The store is busy or unreachable; retrying later may succeed.
    #[error("Storage unavailable: {message} (retries: {retries})")]
    Unavailable {
        /// Last underlying error text.
        message: String,
        /// Retries attempted before giving up.
        retries: u32,
    },

    /// The stored chain of a call is not a single linear sequence.
    #[error("Chain integrity violated for function call {function_call}: {message}")]
    ChainIntegrity {
        /// Call owning the chain.
        function_call: i64,
        /// What was found wrong.
        message: String,
    },

    /// A reported path disagrees with the condition stored at some depth.
    #[error(
        "Path diverges from stored chain of function call {function_call} at depth {depth}: stored condition {stored}, reported condition {reported}"
    )]
    ChainDivergence {
        /// Call owning the chain.
        function_call: i64,
        /// First depth that differs.
        depth: usize,
        /// Condition atom stored at that depth.
        stored: i64,
        /// Condition atom reported at that depth.
        reported: i64,
    },

    /// The payload was rejected before any write.
    #[error("Invalid payload: {field} - {reason}")]
    InvalidPayload {
        /// Offending field.
        field: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Unclassified driver error.
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl StorageError {
    /// Classify a raw driver error into the storage taxonomy.
    ///
    /// Unique-constraint violations become [`StorageError::DuplicateKey`] and
    /// busy/locked/I/O/pool failures become [`StorageError::Unavailable`] with
    /// zero retries. Everything else is passed through.
    pub fn classify(table: &'static str, err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return StorageError::DuplicateKey {
                    table,
                    message: db.message().to_string(),
                };
            }
            if is_busy_code(db.code().as_deref()) {
                return StorageError::Unavailable {
                    message: db.message().to_string(),
                    retries: 0,
                };
            }
        }

        if matches!(
            err,
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
        ) {
            return StorageError::Unavailable {
                message: err.to_string(),
                retries: 0,
            };
        }

        StorageError::Sqlx(err)
    }

    /// Whether the failure is transient and the insertion may be retried
    /// at the transaction boundary.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Unavailable { .. } => true,
            StorageError::Sqlx(sqlx::Error::Database(db)) => is_busy_code(db.code().as_deref()),
            StorageError::Sqlx(sqlx::Error::Io(_))
            | StorageError::Sqlx(sqlx::Error::PoolTimedOut)
            | StorageError::Sqlx(sqlx::Error::PoolClosed) => true,
            _ => false,
        }
    }
}

impl StorageError {
    /// Stable machine-readable name of the error variant.
    ///
    /// Transient driver failures report `unavailable` like
    /// [`StorageError::Unavailable`].
    pub fn kind(&self) -> &'static str {
        match self {
            StorageError::Connection { .. } => "connection",
            StorageError::Migration { .. } => "migration",
            StorageError::MissingPrerequisite { .. } => "missing_prerequisite",
            StorageError::DuplicateKey { .. } => "duplicate_key",
            StorageError::Unavailable { .. } => "unavailable",
            StorageError::ChainIntegrity { .. } => "chain_integrity",
            StorageError::ChainDivergence { .. } => "chain_divergence",
            StorageError::InvalidPayload { .. } => "invalid_payload",
            StorageError::Sqlx(_) if self.is_transient() => "unavailable",
            StorageError::Sqlx(_) => "database",
        }
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including their extended codes.
fn is_busy_code(code: Option<&str>) -> bool {
    code.and_then(|c| c.parse::<i32>().ok())
        .map(|c| matches!(c & 0xff, 5 | 6))
        .unwrap_or(false)
}

/// MCP protocol errors
#[derive(Debug, Error)]
pub enum McpError {
    /// No tool with this name is registered.
    #[error("Unknown tool: {tool_name}")]
    UnknownTool {
        /// Requested tool name.
        tool_name: String,
    },

    /// Tool arguments did not deserialize.
    #[error("Invalid parameters for {tool_name}: {message}")]
    InvalidParameters {
        /// Tool being called.
        tool_name: String,
        /// Deserialization error text.
        message: String,
    },

    /// The tool ran and failed.
    #[error("Tool execution failed: {message}")]
    ExecutionFailed {
        /// Storage error kind, see [`StorageError::kind`].
        kind: &'static str,
        /// Error text.
        message: String,
    },

    /// Serializing a tool result failed.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// Stable machine-readable name of the failure, reported to clients
    /// alongside the error text.
    pub fn kind(&self) -> &'static str {
        match self {
            McpError::UnknownTool { .. } => "unknown_tool",
            McpError::InvalidParameters { .. } => "invalid_parameters",
            McpError::ExecutionFailed { kind, .. } => *kind,
            McpError::Json(_) => "serialization",
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for MCP operations
pub type McpResult<T> = Result<T, McpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_display() {
        let err = AppError::Config {
            message: "bad DATABASE_MAX_CONNECTIONS".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Configuration error: bad DATABASE_MAX_CONNECTIONS"
        );
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::MissingPrerequisite {
            entity: "function",
            key: "app.views.index".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Missing prerequisite function: app.views.index"
        );

        let err = StorageError::DuplicateKey {
            table: "path_chain_node",
            message: "UNIQUE constraint failed".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Duplicate key in path_chain_node: UNIQUE constraint failed"
        );

        let err = StorageError::Unavailable {
            message: "database is locked".to_string(),
            retries: 3,
        };
        assert_eq!(
            err.to_string(),
            "Storage unavailable: database is locked (retries: 3)"
        );

        let err = StorageError::ChainDivergence {
            function_call: 7,
            depth: 2,
            stored: 4,
            reported: 9,
        };
        assert!(err.to_string().contains("function call 7 at depth 2"));
    }

    #[test]
    fn test_transient_classification() {
        let err = StorageError::Unavailable {
            message: "busy".to_string(),
            retries: 0,
        };
        assert!(err.is_transient());
        assert!(StorageError::Sqlx(sqlx::Error::PoolTimedOut).is_transient());
        assert!(StorageError::classify("verdict", sqlx::Error::PoolClosed).is_transient());

        let err = StorageError::ChainIntegrity {
            function_call: 1,
            message: "missing node".to_string(),
        };
        assert!(!err.is_transient());
        assert!(!StorageError::Sqlx(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn test_busy_codes() {
        assert!(is_busy_code(Some("5")));
        assert!(is_busy_code(Some("517")));
        assert!(is_busy_code(Some("6")));
        assert!(!is_busy_code(Some("2067")));
        assert!(!is_busy_code(None));
    }

    #[test]
    fn test_error_kinds() {
        let err = StorageError::ChainDivergence {
            function_call: 1,
            depth: 1,
            stored: 2,
            reported: 3,
        };
        assert_eq!(err.kind(), "chain_divergence");
        assert_eq!(StorageError::Sqlx(sqlx::Error::PoolTimedOut).kind(), "unavailable");
        assert_eq!(StorageError::Sqlx(sqlx::Error::RowNotFound).kind(), "database");

        let err = McpError::ExecutionFailed {
            kind: "invalid_payload",
            message: "Invalid payload: points - empty".to_string(),
        };
        assert_eq!(err.kind(), "invalid_payload");
        assert_eq!(err.to_string(), "Tool execution failed: Invalid payload: points - empty");
        let err = McpError::UnknownTool {
            tool_name: "x".to_string(),
        };
        assert_eq!(err.kind(), "unknown_tool");
    }

    #[test]
    fn test_mcp_error_display() {
        let err = McpError::InvalidParameters {
            tool_name: "verdict_insert".to_string(),
            message: "missing field `verdict`".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid parameters for verdict_insert: missing field `verdict`"
        );
    }

    #[test]
    fn test_storage_error_conversion_to_app_error() {
        let storage_err = StorageError::InvalidPayload {
            field: "points".to_string(),
            reason: "empty".to_string(),
        };
        let app_err: AppError = storage_err.into();
        assert!(matches!(app_err, AppError::Storage(_)));
    }
}
