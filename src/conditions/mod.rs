//! Condition registry.
//!
//! Content-addressed store of serialized branch conditions. Every distinct
//! string is stored once and shared by id across all chains. Matching is exact
//! and case-sensitive; no normalization is applied.

use sqlx::SqliteConnection;
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::storage::{ConditionAtomId, ROOT_CONDITION};

/// Resolve a serialized condition to its id, creating it if new.
///
/// The empty string always resolves to [`ROOT_CONDITION`], which the schema
/// migration seeds, so no write ever happens for it.
pub async fn resolve(conn: &mut SqliteConnection, text: &str) -> StorageResult<ConditionAtomId> {
    if text.is_empty() {
        return Ok(ROOT_CONDITION);
    }

    if let Some(id) = find(conn, text).await? {
        return Ok(id);
    }

    let inserted = sqlx::query("INSERT INTO condition_atom (serialised_condition) VALUES (?)")
        .bind(text)
        .execute(&mut *conn)
        .await;

    match inserted {
        Ok(result) => {
            let id = ConditionAtomId(result.last_insert_rowid());
            debug!(condition_atom = %id, "Registered new condition");
            Ok(id)
        }
        // Registry rows are shared: a duplicate means another path already
        // created it, so the stored row wins.
        Err(e) => match StorageError::classify("condition_atom", e) {
            StorageError::DuplicateKey { .. } => {
                find(conn, text)
                    .await?
                    .ok_or_else(|| StorageError::MissingPrerequisite {
                        entity: "condition_atom",
                        key: text.to_string(),
                    })
            }
            other => Err(other),
        },
    }
}

/// Look up an existing condition without creating it.
pub async fn find(conn: &mut SqliteConnection, text: &str) -> StorageResult<Option<ConditionAtomId>> {
    let id: Option<i64> =
        sqlx::query_scalar("SELECT id FROM condition_atom WHERE serialised_condition = ?")
            .bind(text)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| StorageError::classify("condition_atom", e))?;

    Ok(id.map(ConditionAtomId))
}

/// Serialized text of a condition id.
pub async fn text_of(
    conn: &mut SqliteConnection,
    id: ConditionAtomId,
) -> StorageResult<Option<String>> {
    sqlx::query_scalar("SELECT serialised_condition FROM condition_atom WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| StorageError::classify("condition_atom", e))
}

/// First id in `ids` that names no stored condition, if any.
pub(crate) async fn first_unknown(
    conn: &mut SqliteConnection,
    ids: &[ConditionAtomId],
) -> StorageResult<Option<ConditionAtomId>> {
    for &id in ids {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM condition_atom WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| StorageError::classify("condition_atom", e))?;
        if found.is_none() {
            return Ok(Some(id));
        }
    }
    Ok(None)
}
