//! Registration of monitored entities.
//!
//! Properties, atoms, functions, bindings and instrumentation points are
//! registered by the instrumentation layer before any verdict arrives. All of
//! these are deduplicated upserts: inserting an entity that already exists is
//! not an error, the stored row is re-read and returned.
//!
//! The lookups used while ingesting a verdict (function, binding, HTTP request
//! and function call resolution) live here as well.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqliteConnection;
use tracing::{debug, info};

use crate::conditions;
use crate::error::{StorageError, StorageResult};
use crate::storage::{
    format_timestamp, AtomId, BindingId, ConditionAtomId, FunctionCallId, FunctionId,
    HttpRequestId, InstrumentationPointId, SqliteStorage,
};

/// A property together with its atoms and the function it is attached to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyRegistration {
    /// Hash identifying the property formula.
    pub formula_hash: String,
    /// Function the property is attached to.
    pub function: String,
    /// Serialized formula structure, stored opaquely.
    pub serialised_formula_structure: Value,
    /// Serialized bind variables, stored opaquely.
    pub serialised_bind_variables: Value,
    /// `(index_in_atoms, serialized_atom)` pairs.
    #[serde(default)]
    pub serialised_atom_list: Vec<(i64, String)>,
}

/// Ids produced by registering a property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredProperty {
    /// Function the property is attached to.
    pub function: FunctionId,
    /// Atom ids in the order of `serialised_atom_list`.
    pub atoms: Vec<AtomId>,
}

/// A binding of a property's free variables within one function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingRegistration {
    /// Function the binding belongs to.
    pub function: FunctionId,
    /// Index within the function's binding space.
    pub binding_space_index: i64,
    /// Source lines of the binding statements, stored as JSON.
    #[serde(default)]
    pub binding_statement_lines: Value,
}

/// An injected probe location for one atom under one binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentationPointRegistration {
    /// Atom the instrumentation point observes.
    pub atom: AtomId,
    /// Binding the instrumentation point was placed for.
    pub binding: BindingId,
    /// Conditions guarding the probe, serialized.
    #[serde(default)]
    pub serialised_condition_sequence: Vec<String>,
    /// Number of conditions on the path reaching the instrumentation point.
    pub reaching_path_length: i64,
}

/// Registration front end over the store handle.
///
/// Each registration commits in its own transaction.
#[derive(Clone)]
pub struct Registry {
    storage: SqliteStorage,
}

impl Registry {
    /// Create a registry over the given store.
    pub fn new(storage: SqliteStorage) -> Self {
        Self { storage }
    }

    /// Register a serialized branch condition, returning its shared id.
    pub async fn register_condition(&self, text: &str) -> StorageResult<ConditionAtomId> {
        let mut tx = self.storage.begin().await?;
        let id = conditions::resolve(&mut *tx, text).await?;
        tx.commit()
            .await
            .map_err(|e| StorageError::classify("condition_atom", e))?;
        Ok(id)
    }

    /// Register a property, its atoms and its function.
    pub async fn register_property(
        &self,
        registration: &PropertyRegistration,
    ) -> StorageResult<RegisteredProperty> {
        let mut tx = self.storage.begin().await?;

        let structure = serde_json::json!({
            "bind_variables": registration.serialised_bind_variables,
            "property": registration.serialised_formula_structure,
        })
        .to_string();

        let inserted = sqlx::query("INSERT INTO property (hash, serialised_structure) VALUES (?, ?)")
            .bind(&registration.formula_hash)
            .bind(&structure)
            .execute(&mut *tx)
            .await;
        match inserted.map_err(|e| StorageError::classify("property", e)) {
            Ok(_) => {}
            Err(StorageError::DuplicateKey { .. }) => {
                debug!(property = %registration.formula_hash, "Property already registered");
            }
            Err(e) => return Err(e),
        }

        let mut atoms = Vec::with_capacity(registration.serialised_atom_list.len());
        for (index, atom) in &registration.serialised_atom_list {
            atoms.push(upsert_atom(&mut *tx, &registration.formula_hash, *index, atom).await?);
        }

        let function =
            upsert_function(&mut *tx, &registration.function, &registration.formula_hash).await?;

        tx.commit()
            .await
            .map_err(|e| StorageError::classify("property", e))?;

        info!(
            property = %registration.formula_hash,
            function = %function,
            atoms = atoms.len(),
            "Property registered"
        );

        Ok(RegisteredProperty { function, atoms })
    }

    /// Register a binding, returning the existing id if already known.
    pub async fn register_binding(
        &self,
        registration: &BindingRegistration,
    ) -> StorageResult<BindingId> {
        let mut tx = self.storage.begin().await?;

        let lines = registration.binding_statement_lines.to_string();
        let inserted = sqlx::query(
            r#"
            INSERT INTO binding (binding_space_index, function, binding_statement_lines)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(registration.binding_space_index)
        .bind(registration.function)
        .bind(&lines)
        .execute(&mut *tx)
        .await;

        let id = match inserted.map_err(|e| StorageError::classify("binding", e)) {
            Ok(result) => BindingId(result.last_insert_rowid()),
            Err(StorageError::DuplicateKey { .. }) => {
                find_binding(&mut *tx, registration.function, registration.binding_space_index)
                    .await?
            }
            Err(e) => return Err(e),
        };

        tx.commit()
            .await
            .map_err(|e| StorageError::classify("binding", e))?;

        debug!(binding = %id, function = %registration.function, "Binding registered");
        Ok(id)
    }

    /// Register an instrumentation point and link it to its atom and binding.
    pub async fn register_instrumentation_point(
        &self,
        registration: &InstrumentationPointRegistration,
    ) -> StorageResult<InstrumentationPointId> {
        let mut tx = self.storage.begin().await?;

        let sequence = serde_json::to_string(&registration.serialised_condition_sequence)
            .map_err(|e| StorageError::InvalidPayload {
                field: "serialised_condition_sequence".to_string(),
                reason: e.to_string(),
            })?;

        let result = sqlx::query(
            r#"
            INSERT INTO instrumentation_point (serialised_condition_sequence, reaching_path_length)
            VALUES (?, ?)
            "#,
        )
        .bind(&sequence)
        .bind(registration.reaching_path_length)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::classify("instrumentation_point", e))?;
        let id = InstrumentationPointId(result.last_insert_rowid());

        sqlx::query(
            "INSERT INTO atom_instrumentation_point_pair (atom, instrumentation_point) VALUES (?, ?)",
        )
        .bind(registration.atom)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::classify("atom_instrumentation_point_pair", e))?;

        sqlx::query(
            "INSERT INTO binding_instrumentation_point_pair (binding, instrumentation_point) VALUES (?, ?)",
        )
        .bind(registration.binding)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::classify("binding_instrumentation_point_pair", e))?;

        tx.commit()
            .await
            .map_err(|e| StorageError::classify("instrumentation_point", e))?;

        debug!(instrumentation_point = %id, "Instrumentation point registered");
        Ok(id)
    }
}

async fn upsert_atom(
    conn: &mut SqliteConnection,
    property_hash: &str,
    index: i64,
    structure: &str,
) -> StorageResult<AtomId> {
    let inserted = sqlx::query(
        "INSERT INTO atom (property_hash, serialised_structure, index_in_atoms) VALUES (?, ?, ?)",
    )
    .bind(property_hash)
    .bind(structure)
    .bind(index)
    .execute(&mut *conn)
    .await;

    match inserted.map_err(|e| StorageError::classify("atom", e)) {
        Ok(result) => Ok(AtomId(result.last_insert_rowid())),
        Err(StorageError::DuplicateKey { .. }) => {
            let id: i64 = sqlx::query_scalar(
                "SELECT id FROM atom WHERE property_hash = ? AND index_in_atoms = ?",
            )
            .bind(property_hash)
            .bind(index)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| StorageError::classify("atom", e))?;
            Ok(AtomId(id))
        }
        Err(e) => Err(e),
    }
}

async fn upsert_function(
    conn: &mut SqliteConnection,
    qualified_name: &str,
    property_hash: &str,
) -> StorageResult<FunctionId> {
    let inserted =
        sqlx::query("INSERT INTO function (fully_qualified_name, property) VALUES (?, ?)")
            .bind(qualified_name)
            .bind(property_hash)
            .execute(&mut *conn)
            .await;

    match inserted.map_err(|e| StorageError::classify("function", e)) {
        Ok(result) => Ok(FunctionId(result.last_insert_rowid())),
        Err(StorageError::DuplicateKey { .. }) => {
            find_function(conn, qualified_name, property_hash).await
        }
        Err(e) => Err(e),
    }
}

/// Look up a registered function. Absence is a missing prerequisite.
pub async fn find_function(
    conn: &mut SqliteConnection,
    qualified_name: &str,
    property_hash: &str,
) -> StorageResult<FunctionId> {
    let id: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM function WHERE fully_qualified_name = ? AND property = ?",
    )
    .bind(qualified_name)
    .bind(property_hash)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| StorageError::classify("function", e))?;

    id.map(FunctionId)
        .ok_or_else(|| StorageError::MissingPrerequisite {
            entity: "function",
            key: format!("{} (property {})", qualified_name, property_hash),
        })
}

/// Look up a registered binding. Absence is a missing prerequisite.
pub async fn find_binding(
    conn: &mut SqliteConnection,
    function: FunctionId,
    binding_space_index: i64,
) -> StorageResult<BindingId> {
    let id: Option<i64> = sqlx::query_scalar(
        "SELECT id FROM binding WHERE function = ? AND binding_space_index = ?",
    )
    .bind(function)
    .bind(binding_space_index)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| StorageError::classify("binding", e))?;

    id.map(BindingId)
        .ok_or_else(|| StorageError::MissingPrerequisite {
            entity: "binding",
            key: format!("function {} space index {}", function, binding_space_index),
        })
}

/// Get or create the HTTP request identified by its timestamp.
pub async fn http_request_for(
    conn: &mut SqliteConnection,
    time_of_request: &DateTime<Utc>,
) -> StorageResult<HttpRequestId> {
    let time = format_timestamp(time_of_request);
    let existing: Option<i64> =
        sqlx::query_scalar("SELECT id FROM http_request WHERE time_of_request = ?")
            .bind(&time)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| StorageError::classify("http_request", e))?;

    if let Some(id) = existing {
        return Ok(HttpRequestId(id));
    }

    let result = sqlx::query("INSERT INTO http_request (time_of_request, grouping) VALUES (?, '')")
        .bind(&time)
        .execute(&mut *conn)
        .await
        .map_err(|e| StorageError::classify("http_request", e))?;

    Ok(HttpRequestId(result.last_insert_rowid()))
}

/// Get or create the call of `function` made at `time_of_call`.
///
/// Returns whether the call was created by this lookup.
pub async fn function_call_for(
    conn: &mut SqliteConnection,
    function: FunctionId,
    time_of_call: &DateTime<Utc>,
    http_request: HttpRequestId,
) -> StorageResult<(FunctionCallId, bool)> {
    let time = format_timestamp(time_of_call);
    let existing: Option<i64> =
        sqlx::query_scalar("SELECT id FROM function_call WHERE function = ? AND time_of_call = ?")
            .bind(function)
            .bind(&time)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| StorageError::classify("function_call", e))?;

    if let Some(id) = existing {
        return Ok((FunctionCallId(id), false));
    }

    let result = sqlx::query(
        "INSERT INTO function_call (function, time_of_call, http_request) VALUES (?, ?, ?)",
    )
    .bind(function)
    .bind(&time)
    .bind(http_request)
    .execute(&mut *conn)
    .await
    .map_err(|e| StorageError::classify("function_call", e))?;

    Ok((FunctionCallId(result.last_insert_rowid()), true))
}
