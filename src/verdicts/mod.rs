//! Verdict recorder.
//!
//! Writes one verdict row per evaluated outcome and one observation row per
//! monitored point, each observation pointing at the chain node at that
//! point's own reported depth. Nothing here is ever updated or deduplicated:
//! two identical outcomes for the same call are two events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqliteConnection;
use tracing::debug;

use crate::chain::MaterializedChain;
use crate::error::{StorageError, StorageResult};
use crate::storage::{
    format_timestamp, BindingId, FunctionCallId, InstrumentationPointId, ObservationId, VerdictId,
};

/// One monitored point's contribution to a verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedPoint {
    /// Index of the atom within its property.
    pub atom_index: i64,
    /// Instrumentation point that produced the value.
    pub instrumentation_point: InstrumentationPointId,
    /// Raw observed value, stored opaquely.
    pub observed_value: Value,
    /// Number of conditions in the path this point reported.
    pub reported_length: usize,
}

/// The outcome being recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerdictOutcome {
    /// Binding the property was evaluated under.
    pub binding: BindingId,
    /// Call the verdict belongs to.
    pub function_call: FunctionCallId,
    /// Whether the property held.
    pub outcome: bool,
    /// When the outcome was reached.
    pub time_obtained: DateTime<Utc>,
    /// Atom index of the point that collapsed the verdict.
    pub collapsing_atom: i64,
}

/// Ids written for one verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedVerdict {
    /// The new verdict.
    pub verdict: VerdictId,
    /// Observation ids in the order the points were given.
    pub observations: Vec<ObservationId>,
}

/// Record a verdict and its observations against a materialized chain.
///
/// Every point's node is resolved before anything is written, so a point whose
/// reported length does not fit the chain fails without a partial verdict.
pub async fn record(
    conn: &mut SqliteConnection,
    verdict: &VerdictOutcome,
    chain: &MaterializedChain,
    points: &[ObservedPoint],
) -> StorageResult<RecordedVerdict> {
    let nodes = points
        .iter()
        .map(|point| chain.node_at(point.reported_length))
        .collect::<StorageResult<Vec<_>>>()?;

    let result = sqlx::query(
        r#"
        INSERT INTO verdict (binding, verdict, time_obtained, function_call, collapsing_atom)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(verdict.binding)
    .bind(verdict.outcome)
    .bind(format_timestamp(&verdict.time_obtained))
    .bind(verdict.function_call)
    .bind(verdict.collapsing_atom)
    .execute(&mut *conn)
    .await
    .map_err(|e| StorageError::classify("verdict", e))?;
    let verdict_id = VerdictId(result.last_insert_rowid());

    let mut observations = Vec::with_capacity(points.len());
    for (point, node) in points.iter().zip(nodes) {
        let result = sqlx::query(
            r#"
            INSERT INTO observation (instrumentation_point, verdict, observed_value, previous_condition, atom_index)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(point.instrumentation_point)
        .bind(verdict_id)
        .bind(point.observed_value.to_string())
        .bind(node)
        .bind(point.atom_index)
        .execute(&mut *conn)
        .await
        .map_err(|e| StorageError::classify("observation", e))?;

        observations.push(ObservationId(result.last_insert_rowid()));
    }

    debug!(
        verdict = %verdict_id,
        function_call = %verdict.function_call,
        observations = observations.len(),
        "Verdict recorded"
    );

    Ok(RecordedVerdict {
        verdict: verdict_id,
        observations,
    })
}
