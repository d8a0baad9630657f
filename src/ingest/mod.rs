//! Verdict ingestion pipeline.
//!
//! One payload is one insertion: entity resolution, the chain walk/extension
//! and the verdict/observation writes all commit in a single transaction.
//! Insertions are serialized through one writer gate held for the whole
//! insertion, including retries.
//!
//! Only the longest reported path is walked against storage. The other points
//! are exact prefixes of it and are attached afterwards at their own depth.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::chain::{self, MaterializedChain};
use crate::conditions;
use crate::config::IngestConfig;
use crate::error::{StorageError, StorageResult};
use crate::registry;
use crate::storage::{
    ConditionAtomId, FunctionCallId, InstrumentationPointId, ObservationId, SqliteStorage,
    VerdictId,
};
use crate::verdicts::{self, ObservedPoint, VerdictOutcome};

/// A verdict as reported by the instrumentation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictPayload {
    /// Fully qualified name of the monitored function.
    pub function_name: String,
    /// Hash of the property evaluated.
    pub property_hash: String,
    /// Index of the binding within the function's binding space.
    pub bind_space_index: i64,
    /// When the monitored call started. Identifies the call together with the function.
    pub time_of_call: DateTime<Utc>,
    /// Timestamp of the request the call happened during.
    pub http_request_time: DateTime<Utc>,
    /// The evaluated outcome.
    pub verdict: VerdictReport,
}

/// The evaluated outcome and the monitored points that led to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictReport {
    /// Whether the property held.
    pub outcome: bool,
    /// When the outcome was reached.
    pub time_obtained: DateTime<Utc>,
    /// Atom index of the point whose observation collapsed the verdict.
    pub collapsing_atom_index: i64,
    /// Every monitored point that reported for this verdict.
    pub points: Vec<MonitoredPoint>,
}

/// One monitored point's report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredPoint {
    /// Index of the atom within its property.
    pub atom_index: i64,
    /// Raw observed value, stored opaquely.
    pub observed_value: Value,
    /// Instrumentation point that produced the value.
    pub instrumentation_point: InstrumentationPointId,
    /// Condition ids taken before this point was evaluated, root excluded.
    #[serde(default)]
    pub path: Vec<ConditionAtomId>,
}

/// Result of a committed insertion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertedVerdict {
    /// The new verdict.
    pub verdict: VerdictId,
    /// Call the verdict was attached to.
    pub function_call: FunctionCallId,
    /// Whether this insertion created the function call.
    pub new_function_call: bool,
    /// Node ids of the walked path and how they were obtained.
    pub chain: MaterializedChain,
    /// Observation ids in payload point order.
    pub observations: Vec<ObservationId>,
}

/// Validated view of a payload: the path to walk and every point's depth.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestPlan {
    /// The longest reported path; every other path is a prefix of it.
    pub path: Vec<ConditionAtomId>,
    /// Every reported point with its own path length.
    pub points: Vec<ObservedPoint>,
}

impl IngestPlan {
    /// Validate a report and pick the path to materialize.
    ///
    /// When several points share the longest length, the first one is used;
    /// since all paths must be prefixes of it the choice does not matter.
    pub fn from_report(report: &VerdictReport) -> StorageResult<Self> {
        let invalid = |field: &str, reason: String| StorageError::InvalidPayload {
            field: field.to_string(),
            reason,
        };

        let longest = report
            .points
            .iter()
            .fold(None::<&MonitoredPoint>, |best, point| match best {
                Some(b) if b.path.len() >= point.path.len() => Some(b),
                _ => Some(point),
            })
            .ok_or_else(|| invalid("points", "at least one monitored point is required".to_string()))?;

        let mut seen = HashSet::with_capacity(report.points.len());
        for point in &report.points {
            if !seen.insert(point.atom_index) {
                return Err(invalid(
                    "points",
                    format!("atom index {} reported more than once", point.atom_index),
                ));
            }
            if !longest.path.starts_with(&point.path) {
                return Err(invalid(
                    "path",
                    format!(
                        "path of atom {} is not a prefix of the longest path (atom {})",
                        point.atom_index, longest.atom_index
                    ),
                ));
            }
        }

        if !seen.contains(&report.collapsing_atom_index) {
            return Err(invalid(
                "collapsing_atom_index",
                format!(
                    "atom index {} is not among the reported points",
                    report.collapsing_atom_index
                ),
            ));
        }

        let points = report
            .points
            .iter()
            .map(|point| ObservedPoint {
                atom_index: point.atom_index,
                instrumentation_point: point.instrumentation_point,
                observed_value: point.observed_value.clone(),
                reported_length: point.path.len(),
            })
            .collect();

        Ok(Self {
            path: longest.path.clone(),
            points,
        })
    }
}

/// Sequential verdict ingestion over one store handle.
///
/// Clones share the writer gate, so every clone belongs to the same
/// single-writer pipeline.
#[derive(Clone)]
pub struct VerdictIngestor {
    storage: SqliteStorage,
    config: IngestConfig,
    writer: Arc<Mutex<()>>,
}

impl VerdictIngestor {
    /// Create an ingestor over the given store.
    pub fn new(storage: SqliteStorage, config: IngestConfig) -> Self {
        Self {
            storage,
            config,
            writer: Arc::new(Mutex::new(())),
        }
    }

    /// Insert one verdict with all its observations, or nothing at all.
    ///
    /// Transient storage failures roll the transaction back and the whole
    /// insertion is retried with exponential backoff; once retries run out
    /// the failure surfaces as [`StorageError::Unavailable`].
    pub async fn insert(&self, payload: &VerdictPayload) -> StorageResult<InsertedVerdict> {
        let plan = IngestPlan::from_report(&payload.verdict)?;

        let _writer = self.writer.lock().await;

        let mut retries = 0;
        loop {
            if retries > 0 {
                let delay =
                    Duration::from_millis(self.config.retry_delay_ms * 2_u64.pow(retries - 1));
                warn!(
                    function = %payload.function_name,
                    retry = retries,
                    delay_ms = delay.as_millis(),
                    "Retrying verdict insertion"
                );
                tokio::time::sleep(delay).await;
            }

            match self.insert_once(payload, &plan).await {
                Ok(inserted) => {
                    info!(
                        function = %payload.function_name,
                        function_call = %inserted.function_call,
                        verdict = %inserted.verdict,
                        outcome = payload.verdict.outcome,
                        chain = ?inserted.chain.outcome(),
                        observations = inserted.observations.len(),
                        "Verdict inserted"
                    );
                    return Ok(inserted);
                }
                Err(e) if e.is_transient() && retries < self.config.max_retries => {
                    warn!(error = %e, retry = retries, "Verdict insertion hit transient failure");
                    retries += 1;
                }
                Err(e) if e.is_transient() => {
                    error!(error = %e, retries, "Verdict insertion failed, storage unavailable");
                    return Err(StorageError::Unavailable {
                        message: e.to_string(),
                        retries,
                    });
                }
                Err(e) => {
                    error!(
                        function = %payload.function_name,
                        error = %e,
                        "Verdict insertion failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn insert_once(
        &self,
        payload: &VerdictPayload,
        plan: &IngestPlan,
    ) -> StorageResult<InsertedVerdict> {
        let mut tx = self.storage.begin().await?;

        let function =
            registry::find_function(&mut *tx, &payload.function_name, &payload.property_hash)
                .await?;
        let binding = registry::find_binding(&mut *tx, function, payload.bind_space_index).await?;

        if let Some(unknown) = conditions::first_unknown(&mut *tx, &plan.path).await? {
            return Err(StorageError::MissingPrerequisite {
                entity: "condition_atom",
                key: unknown.to_string(),
            });
        }

        let http_request = registry::http_request_for(&mut *tx, &payload.http_request_time).await?;
        let (function_call, new_function_call) = registry::function_call_for(
            &mut *tx,
            function,
            &payload.time_of_call,
            http_request,
        )
        .await?;

        let chain = chain::materialize(&mut *tx, function_call, &plan.path).await?;

        let outcome = VerdictOutcome {
            binding,
            function_call,
            outcome: payload.verdict.outcome,
            time_obtained: payload.verdict.time_obtained,
            collapsing_atom: payload.verdict.collapsing_atom_index,
        };
        let recorded = verdicts::record(&mut *tx, &outcome, &chain, &plan.points).await?;

        tx.commit()
            .await
            .map_err(|e| StorageError::classify("verdict", e))?;

        Ok(InsertedVerdict {
            verdict: recorded.verdict,
            function_call,
            new_function_call,
            chain,
            observations: recorded.observations,
        })
    }
}
