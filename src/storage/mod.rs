//! Storage layer for verdict persistence.
//!
//! This module provides the SQLite store handle, the typed row identifiers
//! shared by every component, and the read-side [`Storage`] trait used to
//! inspect committed chains, verdicts and observations.

mod sqlite;

#[cfg(test)]
#[path = "types_tests.rs"]
mod types_tests;

pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
        )]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(
    /// Identifier of a unique serialized branch condition.
    ConditionAtomId
);
row_id!(
    /// Identifier of one node in a function call's path chain.
    ChainNodeId
);
row_id!(
    /// Identifier of a monitored function (qualified name + property).
    FunctionId
);
row_id!(
    /// Identifier of a binding of a property's free variables.
    BindingId
);
row_id!(
    /// Identifier of a single function invocation.
    FunctionCallId
);
row_id!(
    /// Identifier of the HTTP request a call happened during.
    HttpRequestId
);
row_id!(
    /// Identifier of a verdict row.
    VerdictId
);
row_id!(
    /// Identifier of an observation row.
    ObservationId
);
row_id!(
    /// Identifier of an instrumentation point.
    InstrumentationPointId
);
row_id!(
    /// Identifier of an atom (monitored sub-expression) row.
    AtomId
);

/// The empty condition. Seeded by the schema migration; every chain starts here.
pub const ROOT_CONDITION: ConditionAtomId = ConditionAtomId(1);

/// Value stored in `path_chain_node.next_node` for the last node of a chain.
pub const TERMINAL_SENTINEL: i64 = -1;

/// Forward link of a chain node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainLink {
    /// Points at the node one level deeper.
    Next(ChainNodeId),
    /// End of the chain as currently stored.
    Terminal,
}

impl ChainLink {
    /// Decode the stored column value.
    ///
    /// Returns `None` for values that are neither the sentinel nor a valid
    /// row id.
    pub fn from_column(value: i64) -> Option<Self> {
        match value {
            TERMINAL_SENTINEL => Some(ChainLink::Terminal),
            v if v > 0 => Some(ChainLink::Next(ChainNodeId(v))),
            _ => None,
        }
    }

    /// Encode for the `next_node` column.
    pub fn to_column(self) -> i64 {
        match self {
            ChainLink::Next(id) => id.0,
            ChainLink::Terminal => TERMINAL_SENTINEL,
        }
    }

    /// Whether this is the end of the stored chain.
    pub fn is_terminal(self) -> bool {
        matches!(self, ChainLink::Terminal)
    }
}

/// One persisted node of a function call's path chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainNode {
    /// Node identifier.
    pub id: ChainNodeId,
    /// Condition taken at this depth.
    pub condition_atom: ConditionAtomId,
    /// Forward link to the next node.
    pub next: ChainLink,
    /// Call owning the chain.
    pub function_call: FunctionCallId,
    /// Position in the chain; the root node is depth 0.
    pub depth: usize,
}

/// A recorded function invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallRecord {
    /// Call identifier.
    pub id: FunctionCallId,
    /// Function that was called.
    pub function: FunctionId,
    /// When the call started.
    pub time_of_call: DateTime<Utc>,
    /// Request the call happened during.
    pub http_request: HttpRequestId,
}

/// A committed verdict joined with its binding's statement lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictRecord {
    /// Verdict identifier.
    pub id: VerdictId,
    /// Binding the property was evaluated under.
    pub binding: BindingId,
    /// Evaluated outcome.
    pub outcome: bool,
    /// When the outcome was reached.
    pub time_obtained: DateTime<Utc>,
    /// Call the verdict belongs to.
    pub function_call: FunctionCallId,
    /// Index of the monitored point that collapsed the verdict.
    pub collapsing_atom: i64,
    /// Statement lines of the binding, as registered.
    pub binding_statement_lines: serde_json::Value,
}

/// A committed observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationRecord {
    /// Observation identifier.
    pub id: ObservationId,
    /// Instrumentation point that produced the value.
    pub instrumentation_point: InstrumentationPointId,
    /// Verdict the observation belongs to.
    pub verdict: VerdictId,
    /// Raw observed value.
    pub observed_value: serde_json::Value,
    /// Chain node for the deepest condition reached when the point was evaluated.
    pub chain_node: ChainNodeId,
    /// Index of the atom within its property.
    pub atom_index: i64,
}

/// Read-side access to committed verdict data.
///
/// Queries here are independent reads; no snapshot spans several calls.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Get a function call by ID.
    async fn get_function_call(&self, id: FunctionCallId)
        -> StorageResult<Option<FunctionCallRecord>>;
    /// Get the chain of a function call, root first. Empty if none exists yet.
    async fn load_chain(&self, function_call: FunctionCallId) -> StorageResult<Vec<ChainNode>>;
    /// Get the serialized text of a condition atom.
    async fn condition_text(&self, id: ConditionAtomId) -> StorageResult<Option<String>>;
    /// Get all verdicts of a function call, oldest first.
    async fn verdicts_for_call(
        &self,
        function_call: FunctionCallId,
    ) -> StorageResult<Vec<VerdictRecord>>;
    /// Get all observations of a verdict.
    async fn observations_for_verdict(
        &self,
        verdict: VerdictId,
    ) -> StorageResult<Vec<ObservationRecord>>;
}

/// Canonical text form of timestamps. Identity lookups (calls, requests)
/// compare this text, so every writer must go through here.
pub(crate) fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)
}

/// Parse an RFC 3339 column written by this crate.
///
/// An unparseable value reads back as the UNIX epoch. Only use this for
/// display; identity lookups compare the stored text instead.
pub(crate) fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| DateTime::<Utc>::UNIX_EPOCH)
}
