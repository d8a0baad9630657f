use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::SharedState;
use crate::error::{McpError, McpResult, StorageError, StorageResult};
use crate::ingest::VerdictPayload;
use crate::registry::{BindingRegistration, InstrumentationPointRegistration, PropertyRegistration};
use crate::storage::{
    ChainNode, ConditionAtomId, FunctionCallId, ObservationRecord, Storage, VerdictRecord,
};

/// Route tool calls to appropriate handlers
pub async fn handle_tool_call(
    state: &SharedState,
    tool_name: &str,
    arguments: Option<Value>,
) -> McpResult<Value> {
    info!(tool = %tool_name, "Routing tool call");

    match tool_name {
        // Registration tools
        "condition_resolve" => handle_condition_resolve(state, arguments).await,
        "property_register" => handle_property_register(state, arguments).await,
        "binding_register" => handle_binding_register(state, arguments).await,
        "instrumentation_point_register" => {
            handle_instrumentation_point_register(state, arguments).await
        }
        // Ingestion
        "verdict_insert" => handle_verdict_insert(state, arguments).await,
        // Inspection tools
        "chain_get" => handle_chain_get(state, arguments).await,
        "verdicts_list" => handle_verdicts_list(state, arguments).await,
        _ => Err(McpError::UnknownTool {
            tool_name: tool_name.to_string(),
        }),
    }
}

// ============================================================================
// Registration handlers
// ============================================================================

/// Parameters for condition_resolve.
#[derive(Debug, Deserialize)]
pub struct ConditionResolveParams {
    /// Serialized condition; empty for the root.
    pub condition: String,
}

/// Response for condition_resolve.
#[derive(Debug, Serialize)]
pub struct ConditionResolveResponse {
    /// Shared id of the condition.
    pub condition_atom: ConditionAtomId,
}

/// Handle condition_resolve tool call
async fn handle_condition_resolve(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler(
        "condition_resolve",
        arguments,
        |params: ConditionResolveParams| async move {
            let condition_atom = state.registry.register_condition(&params.condition).await?;
            Ok::<_, StorageError>(ConditionResolveResponse { condition_atom })
        },
    )
    .await
}

/// Handle property_register tool call
async fn handle_property_register(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler(
        "property_register",
        arguments,
        |params: PropertyRegistration| async move { state.registry.register_property(&params).await },
    )
    .await
}

/// Handle binding_register tool call
async fn handle_binding_register(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler(
        "binding_register",
        arguments,
        |params: BindingRegistration| async move {
            let binding = state.registry.register_binding(&params).await?;
            Ok::<_, StorageError>(serde_json::json!({ "binding": binding }))
        },
    )
    .await
}

/// Handle instrumentation_point_register tool call
async fn handle_instrumentation_point_register(
    state: &SharedState,
    arguments: Option<Value>,
) -> McpResult<Value> {
    execute_handler(
        "instrumentation_point_register",
        arguments,
        |params: InstrumentationPointRegistration| async move {
            let point = state.registry.register_instrumentation_point(&params).await?;
            Ok::<_, StorageError>(
                serde_json::json!({ "instrumentation_point": point }),
            )
        },
    )
    .await
}

// ============================================================================
// Ingestion handler
// ============================================================================

/// Handle verdict_insert tool call
async fn handle_verdict_insert(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler(
        "verdict_insert",
        arguments,
        |payload: VerdictPayload| async move { state.ingestor.insert(&payload).await },
    )
    .await
}

// ============================================================================
// Inspection handlers
// ============================================================================

/// Parameters for the tools that address one function call.
#[derive(Debug, Deserialize)]
pub struct FunctionCallParams {
    /// Function call id.
    pub function_call: FunctionCallId,
}

/// One chain node with its condition text resolved.
#[derive(Debug, Serialize)]
pub struct ChainNodeView {
    /// The stored node.
    #[serde(flatten)]
    pub node: ChainNode,
    /// Serialized condition of the node.
    pub condition: Option<String>,
}

/// Response for chain_get.
#[derive(Debug, Serialize)]
pub struct ChainGetResponse {
    /// Function call the chain belongs to.
    pub function_call: FunctionCallId,
    /// Nodes in link order, root first.
    pub nodes: Vec<ChainNodeView>,
}

/// A verdict with its observations.
#[derive(Debug, Serialize)]
pub struct VerdictView {
    /// The stored verdict.
    #[serde(flatten)]
    pub verdict: VerdictRecord,
    /// Observations attached to the verdict.
    pub observations: Vec<ObservationRecord>,
}

/// Response for verdicts_list.
#[derive(Debug, Serialize)]
pub struct VerdictsListResponse {
    /// Function call the verdicts belong to.
    pub function_call: FunctionCallId,
    /// Verdicts, oldest first.
    pub verdicts: Vec<VerdictView>,
}

/// Handle chain_get tool call
async fn handle_chain_get(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler(
        "chain_get",
        arguments,
        |params: FunctionCallParams| async move {
            let chain = state.storage.load_chain(params.function_call).await?;
            let mut nodes = Vec::with_capacity(chain.len());
            for node in chain {
                let condition = state.storage.condition_text(node.condition_atom).await?;
                nodes.push(ChainNodeView { node, condition });
            }
            Ok::<_, StorageError>(ChainGetResponse {
                function_call: params.function_call,
                nodes,
            })
        },
    )
    .await
}

/// Handle verdicts_list tool call
async fn handle_verdicts_list(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler(
        "verdicts_list",
        arguments,
        |params: FunctionCallParams| async move {
            let records = state.storage.verdicts_for_call(params.function_call).await?;
            let mut verdicts = Vec::with_capacity(records.len());
            for verdict in records {
                let observations = state.storage.observations_for_verdict(verdict.id).await?;
                verdicts.push(VerdictView {
                    verdict,
                    observations,
                });
            }
            Ok::<_, StorageError>(VerdictsListResponse {
                function_call: params.function_call,
                verdicts,
            })
        },
    )
    .await
}

// ============================================================================
// Helper functions
// ============================================================================

/// Helper to parse arguments with consistent error handling
fn parse_arguments<T: serde::de::DeserializeOwned>(
    tool_name: &str,
    arguments: Option<Value>,
) -> McpResult<T> {
    match arguments {
        Some(args) => serde_json::from_value(args).map_err(|e| McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: e.to_string(),
        }),
        None => Err(McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: "Missing arguments".to_string(),
        }),
    }
}

/// Generic handler that runs a store operation with consistent error handling.
///
/// Parses typed arguments, maps the operation's error to
/// [`McpError::ExecutionFailed`] keeping its kind, and serializes the result.
async fn execute_handler<P, R, F, Fut>(
    tool_name: &str,
    arguments: Option<Value>,
    operation: F,
) -> McpResult<Value>
where
    P: serde::de::DeserializeOwned,
    R: Serialize,
    F: FnOnce(P) -> Fut,
    Fut: std::future::Future<Output = StorageResult<R>>,
{
    let params: P = parse_arguments(tool_name, arguments)?;

    let result = operation(params)
        .await
        .map_err(|e| McpError::ExecutionFailed {
            kind: e.kind(),
            message: e.to_string(),
        })?;

    serde_json::to_value(result).map_err(McpError::Json)
}
