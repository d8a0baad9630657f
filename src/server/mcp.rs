//! JSON-RPC 2.0 protocol loop over newline-delimited stdio.
//!
//! Requests are handled strictly one at a time, in arrival order. Combined
//! with the ingestor's writer gate this keeps verdict insertion sequential.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info};

use super::{handle_tool_call, SharedState};

#[cfg(test)]
#[path = "mcp_tests.rs"]
mod mcp_tests;

/// JSON-RPC parse error code.
pub const PARSE_ERROR: i32 = -32700;
/// JSON-RPC method-not-found code.
pub const METHOD_NOT_FOUND: i32 = -32601;
/// JSON-RPC invalid-params code.
pub const INVALID_PARAMS: i32 = -32602;
/// JSON-RPC internal-error code.
pub const INTERNAL_ERROR: i32 = -32603;

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (must be "2.0").
    pub jsonrpc: String,
    /// Request identifier (None for notifications).
    pub id: Option<Value>,
    /// The method name to invoke.
    pub method: String,
    /// Optional parameters for the method.
    #[serde(default)]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0").
    pub jsonrpc: String,
    /// Request identifier, null when the request could not be parsed.
    pub id: Value,
    /// The result on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// The error on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    /// Error code.
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
}

/// Tool definition with JSON Schema.
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    /// Unique tool name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema for the arguments.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Parameters for a tools/call request.
#[derive(Debug, Deserialize)]
pub struct ToolCallParams {
    /// The name of the tool to invoke.
    pub name: String,
    /// Optional arguments for the tool.
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// Content item within a tool result.
#[derive(Debug, Serialize)]
pub struct ToolResultContent {
    /// The content type, always "text".
    #[serde(rename = "type")]
    pub content_type: String,
    /// The text content of the result.
    pub text: String,
}

/// Result of a tool invocation.
#[derive(Debug, Serialize)]
pub struct ToolCallResult {
    /// The result content items.
    pub content: Vec<ToolResultContent>,
    /// Set when the tool failed.
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    /// Machine-readable failure kind, set together with `isError`.
    #[serde(rename = "errorKind", skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl JsonRpcResponse {
    /// Create a success response
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response
    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Tool server speaking JSON-RPC 2.0, one request per line.
pub struct McpServer {
    state: SharedState,
}

impl McpServer {
    /// Create a new server over the shared state
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Serve requests from stdin until EOF, writing responses to stdout.
    pub async fn run(&self) -> std::io::Result<()> {
        info!("Verdict store server listening on stdio");
        self.serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await
    }

    /// Serve requests from any line-oriented reader until EOF.
    pub async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                info!("EOF received, shutting down");
                break;
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            debug!(request = %trimmed, "Received request");

            let response = match serde_json::from_str::<JsonRpcRequest>(trimmed) {
                Ok(request) => self.handle_request(request).await,
                Err(e) => {
                    error!(error = %e, "Failed to parse request");
                    Some(JsonRpcResponse::error(
                        None,
                        PARSE_ERROR,
                        format!("Parse error: {}", e),
                    ))
                }
            };

            // Notifications get no response.
            if let Some(response) = response {
                let response_json = serde_json::to_string(&response)?;
                debug!(response = %response_json, "Sending response");

                writer.write_all(response_json.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
        }

        Ok(())
    }

    /// Handle a single request. Returns `None` for notifications.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let is_notification = request.id.is_none();

        match request.method.as_str() {
            "initialize" => Some(self.handle_initialize(request.id)),
            "initialized" | "notifications/initialized" | "notifications/cancelled" => {
                debug!(method = %request.method, "Received notification");
                None
            }
            "tools/list" => Some(JsonRpcResponse::success(
                request.id,
                serde_json::json!({ "tools": tool_definitions() }),
            )),
            "tools/call" => Some(self.handle_tool_call(request.id, request.params).await),
            "ping" => Some(JsonRpcResponse::success(
                request.id,
                Value::Object(Default::default()),
            )),
            method if is_notification => {
                debug!(method = %method, "Unknown notification, ignoring");
                None
            }
            method => {
                error!(method = %method, "Unknown method");
                Some(JsonRpcResponse::error(
                    request.id,
                    METHOD_NOT_FOUND,
                    format!("Method not found: {}", method),
                ))
            }
        }
    }

    fn handle_initialize(&self, id: Option<Value>) -> JsonRpcResponse {
        info!("Handling initialize request");

        JsonRpcResponse::success(
            id,
            serde_json::json!({
                "protocolVersion": "2024-11-05",
                "capabilities": { "tools": { "listChanged": false } },
                "serverInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                }
            }),
        )
    }

    async fn handle_tool_call(&self, id: Option<Value>, params: Option<Value>) -> JsonRpcResponse {
        let params: ToolCallParams = match params.map(serde_json::from_value) {
            Some(Ok(p)) => p,
            Some(Err(e)) => {
                return JsonRpcResponse::error(id, INVALID_PARAMS, format!("Invalid params: {}", e))
            }
            None => return JsonRpcResponse::error(id, INVALID_PARAMS, "Missing params"),
        };

        info!(tool = %params.name, "Handling tool call");

        let (text, error_kind) = match handle_tool_call(&self.state, &params.name, params.arguments)
            .await
        {
            Ok(result) => match serde_json::to_string_pretty(&result) {
                Ok(text) => (text, None),
                Err(e) => {
                    error!(error = %e, "Failed to serialize tool result");
                    return JsonRpcResponse::error(
                        id,
                        INTERNAL_ERROR,
                        format!("Internal error: {}", e),
                    );
                }
            },
            Err(e) => {
                error!(tool = %params.name, kind = e.kind(), error = %e, "Tool call failed");
                (format!("Error: {}", e), Some(e.kind().to_string()))
            }
        };

        let tool_result = ToolCallResult {
            content: vec![ToolResultContent {
                content_type: "text".to_string(),
                text,
            }],
            is_error: error_kind.as_ref().map(|_| true),
            error_kind,
        };

        match serde_json::to_value(tool_result) {
            Ok(val) => JsonRpcResponse::success(id, val),
            Err(e) => JsonRpcResponse::error(id, INTERNAL_ERROR, format!("Internal error: {}", e)),
        }
    }
}

/// All tools exposed by the server.
pub fn tool_definitions() -> Vec<Tool> {
    vec![
        condition_resolve_tool(),
        property_register_tool(),
        binding_register_tool(),
        instrumentation_point_register_tool(),
        verdict_insert_tool(),
        chain_get_tool(),
        verdicts_list_tool(),
    ]
}

fn condition_resolve_tool() -> Tool {
    Tool {
        name: "condition_resolve".to_string(),
        description: "Resolve a serialized branch condition to its shared id, registering it if new. The empty string is the root condition.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "condition": {
                    "type": "string",
                    "description": "Serialized condition, matched exactly"
                }
            },
            "required": ["condition"],
            "additionalProperties": false
        }),
    }
}

fn property_register_tool() -> Tool {
    Tool {
        name: "property_register".to_string(),
        description: "Register a property, its atoms and the function it is attached to. Re-registering returns the existing ids.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "formula_hash": { "type": "string" },
                "function": {
                    "type": "string",
                    "description": "Fully qualified function name"
                },
                "serialised_formula_structure": {},
                "serialised_bind_variables": {},
                "serialised_atom_list": {
                    "type": "array",
                    "items": {
                        "type": "array",
                        "prefixItems": [{ "type": "integer" }, { "type": "string" }]
                    },
                    "description": "(index_in_atoms, serialized atom) pairs"
                }
            },
            "required": ["formula_hash", "function", "serialised_formula_structure", "serialised_bind_variables"]
        }),
    }
}

fn binding_register_tool() -> Tool {
    Tool {
        name: "binding_register".to_string(),
        description: "Register a binding of a property's free variables within a function.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "function": { "type": "integer", "description": "Function id" },
                "binding_space_index": { "type": "integer" },
                "binding_statement_lines": {
                    "type": "array",
                    "items": { "type": "integer" }
                }
            },
            "required": ["function", "binding_space_index"]
        }),
    }
}

fn instrumentation_point_register_tool() -> Tool {
    Tool {
        name: "instrumentation_point_register".to_string(),
        description: "Register an instrumentation point for an atom under a binding.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "atom": { "type": "integer" },
                "binding": { "type": "integer" },
                "serialised_condition_sequence": {
                    "type": "array",
                    "items": { "type": "string" }
                },
                "reaching_path_length": { "type": "integer", "minimum": 0 }
            },
            "required": ["atom", "binding", "reaching_path_length"]
        }),
    }
}

fn verdict_insert_tool() -> Tool {
    Tool {
        name: "verdict_insert".to_string(),
        description: "Insert one verdict with its observations. The function call's path chain is created or extended to cover the longest reported path; all writes commit together or not at all.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "function_name": { "type": "string" },
                "property_hash": { "type": "string" },
                "bind_space_index": { "type": "integer" },
                "time_of_call": { "type": "string", "format": "date-time" },
                "http_request_time": { "type": "string", "format": "date-time" },
                "verdict": {
                    "type": "object",
                    "properties": {
                        "outcome": { "type": "boolean" },
                        "time_obtained": { "type": "string", "format": "date-time" },
                        "collapsing_atom_index": { "type": "integer" },
                        "points": {
                            "type": "array",
                            "minItems": 1,
                            "items": {
                                "type": "object",
                                "properties": {
                                    "atom_index": { "type": "integer" },
                                    "observed_value": {},
                                    "instrumentation_point": { "type": "integer" },
                                    "path": {
                                        "type": "array",
                                        "items": { "type": "integer" },
                                        "description": "Condition ids taken, root excluded"
                                    }
                                },
                                "required": ["atom_index", "observed_value", "instrumentation_point"]
                            }
                        }
                    },
                    "required": ["outcome", "time_obtained", "collapsing_atom_index", "points"]
                }
            },
            "required": ["function_name", "property_hash", "bind_space_index", "time_of_call", "http_request_time", "verdict"]
        }),
    }
}

fn chain_get_tool() -> Tool {
    Tool {
        name: "chain_get".to_string(),
        description: "Get a function call's path chain in link order, root first.".to_string(),
        input_schema: function_call_schema(),
    }
}

fn verdicts_list_tool() -> Tool {
    Tool {
        name: "verdicts_list".to_string(),
        description: "List a function call's verdicts with their observations.".to_string(),
        input_schema: function_call_schema(),
    }
}

fn function_call_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "function_call": { "type": "integer", "description": "Function call id" }
        },
        "required": ["function_call"],
        "additionalProperties": false
    })
}
