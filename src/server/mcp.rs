//! MCP protocol implementation for JSON-RPC 2.0 communication.
//!
//! This module provides the core MCP server implementation including:
//! - JSON-RPC 2.0 request/response handling
//! - Tool definitions and schemas
//! - Stdio-based server communication with per-request cancellation

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{handle_tool_call, SharedState};
use crate::error::McpError;

#[cfg(test)]
#[path = "mcp_tests.rs"]
mod mcp_tests;

/// JSON-RPC error code for a request the client cancelled.
pub const REQUEST_CANCELLED: i32 = -32800;

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
    /// Request identifier (null if the request could not be parsed).
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// MCP server information returned during initialization.
#[derive(Debug, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// MCP server capabilities advertised to clients.
#[derive(Debug, Serialize)]
pub struct Capabilities {
    pub tools: ToolCapabilities,
}

/// Tool-specific capabilities.
#[derive(Debug, Serialize)]
pub struct ToolCapabilities {
    /// Whether the tool list can change dynamically.
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

/// Result of the MCP initialize handshake.
#[derive(Debug, Serialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: Capabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

/// MCP tool definition with JSON Schema.
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's input parameters.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Parameters for a tools/call request.
#[derive(Debug, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// Parameters of a `notifications/cancelled` notification.
#[derive(Debug, Deserialize)]
pub struct CancelledParams {
    #[serde(rename = "requestId")]
    pub request_id: Value,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Content item within a tool result.
#[derive(Debug, Serialize)]
pub struct ToolResultContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

/// Result of a tool invocation.
#[derive(Debug, Serialize)]
pub struct ToolCallResult {
    pub content: Vec<ToolResultContent>,
    /// Whether the result represents an error.
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
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
                data: None,
            }),
        }
    }
}

/// MCP Server running over stdio.
///
/// Tool calls run as independent tasks so a `notifications/cancelled` for
/// an in-flight call can be processed while it is still running. Responses
/// may therefore be written in a different order than requests arrived.
#[derive(Clone)]
pub struct McpServer {
    state: SharedState,
    /// Cancellation tokens of in-flight tool calls, keyed by request id.
    in_flight: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl McpServer {
    /// Create a new MCP server
    pub fn new(state: SharedState) -> Self {
        Self {
            state,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run the server using async stdio
    pub async fn run(&self) -> std::io::Result<()> {
        info!("MCP traffic cache server starting...");
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve newline-delimited JSON-RPC from `input` until EOF, writing
    /// responses to `output`. Returns once every in-flight call has answered.
    pub async fn serve<R, W>(&self, input: R, mut output: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<JsonRpcResponse>();

        let writer = tokio::spawn(async move {
            while let Some(response) = rx.recv().await {
                let response_json = serde_json::to_string(&response)?;
                debug!(response = %response_json, "Sending response");

                output.write_all(response_json.as_bytes()).await?;
                output.write_all(b"\n").await?;
                output.flush().await?;
            }
            Ok::<(), std::io::Error>(())
        });

        let mut reader = BufReader::new(input);
        let mut line = String::new();

        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await?;

            // EOF reached
            if bytes_read == 0 {
                info!("EOF received, shutting down");
                break;
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            debug!(request = %trimmed, "Received request");

            let request = match serde_json::from_str::<JsonRpcRequest>(trimmed) {
                Ok(request) => request,
                Err(e) => {
                    error!(error = %e, "Failed to parse request");
                    let _ = tx.send(JsonRpcResponse::error(
                        None,
                        -32700,
                        format!("Parse error: {}", e),
                    ));
                    continue;
                }
            };

            if request.method == "tools/call" {
                // Registered before the next line is read, so a cancel
                // that follows immediately still finds the call.
                let token = self.register_call(request.id.as_ref());
                let server = self.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let response = server
                        .handle_tool_call(request.id, request.params, token)
                        .await;
                    let _ = tx.send(response);
                });
            } else if let Some(response) = self.handle_request(request).await {
                let _ = tx.send(response);
            }
        }

        // The writer drains until every spawned call has dropped its sender.
        drop(tx);
        writer.await.map_err(std::io::Error::other)?
    }

    /// Handle a single JSON-RPC request
    /// Returns None for notifications (requests without id) as JSON-RPC 2.0 requires
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let is_notification = request.id.is_none();

        match request.method.as_str() {
            "initialize" => Some(self.handle_initialize(request.id)),
            "initialized" | "notifications/initialized" => {
                debug!("Received initialized notification");
                None
            }
            "notifications/cancelled" => {
                self.handle_cancelled(request.params);
                None
            }
            "tools/list" => Some(self.handle_tools_list(request.id)),
            "tools/call" => {
                let token = self.register_call(request.id.as_ref());
                Some(self.handle_tool_call(request.id, request.params, token).await)
            }
            "ping" => Some(JsonRpcResponse::success(
                request.id,
                Value::Object(Default::default()),
            )),
            method => {
                // For unknown methods, only respond if it's a request (has id)
                if is_notification {
                    debug!(method = %method, "Unknown notification, ignoring");
                    None
                } else {
                    error!(method = %method, "Unknown method");
                    Some(JsonRpcResponse::error(
                        request.id,
                        -32601,
                        format!("Method not found: {}", method),
                    ))
                }
            }
        }
    }

    /// Cancel the in-flight call with `request_id`. Returns whether one was found.
    pub fn cancel_request(&self, request_id: &Value) -> bool {
        let token = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request_key(request_id))
            .cloned();

        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Track a tool call under its request id so it can be cancelled.
    fn register_call(&self, id: Option<&Value>) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(id) = id {
            self.in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(request_key(id), token.clone());
        }
        token
    }

    fn release_call(&self, id: Option<&Value>) {
        if let Some(id) = id {
            self.in_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&request_key(id));
        }
    }

    /// Number of tool calls currently running.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn handle_cancelled(&self, params: Option<Value>) {
        let params: CancelledParams = match params.map(serde_json::from_value).transpose() {
            Ok(Some(p)) => p,
            Ok(None) => {
                warn!("Cancellation notification without params");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Malformed cancellation notification");
                return;
            }
        };

        // A call that already finished is not an error.
        let found = self.cancel_request(&params.request_id);
        info!(
            request_id = %params.request_id,
            reason = params.reason.as_deref().unwrap_or(""),
            found,
            "Cancellation requested"
        );
    }

    /// Handle initialize request
    fn handle_initialize(&self, id: Option<Value>) -> JsonRpcResponse {
        info!("Handling initialize request");

        let result = InitializeResult {
            protocol_version: "2024-11-05".to_string(),
            capabilities: Capabilities {
                tools: ToolCapabilities {
                    list_changed: false,
                },
            },
            server_info: ServerInfo {
                name: "mcp-traffic-cache".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        };

        match serde_json::to_value(result) {
            Ok(val) => JsonRpcResponse::success(id, val),
            Err(e) => {
                error!(error = %e, "Failed to serialize initialize result");
                JsonRpcResponse::error(id, -32603, format!("Internal error: {}", e))
            }
        }
    }

    /// Handle tools/list request
    fn handle_tools_list(&self, id: Option<Value>) -> JsonRpcResponse {
        info!("Handling tools/list request");

        JsonRpcResponse::success(
            id,
            serde_json::json!({
                "tools": tool_definitions()
            }),
        )
    }

    /// Handle tools/call request, releasing its registry entry when done.
    async fn handle_tool_call(
        &self,
        id: Option<Value>,
        params: Option<Value>,
        token: CancellationToken,
    ) -> JsonRpcResponse {
        let response = self.run_tool_call(id.clone(), params, &token).await;
        self.release_call(id.as_ref());
        response
    }

    async fn run_tool_call(
        &self,
        id: Option<Value>,
        params: Option<Value>,
        token: &CancellationToken,
    ) -> JsonRpcResponse {
        let params: ToolCallParams = match params {
            Some(p) => match serde_json::from_value(p) {
                Ok(p) => p,
                Err(e) => {
                    return JsonRpcResponse::error(id, -32602, format!("Invalid params: {}", e));
                }
            },
            None => {
                return JsonRpcResponse::error(id, -32602, "Missing params");
            }
        };

        info!(tool = %params.name, "Handling tool call");

        let outcome = if token.is_cancelled() {
            Err(McpError::Cancelled)
        } else {
            handle_tool_call(&self.state, &params.name, params.arguments, token).await
        };

        let (content, is_error) = match outcome {
            Ok(result) => {
                let text = serde_json::to_string_pretty(&result).unwrap_or_else(|e| {
                    error!(error = %e, "Failed to serialize tool result");
                    format!("{{\"error\": \"Serialization failed: {}\"}}", e)
                });
                (
                    ToolResultContent {
                        content_type: "text".to_string(),
                        text,
                    },
                    None,
                )
            }
            Err(McpError::Cancelled) => {
                info!(tool = %params.name, "Tool call cancelled");
                return JsonRpcResponse::error(id, REQUEST_CANCELLED, "Request cancelled");
            }
            Err(e) => (
                ToolResultContent {
                    content_type: "text".to_string(),
                    text: format!("Error: {}", e),
                },
                Some(true),
            ),
        };

        let tool_result = ToolCallResult {
            content: vec![content],
            is_error,
        };

        match serde_json::to_value(tool_result) {
            Ok(val) => JsonRpcResponse::success(id, val),
            Err(e) => {
                error!(error = %e, "Failed to serialize tool call result");
                JsonRpcResponse::error(id, -32603, format!("Internal error: {}", e))
            }
        }
    }
}

/// Registry key for a request id; `1` and `"1"` are distinct.
fn request_key(id: &Value) -> String {
    id.to_string()
}

/// Every tool the server exposes.
pub fn tool_definitions() -> Vec<Tool> {
    vec![
        get_traffic_area_tool(),
        get_traffic_refresh_tool(),
        get_events_area_tool(),
        get_events_recent_tool(),
        get_events_types_tool(),
        get_events_severities_tool(),
    ]
}

fn area_properties() -> serde_json::Map<String, Value> {
    let schema = serde_json::json!({
        "lat1": { "type": "number", "minimum": -90, "maximum": 90, "description": "Latitude of the first corner" },
        "lon1": { "type": "number", "minimum": -180, "maximum": 180, "description": "Longitude of the first corner" },
        "lat2": { "type": "number", "minimum": -90, "maximum": 90, "description": "Latitude of the opposite corner" },
        "lon2": { "type": "number", "minimum": -180, "maximum": 180, "description": "Longitude of the opposite corner" },
        "caller_id": { "type": "string", "description": "Optional caller identity, used for logging only" }
    });

    match schema {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    }
}

fn area_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": area_properties(),
        "required": ["lat1", "lon1", "lat2", "lon2"],
        "additionalProperties": false
    })
}

fn get_traffic_area_tool() -> Tool {
    Tool {
        name: "traffic_area".to_string(),
        description: "Traffic flow inside a rectangle: per-segment speeds, congestion levels and area averages. Stale or missing data is refreshed first.".to_string(),
        input_schema: area_schema(),
    }
}

fn get_traffic_refresh_tool() -> Tool {
    Tool {
        name: "traffic_refresh".to_string(),
        description: "Force a refresh of flow and incident data for a rectangle, then return its traffic flow.".to_string(),
        input_schema: area_schema(),
    }
}

fn get_events_area_tool() -> Tool {
    let mut properties = area_properties();
    properties.insert(
        "event_type".to_string(),
        serde_json::json!({
            "type": "string",
            "enum": crate::geo::IncidentType::ALL.map(|t| t.as_str()),
            "description": "Only return incidents of this type"
        }),
    );
    properties.insert(
        "severity".to_string(),
        serde_json::json!({
            "type": "string",
            "enum": crate::geo::Severity::ALL.map(|s| s.as_str()),
            "description": "Only return incidents of this severity"
        }),
    );
    properties.insert(
        "from_date".to_string(),
        serde_json::json!({ "type": "string", "format": "date-time", "description": "Earliest start time (inclusive)" }),
    );
    properties.insert(
        "to_date".to_string(),
        serde_json::json!({ "type": "string", "format": "date-time", "description": "Latest start time (inclusive)" }),
    );

    Tool {
        name: "events_area".to_string(),
        description: "Traffic incidents inside a rectangle, optionally filtered by type, severity and start-time range, with counts per type.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": ["lat1", "lon1", "lat2", "lon2"],
            "additionalProperties": false
        }),
    }
}

fn get_events_recent_tool() -> Tool {
    Tool {
        name: "events_recent".to_string(),
        description: "Most recent incidents recorded anywhere in the last N hours (no refresh).".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "hours": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": 168,
                    "default": 24,
                    "description": "Look-back window in hours"
                },
                "caller_id": {
                    "type": "string",
                    "description": "Optional caller identity, used for logging only"
                }
            },
            "additionalProperties": false
        }),
    }
}

fn get_events_types_tool() -> Tool {
    Tool {
        name: "events_types".to_string(),
        description: "List the incident types with their display labels.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        }),
    }
}

fn get_events_severities_tool() -> Tool {
    Tool {
        name: "events_severities".to_string(),
        description: "List the incident severities with their display labels.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        }),
    }
}
