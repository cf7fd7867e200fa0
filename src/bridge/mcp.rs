//! Stdio MCP server exposing the `permission_prompt` tool
//!
//! The CLI launches this helper through `--mcp-config` and calls the tool for
//! every action not covered by `--allowedTools`. Each call is forwarded to the
//! host through [`PermissionClient`]; the decision goes back to the CLI as the
//! tool's text content.
//!
//! stdout is the JSON-RPC channel. Nothing else may be written to it, so all
//! logging goes to stderr.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::task::JoinSet;

use crate::types::{ErrorCode, PermissionDecision, PermissionRequest, Result};

use super::client::PermissionClient;

pub const TOOL_NAME: &str = "permission_prompt";
pub const SERVER_NAME: &str = "claude-chat-bridge-permissions";
const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Deserialize)]
struct JsonRpcRequest {
    #[serde(default)]
    method: String,
    #[serde(default)]
    params: Option<Value>,
    /// Absent for notifications
    #[serde(default)]
    id: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
    id: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    fn failure(id: Value, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code: code.code(),
                message: message.into(),
            }),
            id,
        }
    }
}

/// Arguments of a `permission_prompt` call
#[derive(Debug, Deserialize)]
struct PromptArguments {
    tool_use_id: String,
    tool_name: String,
    #[serde(default)]
    input: Value,
}

/// The permission helper's MCP server
#[derive(Debug, Clone)]
pub struct PermissionMcpServer {
    client: PermissionClient,
}

impl PermissionMcpServer {
    pub fn new(client: PermissionClient) -> Self {
        Self { client }
    }

    /// Serve on the process's stdin/stdout until stdin closes
    pub async fn run_stdio(self) -> Result<()> {
        let stdin = BufReader::new(tokio::io::stdin());
        let mut stdout = tokio::io::stdout();
        self.serve(stdin, &mut stdout).await
    }

    /// Serve JSON-RPC lines from `reader`, writing responses to `writer`
    ///
    /// Tool calls run concurrently, so a slow permission decision does not
    /// hold up `ping` or a second call. Returns after `reader` hits EOF and
    /// every in-flight call has answered.
    pub async fn serve<R, W>(&self, reader: R, writer: &mut W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        let mut calls: JoinSet<JsonRpcResponse> = JoinSet::new();
        let mut reading = true;

        loop {
            tokio::select! {
                line = lines.next_line(), if reading => {
                    let Some(line) = line? else {
                        tracing::debug!(in_flight = calls.len(), "stdin closed");
                        reading = false;
                        continue;
                    };
                    if let Some(response) = self.dispatch(line.trim(), &mut calls) {
                        write_response(writer, &response).await?;
                    }
                }
                Some(joined) = calls.join_next(), if !calls.is_empty() => {
                    match joined {
                        Ok(response) => write_response(writer, &response).await?,
                        Err(e) => tracing::error!(error = %e, "Permission call task failed"),
                    }
                }
                else => break,
            }
        }
        Ok(())
    }

    /// Handle one line; tool calls are queued on `calls` and answered later
    fn dispatch(&self, line: &str, calls: &mut JoinSet<JsonRpcResponse>) -> Option<JsonRpcResponse> {
        if line.is_empty() {
            return None;
        }
        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "Unparseable JSON-RPC line");
                return Some(JsonRpcResponse::failure(
                    Value::Null,
                    ErrorCode::ParseError,
                    "Parse error",
                ));
            }
        };

        let Some(id) = request.id else {
            tracing::debug!(method = %request.method, "Notification");
            return None;
        };

        match request.method.as_str() {
            "initialize" => Some(JsonRpcResponse::success(id, initialize_result())),
            "ping" => Some(JsonRpcResponse::success(id, json!({}))),
            "tools/list" => Some(JsonRpcResponse::success(id, json!({ "tools": [tool_schema()] }))),
            "tools/call" => {
                let client = self.client.clone();
                match prompt_arguments(request.params) {
                    Ok(Some(args)) => {
                        calls.spawn(async move { call_permission_prompt(client, id, args).await });
                        None
                    }
                    Ok(None) => Some(decision_response(
                        id,
                        &PermissionDecision::deny("Invalid permission_prompt arguments"),
                    )),
                    Err(name) => Some(JsonRpcResponse::failure(
                        id,
                        ErrorCode::InvalidParams,
                        format!("Unknown tool: {name}"),
                    )),
                }
            }
            other => Some(JsonRpcResponse::failure(
                id,
                ErrorCode::MethodNotFound,
                format!("Method not found: {other}"),
            )),
        }
    }
}

/// `Err(name)` for a tool other than ours, `Ok(None)` for bad arguments
fn prompt_arguments(params: Option<Value>) -> std::result::Result<Option<PromptArguments>, String> {
    let params = params.unwrap_or(Value::Null);
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    if name != TOOL_NAME {
        return Err(name.to_string());
    }
    let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
    Ok(serde_json::from_value(arguments).ok())
}

async fn call_permission_prompt(
    client: PermissionClient,
    id: Value,
    args: PromptArguments,
) -> JsonRpcResponse {
    tracing::info!(tool = %args.tool_name, tool_use_id = %args.tool_use_id, "Permission request");
    let request = PermissionRequest::new(args.tool_use_id, args.tool_name, args.input);
    let decision = client.request(&request).await;
    tracing::info!(
        tool_use_id = %request.request_id,
        allowed = decision.is_allow(),
        "Permission decision"
    );
    decision_response(id, &decision)
}

fn decision_response(id: Value, decision: &PermissionDecision) -> JsonRpcResponse {
    let text = serde_json::to_string(decision)
        .unwrap_or_else(|_| r#"{"behavior":"deny","message":"Internal error"}"#.to_string());
    JsonRpcResponse::success(id, json!({ "content": [{ "type": "text", "text": text }] }))
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "serverInfo": {
            "name": SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

fn tool_schema() -> Value {
    json!({
        "name": TOOL_NAME,
        "description": "Handle permission requests from Claude CLI",
        "inputSchema": {
            "type": "object",
            "properties": {
                "tool_use_id": { "type": "string" },
                "tool_name": { "type": "string" },
                "input": {}
            },
            "required": ["tool_use_id", "tool_name"]
        }
    })
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &JsonRpcResponse) -> Result<()> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
