//! MCP protocol types and JSON-RPC message structures

use hub_core::{HubError, ToolSpec};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Protocol revision spoken on every stream.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_PING: &str = "ping";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const METHOD_CANCELLED: &str = "notifications/cancelled";
pub const METHOD_TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";

/// JSON-RPC request id; echoed back exactly as received.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// Numeric value of an id we generated, accepting providers that echo it
    /// back as a string.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            RequestId::Number(n) => u64::try_from(*n).ok(),
            RequestId::String(s) => s.parse().ok(),
        }
    }
}

impl From<u64> for RequestId {
    fn from(id: u64) -> Self {
        RequestId::Number(id as i64)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response. `id` is `null` only for replies to unparseable input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response expected)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }
}

impl From<&HubError> for JsonRpcError {
    fn from(err: &HubError) -> Self {
        match err {
            // Relay provider errors verbatim
            HubError::Rpc { code, message, data } => Self {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            other => Self {
                code: other.code(),
                message: other.to_string(),
                data: Some(other.data()),
            },
        }
    }
}

impl From<JsonRpcError> for HubError {
    fn from(err: JsonRpcError) -> Self {
        HubError::Rpc { code: err.code, message: err.message, data: err.data }
    }
}

/// Client or server identification exchanged during `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

impl Default for Implementation {
    fn default() -> Self {
        Self {
            name: "mcp-hub".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Initialize request parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_info: Option<Implementation>,
}

/// Initialize response result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<Implementation>,
}

/// List tools result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListToolsResult {
    pub tools: Vec<ToolSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Tool call parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    /// Always an object on the wire; missing or `null` becomes `{}`
    #[serde(default = "empty_arguments", deserialize_with = "null_as_empty")]
    pub arguments: Value,
}

fn empty_arguments() -> Value {
    Value::Object(Map::new())
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Value, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(if value.is_null() { empty_arguments() } else { value })
}

/// Parameters of `notifications/cancelled`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_rpc_request_serialization() {
        let request = JsonRpcRequest::new(
            RequestId::Number(7),
            "initialize",
            Some(json!({ "protocolVersion": PROTOCOL_VERSION })),
        );

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":7"));
        assert!(json.contains("\"method\":\"initialize\""));
    }

    #[test]
    fn test_request_ids_round_trip_verbatim() {
        let string_id: RequestId = serde_json::from_value(json!("abc-1")).unwrap();
        assert_eq!(string_id, RequestId::String("abc-1".into()));
        assert_eq!(serde_json::to_value(&string_id).unwrap(), json!("abc-1"));

        assert_eq!(RequestId::String("12".into()).as_u64(), Some(12));
        assert_eq!(RequestId::Number(-1).as_u64(), None);
    }

    #[test]
    fn test_parse_error_response_has_null_id() {
        let response = JsonRpcResponse::failure(None, JsonRpcError::new(-32700, "Parse error"));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["id"], Value::Null);
        assert_eq!(value["error"]["code"], -32700);
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_rpc_error_relayed_verbatim() {
        let err = HubError::Rpc {
            code: -32000,
            message: "throttled".into(),
            data: Some(json!({"retry_after": 3})),
        };
        let rpc = JsonRpcError::from(&err);
        assert_eq!(rpc.code, -32000);
        assert_eq!(rpc.message, "throttled");
        assert_eq!(rpc.data, Some(json!({"retry_after": 3})));
    }

    #[test]
    fn test_missing_call_arguments_become_empty_object() {
        let omitted: ToolCallParams = serde_json::from_value(json!({"name": "aws_list"})).unwrap();
        assert_eq!(omitted.arguments, json!({}));

        let null: ToolCallParams =
            serde_json::from_value(json!({"name": "aws_list", "arguments": null})).unwrap();
        assert_eq!(serde_json::to_value(&null).unwrap()["arguments"], json!({}));

        let given: ToolCallParams =
            serde_json::from_value(json!({"name": "aws_list", "arguments": {"region": "eu"}})).unwrap();
        assert_eq!(given.arguments, json!({"region": "eu"}));
    }

    #[test]
    fn test_list_tools_result_with_cursor() {
        let result: ListToolsResult = serde_json::from_value(json!({
            "tools": [{"name": "list_resources", "description": "List", "inputSchema": {"type": "object"}}],
            "nextCursor": "page-2"
        }))
        .unwrap();
        assert_eq!(result.tools[0].name, "list_resources");
        assert_eq!(result.next_cursor.as_deref(), Some("page-2"));
    }
}
