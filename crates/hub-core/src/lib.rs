use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use thiserror::Error;

/// Index of a provider inside the supervisor arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderId(pub usize);

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Handlers running inside the gateway process
    Local,
    /// A separately launched process spoken to over stdio
    Remote,
}

/// Lifecycle of a provider for the duration of one gateway session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderState {
    Discovered,
    Starting,
    Ready,
    Degraded,
    Dead,
}

impl ProviderState {
    /// Whether the state machine has an edge from `self` to `next`.
    pub fn can_transition_to(self, next: ProviderState) -> bool {
        use ProviderState::*;
        matches!(
            (self, next),
            (Discovered, Starting)
                | (Discovered, Dead)
                | (Starting, Ready)
                | (Starting, Dead)
                | (Starting, Degraded)
                | (Ready, Degraded)
                | (Ready, Dead)
                | (Degraded, Starting)
                | (Degraded, Dead)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == ProviderState::Dead
    }
}

impl fmt::Display for ProviderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderState::Discovered => "discovered",
            ProviderState::Starting => "starting",
            ProviderState::Ready => "ready",
            ProviderState::Degraded => "degraded",
            ProviderState::Dead => "dead",
        };
        f.write_str(s)
    }
}

/// Name, description and parameter schema of one callable operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

/// JSON-RPC error codes used on every stream.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub const UNKNOWN_TOOL: i32 = -32001;
    pub const PROVIDER_UNAVAILABLE: i32 = -32002;
    pub const CALL_TIMEOUT: i32 = -32003;
    pub const CANCELLED: i32 = -32004;
    pub const TOOL_FAILED: i32 = -32005;
}

#[derive(Error, Debug)]
pub enum HubError {
    #[error("Configuration error in {source_name}: {message}")]
    ConfigParse { source_name: String, message: String },

    #[error("Provider '{provider}' failed to start: {message}")]
    ProviderStartup { provider: String, message: String },

    #[error("Provider '{provider}' did not complete the handshake within {timeout_ms}ms")]
    HandshakeTimeout { provider: String, timeout_ms: u64 },

    #[error("Provider '{provider}' crashed: {message}")]
    ProviderCrashed { provider: String, message: String },

    #[error("Provider '{provider}' exhausted {attempts} restart attempts")]
    RestartsExhausted { provider: String, attempts: u32 },

    #[error("Provider '{provider}' is unavailable ({state})")]
    ProviderUnavailable { provider: String, state: ProviderState },

    #[error("Call to '{tool}' timed out after {timeout_ms}ms")]
    CallTimeout { tool: String, timeout_ms: u64 },

    #[error("Call to '{tool}' was cancelled")]
    Cancelled { tool: String },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool name collision on '{qualified}': '{dropped}' dropped in favour of '{kept}'")]
    NameCollision { qualified: String, kept: String, dropped: String },

    #[error("Malformed message on '{stream}': {message}")]
    MalformedMessage { stream: String, message: String },

    #[error("Tool execution failed for '{tool}': {message}")]
    ToolError { tool: String, message: String },

    #[error("Remote error {code}: {message}")]
    Rpc { code: i32, message: String, data: Option<Value> },

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Connection to '{0}' closed")]
    ConnectionClosed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl HubError {
    pub fn tool_error(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolError { tool: tool.into(), message: message.into() }
    }

    pub fn startup(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProviderStartup { provider: provider.into(), message: message.into() }
    }

    pub fn malformed(stream: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedMessage { stream: stream.into(), message: message.into() }
    }

    /// Short machine-readable tag carried in error `data.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            HubError::ConfigParse { .. } => "config_parse",
            HubError::ProviderStartup { .. } => "provider_startup",
            HubError::HandshakeTimeout { .. } => "handshake_timeout",
            HubError::ProviderCrashed { .. } => "provider_crashed",
            HubError::RestartsExhausted { .. } => "restarts_exhausted",
            HubError::ProviderUnavailable { .. } => "provider_unavailable",
            HubError::CallTimeout { .. } => "call_timeout",
            HubError::Cancelled { .. } => "cancelled",
            HubError::UnknownTool(_) => "unknown_tool",
            HubError::NameCollision { .. } => "name_collision",
            HubError::MalformedMessage { .. } => "malformed_message",
            HubError::ToolError { .. } => "tool_error",
            HubError::Rpc { .. } => "remote_error",
            HubError::InvalidParams(_) => "invalid_params",
            HubError::ConnectionClosed(_) => "connection_closed",
            HubError::IoError(_) => "io",
            HubError::SerializationError(_) => "serialization",
        }
    }

    /// JSON-RPC error code reported to the host.
    pub fn code(&self) -> i32 {
        match self {
            HubError::UnknownTool(_) => codes::UNKNOWN_TOOL,
            HubError::ProviderUnavailable { .. }
            | HubError::ProviderCrashed { .. }
            | HubError::RestartsExhausted { .. }
            | HubError::ProviderStartup { .. }
            | HubError::HandshakeTimeout { .. }
            | HubError::ConnectionClosed(_) => codes::PROVIDER_UNAVAILABLE,
            HubError::CallTimeout { .. } => codes::CALL_TIMEOUT,
            HubError::Cancelled { .. } => codes::CANCELLED,
            HubError::ToolError { .. } => codes::TOOL_FAILED,
            HubError::Rpc { code, .. } => *code,
            HubError::InvalidParams(_) => codes::INVALID_PARAMS,
            HubError::MalformedMessage { .. } | HubError::SerializationError(_) => {
                codes::PARSE_ERROR
            }
            HubError::ConfigParse { .. } | HubError::NameCollision { .. } | HubError::IoError(_) => {
                codes::INTERNAL_ERROR
            }
        }
    }

    /// Structured payload for the `data` member of a JSON-RPC error.
    pub fn data(&self) -> Value {
        match self {
            HubError::Rpc { data: Some(data), .. } => data.clone(),
            HubError::ProviderUnavailable { provider, state } => {
                json!({ "kind": self.kind(), "provider": provider, "state": state })
            }
            HubError::CallTimeout { tool, timeout_ms } => {
                json!({ "kind": self.kind(), "tool": tool, "timeout_ms": timeout_ms })
            }
            HubError::Cancelled { tool } | HubError::ToolError { tool, .. } => {
                json!({ "kind": self.kind(), "tool": tool })
            }
            HubError::UnknownTool(tool) => json!({ "kind": self.kind(), "tool": tool }),
            _ => json!({ "kind": self.kind() }),
        }
    }
}

pub type Result<T> = std::result::Result<T, HubError>;
