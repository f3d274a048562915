//! Domain models: what a client declares, what it reports back, and the
//! cloud-side entities that synchronization writes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Category used for tools whose descriptor carries no server name.
pub const DEFAULT_TOOL_CATEGORY: &str = "mcp";

/// Identity attached to an established connection by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub auth_type: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, auth_type: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            auth_type: auth_type.into(),
        }
    }

    /// An identity is usable only when it names a real user.
    pub fn is_authenticated(&self) -> bool {
        let id = self.user_id.trim();
        !id.is_empty() && id != "anonymous"
    }
}

// -----------------------------------------------------------------------------
// Registration
// -----------------------------------------------------------------------------

/// A tool the client exposes to the cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the tool arguments.
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Tool server on the client that provides this tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

impl ToolDescriptor {
    /// Catalog category: the providing server, or [`DEFAULT_TOOL_CATEGORY`].
    pub fn category(&self) -> &str {
        self.server_name
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_TOOL_CATEGORY)
    }
}

/// A tool server configured on the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(rename = "type", default = "default_server_type")]
    pub kind: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_server_type() -> String {
    "stdio".to_string()
}

fn default_enabled() -> bool {
    true
}

/// Payload of `register_tools`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRegistration {
    pub client_id: String,
    #[serde(default)]
    pub client_version: String,
    #[serde(default)]
    pub platform: String,
    pub tools: Vec<ToolDescriptor>,
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

// -----------------------------------------------------------------------------
// Correlated replies
// -----------------------------------------------------------------------------

/// Payload of `tool_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub success: bool,
    #[serde(default)]
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of `server_command_ack`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAck {
    pub request_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of an outbound `tool_call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    /// Seconds the client may spend on the call.
    pub timeout: u64,
}

/// Management command for a tool server on the client.
///
/// Goes out as an envelope whose type is [`ServerCommand::name`] and whose
/// payload is the command fields plus `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ServerCommand {
    AddServer {
        name: String,
        #[serde(default)]
        description: String,
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    ToggleServer {
        name: String,
        enabled: bool,
    },
    RemoveServer {
        name: String,
    },
}

impl ServerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AddServer { .. } => "add_server",
            Self::ToggleServer { .. } => "toggle_server",
            Self::RemoveServer { .. } => "remove_server",
        }
    }

    pub fn server_name(&self) -> &str {
        match self {
            Self::AddServer { name, .. }
            | Self::ToggleServer { name, .. }
            | Self::RemoveServer { name } => name,
        }
    }

    /// Command fields with `request_id` merged in.
    pub fn to_payload(&self, request_id: &str) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(map) = value.as_object_mut() {
            map.remove("action");
            map.insert(
                "request_id".to_string(),
                serde_json::Value::String(request_id.to_string()),
            );
        }
        value
    }
}

// -----------------------------------------------------------------------------
// Synchronized entities
// -----------------------------------------------------------------------------

/// Cloud engram type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngramKind {
    UserFact,
    StatusLog,
    DaemonOutput,
}

impl EngramKind {
    /// Maps a client memory type; anything unmapped becomes `UserFact`.
    pub fn from_memory_type(memory_type: &str) -> Self {
        match memory_type {
            "fact" | "preference" => Self::UserFact,
            "context" => Self::StatusLog,
            "skill_note" => Self::DaemonOutput,
            _ => Self::UserFact,
        }
    }
}

/// A unit of synchronized memory. Unique per `(user_id, key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngramEntry {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: EngramKind,
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub summary: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl EngramEntry {
    pub fn new(
        user_id: impl Into<String>,
        kind: EngramKind,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: None,
            user_id: user_id.into(),
            kind,
            key: key.into(),
            value: value.into(),
            summary: String::new(),
            source: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonaCategory {
    Personality,
    Expertise,
    Communication,
}

/// An attribute describing the user. Unique per user by case-insensitive content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonaFact {
    pub id: Uuid,
    pub user_id: String,
    pub category: PersonaCategory,
    pub content: String,
    pub confidence: f64,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl PersonaFact {
    pub fn new(
        user_id: impl Into<String>,
        category: PersonaCategory,
        content: impl Into<String>,
        confidence: f64,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            category,
            content: content.into(),
            confidence: confidence.clamp(0.0, 1.0),
            source: source.into(),
            created_at: Utc::now(),
        }
    }
}

/// One audited tool execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub user_id: String,
    pub tool_name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        user_id: impl Into<String>,
        tool_name: impl Into<String>,
        success: bool,
        error: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            tool_name: tool_name.into(),
            success,
            error,
            recorded_at: Utc::now(),
        }
    }
}

// -----------------------------------------------------------------------------
// Notifications
// -----------------------------------------------------------------------------

pub const BRIDGE_STATE_UPDATED: &str = "bridge_state_updated";

/// Notification for cloud-side observers of a user's bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl BridgeEvent {
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            at: Utc::now(),
        }
    }

    pub fn connected(connected: bool) -> Self {
        Self::new(
            BRIDGE_STATE_UPDATED,
            serde_json::json!({ "bridge_connected": connected }),
        )
    }

    pub fn memory_updated() -> Self {
        Self::new(
            BRIDGE_STATE_UPDATED,
            serde_json::json!({ "memory_updated": true }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_types_map_to_engram_kinds() {
        assert_eq!(EngramKind::from_memory_type("fact"), EngramKind::UserFact);
        assert_eq!(EngramKind::from_memory_type("preference"), EngramKind::UserFact);
        assert_eq!(EngramKind::from_memory_type("context"), EngramKind::StatusLog);
        assert_eq!(EngramKind::from_memory_type("skill_note"), EngramKind::DaemonOutput);
        assert_eq!(EngramKind::from_memory_type("mystery"), EngramKind::UserFact);
    }

    #[test]
    fn anonymous_identity_is_not_authenticated() {
        assert!(Identity::new("u-1", "jwt").is_authenticated());
        assert!(!Identity::new("anonymous", "none").is_authenticated());
        assert!(!Identity::new("  ", "jwt").is_authenticated());
    }

    #[test]
    fn command_payload_carries_request_id_and_fields() {
        let cmd = ServerCommand::ToggleServer {
            name: "fs".into(),
            enabled: false,
        };
        let payload = cmd.to_payload("req-9");
        assert_eq!(payload["request_id"], "req-9");
        assert_eq!(payload["name"], "fs");
        assert_eq!(payload["enabled"], false);
        assert!(payload.get("action").is_none());
        assert_eq!(cmd.name(), "toggle_server");
    }

    #[test]
    fn tool_category_falls_back_to_default() {
        let mut tool = ToolDescriptor {
            name: "read_file".into(),
            description: String::new(),
            parameters: serde_json::Value::Null,
            server_name: None,
        };
        assert_eq!(tool.category(), DEFAULT_TOOL_CATEGORY);
        tool.server_name = Some("filesystem".into());
        assert_eq!(tool.category(), "filesystem");
    }
}
