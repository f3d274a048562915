//! Wire envelope and the typed message vocabularies for both directions.
//!
//! Every frame is `{type, payload}`. Inbound frames are decoded in two steps:
//! the envelope itself (a failure there is fatal to the connection), then the
//! payload for the given type (a failure there is answered with an `error`
//! envelope and the connection carries on).

use crate::error::ProtocolError;
use crate::models::{CommandAck, PersonaFact, ServerCommand, ToolCall, ToolRegistration, ToolResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// The wire-level unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// State reported by the client in `sync_state` / `memory_update`.
///
/// Sections stay undecoded here: the reconciler decodes each one on its own
/// so a malformed section never rejects the others.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memories: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skills: Option<Value>,
}

impl SyncPayload {
    /// Keeps only the `memories` section.
    pub fn memories_only(self) -> Self {
        Self {
            memories: self.memories,
            persona: None,
            skills: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.memories.is_none() && self.persona.is_none() && self.skills.is_none()
    }
}

/// Client → cloud messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    RegisterTools(ToolRegistration),
    ToolResult(ToolResult),
    ServerCommandAck(CommandAck),
    SyncState(SyncPayload),
    MemoryUpdate(SyncPayload),
    Heartbeat,
    Disconnect,
}

impl ClientMessage {
    pub const REGISTER_TOOLS: &'static str = "register_tools";
    pub const TOOL_RESULT: &'static str = "tool_result";
    pub const SERVER_COMMAND_ACK: &'static str = "server_command_ack";
    pub const SYNC_STATE: &'static str = "sync_state";
    pub const MEMORY_UPDATE: &'static str = "memory_update";
    pub const HEARTBEAT: &'static str = "heartbeat";
    pub const DISCONNECT: &'static str = "disconnect";

    pub fn kind(&self) -> &'static str {
        match self {
            Self::RegisterTools(_) => Self::REGISTER_TOOLS,
            Self::ToolResult(_) => Self::TOOL_RESULT,
            Self::ServerCommandAck(_) => Self::SERVER_COMMAND_ACK,
            Self::SyncState(_) => Self::SYNC_STATE,
            Self::MemoryUpdate(_) => Self::MEMORY_UPDATE,
            Self::Heartbeat => Self::HEARTBEAT,
            Self::Disconnect => Self::DISCONNECT,
        }
    }

    /// Strict decode-and-validate of an inbound envelope.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let Envelope { kind, payload } = envelope;
        match kind.as_str() {
            Self::REGISTER_TOOLS => {
                let registration: ToolRegistration = decode(Self::REGISTER_TOOLS, payload)?;
                validate_registration(&registration)?;
                Ok(Self::RegisterTools(registration))
            }
            Self::TOOL_RESULT => {
                let result: ToolResult = decode(Self::TOOL_RESULT, payload)?;
                require_id(Self::TOOL_RESULT, "call_id", &result.call_id)?;
                Ok(Self::ToolResult(result))
            }
            Self::SERVER_COMMAND_ACK => {
                let ack: CommandAck = decode(Self::SERVER_COMMAND_ACK, payload)?;
                require_id(Self::SERVER_COMMAND_ACK, "request_id", &ack.request_id)?;
                Ok(Self::ServerCommandAck(ack))
            }
            Self::SYNC_STATE => Ok(Self::SyncState(decode_sync(Self::SYNC_STATE, payload)?)),
            Self::MEMORY_UPDATE => Ok(Self::MemoryUpdate(
                decode_sync(Self::MEMORY_UPDATE, payload)?.memories_only(),
            )),
            Self::HEARTBEAT => Ok(Self::Heartbeat),
            Self::DISCONNECT => Ok(Self::Disconnect),
            _ => Err(ProtocolError::UnknownType(kind.clone())),
        }
    }
}

fn decode<T: DeserializeOwned>(kind: &'static str, payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|source| ProtocolError::InvalidPayload { kind, source })
}

fn decode_sync(kind: &'static str, payload: Value) -> Result<SyncPayload, ProtocolError> {
    if payload.is_null() {
        return Ok(SyncPayload::default());
    }
    decode(kind, payload)
}

fn require_id(kind: &'static str, field: &str, value: &str) -> Result<(), ProtocolError> {
    if value.trim().is_empty() {
        return Err(ProtocolError::Rejected {
            kind,
            reason: format!("{} must not be empty", field),
        });
    }
    Ok(())
}

fn validate_registration(registration: &ToolRegistration) -> Result<(), ProtocolError> {
    require_id(ClientMessage::REGISTER_TOOLS, "client_id", &registration.client_id)?;
    if let Some(pos) = registration.tools.iter().position(|t| t.name.trim().is_empty()) {
        return Err(ProtocolError::Rejected {
            kind: ClientMessage::REGISTER_TOOLS,
            reason: format!("tool #{} has no name", pos),
        });
    }
    Ok(())
}

/// Cloud → client messages.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Ack {
        status: String,
        tools_registered: usize,
    },
    Error {
        message: String,
    },
    ToolCall(ToolCall),
    Command {
        request_id: String,
        command: ServerCommand,
    },
    PersonaSync {
        facts: Vec<PersonaFact>,
    },
    RequestSync,
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn connected(tools_registered: usize) -> Self {
        Self::Ack {
            status: "connected".to_string(),
            tools_registered,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ack { .. } => "ack",
            Self::Error { .. } => "error",
            Self::ToolCall(_) => "tool_call",
            Self::Command { command, .. } => command.name(),
            Self::PersonaSync { .. } => "persona_sync",
            Self::RequestSync => "request_sync",
        }
    }

    pub fn to_envelope(&self) -> Envelope {
        let payload = match self {
            Self::Ack {
                status,
                tools_registered,
            } => json!({ "status": status, "tools_registered": tools_registered }),
            Self::Error { message } => json!({ "message": message }),
            Self::ToolCall(call) => json!({
                "call_id": call.call_id,
                "tool_name": call.tool_name,
                "arguments": call.arguments,
                "timeout": call.timeout,
            }),
            Self::Command {
                request_id,
                command,
            } => command.to_payload(request_id),
            Self::PersonaSync { facts } => json!({ "facts": facts }),
            Self::RequestSync => json!({}),
        };
        Envelope::new(self.kind(), payload)
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        self.to_envelope().encode()
    }
}
