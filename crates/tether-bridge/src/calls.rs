//! Cloud-initiated requests: tool calls and server commands awaiting a
//! correlated reply, plus fire-and-forget pushes and status queries.

use crate::connection::Connection;
use crate::registry::ConnectionRegistry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{
    AuditEntry, BridgeError, BridgeResult, PersonaFact, ServerCommand, ServerConfig, ServerMessage,
    ToolCall,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Snapshot of a user's active bridge.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub client_id: String,
    pub client_version: String,
    pub platform: String,
    pub tool_count: usize,
    pub servers: Vec<String>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl From<&Connection> for ConnectionSummary {
    fn from(conn: &Connection) -> Self {
        Self {
            client_id: conn.client_id.clone(),
            client_version: conn.client_version.clone(),
            platform: conn.platform.clone(),
            tool_count: conn.tools.len(),
            servers: conn.server_names(),
            connected_at: conn.connected_at,
            last_heartbeat: conn.last_heartbeat(),
        }
    }
}

impl ConnectionRegistry {
    fn require_user(&self, user_id: &str) -> BridgeResult<Arc<Connection>> {
        self.lookup_user(user_id)
            .ok_or_else(|| BridgeError::NotFound(format!("no bridge client connected for user {}", user_id)))
    }

    /// Runs `tool_name` on the user's client and returns its result text.
    /// `timeout` defaults to the configured tool-call timeout.
    #[instrument(skip_all, fields(user_id = %user_id, tool = %tool_name))]
    pub async fn execute_tool(
        &self,
        user_id: &str,
        tool_name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> BridgeResult<String> {
        let outcome = self.call_tool(user_id, tool_name, arguments, timeout).await;
        self.audit_tool(user_id, tool_name, &outcome);
        outcome
    }

    async fn call_tool(
        &self,
        user_id: &str,
        tool_name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> BridgeResult<String> {
        let conn = self.require_user(user_id)?;
        let timeout = timeout.unwrap_or(self.settings().tool_call_timeout);
        let call_id = Uuid::new_v4().to_string();
        let pending = conn.pending_results.register(call_id.clone())?;

        let call = ToolCall {
            call_id: call_id.clone(),
            tool_name: tool_name.to_string(),
            arguments,
            timeout: timeout.as_secs().max(1),
        };
        conn.enqueue(ServerMessage::ToolCall(call), self.settings().enqueue_timeout)
            .await?;
        debug!(call_id = %call_id, "tool call sent");

        let result = pending.wait(timeout).await?;
        if result.success {
            Ok(result.result)
        } else {
            Err(BridgeError::ToolFailed(
                result.error.unwrap_or_else(|| "tool reported failure".to_string()),
            ))
        }
    }

    fn audit_tool(&self, user_id: &str, tool_name: &str, outcome: &BridgeResult<String>) {
        let Some(audit) = &self.audit else {
            return;
        };
        let error = outcome.as_ref().err().map(|e| e.to_string());
        let entry = AuditEntry::new(user_id, tool_name, outcome.is_ok(), error);
        if let Err(e) = audit.record(&entry) {
            warn!(user_id = %user_id, tool = %tool_name, error = %e, "failed to record tool audit entry");
        }
    }

    /// Sends a server management command and waits for the client's ack.
    #[instrument(skip_all, fields(user_id = %user_id, action = command.name(), server = %command.server_name()))]
    pub async fn send_server_command(&self, user_id: &str, command: ServerCommand) -> BridgeResult<()> {
        let conn = self.require_user(user_id)?;
        let request_id = Uuid::new_v4().to_string();
        let pending = conn.pending_commands.register(request_id.clone())?;

        conn.enqueue(
            ServerMessage::Command {
                request_id: request_id.clone(),
                command,
            },
            self.settings().enqueue_timeout,
        )
        .await?;

        let ack = pending.wait(self.settings().command_timeout).await?;
        if ack.success {
            info!(request_id = %request_id, "server command acknowledged");
            Ok(())
        } else {
            Err(BridgeError::CommandFailed(
                ack.error.unwrap_or_else(|| "client rejected command".to_string()),
            ))
        }
    }

    /// Pushes persona facts to the client without waiting. No-op when the
    /// user has no bridge; dropped with a warning when the queue is full.
    pub fn push_persona_sync(&self, user_id: &str, facts: Vec<PersonaFact>) {
        let count = facts.len();
        self.push(user_id, ServerMessage::PersonaSync { facts }, |user_id| {
            info!(user_id = %user_id, facts = count, "persona sync pushed")
        });
    }

    /// Asks the client to re-send its local state.
    pub fn request_sync(&self, user_id: &str) {
        self.push(user_id, ServerMessage::RequestSync, |user_id| {
            info!(user_id = %user_id, "sync requested")
        });
    }

    fn push(&self, user_id: &str, msg: ServerMessage, on_sent: impl FnOnce(&str)) {
        let Some(conn) = self.lookup_user(user_id) else {
            return;
        };
        let kind = msg.kind();
        match conn.try_enqueue(msg) {
            Ok(()) => on_sent(user_id),
            Err(e) => warn!(user_id = %user_id, kind, error = %e, "push dropped"),
        }
    }

    pub fn connection_summary(&self, user_id: &str) -> Option<ConnectionSummary> {
        self.lookup_user(user_id)
            .map(|conn| ConnectionSummary::from(conn.as_ref()))
    }

    /// Tool servers configured on the user's client.
    pub fn user_servers(&self, user_id: &str) -> BridgeResult<Vec<ServerConfig>> {
        Ok(self.require_user(user_id)?.servers.clone())
    }
}
