//! Process-wide table of active client connections.
//!
//! All mutation goes through [`ConnectionRegistry`]; callers never see the raw
//! maps. Connections are handed out as `Arc<Connection>` so the reader and
//! writer loops can keep using one while the registry concurrently removes it.

use crate::connection::{Connection, WriterHandles};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tether_core::{
    AuditLog, BridgeError, BridgeEvent, BridgeResult, DuplicatePolicy, LinkSettings, Notifier,
    ServerMessage, ToolDescriptor, ToolRegistration,
};
use tracing::{debug, info, warn};

pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
    /// user id -> client id of that user's active bridge.
    user_index: DashMap<String, String>,
    /// user id -> tools declared by the active bridge.
    tool_catalog: DashMap<String, Vec<ToolDescriptor>>,
    pub(crate) notifier: Option<Arc<dyn Notifier>>,
    pub(crate) audit: Option<Arc<dyn AuditLog>>,
    settings: LinkSettings,
    /// Serializes `register` so the per-user swap and the insert are atomic.
    registering: Mutex<()>,
}

impl ConnectionRegistry {
    pub fn new(settings: LinkSettings) -> Self {
        Self {
            connections: DashMap::new(),
            user_index: DashMap::new(),
            tool_catalog: DashMap::new(),
            notifier: None,
            audit: None,
            settings,
            registering: Mutex::new(()),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn settings(&self) -> &LinkSettings {
        &self.settings
    }

    pub(crate) fn notify(&self, user_id: &str, event: BridgeEvent) {
        if let Some(notifier) = &self.notifier {
            notifier.publish(user_id, event);
        }
    }

    /// Validates and stores a new connection, returning it together with the
    /// receiving ends its writer loop must drain.
    pub fn register(
        &self,
        user_id: &str,
        registration: ToolRegistration,
    ) -> BridgeResult<(Arc<Connection>, WriterHandles)> {
        if user_id.trim().is_empty() {
            return Err(BridgeError::Validation("user id must not be empty".to_string()));
        }
        if registration.client_id.trim().is_empty() {
            return Err(BridgeError::Validation("client_id must not be empty".to_string()));
        }
        if registration.tools.iter().any(|t| t.name.trim().is_empty()) {
            return Err(BridgeError::Validation("every tool needs a name".to_string()));
        }
        let client_id = registration.client_id.clone();
        let _guard = self.registering.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = self.lookup(&client_id) {
            if existing.user_id != user_id {
                warn!(client_id = %client_id, user_id = %user_id, "client id is owned by another user");
                return Err(BridgeError::DuplicateClient(client_id));
            }
            match self.settings.duplicate_policy {
                DuplicatePolicy::Reject => return Err(BridgeError::DuplicateClient(client_id)),
                DuplicatePolicy::Replace => {
                    info!(client_id = %client_id, "replacing active connection with same client id");
                    self.disconnect_connection(&existing);
                }
            }
        }

        let prior = self.user_index.get(user_id).map(|c| c.value().clone());
        if let Some(prior) = prior.filter(|c| *c != client_id) {
            info!(user_id = %user_id, prior = %prior, client_id = %client_id, "user opened a new bridge; closing the prior one");
            self.disconnect(&prior);
        }

        let (conn, handles) = Connection::new(user_id, registration, self.settings.outbound_capacity);
        let conn = Arc::new(conn);
        match self.connections.entry(client_id.clone()) {
            Entry::Occupied(_) => return Err(BridgeError::DuplicateClient(client_id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&conn));
            }
        }
        self.user_index.insert(user_id.to_string(), client_id.clone());
        self.tool_catalog.insert(user_id.to_string(), conn.tools.clone());

        if let Err(e) = conn.try_enqueue(ServerMessage::connected(conn.tools.len())) {
            warn!(client_id = %client_id, error = %e, "could not queue registration ack");
        }
        self.notify(user_id, BridgeEvent::connected(true));
        info!(
            user_id = %user_id,
            client_id = %client_id,
            platform = %conn.platform,
            version = %conn.client_version,
            tools = conn.tools.len(),
            "client bridge registered"
        );
        Ok((conn, handles))
    }

    pub fn lookup(&self, client_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(client_id).map(|c| Arc::clone(c.value()))
    }

    /// The active connection of a user, if any.
    pub fn lookup_user(&self, user_id: &str) -> Option<Arc<Connection>> {
        let client_id = self.user_index.get(user_id).map(|c| c.value().clone())?;
        self.lookup(&client_id)
    }

    /// Idempotent teardown by client id. Returns true if this call removed it.
    pub fn disconnect(&self, client_id: &str) -> bool {
        match self.lookup(client_id) {
            Some(conn) => self.disconnect_connection(&conn),
            None => {
                debug!(client_id = %client_id, "disconnect for unknown client ignored");
                false
            }
        }
    }

    /// Tears down exactly this connection; a newer connection registered under
    /// the same client id is left alone.
    pub fn disconnect_connection(&self, conn: &Arc<Connection>) -> bool {
        let first = conn.shutdown();
        let removed = self
            .connections
            .remove_if(&conn.client_id, |_, c| Arc::ptr_eq(c, conn))
            .is_some();
        if removed
            && self
                .user_index
                .remove_if(&conn.user_id, |_, c| *c == conn.client_id)
                .is_some()
        {
            self.tool_catalog.remove(&conn.user_id);
        }
        if first {
            self.notify(&conn.user_id, BridgeEvent::connected(false));
            info!(user_id = %conn.user_id, client_id = %conn.client_id, "client bridge disconnected");
        }
        first || removed
    }

    pub fn touch_heartbeat(&self, client_id: &str) -> BridgeResult<()> {
        let conn = self
            .lookup(client_id)
            .ok_or_else(|| BridgeError::NotFound(format!("client {}", client_id)))?;
        conn.touch();
        Ok(())
    }

    pub fn is_user_connected(&self, user_id: &str) -> bool {
        self.lookup_user(user_id).is_some()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Tools offered by the user's client, grouped by category.
    pub fn tool_catalog(&self, user_id: &str) -> BTreeMap<String, Vec<ToolDescriptor>> {
        let mut grouped: BTreeMap<String, Vec<ToolDescriptor>> = BTreeMap::new();
        if let Some(tools) = self.tool_catalog.get(user_id) {
            for tool in tools.iter() {
                grouped
                    .entry(tool.category().to_string())
                    .or_default()
                    .push(tool.clone());
            }
        }
        grouped
    }

    /// Tears down every connection (gateway shutdown).
    pub fn disconnect_all(&self) -> usize {
        let all: Vec<Arc<Connection>> = self.connections.iter().map(|c| Arc::clone(c.value())).collect();
        all.iter().filter(|c| self.disconnect_connection(c)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tether_core::ToolDescriptor;

    fn registration(client_id: &str, tools: &[&str]) -> ToolRegistration {
        ToolRegistration {
            client_id: client_id.to_string(),
            client_version: "0.9.1".into(),
            platform: "darwin".into(),
            tools: tools
                .iter()
                .map(|name| ToolDescriptor {
                    name: name.to_string(),
                    description: String::new(),
                    parameters: serde_json::Value::Null,
                    server_name: None,
                })
                .collect(),
            servers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn register_queues_ack_and_indexes_user() {
        let registry = ConnectionRegistry::new(LinkSettings::default());
        let (conn, mut handles) = registry
            .register("alice", registration("c-1", &["read_file", "search"]))
            .expect("register");

        assert_eq!(conn.user_id, "alice");
        assert!(registry.is_user_connected("alice"));
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(registry.tool_catalog("alice")["mcp"].len(), 2);
        assert_eq!(handles.outbound.recv().await, Some(ServerMessage::connected(2)));
    }

    #[test]
    fn empty_client_id_is_a_validation_error() {
        let registry = ConnectionRegistry::new(LinkSettings::default());
        let err = registry.register("alice", registration("", &[])).unwrap_err();
        assert!(matches!(err, BridgeError::Validation(_)));
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn client_id_owned_by_another_user_is_rejected() {
        let registry = ConnectionRegistry::new(LinkSettings::default());
        registry.register("alice", registration("c-1", &[])).expect("register");
        let err = registry.register("bob", registration("c-1", &[])).unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateClient(_)));
        assert_eq!(registry.lookup("c-1").expect("still there").user_id, "alice");
    }

    #[test]
    fn reject_policy_refuses_re_registration() {
        let settings = LinkSettings {
            duplicate_policy: DuplicatePolicy::Reject,
            ..LinkSettings::default()
        };
        let registry = ConnectionRegistry::new(settings);
        registry.register("alice", registration("c-1", &[])).expect("register");
        assert!(matches!(
            registry.register("alice", registration("c-1", &[])),
            Err(BridgeError::DuplicateClient(_))
        ));
    }

    #[tokio::test]
    async fn replace_policy_tears_down_the_prior_instance_first() {
        let registry = ConnectionRegistry::new(LinkSettings::default());
        let (old, _old_handles) = registry.register("alice", registration("c-1", &[])).expect("first");
        let waiter = old.pending_results.register("call-1").expect("pending");

        let (new, _new_handles) = registry.register("alice", registration("c-1", &["x"])).expect("second");

        assert!(old.is_closed());
        assert!(!new.is_closed());
        assert!(Arc::ptr_eq(&registry.lookup("c-1").expect("lookup"), &new));
        assert!(matches!(
            waiter.wait(Duration::from_secs(1)).await,
            Err(BridgeError::ConnectionClosed)
        ));

        // Tearing down the stale instance must not touch its replacement.
        assert!(!registry.disconnect_connection(&old));
        assert!(registry.lookup("c-1").is_some());
        assert_eq!(registry.tool_catalog("alice")["mcp"].len(), 1);
    }

    #[test]
    fn new_client_for_same_user_replaces_prior_bridge() {
        let registry = ConnectionRegistry::new(LinkSettings::default());
        let (first, _h1) = registry.register("alice", registration("laptop", &[])).expect("first");
        registry.register("alice", registration("desktop", &[])).expect("second");

        assert!(first.is_closed());
        assert!(registry.lookup("laptop").is_none());
        assert_eq!(registry.lookup_user("alice").expect("active").client_id, "desktop");
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn heartbeat_for_unknown_client_is_not_found() {
        let registry = ConnectionRegistry::new(LinkSettings::default());
        assert!(matches!(registry.touch_heartbeat("ghost"), Err(BridgeError::NotFound(_))));
        registry.register("alice", registration("c-1", &[])).expect("register");
        registry.touch_heartbeat("c-1").expect("touch");
    }

    #[test]
    fn concurrent_registrations_leave_one_reachable_bridge() {
        let registry = Arc::new(ConnectionRegistry::new(LinkSettings::default()));
        let start = Arc::new(std::sync::Barrier::new(8));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let start = Arc::clone(&start);
                std::thread::spawn(move || {
                    start.wait();
                    registry
                        .register("alice", registration(&format!("device-{}", i), &["x"]))
                        .map(|(conn, _handles)| conn)
                })
            })
            .collect();
        let registered: Vec<Arc<Connection>> = threads
            .into_iter()
            .map(|t| t.join().expect("thread").expect("register"))
            .collect();

        assert_eq!(registry.connection_count(), 1);
        let active = registry.lookup_user("alice").expect("active bridge");
        assert_eq!(registered.iter().filter(|c| !c.is_closed()).count(), 1);
        assert!(registered.iter().any(|c| Arc::ptr_eq(c, &active) && !c.is_closed()));
        assert_eq!(registry.tool_catalog("alice")["mcp"].len(), 1);
    }
}
