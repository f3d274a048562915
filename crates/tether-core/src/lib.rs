//! tether-core: wire envelopes, domain models, configuration, entity stores
//! and the event bus shared by the bridge and the gateway.

mod config;
mod envelope;
mod error;
mod events;
mod models;
mod store;

pub use config::{BridgeConfig, DuplicatePolicy, LinkSettings};
pub use envelope::{ClientMessage, Envelope, ServerMessage, SyncPayload};
pub use error::{BridgeError, BridgeResult, ProtocolError, StoreError};
pub use events::{EventBus, Notifier};
pub use models::{
    AuditEntry, BridgeEvent, CommandAck, EngramEntry, EngramKind, Identity, PersonaCategory,
    PersonaFact, ServerCommand, ServerConfig, ToolCall, ToolDescriptor, ToolRegistration,
    ToolResult, BRIDGE_STATE_UPDATED, DEFAULT_TOOL_CATEGORY,
};
pub use store::{AuditLog, EngramStore, PersonaStore, SessionResolver, SledVault};
