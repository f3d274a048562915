//! tether-bridge: one persistent connection per user between a local agent
//! and the cloud. Registry, reader/writer loops, request correlation and
//! state reconciliation.

mod calls;
mod connection;
mod correlation;
mod reader;
mod reconcile;
mod registry;
mod transport;
mod writer;

pub use calls::ConnectionSummary;
pub use connection::{Connection, WriterHandles};
pub use correlation::{Correlator, Delivery, PendingReply};
pub use reader::{serve_connection, ReaderExit, AUTH_REQUIRED, INVALID_REGISTRATION};
pub use reconcile::{
    memory_key, skill_key, SectionReport, StateReconciler, SyncReport, MEMORY_SOURCE,
    PERSONA_CONFIDENCE, PERSONA_SOURCE, SKILL_SOURCE,
};
pub use registry::ConnectionRegistry;
pub use transport::{memory_transport, Frame, FrameSink, FrameSource, MemoryPeer, MemorySink, MemorySource};
pub use writer::{run_writer, WriterExit};
