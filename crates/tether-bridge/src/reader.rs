//! Reader loop: one per physical connection.
//!
//! Inbound messages are dispatched strictly in order. Per-message failures
//! are answered or logged and never end the loop; a transport failure, an
//! undecodable frame, an explicit `disconnect` or the liveness deadline does.

use crate::connection::Connection;
use crate::correlation::Delivery;
use crate::reconcile::StateReconciler;
use crate::registry::ConnectionRegistry;
use crate::transport::{Frame, FrameSink, FrameSource};
use crate::writer::{run_writer, WriterExit};
use std::sync::Arc;
use tether_core::{
    BridgeEvent, ClientMessage, Envelope, Identity, ProtocolError, ServerMessage,
    SyncPayload, ToolRegistration,
};
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

pub const AUTH_REQUIRED: &str = "Authentication required";
pub const INVALID_REGISTRATION: &str = "Invalid registration format";

/// Why the reader loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderExit {
    Unauthenticated,
    /// Client sent `disconnect`.
    ClientDisconnect,
    /// Close frame or end of stream.
    PeerClosed,
    TransportError(String),
    DecodeError(String),
    LivenessTimeout,
    /// The registry tore this connection down (replaced or closed by an operator).
    Stopped,
}

/// Serves one physical connection until it ends, then tears down whatever
/// it registered and closes the sink.
pub async fn serve_connection<R, W>(
    registry: Arc<ConnectionRegistry>,
    reconciler: Arc<StateReconciler>,
    identity: Option<Identity>,
    source: R,
    sink: W,
) -> ReaderExit
where
    R: FrameSource,
    W: FrameSink + 'static,
{
    let sink = Arc::new(Mutex::new(sink));
    let identity = match identity.filter(Identity::is_authenticated) {
        Some(identity) => identity,
        None => {
            warn!("rejecting unauthenticated bridge connection");
            send_error(&sink, AUTH_REQUIRED).await;
            let _ = sink.lock().await.close().await;
            return ReaderExit::Unauthenticated;
        }
    };
    debug!(user_id = %identity.user_id, auth = %identity.auth_type, "bridge connection accepted");

    let mut reader = ReaderLoop {
        registry,
        reconciler,
        user_id: identity.user_id,
        sink,
        current: None,
        stop: None,
        writer: None,
    };
    let exit = reader.run(source).await;
    reader.finish(&exit).await;
    exit
}

struct ReaderLoop<W: FrameSink + 'static> {
    registry: Arc<ConnectionRegistry>,
    reconciler: Arc<StateReconciler>,
    user_id: String,
    sink: Arc<Mutex<W>>,
    current: Option<Arc<Connection>>,
    stop: Option<watch::Receiver<bool>>,
    writer: Option<JoinHandle<WriterExit>>,
}

/// Dispatch outcome for one inbound message.
enum Flow {
    Continue,
    End(ReaderExit),
}

impl<W: FrameSink + 'static> ReaderLoop<W> {
    async fn run<R: FrameSource>(&mut self, mut source: R) -> ReaderExit {
        let read_timeout = self.registry.settings().read_timeout;
        let mut deadline = Instant::now() + read_timeout;
        loop {
            let next = tokio::select! {
                next = timeout_at(deadline, source.next_frame()) => next,
                _ = stopped(&mut self.stop) => return ReaderExit::Stopped,
                joined = writer_ended(&mut self.writer) => {
                    self.writer = None;
                    return match joined {
                        Ok(WriterExit::SendFailed(e)) => ReaderExit::TransportError(e),
                        Ok(WriterExit::Stopped | WriterExit::QueueClosed) => ReaderExit::Stopped,
                        Err(e) => ReaderExit::TransportError(format!("writer task failed: {}", e)),
                    };
                }
            };
            let frame = match next {
                Err(_) => return ReaderExit::LivenessTimeout,
                Ok(None) => return ReaderExit::PeerClosed,
                Ok(Some(Err(e))) => return ReaderExit::TransportError(e.to_string()),
                Ok(Some(Ok(frame))) => frame,
            };
            match frame {
                Frame::Text(text) => {
                    let envelope = match Envelope::decode(&text) {
                        Ok(envelope) => envelope,
                        Err(e) => return ReaderExit::DecodeError(e.to_string()),
                    };
                    deadline = Instant::now() + read_timeout;
                    if let Flow::End(exit) = self.dispatch(envelope).await {
                        return exit;
                    }
                }
                Frame::Pong => deadline = Instant::now() + read_timeout,
                Frame::Ping => {}
                Frame::Close => return ReaderExit::PeerClosed,
            }
        }
    }

    async fn dispatch(&mut self, envelope: Envelope) -> Flow {
        let kind = envelope.kind.clone();
        let message = match ClientMessage::from_envelope(envelope) {
            Ok(message) => message,
            Err(ProtocolError::UnknownType(t)) => {
                warn!(user_id = %self.user_id, kind = %t, "unknown message type");
                send_error(&self.sink, &format!("Unknown message type: {}", t)).await;
                return Flow::Continue;
            }
            Err(e) if kind == ClientMessage::REGISTER_TOOLS => {
                warn!(user_id = %self.user_id, error = %e, "invalid registration");
                send_error(&self.sink, INVALID_REGISTRATION).await;
                return Flow::Continue;
            }
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "dropping malformed message");
                return Flow::Continue;
            }
        };

        match message {
            ClientMessage::RegisterTools(registration) => return self.on_register(registration).await,
            ClientMessage::ToolResult(result) => {
                let Some(conn) = self.registered("tool_result") else {
                    return Flow::Continue;
                };
                let call_id = result.call_id.clone();
                log_delivery("tool_result", &call_id, conn.pending_results.deliver(&call_id, result));
            }
            ClientMessage::ServerCommandAck(ack) => {
                let Some(conn) = self.registered("server_command_ack") else {
                    return Flow::Continue;
                };
                let request_id = ack.request_id.clone();
                log_delivery(
                    "server_command_ack",
                    &request_id,
                    conn.pending_commands.deliver(&request_id, ack),
                );
            }
            ClientMessage::SyncState(payload) => {
                self.reconcile(payload).await;
                self.registry.notify(&self.user_id, BridgeEvent::connected(true));
            }
            ClientMessage::MemoryUpdate(payload) => {
                self.reconcile(payload).await;
                self.registry.notify(&self.user_id, BridgeEvent::memory_updated());
            }
            ClientMessage::Heartbeat => match &self.current {
                Some(conn) => {
                    if let Err(e) = self.registry.touch_heartbeat(&conn.client_id) {
                        warn!(client_id = %conn.client_id, error = %e, "heartbeat failed");
                    }
                }
                None => debug!(user_id = %self.user_id, "heartbeat before registration"),
            },
            ClientMessage::Disconnect => {
                info!(user_id = %self.user_id, "client requested disconnect");
                return Flow::End(ReaderExit::ClientDisconnect);
            }
        }
        Flow::Continue
    }

    fn registered(&self, kind: &str) -> Option<&Arc<Connection>> {
        if self.current.is_none() {
            debug!(user_id = %self.user_id, kind, "message before registration dropped");
        }
        self.current.as_ref()
    }

    async fn on_register(&mut self, registration: ToolRegistration) -> Flow {
        let (conn, handles) = match self.registry.register(&self.user_id, registration) {
            Ok(registered) => registered,
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "registration failed");
                send_error(&self.sink, &format!("Registration failed: {}", e)).await;
                return Flow::Continue;
            }
        };
        // A previous registration on this socket is already torn down by now.
        if let Some(previous) = self.writer.take() {
            let _ = previous.await;
        }
        self.stop = Some(conn.stop_signal());
        self.writer = Some(tokio::spawn(run_writer(
            conn.client_id.clone(),
            handles,
            Arc::clone(&self.sink),
            self.registry.settings().ping_interval,
        )));
        self.current = Some(conn);
        Flow::Continue
    }

    /// Store calls block, so they run on the blocking pool; awaiting keeps
    /// dispatch sequential.
    async fn reconcile(&self, payload: SyncPayload) {
        if payload.is_empty() {
            debug!(user_id = %self.user_id, "empty sync payload");
            return;
        }
        let reconciler = Arc::clone(&self.reconciler);
        let user_id = self.user_id.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || reconciler.sync_state(&user_id, &payload)).await {
            warn!(user_id = %self.user_id, error = %e, "reconciliation task failed");
        }
    }

    async fn finish(&mut self, exit: &ReaderExit) {
        if let Some(conn) = self.current.take() {
            self.registry.disconnect_connection(&conn);
        }
        if let Some(writer) = self.writer.take() {
            match writer.await {
                Ok(writer_exit) => debug!(user_id = %self.user_id, ?writer_exit, "writer joined"),
                Err(e) => warn!(user_id = %self.user_id, error = %e, "writer task failed"),
            }
        }
        let _ = self.sink.lock().await.close().await;
        info!(user_id = %self.user_id, ?exit, "bridge connection closed");
    }
}

async fn stopped(stop: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = stop else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Resolves when the current writer task ends; a failed write is fatal to
/// the connection just like a failed read.
async fn writer_ended(writer: &mut Option<JoinHandle<WriterExit>>) -> Result<WriterExit, JoinError> {
    match writer {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn send_error<W: FrameSink + ?Sized>(sink: &Arc<Mutex<W>>, message: &str) {
    let text = match ServerMessage::error(message).encode() {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "could not encode error envelope");
            return;
        }
    };
    if let Err(e) = sink.lock().await.send_text(text).await {
        debug!(error = %e, "error envelope not delivered");
    }
}

fn log_delivery(kind: &str, id: &str, outcome: Delivery) {
    match outcome {
        Delivery::Delivered => debug!(kind, id = %id, "reply delivered"),
        Delivery::Duplicate => warn!(kind, id = %id, "duplicate reply dropped"),
        Delivery::Unknown => warn!(kind, id = %id, "reply for unknown id dropped"),
        Delivery::Closed => debug!(kind, id = %id, "reply after teardown dropped"),
    }
}
