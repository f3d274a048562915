//! Writer loop: drains one connection's outbound queue to the wire and
//! probes liveness on a fixed period.

use crate::connection::WriterHandles;
use crate::transport::FrameSink;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Floor for the probe period; `interval_at` rejects a zero period.
const MIN_PING_INTERVAL: Duration = Duration::from_millis(10);

/// Why the writer loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterExit {
    Stopped,
    QueueClosed,
    SendFailed(String),
}

pub async fn run_writer<S>(
    client_id: String,
    mut handles: WriterHandles,
    sink: Arc<Mutex<S>>,
    ping_interval: Duration,
) -> WriterExit
where
    S: FrameSink + ?Sized,
{
    let ping_interval = ping_interval.max(MIN_PING_INTERVAL);
    let mut ticker = interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let exit = loop {
        tokio::select! {
            biased;
            changed = handles.stop.changed() => {
                if changed.is_err() || *handles.stop.borrow() {
                    break WriterExit::Stopped;
                }
            }
            msg = handles.outbound.recv() => {
                let Some(msg) = msg else {
                    break WriterExit::QueueClosed;
                };
                let text = match msg.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(client_id = %client_id, kind = msg.kind(), error = %e, "dropping unencodable message");
                        continue;
                    }
                };
                if let Err(e) = sink.lock().await.send_text(text).await {
                    break WriterExit::SendFailed(e.to_string());
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = sink.lock().await.send_ping().await {
                    break WriterExit::SendFailed(e.to_string());
                }
            }
        }
    };
    debug!(client_id = %client_id, ?exit, "writer loop ended");
    exit
}
