//! Adapts an axum WebSocket to the bridge's frame traits.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tether_bridge::{Frame, FrameSink, FrameSource};
use tether_core::BridgeError;

pub struct WsSource(pub SplitStream<WebSocket>);

pub struct WsSink(pub SplitSink<WebSocket, Message>);

/// Splits an upgraded socket into the bridge's source and sink halves.
pub fn split(socket: WebSocket) -> (WsSource, WsSink) {
    let (sink, stream) = socket.split();
    (WsSource(stream), WsSink(sink))
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Option<Result<Frame, BridgeError>> {
        let frame = match self.0.next().await? {
            Ok(Message::Text(text)) => Ok(Frame::Text(text)),
            Ok(Message::Binary(bytes)) => String::from_utf8(bytes)
                .map(Frame::Text)
                .map_err(|_| BridgeError::Transport("binary frame is not UTF-8".to_string())),
            Ok(Message::Ping(_)) => Ok(Frame::Ping),
            Ok(Message::Pong(_)) => Ok(Frame::Pong),
            Ok(Message::Close(_)) => Ok(Frame::Close),
            Err(e) => Err(BridgeError::Transport(e.to_string())),
        };
        Some(frame)
    }
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<(), BridgeError> {
        self.0
            .send(Message::Text(text))
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), BridgeError> {
        self.0
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), BridgeError> {
        let _ = self.0.send(Message::Close(None)).await;
        SinkExt::close(&mut self.0)
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }
}
