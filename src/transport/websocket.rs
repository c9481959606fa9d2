//! WebSocket transport for the bundled relay server
//!
//! Frames are JSON objects tagged by `type`. The socket is split: writes
//! go through a shared sink, and a reader task turns inbound frames into
//! [`TransportEvent`]s.

use super::{Transport, TransportError, TransportEvent, TransportResult};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Frames exchanged with the relay server
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
#[allow(missing_docs)]
pub enum RelayFrame {
    /// Publish an envelope on a topic
    Publish { topic: String, message: String },
    /// Receive envelopes for a topic
    Subscribe { topic: String },
    /// Stop receiving envelopes for a topic
    Unsubscribe { topic: String },
    /// Envelope delivered to a subscriber
    Message { topic: String, message: String },
    /// Error occurred
    Error { message: String },
    /// Ping
    Ping,
    /// Pong
    Pong,
}

impl RelayFrame {
    /// JSON text of the frame
    pub fn to_text(&self) -> TransportResult<String> {
        serde_json::to_string(self).map_err(|e| TransportError::InvalidData(e.to_string()))
    }

    /// Parse a JSON text frame
    pub fn from_text(text: &str) -> TransportResult<Self> {
        serde_json::from_str(text).map_err(|e| TransportError::InvalidData(e.to_string()))
    }
}

/// WebSocket transport connected to a relay server
pub struct WebSocketTransport {
    sink: Arc<Mutex<WsSink>>,
}

impl WebSocketTransport {
    /// Connect to a relay server
    pub async fn connect(
        relay_url: &str,
    ) -> TransportResult<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let (ws, _) = connect_async(relay_url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (sink, stream) = ws.split();
        let sink = Arc::new(Mutex::new(sink));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let _ = events_tx.send(TransportEvent::Connected);
        tokio::spawn(read_loop(stream, sink.clone(), events_tx));

        Ok((WebSocketTransport { sink }, events_rx))
    }

    async fn send_frame(&self, frame: &RelayFrame) -> TransportResult<()> {
        let text = frame.to_text()?;
        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    sink: Arc<Mutex<WsSink>>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(next) = stream.next().await {
        let text = match next {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = sink.lock().await.send(Message::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("relay connection error: {}", e);
                break;
            }
        };

        match RelayFrame::from_text(&text) {
            Ok(RelayFrame::Message { topic, message }) => {
                if events.send(TransportEvent::Message { topic, message }).is_err() {
                    break;
                }
            }
            Ok(RelayFrame::Ping) => {
                if let Ok(pong) = RelayFrame::Pong.to_text() {
                    let _ = sink.lock().await.send(Message::Text(pong)).await;
                }
            }
            Ok(RelayFrame::Error { message }) => warn!("relay reported: {}", message),
            Ok(other) => debug!(?other, "ignoring frame"),
            Err(e) => warn!("unreadable relay frame: {}", e),
        }
    }
    debug!("relay connection closed");
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn publish(&self, topic: &str, message: &str) -> TransportResult<()> {
        self.send_frame(&RelayFrame::Publish {
            topic: topic.to_string(),
            message: message.to_string(),
        })
        .await
    }

    async fn subscribe(&self, topic: &str) -> TransportResult<()> {
        self.send_frame(&RelayFrame::Subscribe {
            topic: topic.to_string(),
        })
        .await
    }

    async fn unsubscribe(&self, topic: &str) -> TransportResult<()> {
        self.send_frame(&RelayFrame::Unsubscribe {
            topic: topic.to_string(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_wire_shape() {
        let frame = RelayFrame::Publish {
            topic: "abc".to_string(),
            message: "00ff".to_string(),
        };
        let json: serde_json::Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(json["type"], "Publish");
        assert_eq!(json["data"]["topic"], "abc");
        assert_eq!(json["data"]["message"], "00ff");
    }

    #[test]
    fn test_unit_frames_parse() {
        assert_eq!(RelayFrame::from_text(r#"{"type":"Ping"}"#).unwrap(), RelayFrame::Ping);
        assert!(RelayFrame::from_text(r#"{"type":"Bogus"}"#).is_err());
    }
}
