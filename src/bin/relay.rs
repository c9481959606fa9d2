//! Pairlink Relay Server
//!
//! A WebSocket store-and-forward relay keyed by topic. The server provides:
//! - Topic subscriptions per connection
//! - Fan-out of published envelopes to every other subscriber
//! - A mailbox for envelopes published before anyone else subscribed
//!
//! The relay never sees plaintext; envelopes are opaque strings.
//!
//! Usage:
//!   pairlink-relay [--port 8765] [--host 0.0.0.0]

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use pairlink::transport::websocket::RelayFrame;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Held envelopes per topic
const MAILBOX_LIMIT: usize = 64;

/// Pairlink Relay Server
#[derive(Parser)]
#[command(name = "pairlink-relay")]
#[command(about = "WebSocket store-and-forward relay for pairlink peers")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8765")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,
}

type ClientId = u64;

/// Server state
#[derive(Default)]
struct RelayState {
    /// Outbound frame queue of each connected client
    clients: RwLock<HashMap<ClientId, mpsc::UnboundedSender<RelayFrame>>>,
    /// Subscribers of each topic
    topics: RwLock<HashMap<String, HashSet<ClientId>>>,
    /// Envelopes nobody else was subscribed to: (publisher, message)
    mailbox: RwLock<HashMap<String, Vec<(ClientId, String)>>>,
}

impl RelayState {
    async fn register(&self, id: ClientId, tx: mpsc::UnboundedSender<RelayFrame>) {
        self.clients.write().await.insert(id, tx);
    }

    async fn subscribe(&self, id: ClientId, topic: &str) {
        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .insert(id);

        let held = {
            let mut mailbox = self.mailbox.write().await;
            match mailbox.get_mut(topic) {
                Some(messages) => {
                    let (deliver, keep): (Vec<_>, Vec<_>) =
                        messages.drain(..).partition(|(publisher, _)| *publisher != id);
                    *messages = keep;
                    if messages.is_empty() {
                        mailbox.remove(topic);
                    }
                    deliver
                }
                None => Vec::new(),
            }
        };

        if let Some(tx) = self.clients.read().await.get(&id) {
            for (_, message) in held {
                let _ = tx.send(RelayFrame::Message {
                    topic: topic.to_string(),
                    message,
                });
            }
        }
        debug!(client = id, topic, "subscribed");
    }

    async fn unsubscribe(&self, id: ClientId, topic: &str) {
        let mut topics = self.topics.write().await;
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Deliver to every other subscriber, or hold in the mailbox
    async fn publish(&self, id: ClientId, topic: &str, message: String) {
        let recipients: Vec<ClientId> = self
            .topics
            .read()
            .await
            .get(topic)
            .map(|subscribers| subscribers.iter().copied().filter(|s| *s != id).collect())
            .unwrap_or_default();

        if recipients.is_empty() {
            let mut mailbox = self.mailbox.write().await;
            let held = mailbox.entry(topic.to_string()).or_default();
            if held.len() >= MAILBOX_LIMIT {
                held.remove(0);
            }
            held.push((id, message));
            debug!(topic, "no subscriber, holding envelope");
            return;
        }

        let clients = self.clients.read().await;
        for recipient in recipients {
            if let Some(tx) = clients.get(&recipient) {
                let _ = tx.send(RelayFrame::Message {
                    topic: topic.to_string(),
                    message: message.clone(),
                });
            }
        }
    }

    /// Forget a disconnected client
    async fn remove(&self, id: ClientId) {
        self.clients.write().await.remove(&id);
        let mut topics = self.topics.write().await;
        topics.retain(|_, subscribers| {
            subscribers.remove(&id);
            !subscribers.is_empty()
        });
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(stream: TcpStream, addr: SocketAddr, state: Arc<RelayState>) {
    info!("New connection from: {}", addr);

    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();
    let client_id: ClientId = rand::random();
    let (tx, mut outbound) = mpsc::unbounded_channel();
    state.register(client_id, tx.clone()).await;

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match RelayFrame::from_text(&text) {
                        Ok(RelayFrame::Publish { topic, message }) => {
                            state.publish(client_id, &topic, message).await;
                        }
                        Ok(RelayFrame::Subscribe { topic }) => {
                            state.subscribe(client_id, &topic).await;
                        }
                        Ok(RelayFrame::Unsubscribe { topic }) => {
                            state.unsubscribe(client_id, &topic).await;
                        }
                        Ok(RelayFrame::Ping) => {
                            let _ = tx.send(RelayFrame::Pong);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Invalid frame from {}: {}", addr, e);
                            let _ = tx.send(RelayFrame::Error {
                                message: e.to_string(),
                            });
                        }
                    },

                    Some(Ok(Message::Close(_))) | None => {
                        info!("Client {} disconnected", addr);
                        break;
                    }

                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }

                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", addr, e);
                        break;
                    }

                    _ => {}
                }
            }

            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                match frame.to_text() {
                    Ok(json) => {
                        if let Err(e) = write.send(Message::Text(json)).await {
                            warn!("Send to {} failed: {}", addr, e);
                            break;
                        }
                    }
                    Err(e) => warn!("Unencodable frame for {}: {}", addr, e),
                }
            }
        }
    }

    state.remove(client_id).await;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pairlink_relay=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    let listener = TcpListener::bind(&addr).await?;
    info!("Pairlink Relay Server listening on ws://{}", addr);

    let state = Arc::new(RelayState::default());

    while let Ok((stream, addr)) = listener.accept().await {
        let state = state.clone();
        tokio::spawn(handle_connection(stream, addr, state));
    }
    Ok(())
}
