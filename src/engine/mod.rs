//! Pairing and session state machines
//!
//! Each engine owns a [`Subscriber`](crate::relay::Subscriber), handles the
//! requests arriving on its topics one at a time from a single task, and
//! publishes what happened on an event channel.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::jsonrpc::{JsonRpcErrorResponse, JsonRpcResponse};
use crate::relay::{InboundRequest, Relay};

pub mod pairing;
pub mod session;

pub use pairing::{PairingEngine, PairingEvent};
pub use session::{SessionEngine, SessionEvent};

/// What the shared loops need from an engine
#[async_trait]
pub(crate) trait Engine: Send + Sync + 'static {
    /// Handle one request on an owned topic
    async fn handle_request(&self, inbound: InboundRequest) -> Result<()>;

    /// Re-subscribe every stored topic
    async fn restore_subscriptions(&self) -> Result<()>;

    /// Release topics whose sequence expired
    async fn sweep(&self) -> Result<()>;
}

/// How often expired sequences are released
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Start the dispatch, subscription-restore and expiry loops for `engine`
pub(crate) fn spawn_loops<E: Engine>(
    engine: &Arc<E>,
    mut requests: mpsc::UnboundedReceiver<InboundRequest>,
    mut connections: broadcast::Receiver<()>,
) {
    let weak = Arc::downgrade(engine);
    tokio::spawn(async move {
        while let Some(inbound) = requests.recv().await {
            let Some(engine) = weak.upgrade() else {
                break;
            };
            let topic = inbound.topic.clone();
            let method = inbound.request.method();
            if let Err(e) = engine.handle_request(inbound).await {
                warn!(topic = %topic, %method, "request handling failed: {}", e);
            }
        }
        debug!("dispatch loop stopped");
    });

    let weak = Arc::downgrade(engine);
    tokio::spawn(async move {
        let mut next = Ok(());
        loop {
            match next {
                Ok(()) | Err(RecvError::Lagged(_)) => {
                    let Some(engine) = weak.upgrade() else {
                        break;
                    };
                    if let Err(e) = engine.restore_subscriptions().await {
                        warn!("restoring subscriptions failed: {}", e);
                    }
                }
                Err(RecvError::Closed) => break,
            }
            next = connections.recv().await;
        }
        debug!("restore loop stopped");
    });

    let weak = Arc::downgrade(engine);
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(SWEEP_INTERVAL);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            let Some(engine) = weak.upgrade() else {
                break;
            };
            if let Err(e) = engine.sweep().await {
                warn!("expiry sweep failed: {}", e);
            }
        }
        debug!("expiry loop stopped");
    });
}

/// Answer `{"result": true}`
pub(crate) async fn acknowledge(relay: &Relay, topic: &str, id: i64) -> Result<()> {
    relay.respond(topic, JsonRpcResponse::ack(id).into()).await?;
    Ok(())
}

/// Answer with the protocol error for `error`
pub(crate) async fn refuse(relay: &Relay, topic: &str, id: i64, error: &Error) -> Result<()> {
    let response = JsonRpcErrorResponse::new(id, error.code().unwrap_or(0), error.to_string());
    relay.respond(topic, response.into()).await?;
    Ok(())
}
