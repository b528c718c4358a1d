//! Control channel.
//!
//! Control messages can be handled directly with
//! [`OfflineEngine::handle_control`] or sent through a [`ControlClient`]
//! served by [`serve_control`]. Every message is idempotent.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::engine::OfflineEngine;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Activate the waiting version without waiting for clients.
    ForceActivate,
    QueryVersion,
    /// Delete retired partitions and empty the active ones.
    PurgeAllPartitions,
    /// Fetch URLs into the active precache partition.
    Precache { urls: Vec<String> },
    PruneExpired,
    QueueStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlReply {
    Activated { version: Option<String> },
    Version { active: Option<String>, waiting: Option<String> },
    Purged { removed: usize },
    Precached { stored: usize, failed: Vec<String> },
    Pruned { removed: usize },
    QueueStatus { pending: BTreeMap<String, usize> },
    Error { message: String },
}

/// A message with the slot its reply goes to.
pub type ControlRequest = (ControlMessage, oneshot::Sender<ControlReply>);

/// Sending half of the control channel.
#[derive(Debug, Clone)]
pub struct ControlClient {
    tx: mpsc::Sender<ControlRequest>,
}

impl ControlClient {
    /// Open a channel. The receiver goes to [`serve_control`].
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ControlRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub async fn send(&self, message: ControlMessage) -> EngineResult<ControlReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((message, reply_tx))
            .await
            .map_err(|_| EngineError::StateError("control channel closed".to_string()))?;
        reply_rx
            .await
            .map_err(|_| EngineError::StateError("control reply dropped".to_string()))
    }
}

/// Answer control requests until every client is dropped.
pub async fn serve_control(engine: Arc<OfflineEngine>, mut rx: mpsc::Receiver<ControlRequest>) {
    info!("Control channel serving");
    while let Some((message, reply_tx)) = rx.recv().await {
        debug!(?message, "Control message");
        let reply = engine.handle_control(message).await;
        if reply_tx.send(reply).is_err() {
            debug!("Control caller went away before the reply");
        }
    }
    info!("Control channel closed");
}
