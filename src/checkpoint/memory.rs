use super::{Checkpoint, CheckpointGateway, CheckpointResponse, UiSpec};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

struct Slot {
    checkpoint: Checkpoint,
    responder: Option<oneshot::Sender<CheckpointResponse>>,
    receiver: Option<oneshot::Receiver<CheckpointResponse>>,
}

/// In-process gateway: checkpoints are answered by calling [`respond`](Self::respond).
#[derive(Default)]
pub struct InMemoryCheckpointGateway {
    slots: Mutex<HashMap<String, Slot>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<Checkpoint>>>,
}

impl InMemoryCheckpointGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every checkpoint created from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Checkpoint> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.push(tx);
        }
        rx
    }

    /// Checkpoints created but not yet consumed.
    pub fn pending(&self) -> Vec<Checkpoint> {
        self.slots
            .lock()
            .map(|s| s.values().map(|slot| slot.checkpoint.clone()).collect())
            .unwrap_or_default()
    }

    /// Answer a checkpoint. Fails if it is unknown or already answered.
    pub fn respond(&self, id: &str, response: CheckpointResponse) -> anyhow::Result<()> {
        let sender = {
            let mut slots = self
                .slots
                .lock()
                .map_err(|_| anyhow::anyhow!("Checkpoint registry lock poisoned"))?;
            let slot = slots
                .get_mut(id)
                .ok_or_else(|| anyhow::anyhow!("Unknown checkpoint '{}'", id))?;
            slot.responder
                .take()
                .ok_or_else(|| anyhow::anyhow!("Checkpoint '{}' was already answered", id))?
        };
        sender
            .send(response)
            .map_err(|_| anyhow::anyhow!("Checkpoint '{}' is no longer awaited", id))
    }

    fn discard(&self, id: &str) {
        if let Ok(mut slots) = self.slots.lock() {
            slots.remove(id);
        }
    }
}

#[async_trait]
impl CheckpointGateway for InMemoryCheckpointGateway {
    async fn create(&self, ui: UiSpec, timeout: Option<Duration>) -> anyhow::Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let checkpoint = Checkpoint {
            id: id.clone(),
            ui,
            timeout_secs: timeout.map(|t| t.as_secs()),
            created_at: Utc::now(),
        };

        self.slots
            .lock()
            .map_err(|_| anyhow::anyhow!("Checkpoint registry lock poisoned"))?
            .insert(
                id.clone(),
                Slot {
                    checkpoint: checkpoint.clone(),
                    responder: Some(tx),
                    receiver: Some(rx),
                },
            );

        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.retain(|w| w.send(checkpoint.clone()).is_ok());
        }
        debug!(checkpoint_id = %id, "Checkpoint created");
        Ok(id)
    }

    async fn wait(&self, id: &str, timeout: Option<Duration>) -> Option<CheckpointResponse> {
        let receiver = self
            .slots
            .lock()
            .ok()?
            .get_mut(id)
            .and_then(|slot| slot.receiver.take());

        let Some(receiver) = receiver else {
            warn!(checkpoint_id = %id, "Checkpoint is unknown or already awaited");
            return None;
        };

        let response = match timeout {
            Some(limit) => tokio::time::timeout(limit, receiver)
                .await
                .ok()
                .and_then(Result::ok),
            None => receiver.await.ok(),
        };

        if response.is_none() {
            debug!(checkpoint_id = %id, "Checkpoint wait ended without a response");
        }
        self.discard(id);
        response
    }
}
