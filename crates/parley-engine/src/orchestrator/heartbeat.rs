use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use parley_core::ids::{ConversationId, ToolCallId};
use parley_core::notifications::{SessionUpdate, ToolCallStatus, ToolCallUpdate};

use super::emitter::TurnEmitter;
use crate::store::ConversationStore;

/// Periodic liveness signal for one turn. Aborted when dropped.
pub(crate) struct Heartbeat {
    handle: JoinHandle<()>,
}

pub(crate) struct HeartbeatParams {
    pub store: Arc<dyn ConversationStore>,
    pub emitter: Arc<TurnEmitter>,
    pub conversation_id: ConversationId,
    pub progress_id: ToolCallId,
    pub interval: Duration,
    pub started: Instant,
    pub cancel: CancellationToken,
}

impl Heartbeat {
    pub(crate) fn spawn(p: HeartbeatParams) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(p.started + p.interval, p.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = p.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match p.store.load(&p.conversation_id).await {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        debug!(conversation_id = %p.conversation_id, "conversation gone, heartbeat stopped");
                        break;
                    }
                    Err(e) => {
                        warn!(conversation_id = %p.conversation_id, error = %e, "heartbeat load failed");
                        continue;
                    }
                }

                let mut patch = Map::new();
                let _ = patch.insert("lastActivityAt".into(), json!(Utc::now().to_rfc3339()));
                if let Err(e) = p.store.update_metadata(&p.conversation_id, patch).await {
                    warn!(conversation_id = %p.conversation_id, error = %e, "failed to touch conversation activity");
                }

                let elapsed_ms = p.started.elapsed().as_millis() as u64;
                let update = ToolCallUpdate::status(p.progress_id.clone(), ToolCallStatus::InProgress)
                    .with_meta("elapsedMs", json!(elapsed_ms));
                if !p.emitter.emit(SessionUpdate::ToolCallUpdate(update)) {
                    break;
                }
            }
        });
        Self { handle }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
