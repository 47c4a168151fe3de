//! Turn orchestrator: per-conversation FIFO execution of turns.
//!
//! Each conversation with queued work gets one worker task fed by an unbounded
//! channel. The queue entry's pending count is only changed under the map's
//! shard lock, so a worker exits exactly when nothing newer is queued behind it.

mod emitter;
mod heartbeat;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use parley_core::content::{ContentBlock, Role};
use parley_core::ids::{ConversationId, ToolCallId, TurnId};
use parley_core::notifications::{SessionUpdate, ToolCall, ToolCallStatus, ToolCallUpdate, ToolKind};
use parley_core::turn::{StopReason, TurnRequest, TurnResponse};
use parley_telemetry::MetricsRecorder;

use crate::assembler::{parse_full, ContentAssembler};
use crate::backend::{BackendEvent, BackendResponse, ExecutionBackend, TurnContext};
use crate::error::{BackendError, TurnError};
use crate::permissions::{PermissionGateway, PermissionHandle};
use crate::sink::NotificationSink;
use crate::store::ConversationStore;
use crate::tracker::ToolCallTracker;

use emitter::TurnEmitter;
use heartbeat::{Heartbeat, HeartbeatParams};

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(12);

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub heartbeat_interval: Duration,
    /// Used by front ends when a request does not say whether to stream.
    pub streaming_default: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            streaming_default: false,
        }
    }
}

struct QueuedTurn {
    turn_id: TurnId,
    request: TurnRequest,
    reply: oneshot::Sender<Result<TurnResponse, TurnError>>,
}

struct ConversationQueue {
    tx: mpsc::UnboundedSender<QueuedTurn>,
    /// Turns sent to the worker and not yet settled.
    pending: usize,
}

struct Inner {
    backend: Arc<dyn ExecutionBackend>,
    store: Arc<dyn ConversationStore>,
    sink: Arc<dyn NotificationSink>,
    permissions: Arc<PermissionGateway>,
    config: OrchestratorConfig,
    metrics: Option<Arc<MetricsRecorder>>,
    queues: DashMap<ConversationId, ConversationQueue>,
    active: DashMap<ConversationId, HashMap<TurnId, CancellationToken>>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct TurnOrchestrator {
    inner: Arc<Inner>,
}

impl TurnOrchestrator {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        store: Arc<dyn ConversationStore>,
        sink: Arc<dyn NotificationSink>,
        permissions: Arc<PermissionGateway>,
        config: OrchestratorConfig,
    ) -> Self {
        Self::build(backend, store, sink, permissions, config, None)
    }

    /// Like [`new`](Self::new), recording turn metrics into `metrics`.
    pub fn instrumented(
        backend: Arc<dyn ExecutionBackend>,
        store: Arc<dyn ConversationStore>,
        sink: Arc<dyn NotificationSink>,
        permissions: Arc<PermissionGateway>,
        config: OrchestratorConfig,
        metrics: Arc<MetricsRecorder>,
    ) -> Self {
        Self::build(backend, store, sink, permissions, config, Some(metrics))
    }

    fn build(
        backend: Arc<dyn ExecutionBackend>,
        store: Arc<dyn ConversationStore>,
        sink: Arc<dyn NotificationSink>,
        permissions: Arc<PermissionGateway>,
        config: OrchestratorConfig,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                store,
                sink,
                permissions,
                config,
                metrics,
                queues: DashMap::new(),
                active: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    pub fn permissions(&self) -> &Arc<PermissionGateway> {
        &self.inner.permissions
    }

    /// Validate, enqueue behind earlier turns of the same conversation, and wait
    /// for the stop reason.
    pub async fn submit_turn(&self, request: TurnRequest) -> Result<TurnResponse, TurnError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TurnError::ShuttingDown);
        }
        request.validate()?;
        if self.inner.store.load(&request.conversation_id).await?.is_none() {
            return Err(TurnError::ConversationNotFound(request.conversation_id));
        }

        let turn_id = TurnId::new();
        debug!(
            conversation_id = %request.conversation_id,
            turn_id = %turn_id,
            blocks = request.content.len(),
            streaming = request.streaming,
            "turn queued"
        );
        let (reply, rx) = oneshot::channel();
        self.enqueue(QueuedTurn {
            turn_id,
            request,
            reply,
        });
        rx.await
            .map_err(|_| TurnError::Internal("turn worker stopped before replying".into()))?
    }

    fn enqueue(&self, turn: QueuedTurn) {
        let conversation_id = turn.request.conversation_id.clone();
        let mut queue = self
            .inner
            .queues
            .entry(conversation_id.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let _ = tokio::spawn(run_queue(Arc::clone(&self.inner), conversation_id, rx));
                ConversationQueue { tx, pending: 0 }
            });
        queue.pending += 1;
        if let Err(mpsc::error::SendError(turn)) = queue.tx.send(turn) {
            queue.pending -= 1;
            let _ = turn
                .reply
                .send(Err(TurnError::Internal("conversation worker is gone".into())));
        }
    }

    /// Cancel every running turn of the conversation and its pending permission
    /// requests. Returns the number of turns signalled.
    pub fn cancel_conversation(&self, conversation_id: &ConversationId) -> usize {
        let tokens: Vec<CancellationToken> = self
            .inner
            .active
            .get(conversation_id)
            .map(|turns| turns.values().cloned().collect())
            .unwrap_or_default();
        for token in &tokens {
            token.cancel();
        }
        let permissions = self.inner.permissions.cancel_for_conversation(conversation_id);
        info!(
            conversation_id = %conversation_id,
            turns = tokens.len(),
            permissions,
            "conversation cancelled"
        );
        tokens.len()
    }

    /// Cancel everything and refuse new turns. Queued turns resolve as cancelled.
    pub fn shutdown(&self) {
        info!("orchestrator shutting down");
        self.inner.shutdown.cancel();
        self.inner.permissions.shutdown();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn active_turns(&self, conversation_id: &ConversationId) -> usize {
        self.inner.active.get(conversation_id).map_or(0, |t| t.len())
    }

    /// Turns submitted and not yet settled, including the running one.
    pub fn pending_turns(&self, conversation_id: &ConversationId) -> usize {
        self.inner.queues.get(conversation_id).map_or(0, |q| q.pending)
    }

    pub fn queue_count(&self) -> usize {
        self.inner.queues.len()
    }
}

async fn run_queue(
    inner: Arc<Inner>,
    conversation_id: ConversationId,
    mut rx: mpsc::UnboundedReceiver<QueuedTurn>,
) {
    while let Some(QueuedTurn {
        turn_id,
        request,
        reply,
    }) = rx.recv().await
    {
        let result = if inner.shutdown.is_cancelled() {
            Ok(TurnResponse::new(StopReason::Cancelled))
        } else {
            inner.execute(turn_id, request).await
        };

        // Settle before replying so a caller never observes its own turn as pending.
        let drained = inner
            .queues
            .remove_if_mut(&conversation_id, |_, queue| {
                queue.pending = queue.pending.saturating_sub(1);
                queue.pending == 0
            })
            .is_some();
        let _ = reply.send(result);
        if drained {
            debug!(conversation_id = %conversation_id, "conversation queue drained");
            break;
        }
    }
}

impl Inner {
    fn register(&self, conversation_id: &ConversationId, turn_id: &TurnId, token: CancellationToken) {
        let _ = self
            .active
            .entry(conversation_id.clone())
            .or_default()
            .insert(turn_id.clone(), token);
    }

    fn unregister(&self, conversation_id: &ConversationId, turn_id: &TurnId) {
        let _ = self.active.remove_if_mut(conversation_id, |_, turns| {
            let _ = turns.remove(turn_id);
            turns.is_empty()
        });
    }

    /// Run one dequeued turn in its own task so a panic cannot take the worker down.
    async fn execute(self: &Arc<Self>, turn_id: TurnId, request: TurnRequest) -> Result<TurnResponse, TurnError> {
        let conversation_id = request.conversation_id.clone();
        let cancel = self.shutdown.child_token();
        self.register(&conversation_id, &turn_id, cancel.clone());

        let task = tokio::spawn(Arc::clone(self).run_turn(turn_id.clone(), request, cancel));
        let result = match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                error!(conversation_id = %conversation_id, turn_id = %turn_id, "turn panicked");
                Err(TurnError::Internal("turn execution panicked".into()))
            }
            Err(e) => Err(TurnError::Internal(e.to_string())),
        };

        self.unregister(&conversation_id, &turn_id);
        if let Err(e) = self.store.unmark_processing(&conversation_id).await {
            warn!(conversation_id = %conversation_id, error = %e, "failed to clear processing flag");
        }
        result
    }

    #[instrument(skip_all, fields(conversation_id = %request.conversation_id, turn_id = %turn_id, streaming = request.streaming))]
    async fn run_turn(
        self: Arc<Self>,
        turn_id: TurnId,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> Result<TurnResponse, TurnError> {
        let TurnRequest {
            conversation_id,
            content,
            streaming,
            metadata,
        } = request;
        let started = Instant::now();

        let conversation = self
            .store
            .load(&conversation_id)
            .await?
            .ok_or_else(|| TurnError::ConversationNotFound(conversation_id.clone()))?;
        self.store.mark_processing(&conversation_id).await?;

        let _active = ActiveTurnGauge::new(self.metrics.clone());
        let emitter = Arc::new(TurnEmitter::new(
            Arc::clone(&self.sink),
            conversation_id.clone(),
            cancel.clone(),
        ));
        let progress_id = ToolCallId::from_raw(turn_id.as_str());
        let _ = emitter.emit(SessionUpdate::ToolCall(
            ToolCall::new(progress_id.clone(), "Processing", ToolKind::Think)
                .with_status(ToolCallStatus::InProgress),
        ));
        let heartbeat = Heartbeat::spawn(HeartbeatParams {
            store: Arc::clone(&self.store),
            emitter: Arc::clone(&emitter),
            conversation_id: conversation_id.clone(),
            progress_id: progress_id.clone(),
            interval: self.config.heartbeat_interval,
            started,
            cancel: cancel.clone(),
        });

        if let Err(e) = self.store.add_message(&conversation_id, Role::User, &content).await {
            warn!(error = %e, "failed to record user message");
        }

        let ctx = TurnContext {
            conversation_id: conversation_id.clone(),
            turn_id: turn_id.clone(),
            cwd: conversation.cwd().map(str::to_string),
            metadata,
            cancel: cancel.clone(),
            permissions: PermissionHandle::new(Arc::clone(&self.permissions), conversation_id.clone()),
        };

        let result = if streaming {
            self.run_streaming(&ctx, &content, &emitter, &progress_id).await
        } else {
            self.run_blocking(&ctx, &content, &emitter).await
        };
        drop(heartbeat);

        let stop_reason = classify_stop(cancel.is_cancelled(), &result);
        match &result {
            Err(e) if !e.is_cancelled() => warn!(error = %e, "backend call failed"),
            Ok(resp) if !resp.success => {
                warn!(error = resp.error.as_deref().unwrap_or("unknown"), "backend reported failure")
            }
            _ => {}
        }

        let status = match stop_reason {
            StopReason::Cancelled => None,
            StopReason::Refusal => Some(ToolCallStatus::Failed),
            _ => Some(ToolCallStatus::Completed),
        };
        if let Some(status) = status {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let _ = emitter.emit(SessionUpdate::ToolCallUpdate(
                ToolCallUpdate::status(progress_id, status)
                    .with_meta("elapsedMs", serde_json::json!(elapsed_ms))
                    .with_meta("stopReason", serde_json::json!(stop_reason.as_str())),
            ));
        }

        let transcript = emitter.transcript();
        if !transcript.is_empty() {
            if let Err(e) = self
                .store
                .add_message(&conversation_id, Role::Assistant, &transcript)
                .await
            {
                warn!(error = %e, "failed to record assistant message");
            }
        }

        let duration_ms = started.elapsed().as_millis() as f64;
        if let Some(m) = &self.metrics {
            m.counter_inc("turns_completed", &[("stop_reason", stop_reason.as_str())], 1);
            m.histogram_observe("turn_duration_ms", &[], duration_ms);
        }
        info!(stop_reason = %stop_reason, duration_ms, "turn finished");

        let mut response = TurnResponse::new(stop_reason);
        if let Ok(resp) = &result {
            response.metadata = resp.metadata.clone();
        }
        Ok(response)
    }

    async fn run_blocking(
        &self,
        ctx: &TurnContext,
        content: &[ContentBlock],
        emitter: &TurnEmitter,
    ) -> Result<BackendResponse, BackendError> {
        let response = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(BackendError::Cancelled),
            r = self.backend.send(ctx, content) => r?,
        };
        for block in parse_full(&response.output) {
            if !emitter.message(block) {
                break;
            }
        }
        Ok(response)
    }

    async fn run_streaming(
        &self,
        ctx: &TurnContext,
        content: &[ContentBlock],
        emitter: &TurnEmitter,
        progress_id: &ToolCallId,
    ) -> Result<BackendResponse, BackendError> {
        let mut stream = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(BackendError::Cancelled),
            s = self.backend.send_streaming(ctx, content) => s?,
        };

        let mut assembler = ContentAssembler::new();
        let mut tracker = ToolCallTracker::new();
        let mut done = None;

        loop {
            let event = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(BackendError::Cancelled),
                event = stream.next() => event,
            };
            let Some(event) = event else { break };
            match event {
                BackendEvent::Chunk(text) => {
                    for block in assembler.push(&text) {
                        let _ = emitter.message(block);
                    }
                }
                BackendEvent::Progress(note) => {
                    let mut update = ToolCallUpdate::status(progress_id.clone(), ToolCallStatus::InProgress);
                    if let Some(note) = note {
                        update = update.with_meta("message", serde_json::Value::String(note));
                    }
                    let _ = emitter.emit(SessionUpdate::ToolCallUpdate(update));
                }
                BackendEvent::ToolCall(call) => {
                    if tracker.start(&call) {
                        let _ = emitter.emit(SessionUpdate::ToolCall(call));
                    } else {
                        warn!(tool_call_id = %call.tool_call_id, "duplicate tool call ignored");
                    }
                }
                BackendEvent::ToolCallUpdate(update) => {
                    if tracker.update(&update) {
                        let _ = emitter.emit(SessionUpdate::ToolCallUpdate(update));
                    } else {
                        warn!(tool_call_id = %update.tool_call_id, "update for unknown tool call dropped");
                    }
                }
                BackendEvent::Done(response) => {
                    done = Some(response);
                    break;
                }
            }
        }

        if ctx.cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        for block in assembler.finish() {
            let _ = emitter.message(block);
        }
        for update in tracker.close_open(ToolCallStatus::Failed) {
            let _ = emitter.emit(SessionUpdate::ToolCallUpdate(update));
        }
        Ok(done.unwrap_or_else(|| BackendResponse::ok("")))
    }
}

/// Checked in order: cancellation, token limit, turn limit, error or refusal.
fn classify_stop(cancelled: bool, result: &Result<BackendResponse, BackendError>) -> StopReason {
    if cancelled {
        return StopReason::Cancelled;
    }
    match result {
        Err(e) if e.is_cancelled() => StopReason::Cancelled,
        Err(_) => StopReason::Refusal,
        Ok(r) if r.hit_token_limit() => StopReason::MaxTokens,
        Ok(r) if r.hit_turn_limit() => StopReason::MaxTurnRequests,
        Ok(r) if !r.success || r.error.is_some() || r.is_refusal() => StopReason::Refusal,
        Ok(_) => StopReason::EndTurn,
    }
}

struct ActiveTurnGauge(Option<Arc<MetricsRecorder>>);

impl ActiveTurnGauge {
    fn new(metrics: Option<Arc<MetricsRecorder>>) -> Self {
        if let Some(m) = &metrics {
            m.counter_inc("turns_started", &[], 1);
            m.gauge_inc("active_turns", &[], 1.0);
        }
        Self(metrics)
    }
}

impl Drop for ActiveTurnGauge {
    fn drop(&mut self) {
        if let Some(m) = &self.0 {
            m.gauge_inc("active_turns", &[], -1.0);
        }
    }
}

#[cfg(test)]
mod tests;
