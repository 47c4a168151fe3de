//! Permission gateway: outstanding requests, timeouts, and the default policy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_core::ids::{ConversationId, PermissionRequestId};
use parley_core::notifications::ToolKind;
use parley_core::permissions::{
    validate_options, PermissionOption, PermissionOptionKind, PermissionOutcome,
    PermissionRequest, ToolCallDescriptor,
};
use parley_telemetry::MetricsRecorder;

use crate::error::PermissionError;

const DEFAULT_PERMISSION_TIMEOUT: Duration = Duration::from_millis(300_000);

#[derive(Clone, Debug)]
pub struct PermissionConfig {
    /// How long a request may stay unanswered before it resolves to the deny default.
    pub timeout: Duration,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PERMISSION_TIMEOUT,
        }
    }
}

/// Delivers a permission request to the client. The answer arrives later via
/// [`PermissionGateway::resolve`].
pub trait PermissionPrompter: Send + Sync {
    fn prompt(&self, request: &PermissionRequest);
}

struct Pending {
    conversation_id: ConversationId,
    created_at: DateTime<Utc>,
    options: Vec<PermissionOption>,
    tx: oneshot::Sender<PermissionOutcome>,
    timer: Option<JoinHandle<()>>,
}

impl Pending {
    fn waited_ms(&self) -> i64 {
        (Utc::now() - self.created_at).num_milliseconds()
    }

    fn complete(self, outcome: PermissionOutcome) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        let _ = self.tx.send(outcome);
    }
}

type PendingMap = Arc<DashMap<PermissionRequestId, Pending>>;

/// Removes an entry whose waiter went away without an answer.
struct PendingGuard {
    pending: PendingMap,
    id: PermissionRequestId,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Some((_, entry)) = self.pending.remove(&self.id) {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
    }
}

pub struct PermissionGateway {
    pending: PendingMap,
    prompter: Option<Arc<dyn PermissionPrompter>>,
    config: PermissionConfig,
    metrics: Option<Arc<MetricsRecorder>>,
    shutting_down: AtomicBool,
}

impl PermissionGateway {
    /// Gateway without an interactive client: every request gets [`Self::default_outcome`].
    pub fn new(config: PermissionConfig) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            prompter: None,
            config,
            metrics: None,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn with_prompter(mut self, prompter: Arc<dyn PermissionPrompter>) -> Self {
        self.prompter = Some(prompter);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_for(&self, conversation_id: &ConversationId) -> Vec<PermissionRequestId> {
        self.pending
            .iter()
            .filter(|e| e.conversation_id == *conversation_id)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Ask for authorization and wait for the outcome.
    ///
    /// Resolves exactly once: by [`resolve`](Self::resolve), by
    /// [`cancel_for_conversation`](Self::cancel_for_conversation), or by the timeout,
    /// which picks the safe deny option.
    pub async fn request(
        &self,
        conversation_id: &ConversationId,
        tool_call: ToolCallDescriptor,
        options: Vec<PermissionOption>,
    ) -> Result<PermissionOutcome, PermissionError> {
        validate_options(&options)?;
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(PermissionError::ShuttingDown);
        }
        if let Some(m) = &self.metrics {
            m.counter_inc("permission_requests", &[("tool_kind", tool_call.kind.as_str())], 1);
        }

        let Some(prompter) = self.prompter.as_ref() else {
            let outcome = Self::default_outcome(tool_call.kind, &options);
            debug!(
                conversation_id = %conversation_id,
                tool_call_id = %tool_call.tool_call_id,
                tool_kind = %tool_call.kind,
                ?outcome,
                "permission resolved by default policy"
            );
            return Ok(outcome);
        };

        let request_id = PermissionRequestId::new();
        let (tx, rx) = oneshot::channel();
        let _ = self.pending.insert(
            request_id.clone(),
            Pending {
                conversation_id: conversation_id.clone(),
                created_at: Utc::now(),
                options: options.clone(),
                tx,
                timer: None,
            },
        );
        let guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            id: request_id.clone(),
        };

        self.arm_timer(&request_id);

        info!(
            conversation_id = %conversation_id,
            request_id = %request_id,
            tool_call_id = %tool_call.tool_call_id,
            tool_kind = %tool_call.kind,
            "permission requested"
        );
        prompter.prompt(&PermissionRequest {
            conversation_id: conversation_id.clone(),
            request_id,
            tool_call,
            options,
        });

        let outcome = rx.await.map_err(|_| PermissionError::Dropped);
        drop(guard);
        outcome
    }

    fn arm_timer(&self, id: &PermissionRequestId) {
        let timer = self.spawn_timeout(id.clone());
        match self.pending.get_mut(id) {
            Some(mut entry) => entry.timer = Some(timer),
            // Already resolved or timed out.
            None => timer.abort(),
        }
    }

    fn spawn_timeout(&self, id: PermissionRequestId) -> JoinHandle<()> {
        let pending = Arc::clone(&self.pending);
        let metrics = self.metrics.clone();
        let timeout = self.config.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, mut entry)) = pending.remove(&id) {
                let outcome = safe_deny(&entry.options);
                warn!(
                    request_id = %id,
                    conversation_id = %entry.conversation_id,
                    timeout_ms = timeout.as_millis() as u64,
                    ?outcome,
                    "permission request timed out"
                );
                if let Some(m) = &metrics {
                    m.counter_inc("permission_timeouts", &[], 1);
                }
                // This task is the timer; nothing to abort.
                entry.timer = None;
                entry.complete(outcome);
            }
        })
    }

    /// Complete a pending request. Returns `false` for unknown ids and for a
    /// selection that was not among the offered options (the request stays pending).
    pub fn resolve(&self, request_id: &PermissionRequestId, outcome: PermissionOutcome) -> bool {
        let offered = |_: &PermissionRequestId, entry: &Pending| {
            outcome
                .selected_id()
                .map_or(true, |sel| entry.options.iter().any(|o| o.option_id == sel))
        };
        match self.pending.remove_if(request_id, offered) {
            Some((_, entry)) => {
                debug!(request_id = %request_id, ?outcome, waited_ms = entry.waited_ms(), "permission resolved");
                entry.complete(outcome);
                true
            }
            None => {
                debug!(request_id = %request_id, "resolve ignored: unknown request or option");
                false
            }
        }
    }

    /// Resolve every pending request of a conversation with `cancelled`.
    pub fn cancel_for_conversation(&self, conversation_id: &ConversationId) -> usize {
        let mut cancelled = 0;
        for id in self.pending_for(conversation_id) {
            if let Some((_, entry)) = self.pending.remove(&id) {
                debug!(request_id = %id, waited_ms = entry.waited_ms(), "permission cancelled");
                entry.complete(PermissionOutcome::Cancelled);
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!(conversation_id = %conversation_id, cancelled, "pending permissions cancelled");
        }
        cancelled
    }

    /// Cancel everything and refuse new requests.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let ids: Vec<_> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                entry.complete(PermissionOutcome::Cancelled);
            }
        }
    }

    /// Non-interactive policy: read-only kinds allow once, mutating kinds reject
    /// once, anything else takes the first option.
    pub fn default_outcome(kind: ToolKind, options: &[PermissionOption]) -> PermissionOutcome {
        let preferred = if kind.is_read_only() {
            Some(PermissionOptionKind::AllowOnce)
        } else if kind.is_mutating() {
            Some(PermissionOptionKind::RejectOnce)
        } else {
            None
        };
        preferred
            .and_then(|k| options.iter().find(|o| o.kind == k))
            .or_else(|| options.first())
            .map_or(PermissionOutcome::Cancelled, |o| {
                PermissionOutcome::selected(o.option_id.clone())
            })
    }
}

/// Outcome used when nobody answered in time.
fn safe_deny(options: &[PermissionOption]) -> PermissionOutcome {
    [PermissionOptionKind::RejectOnce, PermissionOptionKind::RejectAlways]
        .iter()
        .find_map(|kind| options.iter().find(|o| o.kind == *kind))
        .map_or(PermissionOutcome::Cancelled, |o| {
            PermissionOutcome::selected(o.option_id.clone())
        })
}

/// Conversation-scoped view of the gateway handed to execution backends.
#[derive(Clone)]
pub struct PermissionHandle {
    gateway: Arc<PermissionGateway>,
    conversation_id: ConversationId,
}

impl PermissionHandle {
    pub fn new(gateway: Arc<PermissionGateway>, conversation_id: ConversationId) -> Self {
        Self {
            gateway,
            conversation_id,
        }
    }

    pub async fn request(
        &self,
        tool_call: ToolCallDescriptor,
        options: Vec<PermissionOption>,
    ) -> Result<PermissionOutcome, PermissionError> {
        self.gateway
            .request(&self.conversation_id, tool_call, options)
            .await
    }
}

impl std::fmt::Debug for PermissionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionHandle")
            .field("conversation_id", &self.conversation_id)
            .finish_non_exhaustive()
    }
}
