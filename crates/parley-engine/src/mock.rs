//! Scripted backend for deterministic tests and local runs.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use parley_core::content::{joined_text, ContentBlock};
use parley_core::ids::ConversationId;
use parley_core::permissions::{PermissionOption, PermissionOutcome, ToolCallDescriptor};

use crate::backend::{BackendEvent, BackendResponse, BackendStream, ExecutionBackend, TurnContext};
use crate::error::BackendError;

/// One step of a scripted stream.
#[derive(Clone, Debug)]
pub enum MockStep {
    Event(BackendEvent),
    Pause(Duration),
}

/// Pre-programmed backend behaviour, consumed one per call.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// `send` returns it; `send_streaming` yields the output as one chunk then `Done`.
    Output(BackendResponse),
    /// `send_streaming` plays the script; `send` returns the concatenated chunks.
    Stream(Vec<MockStep>),
    Error(BackendError),
    /// Wait (cancellable), then behave like the inner response.
    Delay(Duration, Box<MockResponse>),
    /// Block until the turn is cancelled.
    Hang,
    /// Ask for permission, then answer with the outcome (`selected:<id>` or `cancelled`).
    AskPermission(ToolCallDescriptor, Vec<PermissionOption>),
    Panic(String),
}

impl MockResponse {
    pub fn text(output: &str) -> Self {
        Self::Output(BackendResponse::ok(output))
    }

    /// Stream the given fragments followed by a successful `Done`.
    pub fn chunks(fragments: &[&str]) -> Self {
        let mut steps: Vec<MockStep> = fragments
            .iter()
            .map(|f| MockStep::Event(BackendEvent::Chunk((*f).to_string())))
            .collect();
        steps.push(MockStep::Event(BackendEvent::Done(BackendResponse::ok(
            fragments.concat(),
        ))));
        Self::Stream(steps)
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// What the backend saw on each call.
#[derive(Clone, Debug)]
pub struct RecordedCall {
    pub conversation_id: ConversationId,
    pub text: String,
    pub streaming: bool,
}

/// Backend returning pre-programmed responses in sequence.
///
/// Per-conversation scripts take precedence over the shared queue so that
/// concurrent conversations stay deterministic.
#[derive(Default)]
pub struct MockBackend {
    shared: Mutex<VecDeque<MockResponse>>,
    by_conversation: Mutex<HashMap<ConversationId, VecDeque<MockResponse>>>,
    calls: Mutex<Vec<RecordedCall>>,
    /// `start:<text>` / `end:<text>` entries, in the order they happened.
    timeline: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            shared: Mutex::new(responses.into()),
            ..Default::default()
        }
    }

    pub fn with_conversation(self, id: ConversationId, responses: Vec<MockResponse>) -> Self {
        let _ = self.by_conversation.lock().insert(id, responses.into());
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn timeline(&self) -> Vec<String> {
        self.timeline.lock().clone()
    }

    fn next_response(&self, ctx: &TurnContext, content: &[ContentBlock], streaming: bool) -> Result<MockResponse, BackendError> {
        let text = joined_text(content);
        let index = {
            let mut calls = self.calls.lock();
            calls.push(RecordedCall {
                conversation_id: ctx.conversation_id.clone(),
                text,
                streaming,
            });
            calls.len() - 1
        };
        if let Some(queue) = self.by_conversation.lock().get_mut(&ctx.conversation_id) {
            if let Some(response) = queue.pop_front() {
                return Ok(response);
            }
        }
        self.shared.lock().pop_front().ok_or_else(|| {
            BackendError::Unavailable(format!("MockBackend: no response configured for call {index}"))
        })
    }

    /// Unwrap delays, honoring cancellation while waiting.
    async fn settle(response: MockResponse, cancel: &CancellationToken) -> Result<MockResponse, BackendError> {
        let mut current = response;
        loop {
            match current {
                MockResponse::Delay(duration, inner) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => current = *inner,
                        _ = cancel.cancelled() => return Err(BackendError::Cancelled),
                    }
                }
                MockResponse::Hang => {
                    cancel.cancelled().await;
                    return Err(BackendError::Cancelled);
                }
                MockResponse::Error(e) => return Err(e),
                MockResponse::Panic(msg) => panic!("{msg}"),
                other => return Ok(other),
            }
        }
    }

    async fn ask(ctx: &TurnContext, tool_call: ToolCallDescriptor, options: Vec<PermissionOption>) -> BackendResponse {
        match ctx.permissions.request(tool_call, options).await {
            Ok(PermissionOutcome::Selected(id)) => BackendResponse::ok(format!("selected:{id}")),
            Ok(PermissionOutcome::Cancelled) => BackendResponse::ok("cancelled"),
            Err(e) => BackendResponse::failure(e.to_string()),
        }
    }

    fn mark(&self, edge: &str, content: &[ContentBlock]) {
        self.timeline
            .lock()
            .push(format!("{edge}:{}", joined_text(content)));
    }
}

#[async_trait]
impl ExecutionBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(
        &self,
        ctx: &TurnContext,
        content: &[ContentBlock],
    ) -> Result<BackendResponse, BackendError> {
        let response = self.next_response(ctx, content, false)?;
        self.mark("start", content);
        let settled = Self::settle(response, &ctx.cancel).await;
        self.mark("end", content);

        match settled? {
            MockResponse::Output(resp) => Ok(resp),
            MockResponse::Stream(steps) => {
                let mut output = String::new();
                let mut done = None;
                for step in steps {
                    match step {
                        MockStep::Event(BackendEvent::Chunk(text)) => output.push_str(&text),
                        MockStep::Event(BackendEvent::Done(resp)) => done = Some(resp),
                        _ => {}
                    }
                }
                Ok(match done {
                    Some(resp) => BackendResponse { output, ..resp },
                    None => BackendResponse::ok(output),
                })
            }
            MockResponse::AskPermission(tool_call, options) => Ok(Self::ask(ctx, tool_call, options).await),
            other => Err(BackendError::Protocol(format!("unsettled mock response: {other:?}"))),
        }
    }

    async fn send_streaming(
        &self,
        ctx: &TurnContext,
        content: &[ContentBlock],
    ) -> Result<BackendStream, BackendError> {
        let response = self.next_response(ctx, content, true)?;
        self.mark("start", content);

        let steps = match Self::settle(response, &ctx.cancel).await? {
            MockResponse::Output(resp) => vec![
                MockStep::Event(BackendEvent::Chunk(resp.output.clone())),
                MockStep::Event(BackendEvent::Done(resp)),
            ],
            MockResponse::Stream(steps) => steps,
            MockResponse::AskPermission(tool_call, options) => {
                let resp = Self::ask(ctx, tool_call, options).await;
                vec![
                    MockStep::Event(BackendEvent::Chunk(resp.output.clone())),
                    MockStep::Event(BackendEvent::Done(resp)),
                ]
            }
            other => return Err(BackendError::Protocol(format!("unsettled mock response: {other:?}"))),
        };
        self.mark("end", content);

        let stream = stream::unfold(steps.into_iter(), |mut steps| async move {
            loop {
                match steps.next()? {
                    MockStep::Pause(d) => tokio::time::sleep(d).await,
                    MockStep::Event(event) => return Some((event, steps)),
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
