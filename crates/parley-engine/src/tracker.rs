//! Tool-call tracker: per-turn record of tool calls reported by the backend.

use std::collections::HashMap;

use parley_core::ids::ToolCallId;
use parley_core::notifications::{ToolCall, ToolCallStatus, ToolCallUpdate};

/// Knows which tool calls a turn has announced and which are still open.
#[derive(Debug, Default)]
pub struct ToolCallTracker {
    status: HashMap<ToolCallId, ToolCallStatus>,
    order: Vec<ToolCallId>,
}

impl ToolCallTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new call. Returns `false` if the id was already announced.
    pub fn start(&mut self, call: &ToolCall) -> bool {
        if self.status.contains_key(&call.tool_call_id) {
            return false;
        }
        let _ = self.status.insert(call.tool_call_id.clone(), call.status);
        self.order.push(call.tool_call_id.clone());
        true
    }

    /// Apply an update. Returns `false` for ids that were never announced.
    pub fn update(&mut self, update: &ToolCallUpdate) -> bool {
        match self.status.get_mut(&update.tool_call_id) {
            Some(status) => {
                if let Some(next) = update.status {
                    *status = next;
                }
                true
            }
            None => false,
        }
    }

    pub fn status(&self, id: &ToolCallId) -> Option<ToolCallStatus> {
        self.status.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Calls not yet completed or failed, in announcement order.
    pub fn open_calls(&self) -> Vec<ToolCallId> {
        self.order
            .iter()
            .filter(|id| self.status.get(*id).is_some_and(|s| !s.is_terminal()))
            .cloned()
            .collect()
    }

    /// Mark every open call with `status`, returning the updates to emit.
    pub fn close_open(&mut self, status: ToolCallStatus) -> Vec<ToolCallUpdate> {
        let open = self.open_calls();
        open.into_iter()
            .map(|id| {
                let _ = self.status.insert(id.clone(), status);
                ToolCallUpdate::status(id, status)
            })
            .collect()
    }
}
