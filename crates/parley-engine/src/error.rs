use parley_core::errors::ValidationError;
use parley_core::ids::ConversationId;

/// Failure reported by an execution backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend process failed: {0}")]
    Process(String),

    #[error("backend protocol error: {0}")]
    Protocol(String),

    #[error("backend call cancelled")]
    Cancelled,
}

impl BackendError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("conversation not found: {0}")]
    NotFound(ConversationId),

    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PermissionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("permission gateway is shutting down")]
    ShuttingDown,

    #[error("permission request dropped before completion")]
    Dropped,
}

/// Errors surfaced from `TurnOrchestrator::submit_turn`.
///
/// Backend failures are not here: they resolve into a `refusal` stop reason.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error("{0}")]
    Internal(String),
}

impl TurnError {
    /// Stable machine-readable category for logs and RPC error data.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::ConversationNotFound(_) => "conversation_not_found",
            Self::Store(_) => "store",
            Self::ShuttingDown => "shutting_down",
            Self::Internal(_) => "internal",
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Validation(_) | Self::ConversationNotFound(_))
    }
}
