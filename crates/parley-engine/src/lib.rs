//! Conversational turn engine: queueing, streaming assembly, permissions,
//! and the backends that produce replies.

pub mod assembler;
pub mod backend;
pub mod error;
pub mod mock;
pub mod orchestrator;
pub mod permissions;
pub mod process;
pub mod sink;
pub mod store;
pub mod tracker;

pub use assembler::{parse_full, ContentAssembler};
pub use backend::{BackendEvent, BackendResponse, BackendStream, ExecutionBackend, TurnContext};
pub use error::{BackendError, PermissionError, StoreError, TurnError};
pub use orchestrator::{OrchestratorConfig, TurnOrchestrator};
pub use permissions::{PermissionConfig, PermissionGateway, PermissionHandle, PermissionPrompter};
pub use sink::NotificationSink;
pub use store::{ConversationStore, InMemoryConversationStore};
