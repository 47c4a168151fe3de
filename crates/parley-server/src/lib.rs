//! JSON-RPC 2.0 surface for the turn engine.

pub mod bridge;
pub mod handlers;
pub mod rpc;

pub use bridge::{RpcNotificationSink, RpcPermissionPrompter};
pub use handlers::RpcDispatcher;
pub use rpc::{RpcRequest, RpcResponse};
