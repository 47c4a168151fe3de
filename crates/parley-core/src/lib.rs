pub mod content;
pub mod errors;
pub mod ids;
pub mod notifications;
pub mod permissions;
pub mod turn;
