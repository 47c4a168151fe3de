//! Identifiers for conversations, turns, tool calls and permission requests.
//!
//! Ids are opaque strings on the wire. Ids minted here carry a short kind
//! prefix and a time-ordered UUID, so they sort by creation time in logs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Declares a string-backed id type that serializes as a bare JSON string.
macro_rules! branded_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[doc = concat!("Mint a fresh id of the form `", $prefix, "_<uuid v7>`.")]
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            /// Wrap an id received from a client or a backend, unchanged.
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Blank ids fail request validation.
            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self::from_raw(s))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(
    /// A client conversation. Chosen by the client; `new()` is for stores that mint their own.
    ConversationId,
    "conv"
);
branded_id!(
    /// One submitted turn. Also names the turn's progress tool call.
    TurnId,
    "turn"
);
branded_id!(
    /// A tool call reported by the backend, or the synthetic progress call of a turn.
    ToolCallId,
    "call"
);
branded_id!(
    /// An outstanding permission request. Used as the JSON-RPC id of the prompt.
    PermissionRequestId,
    "perm"
);
