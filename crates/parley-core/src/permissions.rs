use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;
use crate::ids::{ConversationId, PermissionRequestId, ToolCallId};
use crate::notifications::ToolKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOptionKind {
    AllowOnce,
    AllowAlways,
    RejectOnce,
    RejectAlways,
}

impl PermissionOptionKind {
    pub fn is_allow(self) -> bool {
        matches!(self, Self::AllowOnce | Self::AllowAlways)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionOption {
    pub option_id: String,
    pub name: String,
    pub kind: PermissionOptionKind,
}

impl PermissionOption {
    pub fn new(option_id: impl Into<String>, name: impl Into<String>, kind: PermissionOptionKind) -> Self {
        Self {
            option_id: option_id.into(),
            name: name.into(),
            kind,
        }
    }
}

/// How a permission request ended.
///
/// Wire form: `"cancelled"` or `{"selected": "<optionId>"}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOutcome {
    Cancelled,
    Selected(String),
}

impl PermissionOutcome {
    pub fn selected(option_id: impl Into<String>) -> Self {
        Self::Selected(option_id.into())
    }

    pub fn selected_id(&self) -> Option<&str> {
        match self {
            Self::Selected(id) => Some(id),
            Self::Cancelled => None,
        }
    }

    /// True only when the selected option is an allow option from `options`.
    pub fn is_allowed(&self, options: &[PermissionOption]) -> bool {
        self.selected_id()
            .and_then(|id| options.iter().find(|o| o.option_id == id))
            .is_some_and(|o| o.kind.is_allow())
    }
}

/// The tool operation a permission request is about.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallDescriptor {
    pub tool_call_id: ToolCallId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "toolKind", default)]
    pub kind: ToolKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_input: Option<serde_json::Value>,
}

impl ToolCallDescriptor {
    pub fn new(tool_call_id: ToolCallId, kind: ToolKind) -> Self {
        Self {
            tool_call_id,
            title: None,
            kind,
            raw_input: None,
        }
    }
}

/// Request sent to the client asking it to pick one of `options`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub conversation_id: ConversationId,
    pub request_id: PermissionRequestId,
    pub tool_call: ToolCallDescriptor,
    pub options: Vec<PermissionOption>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionResponse {
    pub outcome: PermissionOutcome,
}

/// Options must be non-empty with unique, non-blank ids and names.
/// Unknown kinds never get this far: they fail to deserialize.
pub fn validate_options(options: &[PermissionOption]) -> Result<(), ValidationError> {
    if options.is_empty() {
        return Err(ValidationError::InvalidOptions("at least one option is required".into()));
    }
    let mut seen = HashSet::new();
    for opt in options {
        if opt.option_id.trim().is_empty() {
            return Err(ValidationError::InvalidOptions("optionId must not be empty".into()));
        }
        if opt.name.trim().is_empty() {
            return Err(ValidationError::InvalidOptions(format!(
                "option {} has an empty name",
                opt.option_id
            )));
        }
        if !seen.insert(opt.option_id.as_str()) {
            return Err(ValidationError::InvalidOptions(format!(
                "duplicate optionId: {}",
                opt.option_id
            )));
        }
    }
    Ok(())
}

/// Parse and validate options from raw JSON (unknown kinds are rejected here).
pub fn parse_options(value: serde_json::Value) -> Result<Vec<PermissionOption>, ValidationError> {
    let options: Vec<PermissionOption> = serde_json::from_value(value)
        .map_err(|e| ValidationError::InvalidOptions(e.to_string()))?;
    validate_options(&options)?;
    Ok(options)
}
