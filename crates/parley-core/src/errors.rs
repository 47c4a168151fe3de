/// A content block that failed its shape check.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BlockError {
    #[error("{field} is not valid base64")]
    InvalidBase64 { field: &'static str },
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("mime type {actual} is not a {expected} type")]
    WrongMimeFamily { expected: &'static str, actual: String },
    #[error("resource must carry exactly one of text or blob")]
    ResourcePayload,
    #[error("annotation priority must be a finite number >= 0")]
    InvalidPriority,
    #[error("annotation lastModified is not an ISO-8601 timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("annotation audience lists a role more than once")]
    DuplicateAudience,
}

/// Malformed turn or permission request. Rejected before any side effect and
/// never retried.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required parameter: {0}")]
    MissingField(&'static str),
    #[error("content must contain at least one block")]
    EmptyContent,
    #[error("content[{index}]: {source}")]
    InvalidBlock {
        index: usize,
        #[source]
        source: BlockError,
    },
    #[error("invalid permission options: {0}")]
    InvalidOptions(String),
    #[error("malformed request: {0}")]
    Malformed(String),
}

impl ValidationError {
    /// Short classification string for logging and protocol error data.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::MissingField(_) => "missing_field",
            Self::EmptyContent => "empty_content",
            Self::InvalidBlock { .. } => "invalid_block",
            Self::InvalidOptions(_) => "invalid_options",
            Self::Malformed(_) => "malformed",
        }
    }
}

impl From<serde_json::Error> for ValidationError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}
