use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::errors::{BlockError, ValidationError};

/// Who a block is meant for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotations {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<Vec<Role>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Map<String, serde_json::Value>>,
}

/// A tagged payload exchanged between client and agent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text(TextContent),
    Image(ImageContent),
    Audio(AudioContent),
    Resource(EmbeddedResource),
    ResourceLink(ResourceLink),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextContent {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageContent {
    pub data: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioContent {
    pub data: String,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddedResource {
    pub resource: ResourceContents,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

/// Contents of an embedded resource. Exactly one of `text` or `blob` (base64)
/// is present; both fields exist on the wire struct so the "both" and
/// "neither" cases can be rejected by validation instead of silently picked.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceContents {
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLink {
    pub uri: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Annotations>,
}

// --- Convenience constructors ---

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(TextContent {
            text: text.into(),
            annotations: None,
        })
    }

    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self::Image(ImageContent {
            data: data.into(),
            mime_type: mime_type.into(),
            uri: None,
            annotations: None,
        })
    }

    pub fn audio(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self::Audio(AudioContent {
            data: data.into(),
            mime_type: mime_type.into(),
            annotations: None,
        })
    }

    pub fn resource_text(uri: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Resource(EmbeddedResource {
            resource: ResourceContents {
                uri: uri.into(),
                mime_type: None,
                text: Some(text.into()),
                blob: None,
            },
            annotations: None,
        })
    }

    pub fn resource_link(uri: impl Into<String>, name: impl Into<String>) -> Self {
        Self::ResourceLink(ResourceLink {
            uri: uri.into(),
            name: name.into(),
            title: None,
            description: None,
            mime_type: None,
            size: None,
            annotations: None,
        })
    }

    /// Wire tag of this block.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Image(_) => "image",
            Self::Audio(_) => "audio",
            Self::Resource(_) => "resource",
            Self::ResourceLink(_) => "resource_link",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(&t.text),
            _ => None,
        }
    }

    pub fn annotations(&self) -> Option<&Annotations> {
        match self {
            Self::Text(c) => c.annotations.as_ref(),
            Self::Image(c) => c.annotations.as_ref(),
            Self::Audio(c) => c.annotations.as_ref(),
            Self::Resource(c) => c.annotations.as_ref(),
            Self::ResourceLink(c) => c.annotations.as_ref(),
        }
    }

    pub fn annotations_mut(&mut self) -> &mut Option<Annotations> {
        match self {
            Self::Text(c) => &mut c.annotations,
            Self::Image(c) => &mut c.annotations,
            Self::Audio(c) => &mut c.annotations,
            Self::Resource(c) => &mut c.annotations,
            Self::ResourceLink(c) => &mut c.annotations,
        }
    }

    /// Check that the block carries a payload valid for its tag.
    pub fn validate(&self) -> Result<(), BlockError> {
        match self {
            Self::Text(_) => {}
            Self::Image(c) => {
                require_base64(&c.data, "data")?;
                require_mime_family(&c.mime_type, "image")?;
            }
            Self::Audio(c) => {
                require_base64(&c.data, "data")?;
                require_mime_family(&c.mime_type, "audio")?;
            }
            Self::Resource(c) => {
                let r = &c.resource;
                require_non_empty(&r.uri, "resource.uri")?;
                match (&r.text, &r.blob) {
                    (Some(_), None) => {}
                    (None, Some(blob)) => require_base64(blob, "resource.blob")?,
                    _ => return Err(BlockError::ResourcePayload),
                }
            }
            Self::ResourceLink(c) => {
                require_non_empty(&c.uri, "uri")?;
                require_non_empty(&c.name, "name")?;
            }
        }
        match self.annotations() {
            Some(a) => a.validate(),
            None => Ok(()),
        }
    }
}

impl Annotations {
    pub fn validate(&self) -> Result<(), BlockError> {
        if let Some(audience) = &self.audience {
            let mut seen = Vec::with_capacity(audience.len());
            for role in audience {
                if seen.contains(role) {
                    return Err(BlockError::DuplicateAudience);
                }
                seen.push(*role);
            }
        }
        if let Some(p) = self.priority {
            if !p.is_finite() || p < 0.0 {
                return Err(BlockError::InvalidPriority);
            }
        }
        if let Some(ts) = &self.last_modified {
            chrono::DateTime::parse_from_rfc3339(ts)
                .map_err(|_| BlockError::InvalidTimestamp(ts.clone()))?;
        }
        Ok(())
    }

    /// Insert a `_meta` entry, creating the map if needed.
    pub fn set_meta(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.meta
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.into(), value);
    }
}

/// Validate a whole turn's content: non-empty, every block well-formed.
pub fn validate_content(blocks: &[ContentBlock]) -> Result<(), ValidationError> {
    if blocks.is_empty() {
        return Err(ValidationError::EmptyContent);
    }
    for (index, block) in blocks.iter().enumerate() {
        block
            .validate()
            .map_err(|source| ValidationError::InvalidBlock { index, source })?;
    }
    Ok(())
}

/// Concatenated text of every text block (used when recording history).
pub fn joined_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(ContentBlock::as_text)
        .collect::<Vec<_>>()
        .join("")
}

fn require_non_empty(value: &str, field: &'static str) -> Result<(), BlockError> {
    if value.trim().is_empty() {
        Err(BlockError::Empty { field })
    } else {
        Ok(())
    }
}

fn require_base64(value: &str, field: &'static str) -> Result<(), BlockError> {
    require_non_empty(value, field)?;
    STANDARD
        .decode(value.trim())
        .map(|_| ())
        .map_err(|_| BlockError::InvalidBase64 { field })
}

fn require_mime_family(mime: &str, family: &'static str) -> Result<(), BlockError> {
    require_non_empty(mime, "mimeType")?;
    let prefix = mime.split('/').next().unwrap_or_default();
    if prefix.eq_ignore_ascii_case(family) {
        Ok(())
    } else {
        Err(BlockError::WrongMimeFamily {
            expected: family,
            actual: mime.to_string(),
        })
    }
}
