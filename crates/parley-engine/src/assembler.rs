//! Streaming text → content block assembly.
//!
//! Backends emit text in arbitrary fragments. [`ContentAssembler`] buffers them
//! and releases blocks only once a fenced code span or inline data marker can no
//! longer be split by the next fragment.

use std::sync::LazyLock;

use regex::Regex;

use parley_core::content::{Annotations, ContentBlock};

/// Buffers without a newline shorter than this are held back.
const FLUSH_THRESHOLD: usize = 100;
const FENCE: &str = "```";

static FENCE_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"```([A-Za-z0-9_+#.\-]*)[ \t]*\n?").unwrap());

/// Markdown-style inline media reference, e.g. `![chart](data:image/png;base64,...)`.
static DATA_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[[^\]\n]*\]\([^)\s]+\)").unwrap());

/// A data marker that may still be completed by the next fragment.
static PARTIAL_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!(?:\[[^\]\n]*(?:\]\([^)\s]*)?)?$").unwrap());

static FILE_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:#+\s*|//\s*)?File:\s*(\S.*?)\s*$").unwrap());

#[derive(Clone, Debug, Default, PartialEq, Eq)]
enum Mode {
    #[default]
    Text,
    Code {
        language: Option<String>,
    },
}

/// Next structural token found in a text buffer.
enum Token {
    Fence {
        start: usize,
        end: usize,
        language: Option<String>,
        /// False when the match runs into the end of the buffer without its newline.
        complete: bool,
    },
    Marker {
        start: usize,
        end: usize,
    },
}

fn scan(s: &str) -> Option<Token> {
    let fence = FENCE_OPEN.find(s);
    let marker = DATA_MARKER.find(s);
    match (fence, marker) {
        (Some(f), Some(m)) if m.start() < f.start() => Some(Token::Marker {
            start: m.start(),
            end: m.end(),
        }),
        (Some(f), _) => Some(Token::Fence {
            start: f.start(),
            end: f.end(),
            language: fence_language(f.as_str()),
            complete: f.as_str().ends_with('\n') || f.end() < s.len(),
        }),
        (None, Some(m)) => Some(Token::Marker {
            start: m.start(),
            end: m.end(),
        }),
        (None, None) => None,
    }
}

fn fence_language(fence: &str) -> Option<String> {
    let lang = fence.trim_start_matches('`').trim_end();
    (!lang.is_empty()).then(|| lang.to_string())
}

/// Offset of a closing fence: three backticks at the start of a line, followed by
/// whitespace or the end of the buffer.
fn find_closing_fence(s: &str) -> Option<usize> {
    s.match_indices(FENCE).map(|(i, _)| i).find(|&i| {
        let at_line_start = i == 0 || s.as_bytes()[i - 1] == b'\n';
        let next = s[i + FENCE.len()..].chars().next();
        at_line_start && next.map_or(true, char::is_whitespace)
    })
}

fn wrap_code(language: Option<&str>, code: &str) -> String {
    let mut out = String::with_capacity(code.len() + 16);
    out.push_str(FENCE);
    if let Some(lang) = language {
        out.push_str(lang);
    }
    out.push('\n');
    out.push_str(code);
    if !code.is_empty() && !code.ends_with('\n') {
        out.push('\n');
    }
    out.push_str(FENCE);
    out
}

/// Incremental assembler for one stream. Create one per turn; never shared.
#[derive(Debug, Default)]
pub struct ContentAssembler {
    mode: Mode,
    buffer: String,
}

impl ContentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_code(&self) -> bool {
        matches!(self.mode, Mode::Code { .. })
    }

    pub fn code_language(&self) -> Option<&str> {
        match &self.mode {
            Mode::Code { language } => language.as_deref(),
            Mode::Text => None,
        }
    }

    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    pub fn reset(&mut self) {
        self.mode = Mode::Text;
        self.buffer.clear();
    }

    /// Append a fragment and return at most one block that is now safe to emit.
    ///
    /// More than one block may be ready after a single fragment; call again with
    /// `""` (or use [`push`](Self::push)) to drain them.
    pub fn process_chunk(&mut self, raw: &str) -> Option<ContentBlock> {
        self.buffer.push_str(raw);
        self.step()
    }

    /// Append a fragment and drain every block that is ready.
    pub fn push(&mut self, raw: &str) -> Vec<ContentBlock> {
        self.buffer.push_str(raw);
        self.drain()
    }

    /// Emit whatever is still buffered. Returns a block at most once per stream.
    pub fn finalize(&mut self) -> Option<ContentBlock> {
        let buffer = std::mem::take(&mut self.buffer);
        match std::mem::take(&mut self.mode) {
            Mode::Code { language } if !buffer.is_empty() => {
                Some(ContentBlock::text(wrap_code(language.as_deref(), &buffer)))
            }
            Mode::Text if !buffer.trim().is_empty() => Some(ContentBlock::text(buffer)),
            _ => None,
        }
    }

    /// Drain ready blocks, then finalize.
    pub fn finish(&mut self) -> Vec<ContentBlock> {
        let mut blocks = self.drain();
        blocks.extend(self.finalize());
        blocks
    }

    fn drain(&mut self) -> Vec<ContentBlock> {
        let mut blocks = Vec::new();
        while let Some(block) = self.step() {
            blocks.push(block);
        }
        blocks
    }

    fn step(&mut self) -> Option<ContentBlock> {
        loop {
            if let Mode::Code { language } = &self.mode {
                let close = find_closing_fence(&self.buffer)?;
                let payload = wrap_code(language.as_deref(), &self.buffer[..close]);
                self.buffer.drain(..close + FENCE.len());
                self.mode = Mode::Text;
                return Some(ContentBlock::text(payload));
            }

            match scan(&self.buffer) {
                Some(Token::Fence {
                    start,
                    end,
                    language,
                    complete,
                }) => {
                    let preceding = self.buffer[..start].trim();
                    let flushed = (!preceding.is_empty()).then(|| ContentBlock::text(preceding));
                    if !complete {
                        // Language tag may still be arriving; keep the fence buffered.
                        self.buffer.drain(..start);
                        return flushed;
                    }
                    self.buffer.drain(..end);
                    self.mode = Mode::Code { language };
                    if flushed.is_some() {
                        return flushed;
                    }
                }
                Some(Token::Marker { start, end }) => {
                    let cut = if start > 0 { start } else { end };
                    return Some(self.take(cut));
                }
                None => return self.flush_plain(),
            }
        }
    }

    fn flush_plain(&mut self) -> Option<ContentBlock> {
        // One or two trailing backticks may be the start of a fence.
        if self.buffer.ends_with('`') {
            return None;
        }
        if let Some(nl) = self.buffer.rfind('\n') {
            return Some(self.take(nl + 1));
        }
        if self.buffer.chars().count() < FLUSH_THRESHOLD {
            return None;
        }
        let cut = PARTIAL_MARKER
            .find(&self.buffer)
            .map(|m| m.start())
            .filter(|&start| start > 0)
            .unwrap_or(self.buffer.len());
        Some(self.take(cut))
    }

    fn take(&mut self, upto: usize) -> ContentBlock {
        let text: String = self.buffer.drain(..upto).collect();
        ContentBlock::text(text)
    }
}

enum Segment {
    Text(String),
    Code(String),
}

/// Segment a complete response into blocks.
///
/// Follows the streaming rules without holding anything back. Whitespace-only
/// text between structural tokens is dropped; every other segment keeps its
/// bytes. A code block directly preceded by a `File: name` header line gets
/// `_meta.file = name`.
pub fn parse_full(text: &str) -> Vec<ContentBlock> {
    let mut segments = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        match scan(rest) {
            Some(Token::Fence {
                start,
                end,
                language,
                ..
            }) => {
                push_text(&mut segments, &rest[..start]);
                let body = &rest[end..];
                match find_closing_fence(body) {
                    Some(close) => {
                        segments.push(Segment::Code(wrap_code(language.as_deref(), &body[..close])));
                        rest = &body[close + FENCE.len()..];
                    }
                    None => {
                        segments.push(Segment::Code(wrap_code(language.as_deref(), body)));
                        rest = "";
                    }
                }
            }
            Some(Token::Marker { start, end }) => {
                push_text(&mut segments, &rest[..start]);
                segments.push(Segment::Text(rest[start..end].to_string()));
                rest = &rest[end..];
            }
            None => {
                push_text(&mut segments, rest);
                rest = "";
            }
        }
    }

    attach_file_headers(segments)
}

fn push_text(segments: &mut Vec<Segment>, text: &str) {
    if !text.trim().is_empty() {
        segments.push(Segment::Text(text.to_string()));
    }
}

fn header_file_name(text: &str) -> Option<String> {
    let last_line = text.trim_end().rsplit('\n').next()?;
    FILE_HEADER
        .captures(last_line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

fn attach_file_headers(segments: Vec<Segment>) -> Vec<ContentBlock> {
    let mut blocks = Vec::with_capacity(segments.len());
    let mut pending_file: Option<String> = None;

    for segment in segments {
        match segment {
            Segment::Text(text) => {
                pending_file = header_file_name(&text);
                blocks.push(ContentBlock::text(text));
            }
            Segment::Code(payload) => {
                let mut block = ContentBlock::text(payload);
                if let Some(file) = pending_file.take() {
                    block
                        .annotations_mut()
                        .get_or_insert_with(Annotations::default)
                        .set_meta("file", serde_json::Value::String(file));
                }
                blocks.push(block);
            }
        }
    }
    blocks
}
