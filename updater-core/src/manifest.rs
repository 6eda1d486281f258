//! Format-aware rewriting of image fields in a YAML manifest.
//!
//! The manifest is parsed with `serde_yaml` to validate it and resolve field
//! paths, but rewriting is done on the raw text: only the byte span of the
//! targeted scalar changes, so comments, key order, quoting, and line endings
//! elsewhere survive untouched. After an edit, the result is re-parsed and
//! must equal the original document with only the targeted fields replaced.
//!
//! Supported: block-style mappings addressed by a dotted key path
//! (`image.tag`). Scalars may be plain, single-, or double-quoted. Flow
//! collections, block scalars, anchors, and tags on the target field are
//! rejected as [`ManifestError::Unsupported`].

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::ManifestError;
use crate::types::Digest;

pub const DEFAULT_TAG_PATH: &str = "image.tag";
pub const DEFAULT_REPOSITORY_PATH: &str = "image.repository";

fn default_tag_path() -> String {
    DEFAULT_TAG_PATH.to_string()
}

fn default_repository_path() -> Option<String> {
    Some(DEFAULT_REPOSITORY_PATH.to_string())
}

/// Where the image fields live inside a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSchema {
    #[serde(default = "default_tag_path")]
    pub tag_path: String,
    #[serde(default = "default_repository_path")]
    pub repository_path: Option<String>,
    /// Optional field pinning the digest next to the tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest_path: Option<String>,
}

impl Default for ManifestSchema {
    fn default() -> Self {
        Self {
            tag_path: default_tag_path(),
            repository_path: default_repository_path(),
            digest_path: None,
        }
    }
}

/// Image fields as currently declared by a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestImage {
    pub repository: Option<String>,
    pub tag: String,
    pub digest: Option<Digest>,
}

/// Read the image fields declared by `content`.
pub fn read_image(content: &[u8], schema: &ManifestSchema) -> Result<ManifestImage, ManifestError> {
    let text = as_text(content)?;
    let doc = parse(text)?;

    let tag = locate_scalar(text, &doc, &schema.tag_path)?
        .map(|span| span.value(text))
        .ok_or_else(|| ManifestError::MissingField {
            path: schema.tag_path.clone(),
        })?;

    let repository = match &schema.repository_path {
        Some(path) => locate_scalar(text, &doc, path)?.map(|span| span.value(text)),
        None => None,
    };
    let digest = match &schema.digest_path {
        Some(path) => locate_scalar(text, &doc, path)?
            .map(|span| span.value(text))
            .filter(|d| !d.is_empty())
            .map(Digest::from),
        None => None,
    };

    Ok(ManifestImage {
        repository,
        tag,
        digest,
    })
}

/// Rewrites the tag field (and the digest field, when the schema names one
/// that is present) to point at a new image version.
#[derive(Debug, Clone, Copy)]
pub struct ManifestMutation<'a> {
    pub schema: &'a ManifestSchema,
    pub tag: &'a str,
    pub digest: Option<&'a Digest>,
}

impl<'a> ManifestMutation<'a> {
    pub fn new(schema: &'a ManifestSchema, tag: &'a str, digest: Option<&'a Digest>) -> Self {
        Self {
            schema,
            tag,
            digest,
        }
    }

    /// Apply the mutation. Returns `content` unchanged (byte-identical) when
    /// the manifest already declares the target values.
    pub fn apply(&self, content: &[u8]) -> Result<Vec<u8>, ManifestError> {
        let text = as_text(content)?;
        let doc = parse(text)?;
        let mut expected = doc.clone();
        let mut edits: Vec<(Span, String)> = Vec::new();

        let tag_span = locate_scalar(text, &doc, &self.schema.tag_path)?.ok_or_else(|| {
            ManifestError::MissingField {
                path: self.schema.tag_path.clone(),
            }
        })?;
        if tag_span.value(text) != self.tag {
            edits.push((tag_span, tag_span.style.render(self.tag)));
            set_path(&mut expected, &self.schema.tag_path, self.tag);
        }

        if let (Some(path), Some(digest)) = (&self.schema.digest_path, self.digest) {
            // Absent digest fields are left alone; inserting one would
            // reshape the document.
            if let Some(span) = locate_scalar(text, &doc, path)? {
                if span.value(text) != digest.as_str() {
                    edits.push((span, span.style.render(digest.as_str())));
                    set_path(&mut expected, path, digest.as_str());
                }
            }
        }

        if edits.is_empty() {
            return Ok(content.to_vec());
        }

        edits.sort_by(|a, b| b.0.start.cmp(&a.0.start));
        let mut output = text.to_string();
        for (span, replacement) in &edits {
            output.replace_range(span.start..span.end, replacement);
        }

        let rewritten = serde_yaml::from_str::<Value>(&output)
            .map_err(|e| ManifestError::Verification(e.to_string()))?;
        if rewritten != expected {
            return Err(ManifestError::Verification(
                "rewrite changed content outside the image fields".to_string(),
            ));
        }
        Ok(output.into_bytes())
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn as_text(content: &[u8]) -> Result<&str, ManifestError> {
    std::str::from_utf8(content).map_err(|_| ManifestError::NotUtf8)
}

fn parse(text: &str) -> Result<Value, ManifestError> {
    serde_yaml::from_str(text).map_err(|e| ManifestError::Parse(e.to_string()))
}

fn segments(path: &str) -> Vec<&str> {
    path.split('.').filter(|s| !s.is_empty()).collect()
}

fn lookup<'v>(doc: &'v Value, path: &str) -> Option<&'v Value> {
    let mut current = doc;
    for segment in segments(path) {
        current = current.get(segment)?;
    }
    Some(current)
}

fn set_path(doc: &mut Value, path: &str, value: &str) {
    let mut current = doc;
    for segment in segments(path) {
        match current.get_mut(segment) {
            Some(next) => current = next,
            None => return,
        }
    }
    *current = Value::String(value.to_string());
}

/// Resolve `path` in the parsed document and find its raw span in `text`.
///
/// `Ok(None)` when the field is absent or null.
fn locate_scalar(text: &str, doc: &Value, path: &str) -> Result<Option<Span>, ManifestError> {
    match lookup(doc, path) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(_)) | Some(Value::Number(_)) | Some(Value::Bool(_)) => {}
        Some(_) => {
            return Err(ManifestError::Unsupported {
                path: path.to_string(),
                reason: "field is not a scalar".to_string(),
            })
        }
    }

    let wanted = segments(path);
    match locate(text, &wanted) {
        Located::Found(span) => Ok(Some(span)),
        Located::Rejected(reason) => Err(ManifestError::Unsupported {
            path: path.to_string(),
            reason,
        }),
        Located::Missing => Err(ManifestError::Unsupported {
            path: path.to_string(),
            reason: "field is not written in block style".to_string(),
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QuoteStyle {
    Plain,
    Single,
    Double,
}

impl QuoteStyle {
    /// Render `value` in this style, upgrading plain scalars that would not
    /// read back as the same string (`16.0`, `true`, `a: b`).
    fn render(self, value: &str) -> String {
        match self {
            QuoteStyle::Plain if is_plain_safe(value) => value.to_string(),
            QuoteStyle::Single => format!("'{}'", value.replace('\'', "''")),
            QuoteStyle::Plain | QuoteStyle::Double => format!(
                "\"{}\"",
                value.replace('\\', "\\\\").replace('"', "\\\"")
            ),
        }
    }
}

fn is_plain_safe(value: &str) -> bool {
    if value.is_empty() || value.trim() != value || value.contains(['\n', '\r']) {
        return false;
    }
    if value.contains(" #") || value.contains(": ") {
        return false;
    }
    matches!(serde_yaml::from_str::<Value>(value), Ok(Value::String(ref s)) if s == value)
}

/// Byte span of a scalar token (including quotes) within the manifest text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: usize,
    end: usize,
    style: QuoteStyle,
}

impl Span {
    fn value(&self, text: &str) -> String {
        let raw = &text[self.start..self.end];
        match self.style {
            QuoteStyle::Plain => raw.to_string(),
            QuoteStyle::Single => raw[1..raw.len() - 1].replace("''", "'"),
            QuoteStyle::Double => raw[1..raw.len() - 1]
                .replace("\\\"", "\"")
                .replace("\\\\", "\\"),
        }
    }
}

enum Located {
    Found(Span),
    Rejected(String),
    Missing,
}

/// One level of the block-mapping path. `None` marks a sequence item, which
/// dotted paths never address.
struct Frame {
    indent: usize,
    key: Option<String>,
}

fn locate(text: &str, wanted: &[&str]) -> Located {
    let mut frames: Vec<Frame> = Vec::new();
    let mut block_scalar_parent: Option<usize> = None;
    let mut offset = 0usize;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();

        let body = line.trim_end_matches(['\n', '\r']);
        let trimmed = body.trim_start_matches(' ');
        let mut indent = body.len() - trimmed.len();

        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some(parent) = block_scalar_parent {
            if indent > parent {
                continue;
            }
            block_scalar_parent = None;
        }
        if indent == 0 && (trimmed.starts_with("---") || trimmed.starts_with("...")) {
            frames.clear();
            continue;
        }

        let mut rest = trimmed;
        while rest == "-" || rest.starts_with("- ") {
            frames.retain(|f| f.indent < indent);
            frames.push(Frame { indent, key: None });
            let after = rest[1..].trim_start_matches(' ');
            indent += rest.len() - after.len();
            rest = after;
        }
        if rest.is_empty() {
            continue;
        }

        let Some((key, after_colon)) = split_key(rest) else {
            continue;
        };
        frames.retain(|f| f.indent < indent);

        let rest_start = line_start + (body.len() - rest.len());
        let value_region = &rest[after_colon..];
        let value = value_region.trim_start_matches([' ', '\t']);
        let value_start = rest_start + after_colon + (value_region.len() - value.len());

        let is_target = frames.len() + 1 == wanted.len()
            && frames
                .iter()
                .zip(wanted)
                .all(|(frame, segment)| frame.key.as_deref() == Some(*segment))
            && key == wanted[wanted.len() - 1];

        if is_target {
            return match scalar_token(value) {
                Ok((len, style)) => Located::Found(Span {
                    start: value_start,
                    end: value_start + len,
                    style,
                }),
                Err(reason) => Located::Rejected(reason),
            };
        }

        if value.starts_with('|') || value.starts_with('>') {
            block_scalar_parent = Some(indent);
        } else if value.is_empty() || value.starts_with('#') || value.starts_with('&') {
            frames.push(Frame {
                indent,
                key: Some(key),
            });
        }
    }

    Located::Missing
}

/// Split `key: value` into the unquoted key and the byte offset just past
/// the mapping colon. `None` for lines that are not mapping entries.
fn split_key(rest: &str) -> Option<(String, usize)> {
    let first = rest.chars().next()?;
    if matches!(first, '{' | '[' | '?' | '#') {
        return None;
    }

    if first == '"' || first == '\'' {
        let (len, style) = quoted_token(rest, first).ok()?;
        let after = &rest[len..];
        let trimmed = after.trim_start_matches(' ');
        if !trimmed.starts_with(':') {
            return None;
        }
        let colon = len + (after.len() - trimmed.len());
        if !separates(rest, colon) {
            return None;
        }
        let key = Span {
            start: 0,
            end: len,
            style,
        }
        .value(rest);
        return Some((key, colon + 1));
    }

    let bytes = rest.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        match b {
            b'#' if i > 0 && matches!(bytes[i - 1], b' ' | b'\t') => return None,
            b':' if separates(rest, i) => {
                let key = rest[..i].trim_end().to_string();
                return Some((key, i + 1));
            }
            _ => {}
        }
    }
    None
}

/// A colon is a mapping separator when followed by whitespace or end of line.
fn separates(rest: &str, colon: usize) -> bool {
    matches!(rest.as_bytes().get(colon + 1), None | Some(b' ') | Some(b'\t'))
}

/// Measure the scalar token at the start of `value`.
fn scalar_token(value: &str) -> Result<(usize, QuoteStyle), String> {
    let Some(first) = value.chars().next() else {
        return Err("field has no inline value".to_string());
    };
    match first {
        '"' | '\'' => quoted_token(value, first),
        '#' => Err("field has no inline value".to_string()),
        '{' | '[' => Err("flow collections are not supported".to_string()),
        '|' | '>' => Err("block scalars are not supported".to_string()),
        '&' | '*' | '!' => Err("anchors, aliases, and tags are not supported".to_string()),
        _ => {
            let end = comment_start(value).unwrap_or(value.len());
            let token = value[..end].trim_end_matches([' ', '\t']);
            Ok((token.len(), QuoteStyle::Plain))
        }
    }
}

fn comment_start(value: &str) -> Option<usize> {
    let bytes = value.as_bytes();
    (1..bytes.len()).find(|&i| bytes[i] == b'#' && matches!(bytes[i - 1], b' ' | b'\t'))
}

fn quoted_token(value: &str, quote: char) -> Result<(usize, QuoteStyle), String> {
    let bytes = value.as_bytes();
    let mut i = 1;
    while i < bytes.len() {
        match (quote, bytes[i]) {
            ('"', b'\\') => i += 2,
            ('"', b'"') => return Ok((i + 1, QuoteStyle::Double)),
            ('\'', b'\'') if bytes.get(i + 1) == Some(&b'\'') => i += 2,
            ('\'', b'\'') => return Ok((i + 1, QuoteStyle::Single)),
            _ => i += 1,
        }
    }
    Err("unterminated quoted scalar".to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
