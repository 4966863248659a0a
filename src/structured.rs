//! Parsing generated file sets out of model answers.
//!
//! Models asked for JSON still wrap it in reasoning blocks, markdown fences,
//! or chatter, and leave trailing commas behind. [`parse_file_set`] tries, in
//! order:
//! 1. The whole answer after stripping `<think>`/`<thinking>` blocks
//! 2. A `` ```json `` fenced block, then any fenced block starting with `{`
//! 3. The last balanced `{...}` region
//!
//! each once as-is and once with trailing commas removed. When every
//! strategy fails the caller substitutes [`FileSet::fallback`], a
//! deterministic payload that keeps the raw text visible.

use crate::artifact::ArtifactKind;
use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};

/// Path used for the fallback summary artifact.
pub const FALLBACK_PATH: &str = "SUMMARY.md";

/// One generated file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub path: String,
    /// Inferred from the path when absent.
    #[serde(default)]
    pub kind: Option<ArtifactKind>,
    pub content: String,
    #[serde(default)]
    pub requirement_refs: Vec<String>,
}

impl GeneratedFile {
    pub fn kind(&self) -> ArtifactKind {
        self.kind.unwrap_or_else(|| ArtifactKind::infer(&self.path))
    }
}

/// `{"summary": "...", "files": [{path, kind?, content, requirement_refs?}]}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSet {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub files: Vec<GeneratedFile>,
    /// Set on the substitute built by [`FileSet::fallback`].
    #[serde(skip)]
    pub is_fallback: bool,
}

impl FileSet {
    /// Deterministic substitute for an unparsable answer: one summary file
    /// holding the cleaned raw text.
    pub fn fallback(raw: &str) -> Self {
        let text = strip_think_tags(raw).trim().to_string();
        FileSet {
            summary: "The answer could not be read as files; kept as text.".to_string(),
            files: vec![GeneratedFile {
                path: FALLBACK_PATH.to_string(),
                kind: Some(ArtifactKind::Summary),
                content: text,
                requirement_refs: Vec::new(),
            }],
            is_fallback: true,
        }
    }

    fn validate(self) -> Result<Self> {
        if self.files.is_empty() && self.summary.trim().is_empty() {
            return Err(malformed("no files and no summary"));
        }
        if let Some(bad) = self.files.iter().find(|f| f.path.trim().is_empty()) {
            return Err(malformed(format!(
                "file with empty path ({} bytes of content)",
                bad.content.len()
            )));
        }
        Ok(self)
    }
}

fn malformed(reason: impl Into<String>) -> RelayError {
    RelayError::MalformedPayload {
        reason: reason.into(),
    }
}

/// Parse a file set from a model answer.
///
/// ```
/// use llm_relay::structured::parse_file_set;
///
/// let answer = "<think>plan</think>```json\n{\"summary\":\"s\",\"files\":[{\"path\":\"a.rs\",\"content\":\"x\"}]}\n```";
/// let set = parse_file_set(answer).unwrap();
/// assert_eq!(set.files[0].path, "a.rs");
/// ```
pub fn parse_file_set(answer: &str) -> Result<FileSet> {
    let cleaned = strip_think_tags(answer).trim().to_string();
    if cleaned.is_empty() {
        return Err(malformed("empty answer"));
    }

    let mut last_error = String::from("no JSON object found");
    for candidate in candidates(&cleaned) {
        let repaired = remove_trailing_commas(candidate);
        for text in [candidate, repaired.as_str()] {
            match serde_json::from_str::<FileSet>(text) {
                Ok(set) => return set.validate(),
                Err(e) => last_error = e.to_string(),
            }
        }
    }
    Err(malformed(last_error))
}

fn candidates(cleaned: &str) -> Vec<&str> {
    let mut out = vec![cleaned];
    if let Some(block) = fenced_block(cleaned, Some("json")) {
        out.push(block);
    }
    if let Some(block) = fenced_block(cleaned, None) {
        if block.starts_with('{') {
            out.push(block);
        }
    }
    if let Some(obj) = last_balanced_object(cleaned) {
        out.push(obj);
    }
    out
}

/// Remove every `<think>` and `<thinking>` block. An unclosed block runs to
/// the end of the text.
pub fn strip_think_tags(text: &str) -> String {
    let mut result = text.to_string();
    for (open, close) in [("<think>", "</think>"), ("<thinking>", "</thinking>")] {
        while let Some(start) = result.find(open) {
            match result[start..].find(close) {
                Some(offset) => {
                    let end = start + offset + close.len();
                    result.replace_range(start..end, "");
                }
                None => {
                    result.truncate(start);
                    break;
                }
            }
        }
    }
    result
}

/// Contents of the first fenced block, optionally requiring a language tag.
fn fenced_block<'a>(text: &'a str, lang: Option<&str>) -> Option<&'a str> {
    let mut from = 0;
    while let Some(offset) = text[from..].find("```") {
        let after = from + offset + 3;
        let line_end = after + text[after..].find('\n')?;
        let tag = text[after..line_end].trim();
        let body_start = line_end + 1;
        let close = body_start + text[body_start..].find("```")?;
        if lang.map_or(true, |l| tag.eq_ignore_ascii_case(l)) {
            return Some(text[body_start..close].trim());
        }
        from = close + 3;
    }
    None
}

/// The last top-level `{...}` region, string- and escape-aware.
fn last_balanced_object(text: &str) -> Option<&str> {
    let mut best = None;
    let mut depth = 0usize;
    let mut start = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    best = Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    best
}

/// Drop commas that directly precede `}` or `]`, outside strings.
fn remove_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &ch) in chars.iter().enumerate() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            out.push(ch);
            continue;
        }
        if ch == '"' {
            in_string = true;
        } else if ch == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(ch);
    }
    out
}
