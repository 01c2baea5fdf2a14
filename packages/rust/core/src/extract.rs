//! Defensive JSON extraction from language-model output.
//!
//! Model replies often wrap the payload in a markdown code fence, or add a
//! sentence before and after it. Candidates are tried in this order:
//! fenced blocks, the whole reply, then each balanced `{...}` / `[...]`
//! span. The first candidate that parses (into the requested type, for
//! [`parse_model_json`]) wins.

use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;

use storyforge_shared::{Result, StoryforgeError};

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").expect("valid regex")
});

/// Upper bound on bracket positions tried before giving up.
const MAX_SPAN_CANDIDATES: usize = 32;

/// Candidate JSON texts in the order they are tried.
fn candidates(text: &str) -> impl Iterator<Item = &str> {
    let fenced = FENCE_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|body| body.as_str().trim());
    let spans = text
        .char_indices()
        .filter(|(_, c)| *c == '{' || *c == '[')
        .map(|(i, _)| i)
        .take(MAX_SPAN_CANDIDATES)
        .filter_map(move |start| balanced_span(text, start));
    fenced.chain(std::iter::once(text.trim())).chain(spans)
}

/// Extract the first parsable JSON value from `text`.
pub fn extract_json(text: &str) -> Result<Value> {
    candidates(text)
        .find_map(|candidate| serde_json::from_str(candidate).ok())
        .ok_or_else(|| no_json(text))
}

/// Deserialize the first candidate in `text` that has the shape of `T`.
///
/// Valid JSON of another shape (a `[1]` citation in the prose, say) is
/// skipped rather than failing the whole reply.
pub fn parse_model_json<T: DeserializeOwned>(text: &str) -> Result<T> {
    let mut shape_error = None;
    for candidate in candidates(text) {
        let Ok(value) = serde_json::from_str::<Value>(candidate) else {
            continue;
        };
        match serde_json::from_value(value) {
            Ok(parsed) => return Ok(parsed),
            Err(e) => {
                shape_error.get_or_insert(e);
            }
        }
    }
    Err(match shape_error {
        Some(e) => StoryforgeError::malformed(format!("unexpected JSON shape: {e}")),
        None => no_json(text),
    })
}

fn no_json(text: &str) -> StoryforgeError {
    StoryforgeError::malformed(format!("no JSON found in model output: {}", preview(text)))
}

/// The bracketed span opening at byte `start`, honouring JSON strings.
fn balanced_span(text: &str, start: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(120).collect();
    if text.chars().count() > 120 {
        out.push('…');
    }
    out
}
