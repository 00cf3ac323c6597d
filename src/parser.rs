//! Defensive parsing of free-form model output into skill records.
//!
//! Models are asked for a bare JSON array but routinely wrap it in code
//! fences or prose. [`parse_skills`] recovers the first well-formed JSON
//! value and normalizes it; out-of-range numbers are clamped, never rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One extracted skill. Bounds hold for every value produced by this module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillRecord {
    pub skill: String,
    /// Proficiency in `0..=100`.
    pub level: u8,
    pub evidence: Vec<String>,
    /// Model confidence in `0.0..=1.0`.
    pub confidence: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unparseable model response: {preview}")]
    Unparseable { preview: String },
}

impl ParseError {
    pub fn code(&self) -> &'static str {
        "unparseable_response"
    }

    fn unparseable(raw: &str) -> Self {
        ParseError::Unparseable {
            preview: raw.chars().take(120).collect(),
        }
    }
}

/// Parse raw model output into skill records.
///
/// A JSON value that is not an array yields an empty list. Fails only when no
/// JSON value can be recovered at all.
pub fn parse_skills(raw: &str) -> Result<Vec<SkillRecord>, ParseError> {
    let value = extract_json_value(raw).ok_or_else(|| ParseError::unparseable(raw))?;
    Ok(normalize(&value))
}

/// Map an already-parsed JSON value into skill records.
pub fn normalize(value: &Value) -> Vec<SkillRecord> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_object)
            .map(|item| SkillRecord {
                skill: item
                    .get("skill")
                    .or_else(|| item.get("name"))
                    .map(coerce_string)
                    .unwrap_or_default()
                    .trim()
                    .to_string(),
                level: clamp_level(item.get("level").or_else(|| item.get("proficiency"))),
                evidence: coerce_evidence(item.get("evidence")),
                confidence: clamp_confidence(item.get("confidence")),
            })
            .collect(),
        _ => Vec::new(),
    }
}

// =============================================================================
// Extraction
// =============================================================================

/// Balanced candidates tried before giving up on a response.
const MAX_CANDIDATES: usize = 64;

/// Recover the first JSON value embedded in `raw`.
pub(crate) fn extract_json_value(raw: &str) -> Option<Value> {
    let cleaned = strip_code_fences(raw);

    if let Ok(value) = serde_json::from_str::<Value>(cleaned) {
        return Some(value);
    }

    let (arrays, objects) = balanced_spans(cleaned);
    // Arrays take precedence over objects, as the prompt asks for an array.
    arrays
        .into_iter()
        .chain(objects)
        .take(MAX_CANDIDATES)
        .find_map(|(start, end)| serde_json::from_str::<Value>(&cleaned[start..end]).ok())
}

fn strip_code_fences(raw: &str) -> &str {
    let mut s = raw.trim();
    if let Some(rest) = s.strip_prefix("```") {
        // Drop an optional language tag on the fence line.
        s = match rest.find('\n') {
            Some(nl) if rest[..nl].trim().chars().all(|c| c.is_ascii_alphanumeric()) => {
                &rest[nl + 1..]
            }
            _ => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
        };
    }
    if let Some(rest) = s.trim_end().strip_suffix("```") {
        s = rest;
    }
    s.trim()
}

/// Byte ranges of balanced `[...]` and `{...}` spans, each list ordered by
/// opening position. Brackets inside JSON strings are ignored. Single pass.
fn balanced_spans(s: &str) -> (Vec<(usize, usize)>, Vec<(usize, usize)>) {
    let mut arrays = Vec::new();
    let mut objects = Vec::new();
    let mut open_arrays = Vec::new();
    let mut open_objects = Vec::new();
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in s.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match c {
            '\\' if in_string => escape = true,
            '"' => in_string = !in_string,
            _ if in_string => {}
            '[' => open_arrays.push(i),
            '{' => open_objects.push(i),
            ']' => {
                if let Some(start) = open_arrays.pop() {
                    arrays.push((start, i + 1));
                }
            }
            '}' => {
                if let Some(start) = open_objects.pop() {
                    objects.push((start, i + 1));
                }
            }
            _ => {}
        }
    }

    arrays.sort_unstable();
    objects.sort_unstable();
    (arrays, objects)
}

// =============================================================================
// Coercion
// =============================================================================

fn coerce_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn as_number(value: Option<&Value>) -> f64 {
    let n = match value {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        Some(Value::Bool(true)) => 1.0,
        _ => 0.0,
    };
    if n.is_finite() {
        n
    } else {
        0.0
    }
}

fn clamp_level(value: Option<&Value>) -> u8 {
    as_number(value).clamp(0.0, 100.0).round() as u8
}

fn clamp_confidence(value: Option<&Value>) -> f64 {
    as_number(value).clamp(0.0, 1.0)
}

fn coerce_evidence(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().map(coerce_string).collect(),
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        Some(Value::Null) | None => Vec::new(),
        Some(Value::String(_)) => Vec::new(),
        Some(other) => vec![other.to_string()],
    }
}
