//! Pulls code and feedback out of free-form model output.
//!
//! Nothing here understands the content; extraction relies only on the
//! sentinel tags and on the feedback JSON the prompts ask for. Every
//! function is total: malformed output degrades to an empty value or a
//! diagnostic string.

use serde::Serialize;

pub const OPEN_TAG: &str = "<execute_python>";
pub const CLOSE_TAG: &str = "</execute_python>";

/// Where the feedback string came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackSource {
    /// The first line parsed as a JSON object.
    FirstLine,
    /// The first `{...}` span found anywhere in the response.
    EmbeddedSpan,
    /// Nothing parsed; the feedback is a diagnostic message.
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReflection {
    pub feedback: String,
    pub source: FeedbackSource,
    pub code: Option<String>,
}

/// Return the trimmed body of the first sentinel-delimited block.
pub fn extract_code(text: &str) -> Option<String> {
    let start = text.find(OPEN_TAG)? + OPEN_TAG.len();
    let end = text[start..].find(CLOSE_TAG)? + start;
    Some(text[start..end].trim().to_string())
}

/// Extract the feedback record and the refined code independently.
pub fn extract_feedback_and_code(text: &str) -> ParsedReflection {
    let (feedback, source) = extract_feedback(text);
    ParsedReflection {
        feedback,
        source,
        code: extract_code(text),
    }
}

/// Wrap a code body in sentinel tags unless it is already wrapped.
pub fn ensure_wrapped(code_body: &str) -> String {
    let trimmed = code_body.trim();
    if trimmed.starts_with(OPEN_TAG) && trimmed.ends_with(CLOSE_TAG) {
        return trimmed.to_string();
    }
    format!("{OPEN_TAG}\n{trimmed}\n{CLOSE_TAG}")
}

fn extract_feedback(text: &str) -> (String, FeedbackSource) {
    let trimmed = text.trim();
    let first_line = trimmed.lines().next().unwrap_or("").trim();

    let first_err = match parse_record(first_line) {
        Ok(feedback) => return (feedback, FeedbackSource::FirstLine),
        Err(e) => e,
    };

    match first_brace_span(text) {
        Some(span) => match parse_record(span) {
            Ok(feedback) => (feedback, FeedbackSource::EmbeddedSpan),
            Err(e) => (format!("Failed to parse JSON: {e}"), FeedbackSource::Placeholder),
        },
        None => (
            format!("Failed to find JSON: {first_err}"),
            FeedbackSource::Placeholder,
        ),
    }
}

/// Parse a JSON object and read its `feedback` key.
fn parse_record(candidate: &str) -> Result<String, String> {
    let value: serde_json::Value = serde_json::from_str(candidate).map_err(|e| e.to_string())?;
    let object = value
        .as_object()
        .ok_or_else(|| format!("expected a JSON object, found {value}"))?;

    let feedback = match object.get("feedback") {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    Ok(feedback.trim().to_string())
}

/// First `{` through the first `}` after it, possibly spanning lines.
fn first_brace_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let len = text[start..].find('}')?;
    Some(&text[start..=start + len])
}
