//! Validation of structured stage output.

use serde_json::Value;

use crate::domain::Stage;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("response is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("response must be a JSON object")]
    NotAnObject,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),
}

/// Top-level keys each stage's payload must carry.
pub fn required_fields(stage: Stage) -> &'static [&'static str] {
    match stage {
        Stage::Vision => &["summary"],
        Stage::Ocr => &["text"],
        Stage::Summary => &["summary"],
        Stage::Prematch => &["score"],
        Stage::Match => &["score", "summary"],
        Stage::Interview => &["questions"],
        Stage::Customize => &[],
    }
}

/// Parse a model's structured reply for `stage`.
///
/// Models often wrap JSON in a fenced code block; the fence is dropped
/// before parsing.
pub fn parse_structured(stage: Stage, raw: &str) -> Result<Value, SchemaError> {
    let value: Value =
        serde_json::from_str(strip_fence(raw)).map_err(|err| SchemaError::InvalidJson(err.to_string()))?;
    let object = value.as_object().ok_or(SchemaError::NotAnObject)?;
    for &field in required_fields(stage) {
        if object.get(field).is_none_or(Value::is_null) {
            return Err(SchemaError::MissingField(field));
        }
    }
    Ok(value)
}

fn strip_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (`json`) on the opening line.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}
