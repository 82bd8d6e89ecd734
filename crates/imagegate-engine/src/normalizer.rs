use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use imagegate_contracts::errors::ClassifiedError;
use imagegate_contracts::profiles::{ErrorRule, ProviderProfile, ResponseMode};
use serde_json::{Map, Value};

use crate::transport::{truncate_text, RawProviderResponse};

const DIAGNOSTIC_BODY_CHARS: usize = 512;
const ELIDED_BASE64_PREVIEW: usize = 16;

/// Classifies a raw upstream response and extracts the image blobs it carries.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseNormalizer;

impl ResponseNormalizer {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(
        &self,
        raw: &RawProviderResponse,
        profile: &ProviderProfile,
    ) -> Result<Vec<Vec<u8>>, ClassifiedError> {
        let error_field = profile.error_rule.error_field();
        if raw.is_error_status() {
            let message = parse_json_body(raw)
                .and_then(|body| error_message(&body, error_field))
                .unwrap_or_else(|| {
                    let text = raw.body_text();
                    let text = text.trim();
                    if text.is_empty() {
                        format!("HTTP {}", raw.status)
                    } else {
                        truncate_text(text, DIAGNOSTIC_BODY_CHARS)
                    }
                });
            return Err(classify_status(raw, message));
        }

        let images = match &profile.response {
            ResponseMode::RawBinary => {
                if raw.is_json() {
                    return Err(match parse_json_body(raw)
                        .and_then(|body| error_message(&body, error_field))
                    {
                        Some(message) => ClassifiedError::UpstreamRejected(message),
                        None => malformed(raw, "expected image bytes, got a JSON body"),
                    });
                }
                if raw.body.is_empty() {
                    return Err(malformed(raw, "empty response body"));
                }
                vec![raw.body.clone()]
            }
            ResponseMode::JsonArray {
                array_field,
                aliases,
            } => {
                let body = require_json(raw)?;
                check_error_field(&body, &profile.error_rule)?;
                let items = body
                    .get(array_field)
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        malformed(raw, &format!("missing '{array_field}' array"))
                    })?;
                let mut images = Vec::with_capacity(items.len());
                for (idx, item) in items.iter().enumerate() {
                    let encoded = item
                        .as_object()
                        .and_then(|row| first_alias(row, aliases))
                        .ok_or_else(|| {
                            malformed(
                                raw,
                                &format!(
                                    "'{array_field}[{idx}]' has none of the fields {aliases:?}"
                                ),
                            )
                        })?;
                    images.push(decode_base64(raw, encoded)?);
                }
                images
            }
            ResponseMode::JsonSingle { aliases } => {
                let body = require_json(raw)?;
                check_error_field(&body, &profile.error_rule)?;
                let encoded = body
                    .as_object()
                    .and_then(|row| first_alias(row, aliases))
                    .ok_or_else(|| {
                        malformed(raw, &format!("response has none of the fields {aliases:?}"))
                    })?;
                vec![decode_base64(raw, encoded)?]
            }
        };

        if images.is_empty() {
            return Err(malformed(raw, "response contained no images"));
        }
        Ok(images)
    }

    /// Response JSON with base64 payloads shortened, for diagnostics. Raw
    /// binary bodies are summarized by size and content type.
    pub fn diagnostics(&self, raw: &RawProviderResponse) -> Value {
        let mut summary = Map::new();
        summary.insert("status".to_string(), Value::Number(raw.status.into()));
        summary.insert(
            "content_type".to_string(),
            raw.content_type
                .clone()
                .map(Value::String)
                .unwrap_or(Value::Null),
        );
        summary.insert("bytes".to_string(), Value::Number(raw.body.len().into()));
        if let Some(body) = parse_json_body(raw) {
            summary.insert("body".to_string(), elide_long_strings(body));
        } else if raw.is_error_status() {
            summary.insert(
                "body".to_string(),
                Value::String(truncate_text(&raw.body_text(), DIAGNOSTIC_BODY_CHARS)),
            );
        }
        Value::Object(summary)
    }
}

fn classify_status(raw: &RawProviderResponse, message: String) -> ClassifiedError {
    match raw.status {
        401 | 403 => ClassifiedError::AuthError(message),
        429 => ClassifiedError::RateLimited {
            message,
            retry_after: raw.retry_after,
        },
        408 | 504 => ClassifiedError::Timeout(format!("HTTP {}: {message}", raw.status)),
        _ => ClassifiedError::UpstreamRejected(message),
    }
}

fn check_error_field(body: &Value, rule: &ErrorRule) -> Result<(), ClassifiedError> {
    let ErrorRule::JsonField { field } = rule else {
        return Ok(());
    };
    match error_message(body, field) {
        Some(message) => Err(ClassifiedError::UpstreamRejected(message)),
        None => Ok(()),
    }
}

/// Text of an `error` field: a string, or an object's `message`. Null and
/// empty values do not count as errors.
fn error_message(body: &Value, field: &str) -> Option<String> {
    let value = body.get(field)?;
    let text = match value {
        Value::Null => return None,
        Value::String(text) => text.trim().to_string(),
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(|text| text.trim().to_string())
            .unwrap_or_else(|| value.to_string()),
        other => other.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

fn first_alias<'a>(row: &'a Map<String, Value>, aliases: &[String]) -> Option<&'a str> {
    aliases.iter().find_map(|alias| {
        row.get(alias)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    })
}

fn decode_base64(raw: &RawProviderResponse, encoded: &str) -> Result<Vec<u8>, ClassifiedError> {
    let payload = match encoded.split_once(";base64,") {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => encoded,
    };
    BASE64
        .decode(payload.as_bytes())
        .map_err(|err| malformed(raw, &format!("invalid base64 image payload: {err}")))
}

fn parse_json_body(raw: &RawProviderResponse) -> Option<Value> {
    serde_json::from_slice::<Value>(&raw.body).ok()
}

fn require_json(raw: &RawProviderResponse) -> Result<Value, ClassifiedError> {
    serde_json::from_slice::<Value>(&raw.body)
        .map_err(|err| malformed(raw, &format!("invalid JSON payload: {err}")))
}

fn malformed(raw: &RawProviderResponse, reason: &str) -> ClassifiedError {
    ClassifiedError::MalformedResponse(format!(
        "{reason} (status {}): {}",
        raw.status,
        truncate_text(&raw.body_text(), DIAGNOSTIC_BODY_CHARS)
    ))
}

fn elide_long_strings(value: Value) -> Value {
    match value {
        Value::String(text) if text.len() > 256 => {
            let preview: String = text.chars().take(ELIDED_BASE64_PREVIEW).collect();
            Value::String(format!("{preview}… ({} chars elided)", text.len()))
        }
        Value::Array(items) => Value::Array(items.into_iter().map(elide_long_strings).collect()),
        Value::Object(obj) => Value::Object(
            obj.into_iter()
                .map(|(key, value)| (key, elide_long_strings(value)))
                .collect(),
        ),
        other => other,
    }
}
