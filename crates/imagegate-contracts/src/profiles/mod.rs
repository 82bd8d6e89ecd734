mod registry;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::PreflightError;

pub use registry::{ProfileError, ProfileRegistry};

/// Base64 field aliases accepted in JSON payloads, in lookup priority order.
pub const DEFAULT_BASE64_ALIASES: [&str; 3] = ["b64_json", "b64", "b64_image"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthScheme {
    /// `Authorization: Bearer <credential>`
    Bearer,
    /// `<name>: <credential>`
    Header { name: String },
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyEncoding {
    Json,
    Multipart,
}

/// Provider-independent request parameters a profile may map onto its own
/// field names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalParam {
    Prompt,
    Width,
    Height,
    /// `"{width}x{height}"`
    Size,
    /// Nearest supported ratio such as `16:9`.
    AspectRatio,
    Steps,
    Guidance,
    Seed,
    /// Per-request model id; replaces a static `model` field when set.
    Model,
    /// Images per upstream call; always 1.
    Count,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ResponseMode {
    /// `{ "<array_field>": [ { "<alias>": "<base64>" }, ... ] }`
    JsonArray {
        array_field: String,
        #[serde(default = "default_aliases")]
        aliases: Vec<String>,
    },
    /// `{ "<alias>": "<base64>" }`
    JsonSingle {
        #[serde(default = "default_aliases")]
        aliases: Vec<String>,
    },
    /// The HTTP body is the image.
    RawBinary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorRule {
    /// Only 4xx/5xx statuses signal failure.
    StatusCode,
    /// Statuses, plus a named JSON field on otherwise successful bodies.
    JsonField {
        #[serde(default = "default_error_field")]
        field: String,
    },
}

impl ErrorRule {
    pub fn error_field(&self) -> &str {
        match self {
            Self::StatusCode => "error",
            Self::JsonField { field } => field,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderProfile {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub endpoint: String,
    pub auth: AuthScheme,
    /// Environment variable holding the credential.
    #[serde(default)]
    pub credential_env: Option<String>,
    pub encoding: BodyEncoding,
    /// Logical parameter to provider field name. JSON profiles may use dotted
    /// paths for nested objects.
    pub params: IndexMap<LogicalParam, String>,
    #[serde(default)]
    pub static_fields: Map<String, Value>,
    #[serde(default)]
    pub headers: IndexMap<String, String>,
    pub response: ResponseMode,
    pub error_rule: ErrorRule,
    /// Accepted side lengths; empty accepts any positive size.
    #[serde(default)]
    pub allowed_dimensions: Vec<u32>,
}

impl ProviderProfile {
    pub fn field_for(&self, param: LogicalParam) -> Option<&str> {
        self.params
            .get(&param)
            .map(String::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn supports(&self, param: LogicalParam) -> bool {
        self.field_for(param).is_some()
    }

    pub fn requires_credential(&self) -> bool {
        !matches!(self.auth, AuthScheme::None)
    }

    pub fn check_dimensions(&self, width: u32, height: u32) -> Result<(), PreflightError> {
        if self.allowed_dimensions.is_empty() {
            return Ok(());
        }
        let allowed = |side: u32| self.allowed_dimensions.contains(&side);
        if allowed(width) && allowed(height) {
            return Ok(());
        }
        Err(PreflightError::UnsupportedDimensions {
            provider: self.id.clone(),
            width,
            height,
            allowed: self.allowed_dimensions.clone(),
        })
    }

    pub fn display_name(&self) -> &str {
        if self.label.trim().is_empty() {
            &self.id
        } else {
            &self.label
        }
    }
}

fn default_aliases() -> Vec<String> {
    DEFAULT_BASE64_ALIASES
        .iter()
        .map(|alias| (*alias).to_string())
        .collect()
}

fn default_error_field() -> String {
    "error".to_string()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{AuthScheme, ErrorRule, LogicalParam, ProviderProfile, ResponseMode};
    use crate::errors::PreflightError;

    fn profile_from(value: serde_json::Value) -> ProviderProfile {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn profile_deserializes_with_alias_and_error_defaults() {
        let profile = profile_from(json!({
            "id": "demo",
            "endpoint": "https://example.test/v1/images",
            "auth": {"type": "header", "name": "x-api-key"},
            "encoding": "json",
            "params": {"prompt": "prompt", "steps": "parameters.steps", "seed": ""},
            "response": {"mode": "json_array", "array_field": "data"},
            "error_rule": {"type": "json_field"},
        }));
        assert_eq!(
            profile.auth,
            AuthScheme::Header {
                name: "x-api-key".to_string()
            }
        );
        assert_eq!(
            profile.response,
            ResponseMode::JsonArray {
                array_field: "data".to_string(),
                aliases: vec!["b64_json".into(), "b64".into(), "b64_image".into()],
            }
        );
        assert_eq!(profile.error_rule.error_field(), "error");
        assert_eq!(
            profile.field_for(LogicalParam::Steps),
            Some("parameters.steps")
        );
        assert!(!profile.supports(LogicalParam::Seed));
        assert!(!profile.supports(LogicalParam::Guidance));
        assert_eq!(profile.display_name(), "demo");
    }

    #[test]
    fn dimension_check_respects_allowed_set() {
        let mut profile = profile_from(json!({
            "id": "demo",
            "endpoint": "https://example.test",
            "auth": {"type": "none"},
            "encoding": "multipart",
            "params": {},
            "response": {"mode": "raw_binary"},
            "error_rule": {"type": "status_code"},
        }));
        assert!(profile.check_dimensions(333, 777).is_ok());
        assert!(!profile.requires_credential());
        assert_eq!(profile.error_rule, ErrorRule::StatusCode);

        profile.allowed_dimensions = vec![512, 1024];
        assert!(profile.check_dimensions(512, 1024).is_ok());
        let err = profile.check_dimensions(512, 768).unwrap_err();
        assert!(matches!(
            err,
            PreflightError::UnsupportedDimensions { height: 768, .. }
        ));
    }
}
