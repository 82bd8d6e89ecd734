use std::sync::Arc;

use imagegate_contracts::errors::ClassifiedError;
use imagegate_contracts::profiles::{
    AuthScheme, BodyEncoding, LogicalParam, ProfileRegistry, ProviderProfile,
};
use imagegate_contracts::request::GenerationRequest;
use reqwest::header::AUTHORIZATION;
use serde_json::{json, Map, Value};

use crate::config::Credentials;

const ASPECT_RATIOS: [(&str, f64); 9] = [
    ("1:1", 1.0),
    ("16:9", 16.0 / 9.0),
    ("9:16", 9.0 / 16.0),
    ("21:9", 21.0 / 9.0),
    ("9:21", 9.0 / 21.0),
    ("3:2", 3.0 / 2.0),
    ("2:3", 2.0 / 3.0),
    ("4:5", 4.0 / 5.0),
    ("5:4", 5.0 / 4.0),
];

#[derive(Debug, Clone, PartialEq)]
pub enum CallBody {
    Json(Value),
    /// Text form fields in insertion order.
    Multipart(Vec<(String, String)>),
}

/// A fully resolved upstream call. Building one performs no I/O.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportCall {
    pub provider: String,
    pub slot: usize,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: CallBody,
}

impl TransportCall {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Diagnostics view with credentials masked.
    pub fn manifest(&self, auth_header: Option<&str>) -> Value {
        let headers: Map<String, Value> = self
            .headers
            .iter()
            .map(|(key, value)| {
                let masked = auth_header
                    .map(|auth| key.eq_ignore_ascii_case(auth))
                    .unwrap_or(false);
                let shown = if masked {
                    "***".to_string()
                } else {
                    value.clone()
                };
                (key.clone(), Value::String(shown))
            })
            .collect();
        let payload = match &self.body {
            CallBody::Json(value) => value.clone(),
            CallBody::Multipart(fields) => Value::Object(
                fields
                    .iter()
                    .map(|(key, value)| (key.clone(), Value::String(value.clone())))
                    .collect(),
            ),
        };
        json!({
            "endpoint": self.url,
            "headers": headers,
            "payload": payload,
        })
    }
}

/// Turns abstract requests into provider-specific calls. Shares the profile
/// registry and credentials read-only.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    registry: Arc<ProfileRegistry>,
    credentials: Arc<Credentials>,
}

impl RequestBuilder {
    pub fn new(registry: Arc<ProfileRegistry>, credentials: Arc<Credentials>) -> Self {
        Self {
            registry,
            credentials,
        }
    }

    pub fn registry(&self) -> &ProfileRegistry {
        &self.registry
    }

    pub fn profile(&self, provider: &str) -> Result<&ProviderProfile, ClassifiedError> {
        self.registry
            .get(provider)
            .ok_or_else(|| ClassifiedError::UnknownProvider(provider.to_string()))
    }

    pub fn build(
        &self,
        request: &GenerationRequest,
        slot: usize,
    ) -> Result<TransportCall, ClassifiedError> {
        let profile = self.profile(request.provider())?;
        let credential = self.credentials.get(&profile.id);
        if profile.requires_credential() && credential.is_none() {
            return Err(ClassifiedError::AuthError(format!(
                "no credential configured for provider '{}'",
                profile.id
            )));
        }
        Ok(build_call(request, profile, slot, credential))
    }
}

pub fn build_call(
    request: &GenerationRequest,
    profile: &ProviderProfile,
    slot: usize,
    credential: Option<&str>,
) -> TransportCall {
    let mut headers = Vec::new();
    if let Some(credential) = credential {
        match &profile.auth {
            AuthScheme::Bearer => {
                headers.push((AUTHORIZATION.to_string(), format!("Bearer {credential}")));
            }
            AuthScheme::Header { name } => {
                headers.push((name.clone(), credential.to_string()));
            }
            AuthScheme::None => {}
        }
    }
    for (key, value) in &profile.headers {
        headers.push((key.clone(), value.clone()));
    }

    let params = logical_values(request, profile, slot);
    let body = match profile.encoding {
        BodyEncoding::Json => {
            let mut payload = profile.static_fields.clone();
            for (field, value) in params {
                insert_path(&mut payload, field, value);
            }
            CallBody::Json(Value::Object(payload))
        }
        BodyEncoding::Multipart => {
            let mut fields: Vec<(String, String)> = profile
                .static_fields
                .iter()
                .map(|(key, value)| (key.clone(), json_value_to_form_text(value)))
                .collect();
            for (field, value) in params {
                let text = json_value_to_form_text(&value);
                match fields.iter_mut().find(|(key, _)| key == field) {
                    Some(existing) => existing.1 = text,
                    None => fields.push((field.to_string(), text)),
                }
            }
            CallBody::Multipart(fields)
        }
    };

    TransportCall {
        provider: profile.id.clone(),
        slot,
        url: profile.endpoint.clone(),
        headers,
        body,
    }
}

/// Values for every parameter the profile maps, paired with the provider's
/// field name. Parameters without a value (no seed) are skipped.
fn logical_values<'a>(
    request: &GenerationRequest,
    profile: &'a ProviderProfile,
    slot: usize,
) -> Vec<(&'a str, Value)> {
    let mut out = Vec::new();
    for (param, field) in &profile.params {
        let field = field.trim();
        if field.is_empty() {
            continue;
        }
        let value = match param {
            LogicalParam::Prompt => Some(Value::String(request.full_prompt())),
            LogicalParam::Width => Some(json!(request.width())),
            LogicalParam::Height => Some(json!(request.height())),
            LogicalParam::Size => Some(Value::String(format!(
                "{}x{}",
                request.width(),
                request.height()
            ))),
            LogicalParam::AspectRatio => Some(Value::String(
                aspect_ratio_from_dims(request.width(), request.height()).to_string(),
            )),
            LogicalParam::Steps => Some(json!(request.steps())),
            LogicalParam::Guidance => {
                serde_json::Number::from_f64(request.guidance()).map(Value::Number)
            }
            LogicalParam::Seed => request.seed_for_slot(slot).map(|seed| json!(seed)),
            LogicalParam::Model => request.model().map(|model| Value::String(model.to_string())),
            LogicalParam::Count => Some(json!(1)),
        };
        if let Some(value) = value {
            out.push((field, value));
        }
    }
    out
}

/// Inserts `value` at a dotted path, creating intermediate objects. A
/// non-object value in the way is replaced.
fn insert_path(root: &mut Map<String, Value>, path: &str, value: Value) {
    let mut segments = path.split('.').filter(|segment| !segment.is_empty());
    let Some(first) = segments.next() else {
        return;
    };
    let mut key = first.to_string();
    let mut current = root;
    for segment in segments {
        let entry = current
            .entry(key)
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        let Value::Object(next) = entry else {
            return;
        };
        current = next;
        key = segment.to_string();
    }
    current.insert(key, value);
}

pub fn aspect_ratio_from_dims(width: u32, height: u32) -> &'static str {
    if width == 0 || height == 0 {
        return "1:1";
    }
    let ratio = width as f64 / height as f64;
    let mut best = "1:1";
    let mut best_delta = f64::MAX;
    for (name, value) in ASPECT_RATIOS {
        let delta = (ratio - value).abs();
        if delta < best_delta {
            best_delta = delta;
            best = name;
        }
    }
    best
}

fn json_value_to_form_text(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(raw) => raw.to_string(),
        Value::Number(raw) => match raw.as_f64() {
            Some(number) if !raw.is_i64() && !raw.is_u64() => trim_float(number),
            _ => raw.to_string(),
        },
        Value::String(raw) => raw.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn trim_float(value: f64) -> String {
    let text = format!("{value:.6}");
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use imagegate_contracts::errors::ClassifiedError;
    use imagegate_contracts::profiles::ProfileRegistry;
    use imagegate_contracts::request::GenerationRequest;
    use serde_json::json;

    use super::{aspect_ratio_from_dims, build_call, CallBody, RequestBuilder};
    use crate::config::Credentials;

    fn request(provider: &str) -> GenerationRequest {
        GenerationRequest::builder("a sunlit loft", provider)
            .style("Industrial")
            .dimensions(768, 512)
            .steps(12)
            .guidance(6.5)
            .seed(Some(100))
            .count(3)
            .build()
            .unwrap()
    }

    fn builder_with(credentials: &[(&str, &str)]) -> RequestBuilder {
        let mut creds = Credentials::default();
        for (provider, value) in credentials {
            creds.insert(provider, *value);
        }
        RequestBuilder::new(Arc::new(ProfileRegistry::new(None).unwrap()), Arc::new(creds))
    }

    #[test]
    fn json_profile_maps_supported_params_and_omits_the_rest() {
        let builder = builder_with(&[("together", "tok-1")]);
        let call = builder.build(&request("together"), 2).unwrap();

        assert_eq!(call.url, "https://api.together.xyz/v1/images/generations");
        assert_eq!(call.header("authorization"), Some("Bearer tok-1"));
        let CallBody::Json(body) = call.body else {
            panic!("together uses JSON bodies");
        };
        assert_eq!(body["prompt"], json!("a sunlit loft. Style: Industrial."));
        assert_eq!(body["width"], json!(768));
        assert_eq!(body["height"], json!(512));
        assert_eq!(body["steps"], json!(12));
        assert_eq!(body["seed"], json!(102));
        assert_eq!(body["n"], json!(1));
        assert_eq!(body["model"], json!("stabilityai/sdxl-turbo"));
        assert_eq!(body["response_format"], json!("b64_json"));
        // together declares no guidance field
        assert!(body.get("guidance").is_none());
        assert!(body.get("guidance_scale").is_none());
    }

    #[test]
    fn request_model_replaces_the_profile_default() {
        let builder = builder_with(&[("together", "tok-1"), ("openai", "sk-1")]);
        let request = GenerationRequest::builder("a sunlit loft", "together")
            .model("stabilityai/stable-diffusion-xl-beta")
            .build()
            .unwrap();

        let CallBody::Json(body) = builder.build(&request, 0).unwrap().body else {
            panic!("together uses JSON bodies");
        };
        assert_eq!(body["model"], json!("stabilityai/stable-diffusion-xl-beta"));
        assert_eq!(body["response_format"], json!("b64_json"));

        let request = GenerationRequest::builder("a sunlit loft", "openai")
            .model("dall-e-3")
            .build()
            .unwrap();
        let CallBody::Json(body) = builder.build(&request, 0).unwrap().body else {
            panic!("openai uses JSON bodies");
        };
        assert_eq!(body["model"], json!("dall-e-3"));
    }

    #[test]
    fn dotted_fields_build_nested_objects() {
        let builder = builder_with(&[("huggingface", "hf-tok")]);
        let call = builder.build(&request("huggingface"), 0).unwrap();
        let CallBody::Json(body) = call.body else {
            panic!("huggingface uses JSON bodies");
        };
        assert_eq!(body["inputs"], json!("a sunlit loft. Style: Industrial."));
        assert_eq!(body["parameters"]["num_inference_steps"], json!(12));
        assert_eq!(body["parameters"]["guidance_scale"], json!(6.5));
        assert_eq!(body["parameters"]["seed"], json!(100));
        assert_eq!(body["parameters"]["width"], json!(768));
    }

    #[test]
    fn multipart_profile_emits_text_fields_and_static_headers() {
        let builder = builder_with(&[("stability", "sk-1")]);
        let call = builder.build(&request("stability"), 1).unwrap();
        assert_eq!(call.header("accept"), Some("image/*"));
        let CallBody::Multipart(fields) = call.body else {
            panic!("stability uses multipart bodies");
        };
        let field = |name: &str| {
            fields
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        };
        assert_eq!(field("output_format"), Some("png"));
        assert_eq!(field("aspect_ratio"), Some("3:2"));
        assert_eq!(field("seed"), Some("101"));
        assert_eq!(field("steps"), None);
    }

    #[test]
    fn custom_header_auth_uses_declared_header_name() {
        let builder = builder_with(&[("segmind", "seg-key")]);
        let call = builder.build(&request("segmind"), 0).unwrap();
        assert_eq!(call.header("x-api-key"), Some("seg-key"));
        assert_eq!(call.header("authorization"), None);
        let manifest = call.manifest(Some("x-api-key"));
        assert_eq!(manifest["headers"]["x-api-key"], json!("***"));
        assert_eq!(manifest["payload"]["img_width"], json!(768));
    }

    #[test]
    fn unseeded_requests_omit_the_seed_field() {
        let registry = ProfileRegistry::new(None).unwrap();
        let profile = registry.get("together").unwrap();
        let request = GenerationRequest::builder("den", "together").build().unwrap();
        let call = build_call(&request, profile, 0, Some("tok"));
        let CallBody::Json(body) = call.body else {
            panic!("together uses JSON bodies");
        };
        assert!(body.get("seed").is_none());
    }

    #[test]
    fn unknown_provider_fails_fast() {
        let builder = builder_with(&[]);
        let err = builder.build(&request("midjourney"), 0).unwrap_err();
        assert_eq!(err, ClassifiedError::UnknownProvider("midjourney".to_string()));
    }

    #[test]
    fn missing_credential_is_an_auth_error() {
        let builder = builder_with(&[]);
        let err = builder.build(&request("together"), 0).unwrap_err();
        assert!(matches!(err, ClassifiedError::AuthError(_)));
    }

    #[test]
    fn aspect_ratio_picks_nearest_candidate() {
        assert_eq!(aspect_ratio_from_dims(1024, 1024), "1:1");
        assert_eq!(aspect_ratio_from_dims(1920, 1080), "16:9");
        assert_eq!(aspect_ratio_from_dims(512, 768), "2:3");
        assert_eq!(aspect_ratio_from_dims(0, 10), "1:1");
    }
}
