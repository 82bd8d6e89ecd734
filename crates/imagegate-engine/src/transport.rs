use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{Rgba, RgbaImage};
use imagegate_contracts::errors::ClassifiedError;
use imagegate_contracts::profiles::{ProfileRegistry, ResponseMode};
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::multipart::Form as MultipartForm;
use reqwest::Client as HttpClient;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::builder::{CallBody, TransportCall};
use crate::codec::{DecodedImage, ImageCodec, OutputFormat, SourceFormat};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawProviderResponse {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub retry_after: Option<Duration>,
}

impl RawProviderResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>, content_type: Option<&str>) -> Self {
        Self {
            status,
            body: body.into(),
            content_type: content_type.map(str::to_string),
            retry_after: None,
        }
    }

    pub fn is_error_status(&self) -> bool {
        self.status >= 400
    }

    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|value| value.to_ascii_lowercase().contains("json"))
            .unwrap_or(false)
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// One network round trip with a deadline. Implementations never retry.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        call: &TransportCall,
        timeout: Duration,
    ) -> Result<RawProviderResponse, ClassifiedError>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    http: HttpClient,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(http: HttpClient) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        call: &TransportCall,
        timeout: Duration,
    ) -> Result<RawProviderResponse, ClassifiedError> {
        let mut request = match &call.body {
            CallBody::Json(payload) => self.http.post(&call.url).json(payload),
            CallBody::Multipart(fields) => {
                let mut form = MultipartForm::new();
                for (key, value) in fields {
                    form = form.text(key.clone(), value.clone());
                }
                self.http.post(&call.url).multipart(form)
            }
        };
        for (key, value) in &call.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let provider = call.provider.as_str();
        let exchange = async {
            let response = request
                .send()
                .await
                .map_err(|err| classify_reqwest_error(provider, &err))?;
            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.to_ascii_lowercase());
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_retry_after);
            let body = response
                .bytes()
                .await
                .map_err(|err| classify_reqwest_error(provider, &err))?
                .to_vec();
            Ok(RawProviderResponse {
                status,
                body,
                content_type,
                retry_after,
            })
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ClassifiedError::Timeout(format!(
                "{provider} did not respond within {:.1}s ({})",
                timeout.as_secs_f64(),
                call.url
            ))),
        }
    }
}

fn classify_reqwest_error(provider: &str, err: &reqwest::Error) -> ClassifiedError {
    let text = format!("{provider}: {}", error_chain_text(err, 512));
    if err.is_timeout() {
        return ClassifiedError::Timeout(text);
    }
    if err.is_builder() {
        return ClassifiedError::UpstreamRejected(format!("request could not be built: {text}"));
    }
    ClassifiedError::Transport(text)
}

fn parse_retry_after(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

pub(crate) fn error_chain_text(err: &(dyn std::error::Error + 'static), max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(cause) = current {
        let text = cause.to_string();
        let trimmed = text.trim();
        if !trimmed.is_empty()
            && !parts
                .last()
                .map(|existing| existing == trimmed)
                .unwrap_or(false)
        {
            parts.push(trimmed.to_string());
        }
        current = cause.source();
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

/// Offline transport that answers every call with a solid-color PNG, shaped
/// the way the target profile's response mode expects. The color is derived
/// from the call payload, so identical calls produce identical images.
#[derive(Debug, Clone)]
pub struct DryrunTransport {
    registry: Arc<ProfileRegistry>,
    width: u32,
    height: u32,
}

impl DryrunTransport {
    pub fn new(registry: Arc<ProfileRegistry>, width: u32, height: u32) -> Self {
        Self {
            registry,
            width: width.clamp(1, 4096),
            height: height.clamp(1, 4096),
        }
    }

    fn render(&self, call: &TransportCall) -> Result<Vec<u8>, ClassifiedError> {
        let (r, g, b) = color_from_payload(&call.manifest(None)["payload"]);
        let mut raster = RgbaImage::new(self.width, self.height);
        for pixel in raster.pixels_mut() {
            *pixel = Rgba([r, g, b, 255]);
        }
        ImageCodec::encode(
            &DecodedImage::new(raster, SourceFormat::Png),
            OutputFormat::Png,
        )
        .map_err(|err| ClassifiedError::Transport(format!("dryrun render failed: {err}")))
    }
}

#[async_trait]
impl Transport for DryrunTransport {
    async fn send(
        &self,
        call: &TransportCall,
        _timeout: Duration,
    ) -> Result<RawProviderResponse, ClassifiedError> {
        let profile = self
            .registry
            .get(&call.provider)
            .ok_or_else(|| ClassifiedError::UnknownProvider(call.provider.clone()))?;
        let png = self.render(call)?;
        let first_alias = |aliases: &[String]| {
            aliases
                .first()
                .cloned()
                .unwrap_or_else(|| "b64_json".to_string())
        };
        let response = match &profile.response {
            ResponseMode::RawBinary => RawProviderResponse::new(200, png, Some("image/png")),
            ResponseMode::JsonSingle { aliases } => {
                let mut payload = serde_json::Map::new();
                payload.insert(first_alias(aliases), Value::String(BASE64.encode(&png)));
                RawProviderResponse::new(
                    200,
                    Value::Object(payload).to_string(),
                    Some("application/json"),
                )
            }
            ResponseMode::JsonArray {
                array_field,
                aliases,
            } => {
                let mut item = serde_json::Map::new();
                item.insert(first_alias(aliases), Value::String(BASE64.encode(&png)));
                let mut payload = serde_json::Map::new();
                payload.insert(array_field.clone(), json!([Value::Object(item)]));
                RawProviderResponse::new(
                    200,
                    Value::Object(payload).to_string(),
                    Some("application/json"),
                )
            }
        };
        Ok(response)
    }
}

fn color_from_payload(payload: &Value) -> (u8, u8, u8) {
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}
