use serde::Serialize;

use crate::errors::PreflightError;

pub const DEFAULT_SIDE: u32 = 1024;
pub const DEFAULT_STEPS: u32 = 8;
pub const DEFAULT_GUIDANCE: f64 = 7.5;
/// Upper bound on images per request; each image is one upstream call.
pub const MAX_COUNT: u32 = 4;

/// A validated, immutable "generate N images from this prompt" request.
///
/// Construct through [`GenerationRequest::builder`]; all checks that do not
/// depend on a provider profile run in [`GenerationRequestBuilder::build`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    prompt: String,
    style: Option<String>,
    model: Option<String>,
    width: u32,
    height: u32,
    steps: u32,
    guidance: f64,
    seed: Option<i64>,
    count: u32,
    provider: String,
}

impl GenerationRequest {
    pub fn builder(
        prompt: impl Into<String>,
        provider: impl Into<String>,
    ) -> GenerationRequestBuilder {
        GenerationRequestBuilder::new(prompt, provider)
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn style(&self) -> Option<&str> {
        self.style.as_deref()
    }

    /// Hosted model chosen for this request; `None` keeps the profile default.
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Prompt as sent upstream, with the style modifier appended.
    pub fn full_prompt(&self) -> String {
        match self.style.as_deref() {
            Some(style) => format!("{}. Style: {}.", self.prompt, style),
            None => self.prompt.clone(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn guidance(&self) -> f64 {
        self.guidance
    }

    pub fn seed(&self) -> Option<i64> {
        self.seed
    }

    /// Slot `index` gets `seed + index` so a fixed seed stays reproducible
    /// without every slot returning the same image.
    pub fn seed_for_slot(&self, index: usize) -> Option<i64> {
        self.seed
            .map(|seed| seed.saturating_add(i64::try_from(index).unwrap_or(i64::MAX)))
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequestBuilder {
    prompt: String,
    style: Option<String>,
    model: Option<String>,
    width: u32,
    height: u32,
    steps: u32,
    guidance: f64,
    seed: Option<i64>,
    seed_text: Option<String>,
    count: u32,
    provider: String,
}

impl GenerationRequestBuilder {
    pub fn new(prompt: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            style: None,
            model: None,
            width: DEFAULT_SIDE,
            height: DEFAULT_SIDE,
            steps: DEFAULT_STEPS,
            guidance: DEFAULT_GUIDANCE,
            seed: None,
            seed_text: None,
            count: 1,
            provider: provider.into(),
        }
    }

    pub fn style(mut self, style: impl Into<String>) -> Self {
        let style = style.into();
        let trimmed = style.trim();
        self.style = (!trimmed.is_empty()).then(|| trimmed.to_string());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        let model = model.into();
        let trimmed = model.trim();
        self.model = (!trimmed.is_empty()).then(|| trimmed.to_string());
        self
    }

    pub fn dimensions(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    pub fn guidance(mut self, guidance: f64) -> Self {
        self.guidance = guidance;
        self
    }

    pub fn seed(mut self, seed: Option<i64>) -> Self {
        self.seed = seed;
        self.seed_text = None;
        self
    }

    /// Seed as typed by a user. Blank means random; anything else must parse
    /// as an integer or `build` fails.
    pub fn seed_text(mut self, raw: impl Into<String>) -> Self {
        self.seed_text = Some(raw.into());
        self
    }

    pub fn count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn build(self) -> Result<GenerationRequest, PreflightError> {
        let prompt = self.prompt.trim();
        if prompt.is_empty() {
            return Err(PreflightError::EmptyPrompt);
        }
        if self.count == 0 {
            return Err(PreflightError::ZeroCount);
        }
        if self.count > MAX_COUNT {
            return Err(PreflightError::TooManyImages {
                count: self.count,
                max: MAX_COUNT,
            });
        }
        if self.width == 0 || self.height == 0 {
            return Err(PreflightError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        let provider = self.provider.trim();
        if provider.is_empty() {
            return Err(PreflightError::UnknownProvider(self.provider.clone()));
        }
        let seed = match self.seed_text.as_deref() {
            Some(raw) => parse_seed(raw)?,
            None => self.seed,
        };

        Ok(GenerationRequest {
            prompt: prompt.to_string(),
            style: self.style,
            model: self.model,
            width: self.width,
            height: self.height,
            steps: self.steps,
            guidance: self.guidance,
            seed,
            count: self.count,
            provider: provider.to_ascii_lowercase(),
        })
    }
}

pub fn parse_seed(raw: &str) -> Result<Option<i64>, PreflightError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<i64>()
        .map(Some)
        .map_err(|_| PreflightError::InvalidSeed(trimmed.to_string()))
}
