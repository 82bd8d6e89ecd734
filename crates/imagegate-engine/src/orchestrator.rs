use std::sync::Arc;
use std::time::{Duration, Instant};

use imagegate_contracts::errors::{ClassifiedError, PreflightError};
use imagegate_contracts::events::{EventWriter, GenerationEvent};
use imagegate_contracts::profiles::{AuthScheme, ProfileRegistry, ProviderProfile};
use imagegate_contracts::request::GenerationRequest;
use imagegate_contracts::summary::GenerationSummary;
use reqwest::header::AUTHORIZATION;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::builder::RequestBuilder;
use crate::codec::{DecodedImage, ImageCodec};
use crate::config::{Credentials, GatewayConfig};
use crate::normalizer::ResponseNormalizer;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::transport::Transport;

pub type SlotOutcome = Result<DecodedImage, ClassifiedError>;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SlotDiagnostics {
    pub index: usize,
    pub attempts: u32,
    pub status_codes: Vec<u16>,
    /// Upstream call with credentials masked.
    pub request: Option<Value>,
    /// Last response seen, base64 payloads elided.
    pub response: Option<Value>,
    /// Images returned beyond the one kept for this slot.
    pub extra_images: usize,
    pub elapsed: Duration,
}

impl SlotDiagnostics {
    fn new(index: usize) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }
}

/// Ordered outcome of one `generate` call: exactly one slot per requested
/// image, each an image or a classified error.
#[derive(Debug)]
pub struct GenerationResult {
    generation_id: String,
    provider: String,
    slots: Vec<SlotOutcome>,
    diagnostics: Vec<SlotDiagnostics>,
}

impl GenerationResult {
    pub fn generation_id(&self) -> &str {
        &self.generation_id
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn slots(&self) -> &[SlotOutcome] {
        &self.slots
    }

    pub fn diagnostics(&self) -> &[SlotDiagnostics] {
        &self.diagnostics
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_ok()).count()
    }

    pub fn images(&self) -> impl Iterator<Item = (usize, &DecodedImage)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().ok().map(|image| (idx, image)))
    }

    pub fn errors(&self) -> impl Iterator<Item = (usize, &ClassifiedError)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().err().map(|err| (idx, err)))
    }

    pub fn into_slots(self) -> Vec<SlotOutcome> {
        self.slots
    }

    pub fn to_summary(&self, started_at: String, finished_at: String) -> GenerationSummary {
        let slots = self
            .slots
            .iter()
            .zip(&self.diagnostics)
            .enumerate()
            .map(|(idx, (slot, diag))| slot_record(idx, slot, diag))
            .collect();
        GenerationSummary {
            generation_id: self.generation_id.clone(),
            provider: self.provider.clone(),
            started_at,
            finished_at,
            requested: self.slots.len() as u64,
            succeeded: self.succeeded() as u64,
            slots,
        }
    }
}

fn slot_record(index: usize, slot: &SlotOutcome, diag: &SlotDiagnostics) -> Map<String, Value> {
    let mut row = Map::new();
    row.insert("index".to_string(), json!(index));
    row.insert("attempts".to_string(), json!(diag.attempts));
    row.insert("status_codes".to_string(), json!(diag.status_codes));
    row.insert(
        "elapsed_ms".to_string(),
        json!(diag.elapsed.as_millis() as u64),
    );
    match slot {
        Ok(image) => {
            row.insert("status".to_string(), json!("ok"));
            row.insert("width".to_string(), json!(image.width()));
            row.insert("height".to_string(), json!(image.height()));
            row.insert(
                "source_format".to_string(),
                json!(image.source_format().as_str()),
            );
        }
        Err(err) => {
            row.insert("status".to_string(), json!("error"));
            row.insert("error_kind".to_string(), json!(err.kind()));
            row.insert("error".to_string(), json!(err.message()));
        }
    }
    if let Some(response) = &diag.response {
        row.insert("response".to_string(), response.clone());
    }
    row
}

/// Fans a request out into per-slot pipelines with bounded concurrency.
#[derive(Clone)]
pub struct Orchestrator {
    builder: RequestBuilder,
    transport: Arc<dyn Transport>,
    normalizer: ResponseNormalizer,
    retry: RetryPolicy,
    concurrency: usize,
    timeout: Duration,
    events: Option<EventWriter>,
}

impl Orchestrator {
    pub fn new(
        registry: ProfileRegistry,
        credentials: Credentials,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let defaults = GatewayConfig::default();
        Self {
            builder: RequestBuilder::new(Arc::new(registry), Arc::new(credentials)),
            transport,
            normalizer: ResponseNormalizer::new(),
            retry: defaults.retry,
            concurrency: defaults.concurrency,
            timeout: defaults.timeout,
            events: None,
        }
    }

    pub fn from_config(
        config: &GatewayConfig,
        registry: ProfileRegistry,
        credentials: Credentials,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self::new(registry, credentials, transport)
            .with_retry_policy(config.retry.clone())
            .with_concurrency(config.concurrency)
            .with_timeout(config.timeout)
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn registry(&self) -> &ProfileRegistry {
        self.builder.registry()
    }

    pub async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, PreflightError> {
        self.generate_with_cancel(request, CancellationToken::new())
            .await
    }

    /// Runs every slot of `request`. Cancelling `cancel` stops new network
    /// calls; calls already in flight finish (or time out) and keep their
    /// result, every other slot is reported as `Cancelled`.
    pub async fn generate_with_cancel(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<GenerationResult, PreflightError> {
        let profile = self
            .builder
            .registry()
            .get(request.provider())
            .ok_or_else(|| PreflightError::UnknownProvider(request.provider().to_string()))?;
        profile.check_dimensions(request.width(), request.height())?;

        let generation_id = uuid::Uuid::new_v4().to_string();
        let count = request.count() as usize;
        let limit = self.concurrency.clamp(1, count.max(1));
        let started = Instant::now();
        info!(
            generation_id = %generation_id,
            provider = %profile.id,
            count,
            limit,
            "generation started"
        );
        record_event(
            self.events.as_ref(),
            &generation_id,
            GenerationEvent::Started {
                provider: profile.id.clone(),
                count,
                concurrency: limit,
                request: json!(request),
            },
        );

        let ctx = Arc::new(SlotContext {
            generation_id: generation_id.clone(),
            builder: self.builder.clone(),
            transport: self.transport.clone(),
            normalizer: self.normalizer,
            retry: self.retry.clone(),
            timeout: self.timeout,
            events: self.events.clone(),
        });
        let request = Arc::new(request.clone());
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut tasks = JoinSet::new();
        for index in 0..count {
            let ctx = ctx.clone();
            let request = request.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let outcome = match permit {
                    Some(_permit) => ctx.run_slot(&request, index, &cancel).await,
                    None => (
                        Err(ClassifiedError::Cancelled(
                            "generation cancelled before the slot started".to_string(),
                        )),
                        SlotDiagnostics::new(index),
                    ),
                };
                ctx.record_slot_finished(&outcome);
                (index, outcome)
            });
        }

        let mut finished: Vec<Option<(SlotOutcome, SlotDiagnostics)>> =
            (0..count).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => finished[index] = Some(outcome),
                Err(err) => warn!(generation_id = %generation_id, "slot worker failed: {err}"),
            }
        }

        let mut slots = Vec::with_capacity(count);
        let mut diagnostics = Vec::with_capacity(count);
        for (index, entry) in finished.into_iter().enumerate() {
            let (slot, diag) = entry.unwrap_or_else(|| {
                (
                    Err(ClassifiedError::Cancelled(
                        "slot worker stopped before reporting".to_string(),
                    )),
                    SlotDiagnostics::new(index),
                )
            });
            slots.push(slot);
            diagnostics.push(diag);
        }

        let result = GenerationResult {
            generation_id,
            provider: profile.id.clone(),
            slots,
            diagnostics,
        };
        info!(
            generation_id = %result.generation_id,
            succeeded = result.succeeded(),
            requested = result.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "generation finished"
        );
        record_event(
            self.events.as_ref(),
            &result.generation_id,
            GenerationEvent::Finished {
                provider: result.provider.clone(),
                requested: result.len(),
                succeeded: result.succeeded(),
                cancelled: cancel.is_cancelled(),
                elapsed: started.elapsed(),
            },
        );
        Ok(result)
    }
}

/// Everything one slot pipeline needs, shared read-only across slot tasks.
struct SlotContext {
    generation_id: String,
    builder: RequestBuilder,
    transport: Arc<dyn Transport>,
    normalizer: ResponseNormalizer,
    retry: RetryPolicy,
    timeout: Duration,
    events: Option<EventWriter>,
}

impl SlotContext {
    async fn run_slot(
        &self,
        request: &GenerationRequest,
        index: usize,
        cancel: &CancellationToken,
    ) -> (SlotOutcome, SlotDiagnostics) {
        let started = Instant::now();
        let mut diag = SlotDiagnostics::new(index);
        let outcome = self
            .run_pipeline(request, index, cancel, &mut diag)
            .await;
        diag.elapsed = started.elapsed();
        (outcome, diag)
    }

    async fn run_pipeline(
        &self,
        request: &GenerationRequest,
        index: usize,
        cancel: &CancellationToken,
        diag: &mut SlotDiagnostics,
    ) -> SlotOutcome {
        let profile = self.builder.profile(request.provider())?;
        let call = self.builder.build(request, index)?;
        diag.request = Some(call.manifest(auth_header_name(profile).as_deref()));

        let mut attempt = 0u32;
        let blobs = loop {
            if cancel.is_cancelled() {
                break Err(ClassifiedError::Cancelled(format!(
                    "generation cancelled before attempt {}",
                    attempt + 1
                )));
            }
            attempt += 1;
            diag.attempts = attempt;
            debug!(generation_id = %self.generation_id, slot = index, attempt, "sending");
            self.record(GenerationEvent::SlotAttempt {
                slot: index,
                attempt,
                endpoint: call.url.clone(),
            });

            let step = match self.transport.send(&call, self.timeout).await {
                Ok(raw) => {
                    diag.status_codes.push(raw.status);
                    diag.response = Some(self.normalizer.diagnostics(&raw));
                    self.normalizer.parse(&raw, profile)
                }
                Err(err) => Err(err),
            };
            let err = match step {
                Ok(blobs) => break Ok(blobs),
                Err(err) => err,
            };
            match self.retry.should_retry(&err, attempt) {
                RetryDecision::GiveUp => break Err(err),
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        generation_id = %self.generation_id,
                        slot = index,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after {}: {}",
                        err.kind(),
                        err.message()
                    );
                    self.record(GenerationEvent::RetryScheduled {
                        slot: index,
                        attempt,
                        error: err.clone(),
                        delay,
                    });
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            break Err(ClassifiedError::Cancelled(format!(
                                "generation cancelled while waiting to retry after {err}"
                            )));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }?;

        diag.extra_images = blobs.len().saturating_sub(1);
        let first = blobs.into_iter().next().ok_or_else(|| {
            ClassifiedError::MalformedResponse("response contained no images".to_string())
        })?;
        ImageCodec::decode(&first)
    }

    fn record_slot_finished(&self, (outcome, diag): &(SlotOutcome, SlotDiagnostics)) {
        self.record(GenerationEvent::SlotFinished {
            slot: diag.index,
            attempts: diag.attempts,
            status_codes: diag.status_codes.clone(),
            elapsed: diag.elapsed,
            outcome: outcome
                .as_ref()
                .map(|image| (image.width(), image.height()))
                .map_err(|err| err.clone()),
        });
    }

    fn record(&self, event: GenerationEvent) {
        record_event(self.events.as_ref(), &self.generation_id, event);
    }
}

/// Event log failures never fail a slot; they are reported through tracing.
fn record_event(events: Option<&EventWriter>, generation_id: &str, event: GenerationEvent) {
    let Some(events) = events else {
        return;
    };
    if let Err(err) = events.record(generation_id, &event) {
        warn!(generation_id, "failed to record {} event: {err:#}", event.event_type());
    }
}

fn auth_header_name(profile: &ProviderProfile) -> Option<String> {
    match &profile.auth {
        AuthScheme::Bearer => Some(AUTHORIZATION.to_string()),
        AuthScheme::Header { name } => Some(name.clone()),
        AuthScheme::None => None,
    }
}
