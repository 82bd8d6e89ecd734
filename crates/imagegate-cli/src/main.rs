use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use imagegate_contracts::request::{DEFAULT_GUIDANCE, DEFAULT_SIDE, DEFAULT_STEPS, MAX_COUNT};
use imagegate_contracts::summary::{now_utc_iso, write_summary};
use imagegate_engine::config::non_empty_env;
use imagegate_engine::{
    credential_env_key, Credentials, DecodedImage, DryrunTransport, EventWriter, GatewayConfig,
    GenerationRequest, GenerationResult, HttpTransport, ImageCodec, Orchestrator, OutputFormat,
    Transport,
};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "imagegate", version, about = "Text-to-image provider gateway")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Generate images from a prompt through one provider.
    Generate(GenerateArgs),
    /// List registered provider profiles.
    Providers,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    style: Option<String>,
    #[arg(long, default_value_t = DEFAULT_SIDE)]
    width: u32,
    #[arg(long, default_value_t = DEFAULT_SIDE)]
    height: u32,
    #[arg(long, default_value_t = DEFAULT_STEPS)]
    steps: u32,
    #[arg(long, default_value_t = DEFAULT_GUIDANCE)]
    guidance: f64,
    /// Integer seed; blank or omitted picks a random one upstream.
    #[arg(long)]
    seed: Option<String>,
    #[arg(
        long,
        default_value_t = 1,
        value_parser = clap::value_parser!(u32).range(1..=i64::from(MAX_COUNT))
    )]
    count: u32,
    /// Hosted model id; omitted uses the provider profile's default.
    #[arg(long)]
    model: Option<String>,
    #[arg(long, default_value = "together")]
    provider: String,
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value = "png")]
    format: String,
    #[arg(long)]
    events: Option<PathBuf>,
    /// Render placeholder images locally instead of calling the provider.
    #[arg(long)]
    dryrun: bool,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("imagegate error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    init_tracing();
    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    match cli.command {
        Command::Generate(args) => runtime.block_on(run_generate(args)),
        Command::Providers => run_providers(),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("IMAGEGATE_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_generate(args: GenerateArgs) -> Result<i32> {
    let Some(format) = OutputFormat::parse(&args.format) else {
        bail!("unsupported output format '{}' (png, jpeg, webp)", args.format);
    };

    let mut builder = GenerationRequest::builder(args.prompt.as_str(), args.provider.as_str())
        .dimensions(args.width, args.height)
        .steps(args.steps)
        .guidance(args.guidance)
        .count(args.count);
    if let Some(style) = &args.style {
        builder = builder.style(style.as_str());
    }
    if let Some(seed) = &args.seed {
        builder = builder.seed_text(seed.as_str());
    }
    if let Some(model) = &args.model {
        builder = builder.model(model.as_str());
    }
    let request = builder.build().context("invalid generation request")?;

    let mut config = GatewayConfig::from_env().context("invalid gateway configuration")?;
    if config.providers.is_none() {
        config.providers = Some(vec![request.provider().to_string()]);
    }
    let registry = config
        .load_registry(non_empty_env)
        .context("failed to load provider profiles")?;
    let credentials = if args.dryrun {
        let mut placeholders = Credentials::default();
        for profile in registry.profiles() {
            placeholders.insert(&profile.id, "dryrun");
        }
        placeholders
    } else {
        Credentials::resolve(&registry, non_empty_env)?
    };
    let transport: Arc<dyn Transport> = if args.dryrun {
        Arc::new(DryrunTransport::new(
            Arc::new(registry.clone()),
            request.width(),
            request.height(),
        ))
    } else {
        Arc::new(HttpTransport::new())
    };

    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let run_id = uuid::Uuid::new_v4().to_string();
    let orchestrator = Orchestrator::from_config(&config, registry, credentials, transport)
        .with_events(EventWriter::new(&events_path, run_id.as_str()));

    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(cancel_on_ctrl_c(cancel.clone()));

    let started_at = now_utc_iso();
    let result = orchestrator
        .generate_with_cancel(&request, cancel)
        .await
        .context("generation rejected before any provider call")?;
    let finished_at = now_utc_iso();
    watcher.abort();

    let writes = write_images(result.images(), &args.out, format);
    let summary = result.to_summary(started_at, finished_at);
    let mut extra = Map::new();
    extra.insert("run_id".to_string(), Value::String(run_id));
    extra.insert("request".to_string(), json!(request));
    extra.insert("dryrun".to_string(), Value::Bool(args.dryrun));
    extra.extend(writes.to_summary_fields());
    write_summary(&args.out.join("summary.json"), &summary, Some(&extra))?;

    print_slots(&result, &writes);
    Ok(exit_code(writes.written.len(), result.len()))
}

async fn cancel_on_ctrl_c(cancel: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupt received, cancelling remaining slots");
        cancel.cancel();
    }
}

/// Per-slot results of saving images. A failed write never stops the rest.
#[derive(Debug, Default)]
struct ImageWrites {
    written: Vec<(usize, PathBuf)>,
    failed: Vec<(usize, String)>,
}

impl ImageWrites {
    fn path(&self, slot: usize) -> Option<&Path> {
        self.written
            .iter()
            .find(|(index, _)| *index == slot)
            .map(|(_, path)| path.as_path())
    }

    fn error(&self, slot: usize) -> Option<&str> {
        self.failed
            .iter()
            .find(|(index, _)| *index == slot)
            .map(|(_, message)| message.as_str())
    }

    fn to_summary_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert(
            "images".to_string(),
            Value::Array(
                self.written
                    .iter()
                    .map(|(_, path)| Value::String(path.display().to_string()))
                    .collect(),
            ),
        );
        fields.insert(
            "write_errors".to_string(),
            Value::Array(
                self.failed
                    .iter()
                    .map(|(slot, error)| json!({"slot": slot, "error": error}))
                    .collect(),
            ),
        );
        fields
    }
}

/// Writes one file per successful slot, named after its slot index so gaps
/// show which slots failed.
fn write_images<'a>(
    images: impl IntoIterator<Item = (usize, &'a DecodedImage)>,
    out_dir: &Path,
    format: OutputFormat,
) -> ImageWrites {
    let mut writes = ImageWrites::default();
    for (index, image) in images {
        let path = out_dir.join(image_file_name(index, format));
        match write_image(image, &path, format) {
            Ok(()) => {
                info!(slot = index, path = %path.display(), "image written");
                writes.written.push((index, path));
            }
            Err(err) => {
                warn!(slot = index, error = %format!("{err:#}"), "image not written");
                writes.failed.push((index, format!("{err:#}")));
            }
        }
    }
    writes
}

fn write_image(image: &DecodedImage, path: &Path, format: OutputFormat) -> Result<()> {
    let bytes = ImageCodec::encode(image, format)?;
    fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

fn image_file_name(index: usize, format: OutputFormat) -> String {
    format!("image-{:02}.{}", index + 1, format.extension())
}

fn print_slots(result: &GenerationResult, writes: &ImageWrites) {
    for (index, slot) in result.slots().iter().enumerate() {
        match slot {
            Ok(image) => {
                let saved = match (writes.path(index), writes.error(index)) {
                    (Some(path), _) => path.display().to_string(),
                    (None, Some(error)) => format!("(not saved: {error})"),
                    (None, None) => String::new(),
                };
                println!(
                    "slot {}: ok {}x{} {}",
                    index + 1,
                    image.width(),
                    image.height(),
                    saved
                );
            }
            Err(err) => println!("slot {}: {} {}", index + 1, err.kind(), err.message()),
        }
    }
    println!(
        "{}/{} images from {}",
        result.succeeded(),
        result.len(),
        result.provider()
    );
}

fn exit_code(succeeded: usize, requested: usize) -> i32 {
    if requested > 0 && succeeded == requested {
        0
    } else if succeeded > 0 {
        2
    } else {
        1
    }
}

fn run_providers() -> Result<i32> {
    let config = GatewayConfig::from_env().context("invalid gateway configuration")?;
    let registry = config
        .load_registry(non_empty_env)
        .context("failed to load provider profiles")?;
    for id in registry.list() {
        let Some(profile) = registry.get(&id) else {
            continue;
        };
        let credential = if profile.requires_credential() {
            let key = credential_env_key(profile);
            let state = if non_empty_env(&key).is_some() {
                "set"
            } else {
                "missing"
            };
            format!("{key} {state}")
        } else {
            "no credential".to_string()
        };
        println!(
            "{:<12} {:<24} {}  [{}]",
            profile.id,
            profile.display_name(),
            profile.endpoint,
            credential
        );
    }
    Ok(0)
}
