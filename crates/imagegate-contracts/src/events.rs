use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Map, Value};

use crate::errors::ClassifiedError;
use crate::summary::now_utc_iso;

/// Lifecycle of one `generate` call as recorded in `events.jsonl`.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    Started {
        provider: String,
        count: usize,
        concurrency: usize,
        request: Value,
    },
    SlotAttempt {
        slot: usize,
        attempt: u32,
        endpoint: String,
    },
    RetryScheduled {
        slot: usize,
        attempt: u32,
        error: ClassifiedError,
        delay: Duration,
    },
    SlotFinished {
        slot: usize,
        attempts: u32,
        status_codes: Vec<u16>,
        elapsed: Duration,
        /// Decoded `(width, height)` or the slot's error.
        outcome: Result<(u32, u32), ClassifiedError>,
    },
    Finished {
        provider: String,
        requested: usize,
        succeeded: usize,
        cancelled: bool,
        elapsed: Duration,
    },
}

impl GenerationEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Started { .. } => "generation_started",
            Self::SlotAttempt { .. } => "slot_attempt",
            Self::RetryScheduled { .. } => "slot_retry_scheduled",
            Self::SlotFinished { .. } => "slot_finished",
            Self::Finished { .. } => "generation_finished",
        }
    }

    fn payload(&self) -> Map<String, Value> {
        let mut out = Map::new();
        match self {
            Self::Started {
                provider,
                count,
                concurrency,
                request,
            } => {
                out.insert("provider".to_string(), json!(provider));
                out.insert("count".to_string(), json!(count));
                out.insert("concurrency".to_string(), json!(concurrency));
                out.insert("request".to_string(), request.clone());
            }
            Self::SlotAttempt {
                slot,
                attempt,
                endpoint,
            } => {
                out.insert("slot".to_string(), json!(slot));
                out.insert("attempt".to_string(), json!(attempt));
                out.insert("endpoint".to_string(), json!(endpoint));
            }
            Self::RetryScheduled {
                slot,
                attempt,
                error,
                delay,
            } => {
                out.insert("slot".to_string(), json!(slot));
                out.insert("attempt".to_string(), json!(attempt));
                insert_error(&mut out, error);
                out.insert("delay_ms".to_string(), json!(millis(*delay)));
            }
            Self::SlotFinished {
                slot,
                attempts,
                status_codes,
                elapsed,
                outcome,
            } => {
                out.insert("slot".to_string(), json!(slot));
                out.insert("attempts".to_string(), json!(attempts));
                out.insert("status_codes".to_string(), json!(status_codes));
                out.insert("elapsed_ms".to_string(), json!(millis(*elapsed)));
                match outcome {
                    Ok((width, height)) => {
                        out.insert("status".to_string(), json!("ok"));
                        out.insert("width".to_string(), json!(width));
                        out.insert("height".to_string(), json!(height));
                    }
                    Err(error) => {
                        out.insert("status".to_string(), json!("error"));
                        insert_error(&mut out, error);
                    }
                }
            }
            Self::Finished {
                provider,
                requested,
                succeeded,
                cancelled,
                elapsed,
            } => {
                out.insert("provider".to_string(), json!(provider));
                out.insert("requested".to_string(), json!(requested));
                out.insert("succeeded".to_string(), json!(succeeded));
                out.insert("cancelled".to_string(), json!(cancelled));
                out.insert("elapsed_ms".to_string(), json!(millis(*elapsed)));
            }
        }
        out
    }
}

fn insert_error(out: &mut Map<String, Value>, error: &ClassifiedError) {
    out.insert("error_kind".to_string(), json!(error.kind()));
    out.insert("error".to_string(), json!(error.message()));
    if let ClassifiedError::RateLimited {
        retry_after: Some(hint),
        ..
    } = error
    {
        out.insert("retry_after_ms".to_string(), json!(millis(*hint)));
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Append-only `events.jsonl` sink shared by every slot task of a run.
///
/// Each line is `{type, run_id, generation_id, ts, ...payload}`. The file is
/// opened on the first record and kept open behind the lock.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<Sink>,
}

#[derive(Debug)]
struct Sink {
    path: PathBuf,
    run_id: String,
    file: Mutex<Option<File>>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Sink {
                path: path.into(),
                run_id: run_id.into(),
                file: Mutex::new(None),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn record(&self, generation_id: &str, event: &GenerationEvent) -> anyhow::Result<Value> {
        let mut line = Map::new();
        line.insert("type".to_string(), json!(event.event_type()));
        line.insert("run_id".to_string(), json!(self.inner.run_id));
        line.insert("generation_id".to_string(), json!(generation_id));
        line.insert("ts".to_string(), json!(now_utc_iso()));
        line.extend(event.payload());
        let line = Value::Object(line);
        self.append(&line)?;
        Ok(line)
    }

    fn append(&self, line: &Value) -> anyhow::Result<()> {
        let mut text = serde_json::to_string(line)?;
        text.push('\n');
        let mut file = self
            .inner
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        if file.is_none() {
            if let Some(parent) = self.inner.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            *file = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.inner.path)?,
            );
        }
        if let Some(file) = file.as_mut() {
            file.write_all(text.as_bytes())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use chrono::DateTime;
    use serde_json::{json, Value};

    use super::{EventWriter, GenerationEvent};
    use crate::errors::ClassifiedError;

    fn read_lines(path: &std::path::Path) -> anyhow::Result<Vec<Value>> {
        let content = fs::read_to_string(path)?;
        content
            .lines()
            .map(|line| serde_json::from_str::<Value>(line).map_err(anyhow::Error::from))
            .collect()
    }

    #[test]
    fn record_stamps_run_and_generation_ids() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "run-123");

        let emitted = writer.record(
            "gen-1",
            &GenerationEvent::SlotAttempt {
                slot: 2,
                attempt: 1,
                endpoint: "https://api.together.xyz/v1/images/generations".to_string(),
            },
        )?;

        let lines = read_lines(&path)?;
        assert_eq!(lines, vec![emitted]);
        let line = &lines[0];
        assert_eq!(line["type"], json!("slot_attempt"));
        assert_eq!(line["run_id"], json!("run-123"));
        assert_eq!(line["generation_id"], json!("gen-1"));
        assert_eq!(line["slot"], json!(2));
        DateTime::parse_from_rfc3339(line["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn slot_errors_are_flattened_to_kind_and_message() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "run-1");

        let retry = writer.record(
            "gen-1",
            &GenerationEvent::RetryScheduled {
                slot: 0,
                attempt: 1,
                error: ClassifiedError::RateLimited {
                    message: "slow down".to_string(),
                    retry_after: Some(Duration::from_secs(3)),
                },
                delay: Duration::from_millis(5000),
            },
        )?;
        assert_eq!(retry["error_kind"], json!("rate_limited"));
        assert_eq!(retry["error"], json!("slow down"));
        assert_eq!(retry["retry_after_ms"], json!(3000));
        assert_eq!(retry["delay_ms"], json!(5000));

        let failed = writer.record(
            "gen-1",
            &GenerationEvent::SlotFinished {
                slot: 1,
                attempts: 1,
                status_codes: vec![401],
                elapsed: Duration::from_millis(12),
                outcome: Err(ClassifiedError::AuthError("invalid api key".to_string())),
            },
        )?;
        assert_eq!(failed["status"], json!("error"));
        assert_eq!(failed["error_kind"], json!("auth_error"));
        assert_eq!(failed["status_codes"], json!([401]));

        let ok = writer.record(
            "gen-1",
            &GenerationEvent::SlotFinished {
                slot: 0,
                attempts: 2,
                status_codes: vec![429, 200],
                elapsed: Duration::from_millis(40),
                outcome: Ok((512, 768)),
            },
        )?;
        assert_eq!(ok["status"], json!("ok"));
        assert_eq!((ok["width"].clone(), ok["height"].clone()), (json!(512), json!(768)));
        assert!(ok.get("error_kind").is_none());
        Ok(())
    }

    #[test]
    fn clones_share_one_file_in_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("events.jsonl");
        let writer = EventWriter::new(&path, "run-123");
        let cloned = writer.clone();

        writer.record(
            "gen-1",
            &GenerationEvent::Started {
                provider: "together".to_string(),
                count: 1,
                concurrency: 1,
                request: json!({"prompt": "a cellar"}),
            },
        )?;
        cloned.record(
            "gen-1",
            &GenerationEvent::Finished {
                provider: "together".to_string(),
                requested: 1,
                succeeded: 1,
                cancelled: false,
                elapsed: Duration::from_millis(900),
            },
        )?;

        let types: Vec<Value> = read_lines(&path)?
            .into_iter()
            .map(|line| line["type"].clone())
            .collect();
        assert_eq!(
            types,
            vec![json!("generation_started"), json!("generation_finished")]
        );
        Ok(())
    }
}
