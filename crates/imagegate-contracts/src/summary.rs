use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSummary {
    pub generation_id: String,
    pub provider: String,
    pub started_at: String,
    pub finished_at: String,
    pub requested: u64,
    pub succeeded: u64,
    pub slots: Vec<Map<String, Value>>,
}

impl GenerationSummary {
    pub fn failed(&self) -> u64 {
        self.requested.saturating_sub(self.succeeded)
    }
}

pub fn write_summary(
    path: &Path,
    summary: &GenerationSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = Map::new();
    payload.insert(
        "generation_id".to_string(),
        Value::String(summary.generation_id.clone()),
    );
    payload.insert(
        "provider".to_string(),
        Value::String(summary.provider.clone()),
    );
    payload.insert(
        "started_at".to_string(),
        Value::String(summary.started_at.clone()),
    );
    payload.insert(
        "finished_at".to_string(),
        Value::String(summary.finished_at.clone()),
    );
    payload.insert(
        "requested".to_string(),
        Value::Number(summary.requested.into()),
    );
    payload.insert(
        "succeeded".to_string(),
        Value::Number(summary.succeeded.into()),
    );
    payload.insert("failed".to_string(), Value::Number(summary.failed().into()));
    payload.insert(
        "slots".to_string(),
        Value::Array(summary.slots.iter().cloned().map(Value::Object).collect()),
    );
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
