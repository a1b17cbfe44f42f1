use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only run journal written as `events.jsonl`.
///
/// Every line carries `type`, `run_id`, `seq` and `ts`; the caller payload
/// is merged after those keys. Payload keys that usually hold image bytes
/// are replaced with a size marker so the journal stays small.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<JournalInner>,
}

#[derive(Debug)]
struct JournalInner {
    path: PathBuf,
    run_id: String,
    next_seq: Mutex<u64>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(JournalInner {
                path: path.into(),
                run_id: run_id.into(),
                next_seq: Mutex::new(0),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        // The sequence lock also serializes appends from cloned writers.
        let mut seq = self
            .inner
            .next_seq
            .lock()
            .map_err(|_| anyhow::anyhow!("event journal lock poisoned"))?;

        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "run_id".to_string(),
            Value::String(self.inner.run_id.clone()),
        );
        event.insert("seq".to_string(), Value::Number((*seq).into()));
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            let binary = key_is_binary(&key);
            event.insert(key, strip_binary_fields(binary, value));
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        *seq += 1;

        Ok(Value::Object(event))
    }
}

fn key_is_binary(key: &str) -> bool {
    matches!(
        key.to_ascii_lowercase().as_str(),
        "data" | "bytes" | "image_bytes" | "inline_data" | "inlinedata"
    )
}

fn strip_binary_fields(binary: bool, value: Value) -> Value {
    if binary {
        let len = match &value {
            Value::String(text) => text.len(),
            Value::Array(rows) => rows.len(),
            _ => 0,
        };
        return Value::String(format!("<omitted {len} bytes>"));
    }
    match value {
        Value::Array(rows) => Value::Array(
            rows.into_iter()
                .map(|row| strip_binary_fields(false, row))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, row)| {
                    let binary = key_is_binary(&key);
                    (key, strip_binary_fields(binary, row))
                })
                .collect(),
        ),
        other => other,
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;
    use serde_json::json;

    use super::*;

    #[test]
    fn emit_writes_one_compact_line_with_defaults() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("events.jsonl");
        let writer = EventWriter::new(&path, "run-7");

        let mut payload = EventPayload::new();
        payload.insert("state".to_string(), json!("generating_anchor"));
        let emitted = writer.emit("synthesis_state", payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;
        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], json!("synthesis_state"));
        assert_eq!(parsed["run_id"], json!("run-7"));
        assert_eq!(parsed["seq"], json!(0));
        assert_eq!(parsed["state"], json!("generating_anchor"));
        DateTime::parse_from_rfc3339(parsed["ts"].as_str().unwrap_or(""))?;
        Ok(())
    }

    #[test]
    fn sequence_increments_across_clones() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "run-7");
        let clone = writer.clone();

        writer.emit("one", EventPayload::new())?;
        clone.emit("two", EventPayload::new())?;

        let content = fs::read_to_string(&path)?;
        let rows: Vec<Value> = content
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["seq"], json!(0));
        assert_eq!(rows[1]["seq"], json!(1));
        assert_eq!(rows[1]["type"], json!("two"));
        Ok(())
    }

    #[test]
    fn binary_fields_are_omitted_at_any_depth() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let writer = EventWriter::new(temp.path().join("events.jsonl"), "run-7");

        let mut payload = EventPayload::new();
        payload.insert(
            "part".to_string(),
            json!({"mime_type": "image/png", "data": "aGVsbG8="}),
        );
        let emitted = writer.emit("keyframe_prompt", payload)?;

        assert_eq!(emitted["part"]["mime_type"], json!("image/png"));
        assert_eq!(emitted["part"]["data"], json!("<omitted 8 bytes>"));
        Ok(())
    }

    #[test]
    fn top_level_binary_keys_are_omitted_in_the_journal() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "run-7");

        let mut payload = EventPayload::new();
        payload.insert("inline_data".to_string(), json!("aGVsbG8gd29ybGQ="));
        payload.insert("label".to_string(), json!("A"));
        writer.emit("keyframe_saved", payload)?;

        let content = fs::read_to_string(&path)?;
        let row: Value = serde_json::from_str(content.lines().next().unwrap_or("{}"))?;
        assert_eq!(row["inline_data"], json!("<omitted 16 bytes>"));
        assert_eq!(row["label"], json!("A"));
        assert!(!content.contains("aGVsbG8gd29ybGQ="));
        Ok(())
    }
}
