use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Structured event log shared by the service and every background dispatch.
///
/// - default fields are `type`, `source`, `ts`
/// - caller payload is merged last and can override defaults
/// - file sinks get one compact JSON object per line
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    sink: EventSink,
    source: String,
    lock: Mutex<VecDeque<Value>>,
}

#[derive(Debug)]
enum EventSink {
    File(PathBuf),
    /// `None` keeps everything; otherwise the oldest events are dropped past the limit.
    Memory(Option<usize>),
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, source: impl Into<String>) -> Self {
        Self::with_sink(EventSink::File(path.into()), source.into())
    }

    /// Keeps events in memory; read them back with [`EventWriter::snapshot`].
    pub fn memory(source: impl Into<String>) -> Self {
        Self::with_sink(EventSink::Memory(None), source.into())
    }

    /// Memory sink holding at most `capacity` of the latest events.
    pub fn bounded(source: impl Into<String>, capacity: usize) -> Self {
        Self::with_sink(EventSink::Memory(Some(capacity.max(1))), source.into())
    }

    fn with_sink(sink: EventSink, source: String) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                sink,
                source,
                lock: Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.inner.sink {
            EventSink::File(path) => Some(path.as_path()),
            EventSink::Memory(_) => None,
        }
    }

    pub fn source(&self) -> &str {
        &self.inner.source
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "source".to_string(),
            Value::String(self.inner.source.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }
        let event = Value::Object(event);

        let mut guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        match &self.inner.sink {
            EventSink::Memory(capacity) => {
                if let Some(capacity) = *capacity {
                    while guard.len() >= capacity {
                        guard.pop_front();
                    }
                }
                guard.push_back(event.clone());
            }
            EventSink::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let line = serde_json::to_string(&event)?;
                let mut file = OpenOptions::new().create(true).append(true).open(path)?;
                file.write_all(line.as_bytes())?;
                file.write_all(b"\n")?;
            }
        }

        Ok(event)
    }

    /// Best-effort variant for call sites that have nobody to report a log failure to.
    pub fn record(&self, event_type: &str, payload: EventPayload) {
        let _ = self.emit(event_type, payload);
    }

    /// Events buffered by a memory sink. File sinks return an empty list.
    pub fn snapshot(&self) -> Vec<Value> {
        self.inner
            .lock
            .lock()
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .filter_map(|event| event.get("type").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
