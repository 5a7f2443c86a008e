//! Debug sink: the only cross-request side-effect channel.
//!
//! When enabled, failure reports are appended as JSON files to an
//! operator-supplied directory. The sink is behind a trait so tests can
//! substitute an in-memory collector, and a failing sink never fails the
//! request it was observing.

use std::{
    path::PathBuf,
    sync::Mutex,
};

use config::{DebugCapture, DebugConfig};
use serde::Serialize;
use serde_json::Value;

/// Observer for provider and streaming failures. Writes are append-only
/// and may be issued from any task.
pub trait DebugSink: Send + Sync {
    fn record(&self, report: FailureReport);

    /// Whether the server should buffer stream chunks for inclusion in
    /// reports.
    fn capture_streams(&self) -> bool {
        false
    }
}

/// One recorded failure.
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    /// The mapped error kind, e.g. `rate_limit_error`.
    pub kind: String,
    /// Provider kind string when the failure came from a driver.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// The client-requested model, prefix included.
    pub model: String,
    /// Suggested HTTP status; absent for mid-stream failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub message: String,
    /// Raw provider error payload when one was parsed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
    /// Stream frames seen before the failure, at capture level `streams`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_chunks: Option<Vec<String>>,
    pub recorded_at: String,
}

impl FailureReport {
    pub fn new(kind: impl Into<String>, model: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            provider: None,
            model: model.into(),
            status: None,
            message: message.into(),
            raw: None,
            stream_chunks: None,
            recorded_at: jiff::Timestamp::now().to_string(),
        }
    }
}

/// Build the configured sink. A missing path disables recording entirely.
pub fn from_config(config: &DebugConfig) -> Box<dyn DebugSink> {
    match &config.path {
        Some(path) => Box::new(FileSink {
            directory: path.clone(),
            capture: config.capture,
        }),
        None => Box::new(NoopSink),
    }
}

/// Discards every report.
pub struct NoopSink;

impl DebugSink for NoopSink {
    fn record(&self, _report: FailureReport) {}
}

/// Writes one JSON file per report into a directory.
pub struct FileSink {
    directory: PathBuf,
    capture: DebugCapture,
}

impl DebugSink for FileSink {
    fn record(&self, report: FailureReport) {
        if let Err(error) = self.write(&report) {
            log::warn!(
                "failed to write debug report to {}: {error}",
                self.directory.display()
            );
        }
    }

    fn capture_streams(&self) -> bool {
        self.capture == DebugCapture::Streams
    }
}

impl FileSink {
    fn write(&self, report: &FailureReport) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.directory)?;

        let stamp = jiff::Timestamp::now().strftime("%Y%m%dT%H%M%S");
        let name = format!(
            "{stamp}-{}-{}.json",
            sanitize(&report.kind),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );

        let payload = serde_json::to_vec_pretty(report)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        std::fs::write(self.directory.join(name), payload)
    }
}

fn sanitize(kind: &str) -> String {
    kind.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' })
        .collect()
}

/// Collects reports in memory; the test substitute for [`FileSink`].
#[derive(Default)]
pub struct MemorySink {
    pub reports: Mutex<Vec<FailureReport>>,
    pub capture: bool,
}

impl DebugSink for MemorySink {
    fn record(&self, report: FailureReport) {
        if let Ok(mut reports) = self.reports.lock() {
            reports.push(report);
        }
    }

    fn capture_streams(&self) -> bool {
        self.capture
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sink_writes_one_file_per_report() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink {
            directory: dir.path().to_path_buf(),
            capture: DebugCapture::Errors,
        };

        sink.record(FailureReport::new(
            "rate_limit_error",
            "openai/gpt-4o",
            "too fast",
        ));
        sink.record(FailureReport::new("overloaded_error", "google/gemini", "reset"));

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 2);

        let first = files[0].as_ref().unwrap().path();
        let content: Value =
            serde_json::from_slice(&std::fs::read(&first).unwrap()).unwrap();
        assert!(content.get("kind").is_some());
        assert!(content.get("recorded_at").is_some());
    }

    #[test]
    fn file_sink_failure_does_not_panic() {
        let sink = FileSink {
            directory: PathBuf::from("/proc/definitely/not/writable"),
            capture: DebugCapture::Streams,
        };

        sink.record(FailureReport::new("x", "m", "msg"));
        assert!(sink.capture_streams());
    }

    #[test]
    fn memory_sink_collects_reports() {
        let sink = MemorySink::default();
        sink.record(FailureReport::new("driver_stream", "xai/grok-3", "boom"));

        let reports = sink.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, "driver_stream");
    }
}
