//! Ingestion progress reporting.
//!
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

/// A single progress event for an ingestion run.
#[derive(Clone, Debug)]
pub enum IngestProgressEvent {
    /// The connector is walking its source. Total unknown.
    Discovering { connector: String },
    /// `n` files processed out of `total`; `path` is the file just finished.
    Ingesting {
        connector: String,
        n: u64,
        total: u64,
        path: String,
    },
    /// `path` could not be read; nothing was written for it.
    FileFailed { path: String, message: String },
    /// A chunk of `path` was rolled back.
    ChunkFailed {
        path: String,
        chunk_index: usize,
        message: String,
    },
}

/// Reports ingestion progress. Implementations write to stderr (human or JSON).
pub trait IngestProgressReporter: Send + Sync {
    fn report(&self, event: IngestProgressEvent);
}

/// Human-friendly progress on stderr: "ingest filesystem  1,234 / 5,000 files".
pub struct StderrProgress;

impl IngestProgressReporter for StderrProgress {
    fn report(&self, event: IngestProgressEvent) {
        let line = match &event {
            IngestProgressEvent::Discovering { connector } => {
                format!("ingest {}  discovering...\n", connector)
            }
            IngestProgressEvent::Ingesting {
                connector,
                n,
                total,
                path,
            } => format!(
                "ingest {}  {} / {} files  {}\n",
                connector,
                format_number(*n),
                format_number(*total),
                path
            ),
            IngestProgressEvent::FileFailed { path, message } => {
                format!("ingest  {} failed: {}\n", path, message)
            }
            IngestProgressEvent::ChunkFailed {
                path,
                chunk_index,
                message,
            } => format!(
                "ingest  chunk {} of {} rolled back: {}\n",
                chunk_index, path, message
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl IngestProgressReporter for JsonProgress {
    fn report(&self, event: IngestProgressEvent) {
        let obj = match &event {
            IngestProgressEvent::Discovering { connector } => serde_json::json!({
                "event": "progress",
                "connector": connector,
                "phase": "discovering"
            }),
            IngestProgressEvent::Ingesting {
                connector,
                n,
                total,
                path,
            } => serde_json::json!({
                "event": "progress",
                "connector": connector,
                "phase": "ingesting",
                "n": n,
                "total": total,
                "path": path
            }),
            IngestProgressEvent::FileFailed { path, message } => serde_json::json!({
                "event": "file_failed",
                "path": path,
                "message": message
            }),
            IngestProgressEvent::ChunkFailed {
                path,
                chunk_index,
                message,
            } => serde_json::json!({
                "event": "chunk_failed",
                "path": path,
                "chunk": chunk_index,
                "message": message
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl IngestProgressReporter for NoProgress {
    fn report(&self, _event: IngestProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn IngestProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(123_456), "123,456");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
