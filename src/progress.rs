//! Sync progress reporting.
//!
//! Progress is emitted on **stderr** so stdout stays parseable for scripts
//! (`docsync sync --json`). The orchestrator calls the reporter from several
//! mappings at once, so implementations must be thread-safe.

use std::io::Write;

/// A single progress event for one mapping's cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncProgressEvent {
    /// Listing both sides; totals not known yet.
    Discovering { mapping: String },
    /// Detection finished: `pending` of `total` documents need work.
    Detected {
        mapping: String,
        total: u64,
        pending: u64,
    },
    /// `n` of `total` pending documents applied.
    Applying {
        mapping: String,
        n: u64,
        total: u64,
    },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: `sync docs  applying  12 / 1,024 documents`.
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Discovering { mapping } => {
                format!("sync {}  discovering...\n", mapping)
            }
            SyncProgressEvent::Detected {
                mapping,
                total,
                pending,
            } => format!(
                "sync {}  detected  {} of {} documents changed\n",
                mapping,
                format_number(*pending),
                format_number(*total)
            ),
            SyncProgressEvent::Applying { mapping, n, total } => format!(
                "sync {}  applying  {} / {} documents\n",
                mapping,
                format_number(*n),
                format_number(*total)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Discovering { mapping } => serde_json::json!({
                "event": "progress",
                "mapping": mapping,
                "phase": "discovering"
            }),
            SyncProgressEvent::Detected {
                mapping,
                total,
                pending,
            } => serde_json::json!({
                "event": "progress",
                "mapping": mapping,
                "phase": "detected",
                "total": total,
                "pending": pending
            }),
            SyncProgressEvent::Applying { mapping, n, total } => serde_json::json!({
                "event": "progress",
                "mapping": mapping,
                "phase": "applying",
                "n": n,
                "total": total
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

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
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
        assert_eq!(format_number(1_234_567), "1,234,567");
    }
}
