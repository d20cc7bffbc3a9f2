//! Extraction progress reporting.
//!
//! Reports observable progress during `harvest extract` and `harvest update`
//! so users see which slice is being worked on and how many records have
//! been collected. Progress is emitted on **stderr** so stdout remains
//! parseable for scripts.

use std::io::Write;

/// A single progress event for an extraction job.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// Counting the records of a scope.
    Counting { scope: String },
    /// A peel round isolated a slice.
    Slice { round: u32, label: String, total: u64 },
    /// A traceback batch was merged.
    Batch { collected: usize, added: usize },
    /// A direct page was merged.
    Page {
        page: u32,
        pages: u32,
        collected: usize,
    },
    /// The job ended.
    Finished { collected: usize, reason: String },
}

/// Reports extraction progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "extract  page 3 / 8  12,000 collected".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Counting { scope } => format!("extract  counting  {}\n", scope),
            ProgressEvent::Slice {
                round,
                label,
                total,
            } => format!(
                "extract  round {}  slice {}  ({} records)\n",
                round,
                label,
                format_number(*total)
            ),
            ProgressEvent::Batch { collected, added } => format!(
                "extract  +{}  {} collected\n",
                format_number(*added as u64),
                format_number(*collected as u64)
            ),
            ProgressEvent::Page {
                page,
                pages,
                collected,
            } => format!(
                "extract  page {} / {}  {} collected\n",
                page,
                pages,
                format_number(*collected as u64)
            ),
            ProgressEvent::Finished { collected, reason } => format!(
                "extract  done  {} records  ({})\n",
                format_number(*collected as u64),
                reason
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Counting { scope } => serde_json::json!({
                "event": "progress",
                "phase": "counting",
                "scope": scope
            }),
            ProgressEvent::Slice {
                round,
                label,
                total,
            } => serde_json::json!({
                "event": "progress",
                "phase": "slice",
                "round": round,
                "label": label,
                "total": total
            }),
            ProgressEvent::Batch { collected, added } => serde_json::json!({
                "event": "progress",
                "phase": "batch",
                "collected": collected,
                "added": added
            }),
            ProgressEvent::Page {
                page,
                pages,
                collected,
            } => serde_json::json!({
                "event": "progress",
                "phase": "page",
                "page": page,
                "pages": pages,
                "collected": collected
            }),
            ProgressEvent::Finished { collected, reason } => serde_json::json!({
                "event": "finished",
                "collected": collected,
                "reason": reason
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
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
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
