//! Persistent journal of operational events.
//!
//! One JSON object per line, each stamped with a monotonic offset from
//! journal creation and a wall-clock Unix time.

use dyno_core::controller::ControllerEvent;
use dyno_core::supervisor::TaskEvent;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalEventType {
    SystemStart,
    SystemShutdown,
    RecordingStarted,
    RecordingStopped,
    ExperimentStarted,
    ExperimentFinished,
    TaskFailure,
    CommandRejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Microseconds since the journal was opened.
    pub monotonic_us: u64,
    pub unix_us: i64,
    pub event_type: JournalEventType,
    pub details: serde_json::Value,
}

/// Thread-safe JSONL writer, opened in append mode.
pub struct EventJournal {
    writer: Mutex<BufWriter<File>>,
    opened: Instant,
}

impl EventJournal {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::with_capacity(8192, file)),
            opened: Instant::now(),
        })
    }

    pub fn log(&self, event_type: JournalEventType, details: serde_json::Value) -> std::io::Result<()> {
        let entry = JournalEntry {
            monotonic_us: self.opened.elapsed().as_micros() as u64,
            unix_us: chrono::Utc::now().timestamp_micros(),
            event_type,
            details,
        };
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        serde_json::to_writer(&mut *writer, &entry)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    pub fn record_controller_event(&self, event: &ControllerEvent) -> std::io::Result<()> {
        let (event_type, details) = match event {
            ControllerEvent::RecordingStarted { path } => (
                JournalEventType::RecordingStarted,
                serde_json::json!({ "path": path }),
            ),
            ControllerEvent::RecordingStopped { path, rows } => (
                JournalEventType::RecordingStopped,
                serde_json::json!({ "path": path, "rows": rows }),
            ),
            ControllerEvent::ExperimentStarted { name } => (
                JournalEventType::ExperimentStarted,
                serde_json::json!({ "name": name }),
            ),
            ControllerEvent::ExperimentFinished { name, outcome } => (
                JournalEventType::ExperimentFinished,
                serde_json::json!({ "name": name, "outcome": outcome }),
            ),
            ControllerEvent::CommandRejected { source, reason } => (
                JournalEventType::CommandRejected,
                serde_json::json!({ "source": source, "reason": reason }),
            ),
        };
        self.log(event_type, details)
    }

    pub fn record_task_event(&self, event: &TaskEvent) -> std::io::Result<()> {
        let details = match event {
            TaskEvent::IterationFailed { task, error } => {
                serde_json::json!({ "task": task, "kind": "iteration", "error": error })
            }
            TaskEvent::Terminated { task, reason } => {
                serde_json::json!({ "task": task, "kind": "terminated", "error": reason })
            }
        };
        self.log(JournalEventType::TaskFailure, details)
    }
}
