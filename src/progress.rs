//! Run progress events and sinks.
//!
//! The orchestrator publishes lifecycle events through a [`ProgressSink`].
//! Publishing is fire-and-forget: `publish` is infallible and must not
//! block, so a slow consumer can never stall a phase. Host applications
//! bridge events onto whatever transport they use (WebSocket, log).

use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    RunStarted,
    PhaseStarted,
    PhaseCompleted,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    EvalRecorded,
    EvalFailed,
    ComparisonResolved,
    ComparisonDiscarded,
    CombineCompleted,
    RunCompleted,
    RunFailed,
    RunCancelled,
}

/// One lifecycle event.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub run_id: Uuid,
    pub timestamp_ms: i64,
    pub kind: ProgressKind,
    /// Phase label, e.g. "generating" or "pairwise".
    pub stage: &'static str,
    /// Artifact this event concerns, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    /// Completion fraction for the stage, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fraction: Option<f64>,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(run_id: Uuid, kind: ProgressKind, stage: &'static str) -> Self {
        Self {
            run_id,
            timestamp_ms: now_epoch_ms(),
            kind,
            stage,
            artifact_id: None,
            fraction: None,
            message: String::new(),
        }
    }

    pub fn artifact(mut self, id: impl Into<String>) -> Self {
        self.artifact_id = Some(id.into());
        self
    }

    pub fn fraction(mut self, f: f64) -> Self {
        self.fraction = Some(f.clamp(0.0, 1.0));
        self
    }

    pub fn message(mut self, m: impl Into<String>) -> Self {
        self.message = m.into();
        self
    }
}

/// Sink for progress events. Implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn publish(&self, _event: ProgressEvent) {}
}

/// Forwards events to `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn publish(&self, event: ProgressEvent) {
        tracing::debug!(
            run_id = %event.run_id,
            kind = ?event.kind,
            stage = event.stage,
            artifact_id = event.artifact_id.as_deref().unwrap_or(""),
            message = %event.message,
            "progress"
        );
    }
}

/// Writes events as JSON lines through a dedicated writer thread, so
/// publishing from parallel task completions never touches the filesystem.
#[derive(Clone)]
pub struct JsonlProgressSink {
    sender: mpsc::Sender<ProgressEvent>,
}

/// Joinable handle for the writer thread. Dropping the sink closes the
/// channel; joining the worker flushes the file.
pub struct ProgressWorker {
    handle: Option<std::thread::JoinHandle<std::io::Result<()>>>,
}

impl ProgressWorker {
    pub fn join(mut self) -> std::io::Result<()> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(std::io::Error::other("progress worker panicked")),
            },
            None => Ok(()),
        }
    }
}

impl JsonlProgressSink {
    pub fn new(path: impl AsRef<Path>) -> std::io::Result<(Self, ProgressWorker)> {
        let file = std::fs::File::create(path)?;
        let (sender, receiver) = mpsc::channel::<ProgressEvent>();
        let handle = std::thread::spawn(move || write_progress_loop(file, receiver));
        Ok((
            Self { sender },
            ProgressWorker {
                handle: Some(handle),
            },
        ))
    }
}

impl ProgressSink for JsonlProgressSink {
    fn publish(&self, event: ProgressEvent) {
        // A closed channel means the worker is gone; losing telemetry is
        // acceptable, stalling the run is not.
        let _ = self.sender.send(event);
    }
}

fn write_progress_loop(
    file: std::fs::File,
    receiver: mpsc::Receiver<ProgressEvent>,
) -> std::io::Result<()> {
    let mut writer = BufWriter::new(file);
    for event in receiver {
        match serde_json::to_string(&event) {
            Ok(line) => writeln!(writer, "{line}")?,
            Err(e) => tracing::warn!(error = %e, "Failed to serialize progress event"),
        }
    }
    writer.flush()?;
    Ok(())
}

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
