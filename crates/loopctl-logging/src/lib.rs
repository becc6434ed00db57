//! The logging spine: worker-to-supervisor log fan-in and an ordered sink
//! (spec.md §4.8).
//!
//! Every worker pushes structured [`LogRecord`]s onto a shared, bounded,
//! multi-producer queue. The supervisor drains it once per tick (mirroring
//! `ipc.Log.Queue`/`ipc.Log.History` in `mappapp/modules/controller.py`),
//! formats each record to the session log file, and retains the last K
//! records in a bounded in-memory ring for a UI to page through.

use std::collections::VecDeque;
use std::io::Write as _;
use std::path::Path;

use crossbeam_channel::{Receiver, Sender};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Default size of the in-memory ring the UI pages through.
pub const DEFAULT_HISTORY_CAPACITY: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&Level> for LogLevel {
    fn from(level: &Level) -> Self {
        match *level {
            Level::TRACE => LogLevel::Trace,
            Level::DEBUG => LogLevel::Debug,
            Level::INFO => LogLevel::Info,
            Level::WARN => LogLevel::Warn,
            Level::ERROR => LogLevel::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// One structured log record: level, logger (tracing target), timestamp
/// (nanoseconds since `UNIX_EPOCH`), and the rendered message (spec.md §4.8).
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: LogLevel,
    pub target: String,
    pub timestamp_nanos: u64,
    pub message: String,
}

fn now_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_nanos() as u64
}

/// The multi-producer, single-consumer log queue (spec.md §5's "Log queue").
#[derive(Clone)]
pub struct LogSender {
    tx: Sender<LogRecord>,
}

impl LogSender {
    pub fn send(&self, record: LogRecord) {
        // A full or closed queue must never block or crash a worker's tick;
        // dropping the record (and letting it be invisible to the UI) is
        // preferable to stalling the data plane over logging.
        let _ = self.tx.send(record);
    }
}

pub struct LogQueue {
    pub sender: LogSender,
    rx: Receiver<LogRecord>,
}

impl LogQueue {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { sender: LogSender { tx }, rx }
    }

    /// Non-blocking drain of every record currently queued — called once
    /// per supervisor tick (spec.md §4.8).
    pub fn drain(&self) -> Vec<LogRecord> {
        self.rx.try_iter().collect()
    }
}

impl Default for LogQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A `tracing_subscriber::Layer` that forwards every event into a
/// [`LogSender`] instead of (or in addition to) printing it directly. Install
/// this in each worker process so its `tracing` events cross the process
/// boundary as [`LogRecord`]s over the attribute/control-message plane,
/// exactly mirroring the Python source's per-process `logging.Handler` that
/// pushes onto `ipc.Log.Queue`.
pub struct QueueLayer {
    sender: LogSender,
}

impl QueueLayer {
    pub fn new(sender: LogSender) -> Self {
        Self { sender }
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        } else if self.0.is_empty() {
            self.0 = format!("{}={:?}", field.name(), value);
        }
    }
}

impl<S: Subscriber> Layer<S> for QueueLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.sender.send(LogRecord {
            level: event.metadata().level().into(),
            target: event.metadata().target().to_string(),
            timestamp_nanos: now_nanos(),
            message: visitor.0,
        });
    }
}

/// The supervisor-side sink (spec.md §4.8): drains a [`LogQueue`], writes
/// formatted lines to the session log file, and keeps the last
/// [`SessionLog::capacity`] records in memory for a UI to page through.
pub struct SessionLog {
    file: Option<std::fs::File>,
    history: VecDeque<LogRecord>,
    capacity: usize,
}

impl SessionLog {
    pub fn create(path: &Path, capacity: usize) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Some(file), history: VecDeque::with_capacity(capacity), capacity })
    }

    /// An in-memory-only log, used by tests and by any worker that doesn't
    /// itself own the session log file (only the supervisor does).
    pub fn in_memory(capacity: usize) -> Self {
        Self { file: None, history: VecDeque::with_capacity(capacity), capacity }
    }

    /// Formats and appends each record to the file (if any) and the ring.
    pub fn ingest(&mut self, records: impl IntoIterator<Item = LogRecord>) {
        for record in records {
            if let Some(file) = self.file.as_mut() {
                let _ = writeln!(
                    file,
                    "{} {} {} {}",
                    record.timestamp_nanos, record.level, record.target, record.message
                );
            }
            if self.history.len() == self.capacity {
                self.history.pop_front();
            }
            self.history.push_back(record);
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &LogRecord> {
        self.history.iter()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_drains_in_fifo_order() {
        let queue = LogQueue::new();
        for i in 0..3 {
            queue.sender.send(LogRecord {
                level: LogLevel::Info,
                target: "test".into(),
                timestamp_nanos: i,
                message: format!("msg-{i}"),
            });
        }
        let drained = queue.drain();
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0].message, "msg-0");
        assert_eq!(drained[2].message, "msg-2");
    }

    #[test]
    fn drain_is_non_blocking_on_empty_queue() {
        let queue = LogQueue::new();
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn session_log_ring_evicts_oldest_once_over_capacity() {
        let mut log = SessionLog::in_memory(2);
        for i in 0..5u64 {
            log.ingest(std::iter::once(LogRecord {
                level: LogLevel::Warn,
                target: "t".into(),
                timestamp_nanos: i,
                message: format!("m{i}"),
            }));
        }
        assert_eq!(log.len(), 2);
        let kept: Vec<_> = log.history().map(|r| r.message.clone()).collect();
        assert_eq!(kept, vec!["m3".to_string(), "m4".to_string()]);
    }

    #[test]
    fn session_log_writes_formatted_lines_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        let mut log = SessionLog::create(&path, 10).unwrap();
        log.ingest(std::iter::once(LogRecord {
            level: LogLevel::Error,
            target: "supervisor".into(),
            timestamp_nanos: 42,
            message: "boom".into(),
        }));
        drop(log);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("ERROR"));
        assert!(contents.contains("supervisor"));
        assert!(contents.contains("boom"));
    }

    #[test]
    fn log_level_ordering_matches_severity() {
        assert!(LogLevel::Error > LogLevel::Warn);
        assert!(LogLevel::Warn > LogLevel::Info);
        assert!(LogLevel::Info > LogLevel::Debug);
        assert!(LogLevel::Debug > LogLevel::Trace);
    }
}
