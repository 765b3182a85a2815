//! Message channel between sandboxes and the host.
//!
//! Sandboxes are producers, the [`Session`](crate::Session) is the single
//! consumer. Every message is tagged with the [`RunId`] of the run that sent
//! it. The host folds the stream into a [`RunLog`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Identifies one invocation of `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A message sent by a sandbox.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Console output. One entry per argument.
    Log(Vec<Value>),
    /// Error output or a reported failure. One entry per argument.
    Error(Vec<Value>),
    /// The run finished, successfully or not.
    Done,
}

impl Message {
    /// Decodes a `{ type, args? }` payload.
    ///
    /// Never fails: a missing or unknown `type` decodes to an empty `Log`,
    /// and `args` that is missing or not an array decodes to no arguments.
    pub fn from_value(value: &Value) -> Self {
        let args = || match value.get("args") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };

        match value.get("type").and_then(Value::as_str) {
            Some("log") => Message::Log(args()),
            Some("error") => Message::Error(args()),
            Some("done") => Message::Done,
            _ => Message::Log(Vec::new()),
        }
    }

    /// Wire form of this message.
    pub fn to_value(&self) -> Value {
        match self {
            Message::Log(args) => json!({ "type": "log", "args": args }),
            Message::Error(args) => json!({ "type": "error", "args": args }),
            Message::Done => json!({ "type": "done" }),
        }
    }

    /// Convenience constructor for a single-line error.
    pub fn error_text(text: impl Into<String>) -> Self {
        Message::Error(vec![Value::String(text.into())])
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Log(_) => "log",
            Message::Error(_) => "error",
            Message::Done => "done",
        }
    }
}

/// A message together with the run that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub run_id: RunId,
    pub message: Message,
}

/// Kind of a [`LogEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Log,
    Error,
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogKind::Log => f.write_str("log"),
            LogKind::Error => f.write_str("error"),
        }
    }
}

/// One line of console output, fully stringified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub kind: LogKind,
    pub text: String,
}

impl LogEntry {
    pub fn log(text: impl Into<String>) -> Self {
        Self {
            kind: LogKind::Log,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            kind: LogKind::Error,
            text: text.into(),
        }
    }
}

/// Stringifies one message argument.
///
/// Strings pass through, null becomes the empty string, other scalars use
/// their JSON spelling, objects and arrays are pretty-printed.
pub fn format_arg(arg: &Value) -> String {
    match arg {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(_) | Value::Number(_) => arg.to_string(),
        Value::Array(_) | Value::Object(_) => {
            serde_json::to_string_pretty(arg).unwrap_or_else(|_| arg.to_string())
        }
    }
}

/// Host-visible state of the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunState {
    /// No run in flight; the last one (if any) finished without errors.
    #[default]
    Idle,
    /// A run was started and its completion signal has not arrived.
    Running,
    /// The last run finished after reporting at least one error, or was
    /// rejected before it could start.
    Errored,
}

/// Folds channel messages into ordered log entries and a run state.
#[derive(Debug, Default)]
pub struct RunLog {
    entries: Vec<LogEntry>,
    state: RunState,
    current: Option<RunId>,
    saw_error: bool,
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn current_run(&self) -> Option<RunId> {
        self.current
    }

    /// Starts tracking a new run, discarding previous entries.
    pub fn begin(&mut self, run_id: RunId) {
        self.entries.clear();
        self.current = Some(run_id);
        self.saw_error = false;
        self.state = RunState::Running;
    }

    /// Marks `run_id` as rejected before it reached a sandbox.
    pub fn reject(&mut self, run_id: RunId, description: impl Into<String>) {
        self.entries.push(LogEntry::error(description));
        if self.current == Some(run_id) {
            self.saw_error = true;
            self.state = RunState::Errored;
        }
    }

    /// Drops all entries. The run state is left alone.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Applies one message.
    ///
    /// Entries from any run are appended in arrival order; only the current
    /// run's `done` ends the `Running` state.
    pub fn apply(&mut self, envelope: Envelope) {
        let is_current = self.current == Some(envelope.run_id);
        match envelope.message {
            Message::Log(args) => {
                self.entries
                    .extend(args.iter().map(|arg| LogEntry::log(format_arg(arg))));
            }
            Message::Error(args) => {
                if is_current && !args.is_empty() {
                    self.saw_error = true;
                }
                self.entries
                    .extend(args.iter().map(|arg| LogEntry::error(format_arg(arg))));
            }
            Message::Done => {
                if !is_current {
                    debug!(run_id = %envelope.run_id, "Ignoring completion of superseded run");
                    return;
                }
                if self.state == RunState::Running {
                    self.state = if self.saw_error {
                        RunState::Errored
                    } else {
                        RunState::Idle
                    };
                }
            }
        }
    }
}

/// Creates the channel. `capacity` bounds log/error messages per run.
pub fn message_channel(capacity: usize) -> (ChannelTx, ChannelRx) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ChannelTx { tx, capacity }, ChannelRx { rx })
}

/// Host-held producer side; hands out one [`RunSender`] per run.
#[derive(Debug, Clone)]
pub struct ChannelTx {
    tx: mpsc::UnboundedSender<Envelope>,
    capacity: usize,
}

impl ChannelTx {
    pub fn for_run(&self, run_id: RunId) -> RunSender {
        RunSender {
            run_id,
            tx: self.tx.clone(),
            remaining: Arc::new(AtomicUsize::new(self.capacity)),
            completed: Arc::new(AtomicBool::new(false)),
            overflowed: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Sandbox-held producer for a single run.
///
/// Clones share the message budget and the completion flag.
#[derive(Debug, Clone)]
pub struct RunSender {
    run_id: RunId,
    tx: mpsc::UnboundedSender<Envelope>,
    remaining: Arc<AtomicUsize>,
    completed: Arc<AtomicBool>,
    overflowed: Arc<AtomicBool>,
}

impl RunSender {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Whether a `done` has been sent for this run.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Sends a message. Returns false if it was dropped.
    ///
    /// Log and error messages beyond the run's budget are dropped; `done`
    /// always goes through.
    pub fn send(&self, message: Message) -> bool {
        match message {
            Message::Done => {
                self.completed.store(true, Ordering::Release);
            }
            Message::Log(_) | Message::Error(_) => {
                let admitted = self
                    .remaining
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
                        left.checked_sub(1)
                    })
                    .is_ok();
                if !admitted {
                    if !self.overflowed.swap(true, Ordering::AcqRel) {
                        warn!(run_id = %self.run_id, "Message budget exhausted, dropping further output");
                    }
                    return false;
                }
            }
        }

        let kind = message.kind();
        if self
            .tx
            .send(Envelope {
                run_id: self.run_id,
                message,
            })
            .is_err()
        {
            debug!(run_id = %self.run_id, kind, "Host receiver closed, message dropped");
            return false;
        }
        true
    }
}

/// Host-held consumer side.
#[derive(Debug)]
pub struct ChannelRx {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl ChannelRx {
    /// Next queued message, if any, without waiting.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// Waits for the next message.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }
}
