//! Core data model shared across the daemon, its readers, and the `ask`
//! client: `ReqId`/`Request`/`TaskResult`/`QueuedTask`/`SessionBinding`/
//! `CursorState`/`Event` from spec §3.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// One of the interactive AI terminal sessions `laskd` can route to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Claude,
    Codex,
    Gemini,
    Opencode,
    Droid,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::Codex => "codex",
            Provider::Gemini => "gemini",
            Provider::Opencode => "opencode",
            Provider::Droid => "droid",
        }
    }
}

/// Which terminal multiplexer a pane lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalKind {
    Tmux,
    Wezterm,
    Iterm2,
}

/// Who submitted a request; drives the completion-notifier's delivery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Caller {
    Claude,
    Codex,
    Droid,
    Email,
}

/// Dense, monotonically unique token per process:
/// `YYYYMMDD-HHMMSS-mmm-<pid>-<seq>`.
pub type ReqId = String;

/// An immutable submission. Created at submission, destroyed after the
/// completion notifier has been invoked (or skipped for cancellation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub req_id: ReqId,
    pub provider: Provider,
    pub work_dir: String,
    pub message: String,
    /// `-1` means unbounded.
    pub timeout_sec: f64,
    pub caller: Caller,
    pub output_path: Option<String>,
    pub email_context: Option<EmailContext>,
}

/// Exit codes mirrored 1:1 onto process exit status when invoked via the
/// `ask` CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExitCode {
    Success = 0,
    ConfigOrPaneError = 1,
    Timeout = 2,
}

/// Outcome of a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub req_id: ReqId,
    pub exit_code: ExitCode,
    pub reply: String,
    pub session_key: String,
    pub done_seen: bool,
    pub anchor_seen: bool,
    pub fallback_scan: bool,
    pub anchor_ms: Option<u64>,
    pub done_ms: Option<u64>,
}

impl TaskResult {
    /// Invariant 1: `doneSeen=true ⇒ exitCode=0` and `exitCode=0 ⇒
    /// doneSeen=true`.
    pub fn is_consistent(&self) -> bool {
        self.done_seen == matches!(self.exit_code, ExitCode::Success)
    }
}

/// Pairs a [`Request`] with its mutable queue state. Queued FIFO per
/// provider.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub request: Request,
    pub cancelled: Arc<AtomicBool>,
    pub started_ms: Option<u64>,
}

impl QueuedTask {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            cancelled: Arc::new(AtomicBool::new(false)),
            started_ms: None,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Persisted per `(work_dir, provider)`. See spec §3 for field invariants.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionBinding {
    pub work_dir: String,
    pub work_dir_norm: String,
    pub ccb_project_id: String,
    pub terminal: Option<TerminalKind>,
    pub pane_id: Option<String>,
    pub pane_title_marker: Option<String>,
    pub session_path: Option<String>,
    pub session_id: Option<String>,
    pub old_session_path: Option<String>,
    pub old_session_id: Option<String>,
    pub old_updated_at: Option<String>,
    pub updated_at: String,
    pub active: bool,
}

impl SessionBinding {
    /// Record a rotation: copy the previous path/id into `old_*` fields and
    /// set `old_updated_at`, but only when the path actually changed (spec
    /// §3 invariant: "exactly once per transition").
    pub fn rotate_to(&mut self, new_path: Option<String>, new_id: Option<String>, now: &str) {
        if self.session_path != new_path && self.session_path.is_some() {
            self.old_session_path = self.session_path.clone();
            self.old_session_id = self.session_id.clone();
            self.old_updated_at = Some(now.to_string());
        }
        self.session_path = new_path;
        self.session_id = new_id;
        self.updated_at = now.to_string();
    }
}

/// A capture of what has already been consumed by a log reader. Exists
/// only for the duration of a request wait; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CursorState {
    /// Conventional offset-based tailer cursor.
    FileTailer {
        path: String,
        offset: u64,
        /// Trailing unterminated line from the previous read.
        carry: String,
    },
    /// Message-database / snapshot cursor (Gemini, OpenCode).
    MessageCursor {
        session_id: String,
        session_updated_ts: Option<i64>,
        assistant_count: u64,
        last_assistant_id: Option<String>,
        last_assistant_completed_ts: Option<i64>,
        last_assistant_has_done_marker: bool,
    },
}

/// Role of an emitted conversational turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventRole {
    User,
    Assistant,
    System,
}

/// Produced by a log reader. Events from a single reader are totally
/// ordered by insertion time in the underlying log; readers never reorder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Turn { role: EventRole, text: String },
    /// Opaque assistant-reply snapshot (OpenCode's coalesced-reply model).
    AssistantSnapshot { text: String, completed: bool },
}

/// Email context envelope: `~/.laskd/mail/pending/<reqId>.json`, written
/// before submission and removed after delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailContext {
    pub request_id: String,
    pub message_id: String,
    pub from_addr: String,
    pub subject: String,
    pub thread_id: Option<String>,
    pub references: Vec<String>,
    pub timestamp: String,
}
