//! Narrow capability traits shared by every provider reader and pane
//! driver: `LogReader` (spec §4.3.6) and `PaneDriver` (spec §4.2). Kept as
//! plain trait objects — no inheritance chains, composed inside an
//! `Adapter` struct by the daemon (spec §9).

use std::time::Duration;

use async_trait::async_trait;
use laskd_protocol::{CursorState, Event};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("no matching log found for work_dir")]
    NoMatchingLog,
    #[error("reader channel closed")]
    ChannelClosed,
}

#[derive(Debug, Error)]
pub enum PaneError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("pane not found: {0}")]
    NotFound(String),
    #[error("backend not implemented on this host: {0}")]
    Unsupported(String),
}

/// Whether a binding-selection pass should consult cached indexes
/// (`sessions-index.json`) or ignore them — used by the rebind path (spec
/// §4.3.1 "Rebinding").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    Normal,
    /// Ignore `sessions-index.json` / cached hints; rescan from scratch.
    Permissive,
}

/// One provider's log/storage reader. Reader objects are not required to
/// be thread-safe; the lifecycle engine guarantees single-threaded use per
/// active request (spec §4.3.6).
#[async_trait]
pub trait LogReader: Send {
    /// Locate the correct log/storage for `work_dir` and build a fresh
    /// reader bound to it, in the given selection mode.
    async fn bind(work_dir: &str, mode: SelectionMode) -> Result<Self, ReaderError>
    where
        Self: Sized;

    /// Snapshot of "already consumed", used as the wait-loop baseline.
    fn capture_state(&self) -> CursorState;

    /// Re-seed this reader's cursor from a tail window instead of the
    /// start of the log (used after a rebind, spec §4.3.6 / §6
    /// `CCB_LASKD_REBIND_TAIL_BYTES`).
    async fn seed_from_tail(&mut self, tail_bytes: u64) -> Result<CursorState, ReaderError>;

    /// Block up to `dt` polling the underlying storage with
    /// provider-specific cadence. Returns events produced strictly after
    /// `state`, plus an updated cursor. Never re-emits already-seen
    /// events. Safe to call repeatedly.
    async fn wait_for_events(
        &mut self,
        state: &CursorState,
        dt: Duration,
    ) -> Result<(Vec<Event>, CursorState), ReaderError>;

    /// Offline aid for context extraction; not used on the hot path.
    async fn latest_conversations(&self, n: usize) -> Result<Vec<(String, String)>, ReaderError>;

    /// Out-of-band cancellation signal beyond the cooperative `cancelled`
    /// flag (OpenCode's two abort-detection paths, spec §4.3.4). Polled
    /// alongside the wait loop's flag check; default: no extra signal.
    async fn detect_cancelled(&mut self, _req_id: &str) -> bool {
        false
    }
}

/// Write text into a named pane; probe liveness; find a pane by title
/// marker. The only ordering guarantee required: sends to a single
/// `pane_id` are linearizable (the underlying terminal serializes them).
#[async_trait]
pub trait PaneDriver: Send + Sync {
    /// Inject `text` followed by an Enter keystroke. Atomic with respect
    /// to partial lines: multi-line text is pasted as one unit, then
    /// Enter.
    async fn send_text(&self, pane_id: &str, text: &str) -> Result<(), PaneError>;

    async fn is_alive(&self, pane_id: &str) -> Result<bool, PaneError>;

    /// Optional: WezTerm/tmux expose pane titles.
    async fn find_pane_by_title_marker(&self, marker: &str) -> Result<Option<String>, PaneError>;

    async fn kill_pane(&self, pane_id: &str) -> Result<(), PaneError>;

    async fn activate(&self, pane_id: &str) -> Result<(), PaneError>;

    async fn create_pane(
        &self,
        cmd: &str,
        cwd: &str,
        direction: SplitDirection,
        percent: u8,
        parent_pane: Option<&str>,
    ) -> Result<String, PaneError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitDirection {
    Horizontal,
    Vertical,
}
