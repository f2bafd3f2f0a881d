//! Provider adapter: composes a codec variant, a `Box<dyn PaneDriver>`,
//! a `Box<dyn LogReader>` constructor, and the lifecycle policy for one
//! provider. No trait inheritance — narrow capability traits composed by
//! a plain struct (spec §4.6/§9).

use std::time::Duration;

use laskd_protocol::{Provider, TerminalKind};
use laskd_reader_core::{LogReader, PaneDriver, ReaderError, SelectionMode};

/// Dispatch to the provider-specific log reader and box it as a trait
/// object. `LogReader::bind` takes `Self: Sized`, so this free function
/// (not a trait method) is the seam where provider selection happens.
pub async fn bind_reader(
    provider: Provider,
    work_dir: &str,
    mode: SelectionMode,
) -> Result<Box<dyn LogReader>, ReaderError> {
    Ok(match provider {
        Provider::Claude => Box::new(laskd_reader_claude::ClaudeReader::bind(work_dir, mode).await?),
        Provider::Codex => Box::new(laskd_reader_codex::CodexReader::bind(work_dir, mode).await?),
        Provider::Gemini => Box::new(laskd_reader_gemini::GeminiReader::bind(work_dir, mode).await?),
        Provider::Droid => Box::new(laskd_reader_droid::DroidReader::bind(work_dir, mode).await?),
        Provider::Opencode => {
            Box::new(laskd_reader_opencode::OpenCodeReader::bind(work_dir, mode).await?)
        }
    })
}

/// Wrap a message with the req-id anchor/done-marker contract, phrased
/// per provider (spec §4.1).
pub fn wrap_prompt(provider: Provider, message: &str, req_id: &str) -> String {
    match provider {
        Provider::Claude => laskd_protocol::wrap_claude_prompt(message, req_id),
        Provider::Codex => laskd_protocol::wrap_codex_prompt(message, req_id),
        Provider::Gemini | Provider::Opencode | Provider::Droid => {
            laskd_protocol::wrap_default_prompt(message, req_id)
        }
    }
}

/// Select a `PaneDriver` backend for a binding's terminal kind, falling
/// back to environment probing when no binding exists yet (spec §4.3
/// supplemental `detect_terminal()`/`get_backend_for_session()`).
pub fn pane_driver_for(terminal: Option<TerminalKind>) -> Box<dyn PaneDriver> {
    laskd_pane_driver::backend_for(terminal.unwrap_or_else(crate::registry::detect_terminal))
}

/// Optional reply post-processing hook (spec §6.2): wired, identity by
/// default. A caller-supplied guardrails pass can be attached without the
/// core implementing the heuristics itself.
pub type ReplyHook = Box<dyn Fn(&str) -> String + Send + Sync>;

pub fn identity_hook() -> ReplyHook {
    Box::new(|s: &str| s.to_string())
}

/// One provider's composed capabilities plus its lifecycle policy knobs.
pub struct ProviderAdapter {
    pub provider: Provider,
    pub pane_check_interval: Duration,
    pub reply_hook: ReplyHook,
}

impl ProviderAdapter {
    pub fn new(provider: Provider, config: &laskd_protocol::Config) -> Self {
        Self {
            provider,
            pane_check_interval: config.pane_check_interval,
            reply_hook: identity_hook(),
        }
    }

    pub fn with_reply_hook(mut self, hook: ReplyHook) -> Self {
        self.reply_hook = hook;
        self
    }

    /// `onStart`: bind a pane driver and a fresh log reader for `work_dir`.
    pub async fn on_start(
        &self,
        work_dir: &str,
        terminal: Option<TerminalKind>,
        mode: SelectionMode,
    ) -> Result<(Box<dyn PaneDriver>, Box<dyn LogReader>), ReaderError> {
        let driver = pane_driver_for(terminal);
        let reader = bind_reader(self.provider, work_dir, mode).await?;
        Ok((driver, reader))
    }

    /// `onStop`: no persistent resources are held by a driver/reader
    /// beyond the request's scope, so this is a no-op hook point kept for
    /// symmetry with the distilled interface (spec §4.6).
    pub fn on_stop(&self) {}

    /// `loadSession`: resume an existing binding's reader without
    /// re-running full discovery, seeding its cursor from the tail
    /// instead of the start of the log (spec §4.3.6 rebind path).
    pub async fn load_session(
        &self,
        work_dir: &str,
        tail_bytes: u64,
    ) -> Result<Box<dyn LogReader>, ReaderError> {
        let mut reader = bind_reader(self.provider, work_dir, SelectionMode::Normal).await?;
        reader.seed_from_tail(tail_bytes).await?;
        Ok(reader)
    }

    pub fn apply_reply_hook(&self, text: &str) -> String {
        (self.reply_hook)(text)
    }
}
