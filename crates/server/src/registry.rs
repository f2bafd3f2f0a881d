//! Session registry: the authoritative in-memory map from `(work_dir,
//! provider)` to its current binding, refreshed on a 10s monitor loop.
//! Grounded on `examples/original_source/lib/laskd_registry.py`'s
//! coarse-lock-then-unlocked-I/O pattern, priority order, and "never
//! downgrade to an older mtime" invariant (spec §4.4/§5).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use laskd_protocol::{Provider, SessionBinding, TerminalKind};
use laskd_reader_core::{LogReader, PaneDriver, ReaderError, SelectionMode};
use laskd_reader_opencode::OpenCodeReader;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::session_file;

/// Everything the registry tracks about one `(work_dir, provider)` pair
/// between monitor ticks.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub binding: SessionBinding,
    /// Seconds to wait before the next refresh attempt; grows via
    /// [`laskd_protocol::next_bind_backoff_secs`] on repeated failures,
    /// resets to the base interval on success.
    pub next_refresh_in: u64,
    pub last_refreshed_at: Instant,
    /// Consecutive ticks this entry's pane/log was found invalid; past
    /// `REGISTRY_EVICT_AFTER` worth of ticks the entry is dropped.
    pub invalid_since: Option<Instant>,
}

impl RegistryEntry {
    fn fresh(binding: SessionBinding) -> Self {
        Self {
            binding,
            next_refresh_in: laskd_protocol::Config::BIND_REFRESH_BASE_SECS,
            last_refreshed_at: Instant::now(),
            invalid_since: None,
        }
    }
}

type RegistryKey = (String, Provider);

/// Coarse lock around the binding map (spec §5: "a single coarse mutex").
/// I/O (log-reader `bind`, session-file read/write) always happens
/// outside the lock; the lock is taken only to read/install a snapshot.
pub struct SessionRegistry {
    entries: Mutex<HashMap<RegistryKey, RegistryEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub async fn get(&self, work_dir: &str, provider: Provider) -> Option<SessionBinding> {
        let key = (work_dir.to_string(), provider);
        self.entries.lock().await.get(&key).map(|e| e.binding.clone())
    }

    /// Load from disk (or reuse the in-memory copy) without re-running
    /// discovery; used by the lifecycle engine at request-submission time.
    pub async fn get_or_load(&self, work_dir: &Path, provider: Provider) -> Option<SessionBinding> {
        let key = (work_dir.to_string_lossy().to_string(), provider);
        if let Some(entry) = self.entries.lock().await.get(&key) {
            return Some(entry.binding.clone());
        }
        let binding = session_file::read_binding(work_dir, provider).await?;
        self.entries
            .lock()
            .await
            .insert(key, RegistryEntry::fresh(binding.clone()));
        Some(binding)
    }

    /// Install a freshly-resolved binding, applying the "never downgrade
    /// to an older mtime" invariant: a refresh that resolves to an older
    /// `updated_at` than what's already recorded is discarded.
    pub async fn install(&self, work_dir: &str, provider: Provider, binding: SessionBinding) {
        let key = (work_dir.to_string(), provider);
        let mut guard = self.entries.lock().await;
        match guard.get(&key) {
            Some(existing) if existing.binding.updated_at > binding.updated_at => {
                debug!(
                    component = "registry",
                    event = "registry.stale_refresh_discarded",
                    work_dir,
                    provider = provider.as_str(),
                    "discarding refresh with older updated_at than current entry"
                );
            }
            _ => {
                guard.insert(key, RegistryEntry::fresh(binding));
            }
        }
    }

    pub async fn mark_invalid(&self, work_dir: &str, provider: Provider) {
        let key = (work_dir.to_string(), provider);
        let mut guard = self.entries.lock().await;
        if let Some(entry) = guard.get_mut(&key) {
            entry.invalid_since.get_or_insert(Instant::now());
        }
    }

    pub async fn mark_valid(&self, work_dir: &str, provider: Provider) {
        let key = (work_dir.to_string(), provider);
        let mut guard = self.entries.lock().await;
        if let Some(entry) = guard.get_mut(&key) {
            entry.invalid_since = None;
        }
    }

    /// Remove entries that have been invalid for longer than
    /// `REGISTRY_EVICT_AFTER` (spec §4.4 eviction threshold).
    async fn evict_stale(&self) {
        let mut guard = self.entries.lock().await;
        let evict_after = laskd_protocol::Config::REGISTRY_EVICT_AFTER;
        let before = guard.len();
        guard.retain(|_, entry| match entry.invalid_since {
            Some(since) => since.elapsed() < evict_after,
            None => true,
        });
        let evicted = before - guard.len();
        if evicted > 0 {
            info!(
                component = "registry",
                event = "registry.evicted",
                count = evicted,
                "evicted stale entries"
            );
        }
    }

    /// Snapshot of keys due for a refresh this tick.
    async fn due_for_refresh(&self) -> Vec<RegistryKey> {
        let guard = self.entries.lock().await;
        guard
            .iter()
            .filter(|(_, entry)| {
                entry.last_refreshed_at.elapsed() >= Duration::from_secs(entry.next_refresh_in)
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    async fn bump_backoff(&self, key: &RegistryKey) {
        let mut guard = self.entries.lock().await;
        if let Some(entry) = guard.get_mut(key) {
            entry.next_refresh_in = laskd_protocol::next_bind_backoff_secs(entry.next_refresh_in);
            entry.last_refreshed_at = Instant::now();
        }
    }

    /// All `(work_dir, provider)` pairs whose binding is for `provider`.
    /// Used by the simplified filesystem-watcher reaction (see module docs).
    async fn keys_for_provider(&self, provider: Provider) -> Vec<RegistryKey> {
        let guard = self.entries.lock().await;
        guard.keys().filter(|(_, p)| *p == provider).cloned().collect()
    }

    /// Force the next monitor tick to re-run discovery for every entry of
    /// `provider`, regardless of backoff. A simplified stand-in for exact
    /// per-`workDir` `cwd` matching against the new log file (spec §4.4
    /// "react to new `*.jsonl` files"): re-running bind for every
    /// in-memory entry of that provider is cheap (bounded by how many
    /// distinct project work_dirs are active) and converges to the same
    /// end state one tick later. Documented as a deliberate simplification
    /// in the grounding ledger rather than hidden behind an exact match.
    pub async fn poke_provider(&self, provider: Provider) {
        let mut guard = self.entries.lock().await;
        for (key, entry) in guard.iter_mut() {
            if key.1 == provider {
                entry.next_refresh_in = 0;
            }
        }
    }

    /// Snapshot of entries not already marked invalid, for the monitor
    /// loop's per-tick liveness pass (spec.md:171).
    async fn valid_entries(&self) -> Vec<(RegistryKey, SessionBinding)> {
        let guard = self.entries.lock().await;
        guard
            .iter()
            .filter(|(_, entry)| entry.invalid_since.is_none())
            .map(|(key, entry)| (key.clone(), entry.binding.clone()))
            .collect()
    }
}

/// Resolves a fresh binding for one `(work_dir, provider)` pair by
/// rerunning provider-specific discovery. One impl per provider family;
/// a blanket impl covers the four readers whose `capture_state()` is
/// immediately meaningful after `bind()` (Claude, Codex, Gemini, Droid).
/// OpenCode needs its own impl since its cursor isn't populated until
/// `wait_for_events` runs once.
#[async_trait]
pub trait BindingResolver: Send + Sync {
    async fn resolve(&self, work_dir: &str, mode: SelectionMode) -> Result<ResolvedBinding, ReaderError>;
}

pub struct ResolvedBinding {
    pub session_path: Option<String>,
    pub session_id: Option<String>,
}

pub struct ReaderBindingResolver<R> {
    _marker: std::marker::PhantomData<R>,
}

impl<R> ReaderBindingResolver<R> {
    pub fn new() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }
}

impl<R> Default for ReaderBindingResolver<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R> BindingResolver for ReaderBindingResolver<R>
where
    R: LogReader + 'static,
{
    async fn resolve(&self, work_dir: &str, mode: SelectionMode) -> Result<ResolvedBinding, ReaderError> {
        let reader = R::bind(work_dir, mode).await?;
        let (path, id) = match reader.capture_state() {
            laskd_protocol::CursorState::FileTailer { path, .. } => (Some(path), None),
            laskd_protocol::CursorState::MessageCursor { session_id, .. } => {
                (None, Some(session_id))
            }
        };
        Ok(ResolvedBinding {
            session_path: path,
            session_id: id,
        })
    }
}

pub struct OpenCodeBindingResolver;

#[async_trait]
impl BindingResolver for OpenCodeBindingResolver {
    async fn resolve(&self, work_dir: &str, mode: SelectionMode) -> Result<ResolvedBinding, ReaderError> {
        let reader = OpenCodeReader::bind(work_dir, mode).await?;
        Ok(ResolvedBinding {
            session_path: Some(reader.project_id().to_string()),
            session_id: reader.resolve_session_id(),
        })
    }
}

pub fn resolver_for(provider: Provider) -> Box<dyn BindingResolver> {
    match provider {
        Provider::Claude => Box::new(ReaderBindingResolver::<laskd_reader_claude::ClaudeReader>::new()),
        Provider::Codex => Box::new(ReaderBindingResolver::<laskd_reader_codex::CodexReader>::new()),
        Provider::Gemini => Box::new(ReaderBindingResolver::<laskd_reader_gemini::GeminiReader>::new()),
        Provider::Droid => Box::new(ReaderBindingResolver::<laskd_reader_droid::DroidReader>::new()),
        Provider::Opencode => Box::new(OpenCodeBindingResolver),
    }
}

/// Run one refresh pass (used both by the periodic monitor and by
/// `poke_provider`'s forced-reload path) and persist+install the result.
async fn refresh_entry(
    registry: &Arc<SessionRegistry>,
    work_dir: &str,
    provider: Provider,
) -> Result<(), ReaderError> {
    let resolver = resolver_for(provider);
    let resolved = resolver.resolve(work_dir, SelectionMode::Normal).await?;

    let path = PathBuf::from(work_dir);
    let existing = session_file::read_binding(&path, provider).await;
    let now = chrono::Utc::now().to_rfc3339();

    let binding = match existing {
        Some(current) => {
            session_file::rotate_and_persist(
                &path,
                provider,
                current,
                resolved.session_path,
                resolved.session_id,
                &now,
            )
            .await
            .map_err(ReaderError::Io)?
        }
        None => {
            let mut fresh = SessionBinding {
                work_dir: work_dir.to_string(),
                work_dir_norm: laskd_protocol::normalize_work_dir(work_dir),
                ccb_project_id: laskd_protocol::compute_ccb_project_id(&path),
                terminal: None,
                pane_id: None,
                pane_title_marker: None,
                session_path: resolved.session_path,
                session_id: resolved.session_id,
                old_session_path: None,
                old_session_id: None,
                old_updated_at: None,
                updated_at: now,
                active: true,
            };
            fresh.active = true;
            session_file::write_binding(&path, provider, &fresh)
                .await
                .map_err(ReaderError::Io)?;
            fresh
        }
    };

    registry.install(work_dir, provider, binding).await;
    registry.mark_valid(work_dir, provider).await;
    Ok(())
}

/// Per-tick liveness pass (spec.md:171), independent of the backoff-gated
/// refresh: the session file may have disappeared since the last check,
/// its on-disk `updated_at` may have moved past what's cached (another
/// process wrote it), or its pane may have died between requests.
async fn check_liveness(
    registry: &Arc<SessionRegistry>,
    work_dir: &str,
    provider: Provider,
    cached: &SessionBinding,
) {
    let path = PathBuf::from(work_dir);
    let Some(fresh) = session_file::read_binding(&path, provider).await else {
        debug!(
            component = "registry",
            event = "registry.session_file_missing",
            work_dir,
            provider = provider.as_str(),
        );
        registry.mark_invalid(work_dir, provider).await;
        return;
    };

    let current = if fresh.updated_at != cached.updated_at {
        registry.install(work_dir, provider, fresh.clone()).await;
        fresh
    } else {
        cached.clone()
    };

    let Some(pane_id) = &current.pane_id else {
        return;
    };
    let driver = crate::adapter::pane_driver_for(current.terminal);
    match driver.is_alive(pane_id).await {
        Ok(true) => {}
        _ => {
            debug!(
                component = "registry",
                event = "registry.pane_dead",
                work_dir,
                provider = provider.as_str(),
            );
            registry.mark_invalid(work_dir, provider).await;
        }
    }
}

/// The 10-second monitor loop (spec §4.4). Runs for the daemon's
/// lifetime; never returns on its own.
pub async fn run_monitor_loop(registry: Arc<SessionRegistry>) {
    let mut ticker = tokio::time::interval(laskd_protocol::Config::REGISTRY_MONITOR_INTERVAL);
    loop {
        ticker.tick().await;
        registry.evict_stale().await;

        for ((work_dir, provider), cached) in registry.valid_entries().await {
            check_liveness(&registry, &work_dir, provider, &cached).await;
        }

        let due = registry.due_for_refresh().await;
        for (work_dir, provider) in due {
            match refresh_entry(&registry, &work_dir, provider).await {
                Ok(()) => {
                    debug!(
                        component = "registry",
                        event = "registry.refreshed",
                        work_dir = %work_dir,
                        provider = provider.as_str(),
                    );
                }
                Err(e) => {
                    warn!(
                        component = "registry",
                        event = "registry.refresh_failed",
                        work_dir = %work_dir,
                        provider = provider.as_str(),
                        error = %e,
                        "binding refresh failed; backing off"
                    );
                    registry.mark_invalid(&work_dir, provider).await;
                    registry.bump_backoff(&(work_dir, provider)).await;
                }
            }
        }
    }
}

/// Optional filesystem watcher over each provider's log root, debounced
/// at `ROOT_WATCHER_DEBOUNCE` (spec §4.4 supplemental). On a burst of
/// `*.jsonl`/storage-file events it pokes every in-memory entry for that
/// provider so the next monitor tick re-resolves bindings, rather than
/// attempting exact per-workDir `cwd` matching inline on the watcher
/// thread (see [`SessionRegistry::poke_provider`]).
pub fn spawn_root_watcher(
    registry: Arc<SessionRegistry>,
    provider: Provider,
    root: PathBuf,
) -> Option<tokio::task::JoinHandle<()>> {
    if !root.exists() {
        return None;
    }

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    let mut watcher = match notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        if res.is_ok() {
            let _ = tx.send(());
        }
    }) {
        Ok(w) => w,
        Err(e) => {
            warn!(
                component = "registry",
                event = "registry.watcher_init_failed",
                provider = provider.as_str(),
                error = %e,
            );
            return None;
        }
    };

    use notify::Watcher;
    if let Err(e) = watcher.watch(&root, notify::RecursiveMode::Recursive) {
        warn!(
            component = "registry",
            event = "registry.watch_failed",
            path = %root.display(),
            error = %e,
        );
        return None;
    }

    Some(tokio::spawn(async move {
        // Keep the watcher alive for the task's lifetime.
        let _watcher = watcher;
        let debounce = laskd_protocol::Config::ROOT_WATCHER_DEBOUNCE;
        loop {
            if rx.recv().await.is_none() {
                return;
            }
            // Drain any further events that land inside the debounce window.
            let deadline = tokio::time::sleep(debounce);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    more = rx.recv() => if more.is_none() { return },
                }
            }
            registry.poke_provider(provider).await;
        }
    }))
}

/// Root directory each provider's reader scans, mirrored from the
/// per-crate `*_root()` helpers (env override, then a fixed default
/// under `$HOME`) so [`spawn_root_watcher`] can watch without requiring
/// those crates to export the path.
pub fn provider_log_root(provider: Provider) -> PathBuf {
    let home = || dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    match provider {
        Provider::Claude => std::env::var("CCB_CLAUDE_PROJECTS_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home().join(".claude").join("projects")),
        Provider::Codex => std::env::var("CCB_CODEX_LOG_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home().join(".codex").join("sessions")),
        Provider::Gemini => std::env::var("CCB_GEMINI_CHATS_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home().join(".gemini").join("chats")),
        Provider::Droid => std::env::var("CCB_DROID_LOG_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| home().join(".factory").join("sessions")),
        Provider::Opencode => std::env::var("OPENCODE_STORAGE_ROOT")
            .map(PathBuf::from)
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| {
                dirs::data_local_dir()
                    .unwrap_or_else(|| home().join(".local").join("share"))
                    .join("opencode")
                    .join("storage")
            }),
    }
}

/// Detect the terminal multiplexer hosting a pane absent an existing
/// binding, by environment probing (spec §4.3 supplemental
/// `detect_terminal()`): WezTerm sets `TERM_PROGRAM=WezTerm`, iTerm2 sets
/// `TERM_PROGRAM=iTerm.app`; everything else running inside `tmux`
/// (`TMUX` env var set) falls back to tmux.
pub fn detect_terminal() -> TerminalKind {
    match std::env::var("TERM_PROGRAM").as_deref() {
        Ok("WezTerm") => TerminalKind::Wezterm,
        Ok("iTerm.app") => TerminalKind::Iterm2,
        _ => TerminalKind::Tmux,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(updated_at: &str) -> SessionBinding {
        SessionBinding {
            work_dir: "/w".to_string(),
            work_dir_norm: "/w".to_string(),
            ccb_project_id: "abc".to_string(),
            terminal: None,
            pane_id: None,
            pane_title_marker: None,
            session_path: Some("/log.jsonl".to_string()),
            session_id: None,
            old_session_path: None,
            old_session_id: None,
            old_updated_at: None,
            updated_at: updated_at.to_string(),
            active: true,
        }
    }

    #[tokio::test]
    async fn install_never_downgrades_to_older_mtime() {
        let registry = SessionRegistry::new();
        registry
            .install("/w", Provider::Claude, sample("2026-01-02T00:00:00Z"))
            .await;
        registry
            .install("/w", Provider::Claude, sample("2026-01-01T00:00:00Z"))
            .await;

        let current = registry.get("/w", Provider::Claude).await.unwrap();
        assert_eq!(current.updated_at, "2026-01-02T00:00:00Z");
    }

    #[tokio::test]
    async fn install_accepts_newer_mtime() {
        let registry = SessionRegistry::new();
        registry
            .install("/w", Provider::Claude, sample("2026-01-01T00:00:00Z"))
            .await;
        registry
            .install("/w", Provider::Claude, sample("2026-01-02T00:00:00Z"))
            .await;

        let current = registry.get("/w", Provider::Claude).await.unwrap();
        assert_eq!(current.updated_at, "2026-01-02T00:00:00Z");
    }

    #[tokio::test]
    async fn invariant10_eviction_after_threshold() {
        let registry = SessionRegistry::new();
        registry.install("/w", Provider::Claude, sample("2026-01-01T00:00:00Z")).await;
        registry.mark_invalid("/w", Provider::Claude).await;

        {
            let mut guard = registry.entries.lock().await;
            let entry = guard.get_mut(&("/w".to_string(), Provider::Claude)).unwrap();
            entry.invalid_since = Some(Instant::now() - Duration::from_secs(301));
        }

        registry.evict_stale().await;
        assert!(registry.get("/w", Provider::Claude).await.is_none());
    }

    #[tokio::test]
    async fn poke_provider_forces_immediate_refresh_eligibility() {
        let registry = SessionRegistry::new();
        registry.install("/w", Provider::Claude, sample("2026-01-01T00:00:00Z")).await;
        registry.poke_provider(Provider::Claude).await;
        let due = registry.due_for_refresh().await;
        assert_eq!(due, vec![("/w".to_string(), Provider::Claude)]);
    }

    #[test]
    fn detect_terminal_defaults_to_tmux() {
        std::env::remove_var("TERM_PROGRAM");
        assert_eq!(detect_terminal(), TerminalKind::Tmux);
    }

    #[tokio::test]
    async fn check_liveness_invalidates_when_session_file_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let work_dir = tmp.path().to_string_lossy().to_string();
        let registry = SessionRegistry::new();
        registry
            .install(&work_dir, Provider::Claude, sample("2026-01-01T00:00:00Z"))
            .await;
        let cached = registry.get(&work_dir, Provider::Claude).await.unwrap();

        check_liveness(&registry, &work_dir, Provider::Claude, &cached).await;

        let guard = registry.entries.lock().await;
        let entry = guard.get(&(work_dir, Provider::Claude)).unwrap();
        assert!(entry.invalid_since.is_some());
    }

    #[tokio::test]
    async fn check_liveness_reloads_when_session_file_mtime_changed() {
        let tmp = tempfile::tempdir().unwrap();
        let work_dir = tmp.path().to_string_lossy().to_string();
        let registry = SessionRegistry::new();
        registry
            .install(&work_dir, Provider::Claude, sample("2026-01-01T00:00:00Z"))
            .await;
        let cached = registry.get(&work_dir, Provider::Claude).await.unwrap();

        let mut fresh = sample("2026-01-02T00:00:00Z");
        fresh.work_dir = work_dir.clone();
        fresh.work_dir_norm = work_dir.clone();
        crate::session_file::write_binding(tmp.path(), Provider::Claude, &fresh)
            .await
            .unwrap();

        check_liveness(&registry, &work_dir, Provider::Claude, &cached).await;

        let current = registry.get(&work_dir, Provider::Claude).await.unwrap();
        assert_eq!(current.updated_at, "2026-01-02T00:00:00Z");
    }

    #[tokio::test]
    async fn check_liveness_invalidates_when_pane_unreachable() {
        let tmp = tempfile::tempdir().unwrap();
        let work_dir = tmp.path().to_string_lossy().to_string();
        let mut binding = sample("2026-01-01T00:00:00Z");
        binding.work_dir = work_dir.clone();
        binding.work_dir_norm = work_dir.clone();
        binding.terminal = Some(TerminalKind::Tmux);
        binding.pane_id = Some("laskd-test-nonexistent-pane".to_string());
        crate::session_file::write_binding(tmp.path(), Provider::Claude, &binding)
            .await
            .unwrap();

        let registry = SessionRegistry::new();
        registry.install(&work_dir, Provider::Claude, binding).await;
        let cached = registry.get(&work_dir, Provider::Claude).await.unwrap();

        check_liveness(&registry, &work_dir, Provider::Claude, &cached).await;

        let guard = registry.entries.lock().await;
        let entry = guard.get(&(work_dir, Provider::Claude)).unwrap();
        assert!(entry.invalid_since.is_some());
    }
}
