//! Request lifecycle engine: the 8-step algorithm of spec §4.5, plus the
//! `ProviderDispatcher` that gives FIFO-per-provider scheduling without a
//! dedicated OS thread per request (one Tokio task per in-flight request,
//! awaited to completion before the next of that provider is dequeued).

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use laskd_protocol::{Config, CursorState, Event, EventRole, ExitCode, Provider, Request, TaskResult};
use laskd_reader_core::{LogReader, PaneDriver, SelectionMode};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::adapter::ProviderAdapter;
use crate::registry::SessionRegistry;

fn now_ms() -> u64 {
    // Monotonic-enough for elapsed-ms logging; never persisted.
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Runs the 8-step algorithm for one request and returns its [`TaskResult`].
pub struct LifecycleEngine {
    adapter: Arc<ProviderAdapter>,
    registry: Arc<SessionRegistry>,
}

impl LifecycleEngine {
    pub fn new(adapter: Arc<ProviderAdapter>, registry: Arc<SessionRegistry>) -> Self {
        Self { adapter, registry }
    }

    pub async fn handle_task(
        &self,
        request: Request,
        cancelled: Arc<std::sync::atomic::AtomicBool>,
    ) -> TaskResult {
        let started_at = now_ms();
        let provider = request.provider;
        let req_id = request.req_id.clone();

        info!(
            component = "lifecycle",
            event = "lifecycle.start",
            req_id = %req_id,
            provider = provider.as_str(),
            work_dir = %request.work_dir,
        );

        match self.run(&request, &cancelled, started_at).await {
            Ok(result) => result,
            Err(reply) => {
                let result = TaskResult {
                    req_id: req_id.clone(),
                    exit_code: ExitCode::ConfigOrPaneError,
                    reply,
                    session_key: request.work_dir.clone(),
                    done_seen: false,
                    anchor_seen: false,
                    fallback_scan: false,
                    anchor_ms: None,
                    done_ms: None,
                };
                info!(
                    component = "lifecycle",
                    event = "lifecycle.config_error",
                    req_id = %req_id,
                    provider = provider.as_str(),
                    reply = %result.reply,
                );
                result
            }
        }
    }

    /// `Err(reply)` corresponds to step 1/2's early `exitCode=1` exits;
    /// everything past pane acquisition is folded into the `Ok` path since
    /// every other outcome (timeout, done, cancel, pane death mid-wait) is
    /// itself a valid `TaskResult`.
    async fn run(
        &self,
        request: &Request,
        cancelled: &Arc<std::sync::atomic::AtomicBool>,
        started_at: u64,
    ) -> Result<TaskResult, String> {
        let provider = request.provider;
        let req_id = &request.req_id;
        let work_dir = Path::new(&request.work_dir);

        // Step 1: locate session.
        let mut binding = self
            .registry
            .get_or_load(work_dir, provider)
            .await
            .ok_or_else(|| "No active session for work_dir".to_string())?;

        let driver = crate::adapter::pane_driver_for(binding.terminal);

        // Step 2: acquire pane.
        let pane_id = self.ensure_pane(driver.as_ref(), &mut binding, request).await?;

        // Step 3: snapshot cursor.
        let mut reader = crate::adapter::bind_reader(provider, &request.work_dir, SelectionMode::Normal)
            .await
            .map_err(|e| format!("Session pane not available: {}", e))?;
        let mut state = reader.capture_state();

        // Step 4: inject.
        let prompt = crate::adapter::wrap_prompt(provider, &request.message, req_id);
        driver
            .send_text(&pane_id, &prompt)
            .await
            .map_err(|e| format!("Session pane not available: {}", e))?;

        // Step 5: wait.
        let deadline = if request.timeout_sec < 0.0 {
            None
        } else {
            Some(Instant::now() + Duration::from_secs_f64(request.timeout_sec))
        };
        let anchor_collect_deadline = Instant::now() + Config::ANCHOR_COLLECT_GRACE;
        let anchor_grace_deadline = Instant::now() + Config::ANCHOR_GRACE_DEADLINE;

        let mut anchor_seen = false;
        let mut anchor_ms = None;
        let mut done_seen = false;
        let mut done_ms = None;
        let mut fallback_scan = false;
        let mut rebounded = false;
        let mut chunks = String::new();
        let mut last_pane_check = Instant::now();
        let pane_check_interval = self.adapter.pane_check_interval;

        loop {
            if cancelled.load(std::sync::atomic::Ordering::SeqCst) {
                info!(
                    component = "lifecycle",
                    event = "lifecycle.cancelled",
                    req_id = %req_id,
                    provider = provider.as_str(),
                );
                return Ok(TaskResult {
                    req_id: req_id.clone(),
                    exit_code: ExitCode::Timeout,
                    reply: String::new(),
                    session_key: request.work_dir.clone(),
                    done_seen: false,
                    anchor_seen,
                    fallback_scan,
                    anchor_ms,
                    done_ms: None,
                });
            }

            if reader.detect_cancelled(req_id).await {
                info!(
                    component = "lifecycle",
                    event = "lifecycle.cancelled",
                    req_id = %req_id,
                    provider = provider.as_str(),
                    reason = "reader_detected",
                );
                cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
                return Ok(TaskResult {
                    req_id: req_id.clone(),
                    exit_code: ExitCode::Timeout,
                    reply: String::new(),
                    session_key: request.work_dir.clone(),
                    done_seen: false,
                    anchor_seen,
                    fallback_scan,
                    anchor_ms,
                    done_ms: None,
                });
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    break;
                }
            }

            if last_pane_check.elapsed() >= pane_check_interval {
                last_pane_check = Instant::now();
                match driver.is_alive(&pane_id).await {
                    Ok(true) => {}
                    Ok(false) | Err(_) => {
                        warn!(
                            component = "lifecycle",
                            event = "lifecycle.pane_died",
                            req_id = %req_id,
                            provider = provider.as_str(),
                        );
                        return Ok(TaskResult {
                            req_id: req_id.clone(),
                            exit_code: ExitCode::ConfigOrPaneError,
                            reply: "Pane died during request".to_string(),
                            session_key: request.work_dir.clone(),
                            done_seen: false,
                            anchor_seen,
                            fallback_scan,
                            anchor_ms,
                            done_ms: None,
                        });
                    }
                }
            }

            let remaining = deadline
                .map(|d| d.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::from_millis(500));
            let poll_window = remaining.min(Duration::from_millis(500));

            let (events, new_state) = match reader.wait_for_events(&state, poll_window).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(
                        component = "lifecycle",
                        event = "lifecycle.reader_error",
                        req_id = %req_id,
                        provider = provider.as_str(),
                        error = %e,
                    );
                    (Vec::new(), state.clone())
                }
            };
            state = new_state;

            for event in events {
                match event {
                    Event::Turn { role: EventRole::User, text } => {
                        if text.contains(&format!("{} {}", laskd_protocol::codec::REQ_ID_PREFIX, req_id)) {
                            anchor_seen = true;
                            anchor_ms.get_or_insert(now_ms() - started_at);
                        }
                    }
                    Event::Turn { role: EventRole::Assistant, text } => {
                        if !anchor_seen && Instant::now() < anchor_collect_deadline {
                            continue;
                        }
                        chunks.push_str(&text);
                        chunks.push('\n');
                        if laskd_protocol::is_done_text(&chunks, req_id) {
                            done_seen = true;
                            done_ms = Some(now_ms() - started_at);
                            break;
                        }
                    }
                    Event::Turn { role: EventRole::System, .. } => {}
                    Event::AssistantSnapshot { text, completed } => {
                        if !anchor_seen {
                            anchor_seen = true;
                            anchor_ms.get_or_insert(now_ms() - started_at);
                        }
                        chunks = text;
                        if completed {
                            done_seen = true;
                            done_ms = Some(now_ms() - started_at);
                        }
                    }
                }
            }

            if done_seen {
                break;
            }

            if !rebounded && !anchor_seen && Instant::now() >= anchor_grace_deadline {
                info!(
                    component = "lifecycle",
                    event = "lifecycle.rebind",
                    req_id = %req_id,
                    provider = provider.as_str(),
                );
                match crate::adapter::bind_reader(provider, &request.work_dir, SelectionMode::Permissive).await {
                    Ok(mut fresh) => {
                        if let Ok(tail_state) = fresh.seed_from_tail(Config::from_env().rebind_tail_bytes).await {
                            state = tail_state;
                            reader = fresh;
                            fallback_scan = true;
                        }
                    }
                    Err(e) => {
                        warn!(
                            component = "lifecycle",
                            event = "lifecycle.rebind_failed",
                            req_id = %req_id,
                            provider = provider.as_str(),
                            error = %e,
                        );
                    }
                }
                rebounded = true;
            }
        }

        // Step 6: extract.
        let reply = laskd_protocol::extract_reply_for_req(&chunks, req_id);
        let reply = self.adapter.apply_reply_hook(&reply);

        // Step 7: classify.
        let exit_code = if done_seen {
            ExitCode::Success
        } else {
            ExitCode::Timeout
        };

        info!(
            component = "lifecycle",
            event = if done_seen { "lifecycle.done" } else { "lifecycle.timeout" },
            req_id = %req_id,
            provider = provider.as_str(),
            elapsed_ms = now_ms() - started_at,
        );

        Ok(TaskResult {
            req_id: req_id.clone(),
            exit_code,
            reply,
            session_key: request.work_dir.clone(),
            done_seen,
            anchor_seen,
            fallback_scan,
            anchor_ms,
            done_ms,
        })
    }

    /// Step 2: use the stored `pane_id` if live, else search by title
    /// marker and persist the update.
    async fn ensure_pane(
        &self,
        driver: &dyn PaneDriver,
        binding: &mut laskd_protocol::SessionBinding,
        request: &Request,
    ) -> Result<String, String> {
        if let Some(pane_id) = &binding.pane_id {
            if matches!(driver.is_alive(pane_id).await, Ok(true)) {
                return Ok(pane_id.clone());
            }
        }

        if let Some(marker) = &binding.pane_title_marker {
            if let Ok(Some(found)) = driver.find_pane_by_title_marker(marker).await {
                binding.pane_id = Some(found.clone());
                binding.updated_at = chrono::Utc::now().to_rfc3339();
                let _ = crate::session_file::write_binding(
                    Path::new(&request.work_dir),
                    request.provider,
                    binding,
                )
                .await;
                self.registry
                    .install(&request.work_dir, request.provider, binding.clone())
                    .await;
                return Ok(found);
            }
        }

        Err("Session pane not available: no live pane found".to_string())
    }
}

/// One FIFO queue per provider: a single-consumer `mpsc` channel whose
/// worker awaits each task's full lifecycle before dequeuing the next,
/// serializing pane injections for that provider (spec §4.5/§5).
pub struct ProviderDispatcher {
    tx: mpsc::UnboundedSender<DispatchedTask>,
}

struct DispatchedTask {
    request: Request,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
    reply_tx: tokio::sync::oneshot::Sender<TaskResult>,
}

impl ProviderDispatcher {
    pub fn spawn(engine: Arc<LifecycleEngine>, notifier: Arc<crate::notifier::CompletionNotifier>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<DispatchedTask>();

        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                let result = engine.handle_task(task.request.clone(), task.cancelled.clone()).await;
                if !task.cancelled.load(std::sync::atomic::Ordering::SeqCst) {
                    notifier.notify(&task.request, &result).await;
                }
                let _ = task.reply_tx.send(result);
            }
        });

        Self { tx }
    }

    /// Enqueue a request; returns a cancellation flag and a receiver for
    /// the eventual [`TaskResult`].
    pub fn submit(
        &self,
        request: Request,
    ) -> (
        Arc<std::sync::atomic::AtomicBool>,
        tokio::sync::oneshot::Receiver<TaskResult>,
    ) {
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let _ = self.tx.send(DispatchedTask {
            request,
            cancelled: cancelled.clone(),
            reply_tx,
        });
        (cancelled, reply_rx)
    }
}

/// Map-of-dispatchers keyed by provider, built once at boot.
pub struct Dispatchers {
    by_provider: std::collections::HashMap<Provider, ProviderDispatcher>,
}

impl Dispatchers {
    pub fn new(by_provider: std::collections::HashMap<Provider, ProviderDispatcher>) -> Self {
        Self { by_provider }
    }

    pub fn get(&self, provider: Provider) -> Option<&ProviderDispatcher> {
        self.by_provider.get(&provider)
    }
}
