//! Completion notifier: out-of-band delivery of a finished request's
//! result. Never blocks the lifecycle engine beyond a brief join (spec
//! §4.7). Errors here are logged and never alter the `TaskResult` that
//! already went back to the caller.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use laskd_protocol::{Caller, Request, TaskResult};
use serde::Serialize;
use tracing::{info, warn};

const HOOK_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const HOOK_RUN_TIMEOUT: Duration = Duration::from_secs(60);
const SMTP_BACKOFFS_SECS: [u64; 3] = [2, 4, 8];

/// `{provider, reqId, reply, doneSeen, caller}`, handed to the hook
/// script / written to `outputPath` (spec §4.7).
#[derive(Debug, Serialize)]
struct Envelope<'a> {
    provider: &'a str,
    req_id: &'a str,
    reply: &'a str,
    done_seen: bool,
    caller: &'a str,
}

fn caller_str(caller: Caller) -> &'static str {
    match caller {
        Caller::Claude => "claude",
        Caller::Codex => "codex",
        Caller::Droid => "droid",
        Caller::Email => "email",
    }
}

/// SMTP delivery is an external collaborator (out of scope); this trait
/// is the seam a real sender plugs into. The daemon's default is a
/// logging no-op, matching the distilled Non-goal on wire code.
#[async_trait]
pub trait SmtpSender: Send + Sync {
    async fn send_reply(
        &self,
        ctx: &laskd_protocol::EmailContext,
        reply: &str,
    ) -> Result<(), String>;
}

pub struct NullSmtpSender;

#[async_trait]
impl SmtpSender for NullSmtpSender {
    async fn send_reply(&self, ctx: &laskd_protocol::EmailContext, _reply: &str) -> Result<(), String> {
        warn!(
            component = "notifier",
            event = "notifier.smtp_sender_unconfigured",
            request_id = %ctx.request_id,
            "no SmtpSender configured; dropping email notification"
        );
        Err("no SMTP sender configured".to_string())
    }
}

/// Discovers the completion-hook binary: `CCB_COMPLETION_HOOK_PATH` env
/// override, then platform candidates, then `PATH` lookup for
/// `ccb-completion-hook` (spec §6.2, ported from `completion_hook.py`).
fn discover_hook_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CCB_COMPLETION_HOOK_PATH") {
        let p = PathBuf::from(path);
        if p.is_file() {
            return Some(p);
        }
    }

    let candidates: Vec<PathBuf> = if cfg!(target_os = "windows") {
        std::env::var("LOCALAPPDATA")
            .ok()
            .map(|local| PathBuf::from(local).join("laskd").join("ccb-completion-hook.exe"))
            .into_iter()
            .collect()
    } else {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        vec![
            home.join(".local/bin/ccb-completion-hook"),
            PathBuf::from("/usr/local/bin/ccb-completion-hook"),
            PathBuf::from("/usr/bin/ccb-completion-hook"),
        ]
    };

    for candidate in candidates {
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    which_on_path("ccb-completion-hook")
}

fn which_on_path(binary: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(binary))
        .find(|p| p.is_file())
}

pub struct CompletionNotifier {
    smtp: Box<dyn SmtpSender>,
}

impl CompletionNotifier {
    pub fn new(smtp: Box<dyn SmtpSender>) -> Self {
        Self { smtp }
    }

    pub async fn notify(&self, request: &Request, result: &TaskResult) {
        if request.caller == Caller::Email {
            self.notify_email(request, result).await;
        } else {
            self.notify_envelope(request, result).await;
        }
    }

    /// Envelope delivery for `{claude, codex, droid}` callers: write to
    /// `outputPath` if given, and/or spawn the hook script detached with
    /// a bounded run timeout, joined for at most `HOOK_JOIN_TIMEOUT`.
    async fn notify_envelope(&self, request: &Request, result: &TaskResult) {
        let envelope = Envelope {
            provider: request.provider.as_str(),
            req_id: &result.req_id,
            reply: &result.reply,
            done_seen: result.done_seen,
            caller: caller_str(request.caller),
        };
        let Ok(payload) = serde_json::to_string(&envelope) else {
            warn!(
                component = "notifier",
                event = "notifier.envelope_serialize_failed",
                req_id = %result.req_id,
            );
            return;
        };

        if let Some(output_path) = &request.output_path {
            if let Err(e) = tokio::fs::write(output_path, &payload).await {
                warn!(
                    component = "notifier",
                    event = "notifier.output_path_write_failed",
                    req_id = %result.req_id,
                    path = %output_path,
                    error = %e,
                );
            }
        }

        if !laskd_protocol::Config::from_env().completion_hook_enabled {
            return;
        }

        let Some(hook_path) = discover_hook_path() else {
            return;
        };

        let req_id = result.req_id.clone();
        let join = tokio::time::timeout(HOOK_JOIN_TIMEOUT, async move {
            let mut child = match tokio::process::Command::new(&hook_path)
                .arg(&payload)
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .spawn()
            {
                Ok(child) => child,
                Err(e) => {
                    warn!(
                        component = "notifier",
                        event = "notifier.hook_spawn_failed",
                        req_id = %req_id,
                        error = %e,
                    );
                    return;
                }
            };

            match tokio::time::timeout(HOOK_RUN_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) if !status.success() => {
                    warn!(
                        component = "notifier",
                        event = "notifier.hook_nonzero_exit",
                        req_id = %req_id,
                        status = ?status.code(),
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        component = "notifier",
                        event = "notifier.hook_wait_failed",
                        req_id = %req_id,
                        error = %e,
                    );
                }
                Err(_) => {
                    warn!(
                        component = "notifier",
                        event = "notifier.hook_timed_out",
                        req_id = %req_id,
                    );
                    let _ = child.kill().await;
                }
                Ok(Ok(_)) => {}
            }
        });

        // Detached: the hook runs in its own spawned task; we only join
        // briefly here to surface a "did it even start" log line.
        tokio::spawn(join);
    }

    async fn notify_email(&self, request: &Request, result: &TaskResult) {
        let Some(ctx) = crate::email_context::load(&result.req_id).await else {
            warn!(
                component = "notifier",
                event = "notifier.email_context_missing",
                req_id = %result.req_id,
            );
            return;
        };

        for (attempt, backoff) in SMTP_BACKOFFS_SECS.iter().enumerate() {
            match self.smtp.send_reply(&ctx, &result.reply).await {
                Ok(()) => {
                    info!(
                        component = "notifier",
                        event = "notifier.email_sent",
                        req_id = %result.req_id,
                        attempt,
                    );
                    crate::email_context::remove(&result.req_id).await;
                    return;
                }
                Err(e) => {
                    warn!(
                        component = "notifier",
                        event = "notifier.email_send_failed",
                        req_id = %result.req_id,
                        attempt,
                        error = %e,
                    );
                    if attempt + 1 < SMTP_BACKOFFS_SECS.len() {
                        tokio::time::sleep(Duration::from_secs(*backoff)).await;
                    }
                }
            }
        }

        warn!(
            component = "notifier",
            event = "notifier.email_exhausted_retries",
            req_id = %result.req_id,
            "giving up after 3 SMTP attempts; leaving pending envelope for manual recovery",
        );
        let _ = request;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use laskd_protocol::ExitCode;

    struct CountingSender {
        failures_before_success: std::sync::atomic::AtomicUsize,
        attempts: std::sync::Mutex<Vec<()>>,
    }

    #[async_trait]
    impl SmtpSender for CountingSender {
        async fn send_reply(&self, _ctx: &laskd_protocol::EmailContext, _reply: &str) -> Result<(), String> {
            self.attempts.lock().unwrap().push(());
            let remaining = self
                .failures_before_success
                .fetch_update(std::sync::atomic::Ordering::SeqCst, std::sync::atomic::Ordering::SeqCst, |v| {
                    Some(v.saturating_sub(1))
                })
                .unwrap();
            if remaining > 0 {
                Err("simulated failure".to_string())
            } else {
                Ok(())
            }
        }
    }

    fn sample_request() -> Request {
        Request {
            req_id: "r1".to_string(),
            provider: laskd_protocol::Provider::Claude,
            work_dir: "/w".to_string(),
            message: "hi".to_string(),
            timeout_sec: 10.0,
            caller: Caller::Email,
            output_path: None,
            email_context: None,
        }
    }

    fn sample_result() -> TaskResult {
        TaskResult {
            req_id: "r1".to_string(),
            exit_code: ExitCode::Success,
            reply: "ok".to_string(),
            session_key: "/w".to_string(),
            done_seen: true,
            anchor_seen: true,
            fallback_scan: false,
            anchor_ms: Some(10),
            done_ms: Some(20),
        }
    }

    #[tokio::test]
    async fn email_retry_succeeds_after_two_failures() {
        let tmp = tempfile::tempdir().unwrap();
        crate::paths::reset_data_dir();
        crate::paths::init_data_dir(Some(tmp.path()));

        crate::email_context::save(&laskd_protocol::EmailContext {
            request_id: "r1".to_string(),
            message_id: "m1".to_string(),
            from_addr: "a@b.com".to_string(),
            subject: "s".to_string(),
            thread_id: None,
            references: vec![],
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        })
        .await
        .unwrap();

        let sender = CountingSender {
            failures_before_success: std::sync::atomic::AtomicUsize::new(2),
            attempts: std::sync::Mutex::new(vec![]),
        };
        let notifier = CompletionNotifier::new(Box::new(sender));
        notifier.notify(&sample_request(), &sample_result()).await;

        assert!(crate::email_context::load("r1").await.is_none());
    }

    #[test]
    fn hook_path_discovery_respects_env_override() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::env::set_var("CCB_COMPLETION_HOOK_PATH", tmp.path());
        assert_eq!(discover_hook_path(), Some(tmp.path().to_path_buf()));
        std::env::remove_var("CCB_COMPLETION_HOOK_PATH");
    }
}
