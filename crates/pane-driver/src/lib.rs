//! `PaneDriver` implementations for tmux, WezTerm, and iTerm2. Grounded
//! on `examples/original_source/lib/terminal.py`'s `TerminalBackend`
//! abstract class and its three concrete backends; each subprocess call
//! maps 1:1 onto the Python original's `subprocess.run` invocation,
//! rewritten over `tokio::process::Command`.

use std::time::Duration;

use async_trait::async_trait;
use laskd_reader_core::{PaneDriver, PaneError, SplitDirection};
use tokio::process::Command;
use tracing::warn;

fn env_float(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| *v >= 0.0)
        .unwrap_or(default)
}

async fn run_ok(mut cmd: Command) -> Result<(), PaneError> {
    let status = cmd.status().await?;
    if status.success() {
        Ok(())
    } else {
        Err(PaneError::Io(std::io::Error::other(format!(
            "command exited with status {status}"
        ))))
    }
}

/// tmux backend: `pane_id` is a tmux session name. Grounded on
/// `TmuxBackend` — the fast-path single `send-keys -l` for short
/// single-line input, buffer-based paste for multi-line/long input.
pub struct TmuxBackend;

#[async_trait]
impl PaneDriver for TmuxBackend {
    async fn send_text(&self, pane_id: &str, text: &str) -> Result<(), PaneError> {
        let sanitized = text.replace('\r', "");
        let sanitized = sanitized.trim();
        if sanitized.is_empty() {
            return Ok(());
        }

        if !sanitized.contains('\n') && sanitized.len() <= 200 {
            run_ok(
                Command::new("tmux")
                    .args(["send-keys", "-t", pane_id, "-l", sanitized])
                    .kill_on_drop(true),
            )
            .await?;
            return run_ok(
                Command::new("tmux")
                    .args(["send-keys", "-t", pane_id, "Enter"])
                    .kill_on_drop(true),
            )
            .await;
        }

        let buffer_name = format!(
            "tb-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis()
        );

        use std::process::Stdio;
        use tokio::io::AsyncWriteExt;
        let mut load = Command::new("tmux")
            .args(["load-buffer", "-b", &buffer_name, "-"])
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(mut stdin) = load.stdin.take() {
            stdin.write_all(sanitized.as_bytes()).await?;
        }
        let status = load.wait().await?;
        if !status.success() {
            return Err(PaneError::Io(std::io::Error::other("tmux load-buffer failed")));
        }

        let paste_result = run_ok(
            Command::new("tmux")
                .args(["paste-buffer", "-t", pane_id, "-b", &buffer_name, "-p"])
                .kill_on_drop(true),
        )
        .await;

        if paste_result.is_ok() {
            let enter_delay = env_float("CCB_TMUX_ENTER_DELAY", 0.0);
            if enter_delay > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(enter_delay)).await;
            }
            let _ = run_ok(
                Command::new("tmux")
                    .args(["send-keys", "-t", pane_id, "Enter"])
                    .kill_on_drop(true),
            )
            .await;
        }

        let _ = Command::new("tmux")
            .args(["delete-buffer", "-b", &buffer_name])
            .kill_on_drop(true)
            .output()
            .await;

        paste_result
    }

    async fn is_alive(&self, pane_id: &str) -> Result<bool, PaneError> {
        let status = Command::new("tmux")
            .args(["has-session", "-t", pane_id])
            .kill_on_drop(true)
            .status()
            .await?;
        Ok(status.success())
    }

    async fn find_pane_by_title_marker(&self, _marker: &str) -> Result<Option<String>, PaneError> {
        // tmux exposes pane titles too, but the original only wires
        // title-marker lookup through the WezTerm backend.
        Ok(None)
    }

    async fn kill_pane(&self, pane_id: &str) -> Result<(), PaneError> {
        let _ = Command::new("tmux")
            .args(["kill-session", "-t", pane_id])
            .kill_on_drop(true)
            .output()
            .await;
        Ok(())
    }

    async fn activate(&self, pane_id: &str) -> Result<(), PaneError> {
        run_ok(
            Command::new("tmux")
                .args(["attach", "-t", pane_id])
                .kill_on_drop(true),
        )
        .await
    }

    async fn create_pane(
        &self,
        cmd: &str,
        cwd: &str,
        _direction: SplitDirection,
        _percent: u8,
        _parent_pane: Option<&str>,
    ) -> Result<String, PaneError> {
        let session_name = format!(
            "ai-{}-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
                % 100_000,
            std::process::id()
        );
        run_ok(
            Command::new("tmux")
                .args(["new-session", "-d", "-s", &session_name, "-c", cwd, cmd])
                .kill_on_drop(true),
        )
        .await?;
        Ok(session_name)
    }
}

fn wezterm_bin() -> String {
    std::env::var("CCB_WEZTERM_BIN")
        .or_else(|_| std::env::var("WEZTERM_BIN"))
        .unwrap_or_else(|_| "wezterm".to_string())
}

fn wezterm_cli_base_args() -> Vec<String> {
    let mut args = vec![wezterm_bin(), "cli".to_string()];
    if let Ok(class) = std::env::var("CCB_WEZTERM_CLASS").or_else(|_| std::env::var("WEZTERM_CLASS")) {
        args.push("--class".to_string());
        args.push(class);
    }
    args
}

/// WezTerm backend: panes are addressed by numeric `pane-id` via
/// `wezterm cli`. Grounded on `WeztermBackend`.
pub struct WeztermBackend;

impl WeztermBackend {
    fn cli(&self) -> Command {
        let args = wezterm_cli_base_args();
        let mut cmd = Command::new(&args[0]);
        cmd.args(&args[1..]);
        cmd
    }
}

#[async_trait]
impl PaneDriver for WeztermBackend {
    async fn send_text(&self, pane_id: &str, text: &str) -> Result<(), PaneError> {
        let sanitized = text.replace('\r', "");
        let sanitized = sanitized.trim();
        if sanitized.is_empty() {
            return Ok(());
        }

        use std::process::Stdio;
        use tokio::io::AsyncWriteExt;

        let mut send = self.cli();
        send.args(["send-text", "--pane-id", pane_id, "--no-paste"])
            .stdin(Stdio::piped())
            .kill_on_drop(true);
        let mut child = send.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(sanitized.as_bytes()).await?;
        }
        let status = child.wait().await?;
        if !status.success() {
            return Err(PaneError::Io(std::io::Error::other("wezterm send-text failed")));
        }

        let enter_delay = env_float("CCB_WEZTERM_ENTER_DELAY", 0.0);
        if enter_delay > 0.0 {
            tokio::time::sleep(Duration::from_secs_f64(enter_delay)).await;
        }

        let mut enter = self.cli();
        enter
            .args(["send-text", "--pane-id", pane_id, "--no-paste"])
            .stdin(Stdio::piped())
            .kill_on_drop(true);
        let mut child = enter.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(b"\r").await?;
        }
        let status = child.wait().await?;
        if status.success() {
            return Ok(());
        }

        let mut fallback = self.cli();
        fallback
            .args(["send-text", "--pane-id", pane_id, "--no-paste"])
            .stdin(Stdio::piped())
            .kill_on_drop(true);
        let mut child = fallback.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(b"\n").await?;
        }
        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(PaneError::Io(std::io::Error::other("wezterm Enter send failed")))
        }
    }

    async fn is_alive(&self, pane_id: &str) -> Result<bool, PaneError> {
        let output = self
            .cli()
            .args(["list", "--format", "json"])
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Ok(false);
        }
        let Ok(panes) = serde_json::from_slice::<Vec<serde_json::Value>>(&output.stdout) else {
            return Ok(false);
        };
        Ok(panes.iter().any(|p| {
            p.get("pane_id")
                .map(|v| v.to_string().trim_matches('"') == pane_id)
                .unwrap_or(false)
        }))
    }

    async fn find_pane_by_title_marker(&self, marker: &str) -> Result<Option<String>, PaneError> {
        let output = self
            .cli()
            .args(["list", "--format", "json"])
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let Ok(panes) = serde_json::from_slice::<Vec<serde_json::Value>>(&output.stdout) else {
            return Ok(None);
        };
        Ok(panes
            .iter()
            .find(|p| {
                p.get("title")
                    .and_then(|v| v.as_str())
                    .map(|t| t.contains(marker))
                    .unwrap_or(false)
            })
            .and_then(|p| p.get("pane_id"))
            .map(|v| v.to_string().trim_matches('"').to_string()))
    }

    async fn kill_pane(&self, pane_id: &str) -> Result<(), PaneError> {
        let _ = self
            .cli()
            .args(["kill-pane", "--pane-id", pane_id])
            .kill_on_drop(true)
            .output()
            .await;
        Ok(())
    }

    async fn activate(&self, pane_id: &str) -> Result<(), PaneError> {
        run_ok(
            self.cli()
                .args(["activate-pane", "--pane-id", pane_id])
                .kill_on_drop(true),
        )
        .await
    }

    async fn create_pane(
        &self,
        cmd: &str,
        cwd: &str,
        direction: SplitDirection,
        percent: u8,
        parent_pane: Option<&str>,
    ) -> Result<String, PaneError> {
        let mut args_cmd = self.cli();
        args_cmd.arg("split-pane");
        args_cmd.args(["--cwd", cwd]);
        match direction {
            SplitDirection::Vertical => {
                args_cmd.arg("--right");
            }
            SplitDirection::Horizontal => {
                args_cmd.arg("--bottom");
            }
        }
        args_cmd.args(["--percent", &percent.to_string()]);
        if let Some(parent) = parent_pane {
            args_cmd.args(["--pane-id", parent]);
        }
        args_cmd.args(["--", "bash", "-c", cmd]);

        let output = args_cmd.kill_on_drop(true).output().await?;
        if !output.status.success() {
            return Err(PaneError::Io(std::io::Error::other(format!(
                "wezterm split-pane failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ))));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn it2_bin() -> String {
    std::env::var("CCB_IT2_BIN")
        .or_else(|_| std::env::var("IT2_BIN"))
        .unwrap_or_else(|_| "it2".to_string())
}

/// iTerm2 backend, driven through the `it2` CLI (`pip install it2`).
/// Grounded on `Iterm2Backend`.
pub struct Iterm2Backend;

#[async_trait]
impl PaneDriver for Iterm2Backend {
    async fn send_text(&self, pane_id: &str, text: &str) -> Result<(), PaneError> {
        let sanitized = text.replace('\r', "");
        let sanitized = sanitized.trim();
        if sanitized.is_empty() {
            return Ok(());
        }
        run_ok(
            Command::new(it2_bin())
                .args(["session", "send", sanitized, "--session", pane_id])
                .kill_on_drop(true),
        )
        .await?;
        tokio::time::sleep(Duration::from_millis(10)).await;
        run_ok(
            Command::new(it2_bin())
                .args(["session", "send", "\r", "--session", pane_id])
                .kill_on_drop(true),
        )
        .await
    }

    async fn is_alive(&self, pane_id: &str) -> Result<bool, PaneError> {
        let output = Command::new(it2_bin())
            .args(["session", "list", "--json"])
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Ok(false);
        }
        let Ok(sessions) = serde_json::from_slice::<Vec<serde_json::Value>>(&output.stdout) else {
            return Ok(false);
        };
        Ok(sessions
            .iter()
            .any(|s| s.get("id").and_then(|v| v.as_str()) == Some(pane_id)))
    }

    async fn find_pane_by_title_marker(&self, _marker: &str) -> Result<Option<String>, PaneError> {
        // Not exposed by the original's iTerm2 backend.
        Ok(None)
    }

    async fn kill_pane(&self, pane_id: &str) -> Result<(), PaneError> {
        let _ = Command::new(it2_bin())
            .args(["session", "close", "--session", pane_id, "--force"])
            .kill_on_drop(true)
            .output()
            .await;
        Ok(())
    }

    async fn activate(&self, pane_id: &str) -> Result<(), PaneError> {
        run_ok(
            Command::new(it2_bin())
                .args(["session", "focus", pane_id])
                .kill_on_drop(true),
        )
        .await
    }

    async fn create_pane(
        &self,
        cmd: &str,
        cwd: &str,
        direction: SplitDirection,
        _percent: u8,
        parent_pane: Option<&str>,
    ) -> Result<String, PaneError> {
        let mut args = vec!["session".to_string(), "split".to_string()];
        if matches!(direction, SplitDirection::Vertical) {
            args.push("--vertical".to_string());
        }
        if let Some(parent) = parent_pane {
            args.push("--session".to_string());
            args.push(parent.to_string());
        }
        let output = Command::new(it2_bin())
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await?;
        if !output.status.success() {
            return Err(PaneError::Io(std::io::Error::other("it2 session split failed")));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let new_session_id = stdout
            .trim()
            .rsplit(':')
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();

        if !new_session_id.is_empty() && !cmd.is_empty() {
            let full_cmd = format!("cd {} && {}", shell_quote(cwd), cmd);
            tokio::time::sleep(Duration::from_millis(200)).await;
            if let Err(e) = self.send_text(&new_session_id, &full_cmd).await {
                warn!(error = %e, "laskd_pane_driver.iterm2_startup_send_failed");
            }
        }
        Ok(new_session_id)
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Select the backend implementation for a stored `terminal` kind.
pub fn backend_for(terminal: laskd_protocol::TerminalKind) -> Box<dyn PaneDriver> {
    match terminal {
        laskd_protocol::TerminalKind::Tmux => Box::new(TmuxBackend),
        laskd_protocol::TerminalKind::Wezterm => Box::new(WeztermBackend),
        laskd_protocol::TerminalKind::Iterm2 => Box::new(Iterm2Backend),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("a'b"), "'a'\\''b'");
    }
}
