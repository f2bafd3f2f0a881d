//! Codex single rotating-log reader: locate the newest matching log for a
//! work_dir, then tail it for structured `(role, text)` lines. Grounded on
//! the teacher's `rollout_watcher.rs` offset-tailing idiom and spec
//! §4.3.2; Codex writes one JSON object per line much like Claude's
//! rollout format, but keyed by `cwd` only (no sidechain concept, no
//! `sessions-index.json`).

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use laskd_protocol::{CursorState, Event, EventRole};
use laskd_reader_core::{LogReader, ReaderError, SelectionMode};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct CodexLine {
    #[serde(rename = "type")]
    kind: Option<String>,
    cwd: Option<String>,
    text: Option<String>,
}

pub struct CodexReader {
    path: PathBuf,
    offset: u64,
    carry: String,
}

fn logs_root() -> PathBuf {
    std::env::var("CCB_CODEX_LOG_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".codex")
                .join("sessions")
        })
}

fn file_mtime(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

fn collect_logs(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = fs::read_dir(root) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(collect_logs(&path));
        } else if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
            out.push(path);
        }
    }
    out
}

/// Locate the newest rotating log whose `cwd` matches `work_dir`.
pub fn newest_matching_log(root: &Path, work_dir: &str) -> Option<PathBuf> {
    let work_dir_norm = laskd_protocol::normalize_work_dir(work_dir);
    let mut candidates = collect_logs(root);
    candidates.sort_by_key(|p| std::cmp::Reverse(file_mtime(p)));

    for path in candidates {
        let Ok(content) = fs::read_to_string(&path) else {
            continue;
        };
        for line in content.lines().take(10) {
            if let Ok(parsed) = serde_json::from_str::<CodexLine>(line) {
                if let Some(cwd) = parsed.cwd {
                    if laskd_protocol::normalize_work_dir(&cwd) == work_dir_norm {
                        return Some(path);
                    }
                }
            }
        }
    }
    None
}

impl CodexReader {
    pub async fn bind_in(root: &Path, work_dir: &str) -> Result<Self, ReaderError> {
        let path = newest_matching_log(root, work_dir).ok_or(ReaderError::NoMatchingLog)?;
        Ok(Self {
            path,
            offset: 0,
            carry: String::new(),
        })
    }

    /// Bind directly to a known log path, skipping discovery entirely.
    /// Used by Droid when a preferred session path is already on hand
    /// (spec §4.3.5).
    pub fn at_path(path: PathBuf) -> Self {
        Self {
            path,
            offset: 0,
            carry: String::new(),
        }
    }

    fn read_new_chunk(&mut self) -> std::io::Result<String> {
        let mut file = fs::File::open(&self.path)?;
        let len = file.metadata()?.len();
        if len < self.offset {
            self.offset = 0;
            self.carry.clear();
        }
        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)?;
        self.offset = len;
        Ok(buf)
    }

    fn parse_lines(&mut self, chunk: &str) -> Vec<Event> {
        let combined = format!("{}{}", self.carry, chunk);
        let mut lines: Vec<&str> = combined.split('\n').collect();
        self.carry = lines.pop().unwrap_or_default().to_string();

        let mut events = Vec::new();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let parsed: CodexLine = match serde_json::from_str(line) {
                Ok(p) => p,
                Err(e) => {
                    debug!(error = %e, "laskd_reader_codex.partial_json_line");
                    continue;
                }
            };
            let role = match parsed.kind.as_deref() {
                Some("user") => EventRole::User,
                Some("assistant") => EventRole::Assistant,
                Some("system") => EventRole::System,
                _ => continue,
            };
            let Some(text) = parsed.text else { continue };
            if text.is_empty() {
                continue;
            }
            events.push(Event::Turn { role, text });
        }
        events
    }
}

#[async_trait]
impl LogReader for CodexReader {
    async fn bind(work_dir: &str, _mode: SelectionMode) -> Result<Self, ReaderError> {
        Self::bind_in(&logs_root(), work_dir).await
    }

    fn capture_state(&self) -> CursorState {
        CursorState::FileTailer {
            path: self.path.to_string_lossy().to_string(),
            offset: self.offset,
            carry: self.carry.clone(),
        }
    }

    async fn seed_from_tail(&mut self, tail_bytes: u64) -> Result<CursorState, ReaderError> {
        let len = fs::metadata(&self.path)?.len();
        self.offset = len.saturating_sub(tail_bytes);
        self.carry.clear();
        Ok(self.capture_state())
    }

    async fn wait_for_events(
        &mut self,
        state: &CursorState,
        dt: Duration,
    ) -> Result<(Vec<Event>, CursorState), ReaderError> {
        if let CursorState::FileTailer { path, offset, carry } = state {
            if *path == self.path.to_string_lossy() {
                self.offset = *offset;
                self.carry = carry.clone();
            }
        }
        tokio::time::sleep(dt.min(Duration::from_millis(200))).await;
        let chunk = self.read_new_chunk()?;
        let events = self.parse_lines(&chunk);
        Ok((events, self.capture_state()))
    }

    async fn latest_conversations(&self, n: usize) -> Result<Vec<(String, String)>, ReaderError> {
        let content = fs::read_to_string(&self.path)?;
        let mut pairs = Vec::new();
        let mut pending_user: Option<String> = None;
        for line in content.lines() {
            let Ok(parsed) = serde_json::from_str::<CodexLine>(line) else {
                continue;
            };
            let text = parsed.text.unwrap_or_default();
            match parsed.kind.as_deref() {
                Some("user") => pending_user = Some(text),
                Some("assistant") => {
                    if let Some(u) = pending_user.take() {
                        pairs.push((u, text));
                    }
                }
                _ => {}
            }
        }
        pairs.reverse();
        pairs.truncate(n);
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_jsonl(path: &Path, lines: &[&str]) {
        let mut f = fs::File::create(path).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
    }

    #[test]
    fn finds_newest_log_matching_cwd() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let older = root.join("old.jsonl");
        write_jsonl(&older, &[r#"{"type":"user","cwd":"/work/proj"}"#]);
        std::thread::sleep(Duration::from_millis(10));
        let newer = root.join("new.jsonl");
        write_jsonl(&newer, &[r#"{"type":"user","cwd":"/work/proj"}"#]);

        let found = newest_matching_log(root, "/work/proj");
        assert_eq!(found, Some(newer));
    }
}
