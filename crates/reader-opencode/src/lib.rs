//! OpenCode storage reader: file-backed `session`/`message`/`part` JSON
//! trees, with an optional SQLite mirror (`opencode.db`), `projectId`
//! discovery for a work_dir, and two-path cancellation detection (spec
//! §4.3.4). Grounded line-for-line on
//! `examples/original_source/lib/opencode_comm.py`'s `OpenCodeLogReader`;
//! SQLite access mirrors the teacher's `rusqlite` usage (bundled feature,
//! blocking calls wrapped in `spawn_blocking`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use laskd_protocol::{CursorState, Event};
use laskd_reader_core::{LogReader, ReaderError, SelectionMode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

mod db;

fn storage_root() -> PathBuf {
    if let Ok(env) = std::env::var("OPENCODE_STORAGE_ROOT") {
        if !env.trim().is_empty() {
            return PathBuf::from(env);
        }
    }
    let base = dirs::data_local_dir().unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".local")
            .join("share")
    });
    base.join("opencode").join("storage")
}

/// Mirrors `_normalize_path_for_match`: absolutize via `absolute()`, not
/// `resolve()`, because OpenCode records the launch-cwd verbatim and
/// symlink resolution would cause false mismatches.
fn normalize_path_for_match(value: &str) -> String {
    let mut s = value.trim().to_string();
    if let Some(home) = dirs::home_dir() {
        if s == "~" {
            s = home.to_string_lossy().to_string();
        } else if let Some(rest) = s.strip_prefix("~/") {
            s = home.join(rest).to_string_lossy().to_string();
        }
    }
    let path = Path::new(&s);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut normalized = absolute.to_string_lossy().replace('\\', "/");
    while normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

fn path_is_same_or_parent(parent: &str, child: &str) -> bool {
    let parent = normalize_path_for_match(parent);
    let child = normalize_path_for_match(child);
    if parent == child {
        return true;
    }
    if parent.is_empty() || child.is_empty() {
        return false;
    }
    if !child.starts_with(&parent) {
        return false;
    }
    child[parent.len()..].starts_with('/')
}

fn path_matches(expected: &str, actual: &str, allow_parent: bool) -> bool {
    if allow_parent {
        path_is_same_or_parent(expected, actual) || path_is_same_or_parent(actual, expected)
    } else {
        normalize_path_for_match(expected) == normalize_path_for_match(actual)
    }
}

#[derive(Debug, Deserialize, Default)]
struct ProjectFile {
    id: Option<String>,
    worktree: Option<String>,
    time: Option<TimeInfo>,
}

#[derive(Debug, Deserialize, Default, Clone, Copy)]
struct TimeInfo {
    updated: Option<i64>,
    completed: Option<i64>,
    #[allow(dead_code)]
    created: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct SessionFile {
    id: Option<String>,
    directory: Option<String>,
    time: Option<TimeInfo>,
}

#[derive(Debug, Deserialize, Default, Clone)]
struct MessageFile {
    id: Option<String>,
    #[serde(rename = "sessionID")]
    session_id: Option<String>,
    role: Option<String>,
    #[serde(rename = "parentID")]
    parent_id: Option<String>,
    error: Option<Value>,
    time: Option<TimeInfo>,
}

#[derive(Debug, Deserialize, Default, Clone)]
struct PartFile {
    #[serde(rename = "messageID")]
    message_id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    text: Option<String>,
}

fn read_json<T: Default + serde::de::DeserializeOwned>(path: &Path) -> T {
    let Ok(content) = std::fs::read_to_string(path) else {
        return T::default();
    };
    match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, path = %path.display(), "laskd_reader_opencode.partial_json");
            T::default()
        }
    }
}

fn is_aborted_error(error: &Value) -> bool {
    let Some(name) = error.get("name").and_then(|v| v.as_str()) else {
        return false;
    };
    if name.to_lowercase().contains("aborted") {
        return true;
    }
    error
        .get("data")
        .and_then(|d| d.get("message"))
        .and_then(|m| m.as_str())
        .map(|m| {
            let m = m.to_lowercase();
            m.contains("aborted") || m.contains("cancel")
        })
        .unwrap_or(false)
}

/// Spec §4.3.4 path (b): `<root>/*.log`, newest by mtime.
fn log_root() -> PathBuf {
    if let Ok(env) = std::env::var("OPENCODE_LOG_ROOT") {
        if !env.trim().is_empty() {
            return PathBuf::from(env);
        }
    }
    let candidates = [
        std::env::var("XDG_DATA_HOME")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(|s| PathBuf::from(s).join("opencode").join("log")),
        dirs::home_dir().map(|h| h.join(".local").join("share").join("opencode").join("log")),
        dirs::home_dir().map(|h| h.join(".opencode").join("log")),
    ];
    for candidate in candidates.into_iter().flatten() {
        if candidate.exists() {
            return candidate;
        }
    }
    candidates
        .into_iter()
        .flatten()
        .next()
        .unwrap_or_else(|| PathBuf::from("."))
}

fn latest_log_file(root: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(root).ok()?;
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("log"))
        .max_by_key(|p| {
            std::fs::metadata(p)
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        })
}

/// A line naming either `sessionID=<sid> cancel` or a
/// `path=/session/<sid>/abort` request.
fn is_cancel_log_line(line: &str, session_id: &str) -> bool {
    if session_id.is_empty() {
        return false;
    }
    line.contains(&format!("sessionID={session_id} cancel"))
        || line.contains(&format!("path=/session/{session_id}/abort"))
}

/// Observed format: `INFO  2026-01-09T12:11:12 +1ms service=...`.
fn parse_log_epoch_s(line: &str) -> Option<f64> {
    use chrono::TimeZone;
    let ts = line.split_whitespace().nth(1)?;
    let naive = chrono::NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S").ok()?;
    Some(chrono::Utc.from_utc_datetime(&naive).timestamp() as f64)
}

fn extract_req_id_from_text(text: &str) -> Option<String> {
    use once_cell::sync::Lazy;
    use regex::Regex;
    static RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"CCB_REQ_ID:\s*([0-9a-fA-F]{32}|\d{8}-\d{6}-\d{3}-\d+-\d+)").unwrap()
    });
    RE.captures(text)
        .map(|c| c[1].to_ascii_lowercase())
}

/// Resolved latest-session lookup result: session id, its own directory,
/// the `time.updated` timestamp, and (for file-backed sessions) the file
/// path, so callers can detect rotation.
#[derive(Debug, Clone)]
struct SessionMatch {
    session_id: String,
    updated: i64,
    path: Option<PathBuf>,
}

pub struct OpenCodeReader {
    root: PathBuf,
    project_id: String,
    session_id_filter: Option<String>,
    work_dir: String,
    allow_parent_match: bool,
    allow_any_session: bool,
    execution_complete_marker: String,

    current_session_id: Option<String>,
    assistant_count: u64,
    last_assistant_id: Option<String>,
    last_assistant_completed: Option<i64>,
    last_assistant_has_done: bool,

    cancel_log_path: Option<PathBuf>,
    cancel_log_offset: u64,
    cancel_log_mtime: f64,
}

impl OpenCodeReader {
    pub async fn bind_with_options(
        work_dir: &str,
        session_id_filter: Option<&str>,
        allow_parent_match: bool,
        allow_any_session: bool,
        allow_git_root_fallback: bool,
    ) -> Result<Self, ReaderError> {
        let root = storage_root();
        let project_id = Self::detect_project_id(&root, work_dir, allow_parent_match)
            .or_else(|| {
                allow_git_root_fallback.then(|| "global".to_string())
            })
            .unwrap_or_else(|| "global".to_string());

        Ok(Self {
            root,
            project_id,
            session_id_filter: session_id_filter.map(|s| s.to_string()),
            work_dir: work_dir.to_string(),
            allow_parent_match,
            allow_any_session,
            execution_complete_marker: std::env::var("CCB_EXECUTION_COMPLETE_MARKER")
                .unwrap_or_else(|_| "[EXECUTION_COMPLETE]".to_string()),
            current_session_id: None,
            assistant_count: 0,
            last_assistant_id: None,
            last_assistant_completed: None,
            last_assistant_has_done: false,

            cancel_log_path: None,
            cancel_log_offset: 0,
            cancel_log_mtime: 0.0,
        })
    }

    /// Scan `<root>/project/*.json`, select the entry whose `worktree`
    /// matches `work_dir`, tie-breaking by longest worktree path, newest
    /// `time.updated`, newest mtime (spec §4.3.4 "projectId discovery").
    fn detect_project_id(root: &Path, work_dir: &str, allow_parent_match: bool) -> Option<String> {
        let dir = root.join("project");
        let entries = std::fs::read_dir(&dir).ok()?;

        let mut best: Option<(String, (usize, i64, i64))> = None;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let payload: ProjectFile = read_json(&path);
            let Some(worktree) = payload.worktree else {
                continue;
            };
            let pid = payload.id.unwrap_or_else(|| {
                path.file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default()
            });
            if pid.is_empty() {
                continue;
            }
            if !path_matches(&worktree, work_dir, allow_parent_match) {
                continue;
            }
            let updated = payload.time.and_then(|t| t.updated).unwrap_or(-1);
            let mtime = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let score = (worktree.len(), updated, mtime);
            if best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
                best = Some((pid, score));
            }
        }
        best.map(|(pid, _)| pid)
    }

    fn session_dir(&self) -> PathBuf {
        self.root.join("session").join(&self.project_id)
    }

    fn message_dir(&self, session_id: &str) -> PathBuf {
        let nested = self.root.join("message").join(session_id);
        if nested.is_dir() {
            nested
        } else {
            self.root.join("message")
        }
    }

    fn part_dir(&self, message_id: &str) -> PathBuf {
        let nested = self.root.join("part").join(message_id);
        if nested.is_dir() {
            nested
        } else {
            self.root.join("part")
        }
    }

    /// Tier 1 (files). Returns the newest session matching `work_dir`,
    /// honoring `session_id_filter` the way the original's
    /// "`filtered_match` vs `best_match`" logic does: a filtered session
    /// only wins if nothing newer for the same work_dir exists.
    fn latest_session_from_files(&self) -> Option<SessionMatch> {
        let dir = self.session_dir();
        let entries = std::fs::read_dir(&dir).ok()?;

        let work_dir_norm = normalize_path_for_match(&self.work_dir);
        let mut filtered: Option<(PathBuf, SessionFile)> = None;
        let mut best: Option<(PathBuf, SessionFile)> = None;
        let mut best_any: Option<(PathBuf, SessionFile)> = None;

        for entry in entries.flatten() {
            let path = entry.path();
            let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
            if !file_name.starts_with("ses_") || path.extension().and_then(|e| e.to_str()) != Some("json")
            {
                continue;
            }
            let payload: SessionFile = read_json(&path);
            let Some(sid) = payload.id.clone() else { continue };

            let updated = payload.time.and_then(|t| t.updated).unwrap_or(-1);
            let best_any_updated = best_any
                .as_ref()
                .and_then(|(_, p)| p.time)
                .and_then(|t| t.updated)
                .unwrap_or(-1);
            if updated >= best_any_updated {
                best_any = Some((path.clone(), payload.clone()));
            }

            if self.session_id_filter.as_deref() == Some(sid.as_str()) {
                filtered = Some((path.clone(), payload.clone()));
            }

            let Some(directory) = payload.directory.clone() else {
                continue;
            };
            let matched = if self.allow_parent_match {
                path_is_same_or_parent(&directory, &self.work_dir)
                    || path_is_same_or_parent(&self.work_dir, &directory)
            } else {
                normalize_path_for_match(&directory) == work_dir_norm
            };
            if !matched {
                continue;
            }
            let best_updated = best
                .as_ref()
                .and_then(|(_, p)| p.time)
                .and_then(|t| t.updated)
                .unwrap_or(-1);
            if updated >= best_updated {
                best = Some((path, payload));
            }
        }

        if let Some((fpath, fpayload)) = &filtered {
            let filtered_updated = fpayload.time.and_then(|t| t.updated).unwrap_or(-1);
            let best_updated = best
                .as_ref()
                .and_then(|(_, p)| p.time)
                .and_then(|t| t.updated)
                .unwrap_or(-1);
            if best.is_none() || best_updated <= filtered_updated {
                return Some(SessionMatch {
                    session_id: fpayload.id.clone().unwrap(),
                    updated: filtered_updated,
                    path: Some(fpath.clone()),
                });
            }
        }

        if let Some((bpath, bpayload)) = best {
            return Some(SessionMatch {
                session_id: bpayload.id.clone().unwrap(),
                updated: bpayload.time.and_then(|t| t.updated).unwrap_or(-1),
                path: Some(bpath),
            });
        }

        if self.allow_any_session {
            return best_any.map(|(path, payload)| SessionMatch {
                session_id: payload.id.unwrap(),
                updated: payload.time.and_then(|t| t.updated).unwrap_or(-1),
                path: Some(path),
            });
        }

        None
    }

    fn latest_session(&self) -> Option<SessionMatch> {
        self.latest_session_from_files()
    }

    /// `projectId` this reader resolved to at bind time (spec §4.3.4
    /// "projectId discovery"). Used by the session registry to persist a
    /// binding without re-running discovery.
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Best-known session id for this reader, re-resolving from storage
    /// if `wait_for_events` hasn't populated `current_session_id` yet
    /// (true immediately after `bind`).
    pub fn resolve_session_id(&self) -> Option<String> {
        self.current_session_id
            .clone()
            .or_else(|| self.latest_session().map(|m| m.session_id))
    }

    fn read_messages(&self, session_id: &str) -> Vec<MessageFile> {
        let dir = self.message_dir(session_id);
        let from_files: Vec<MessageFile> = std::fs::read_dir(&dir)
            .into_iter()
            .flatten()
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|s| s.to_str())
                    .map(|s| s.starts_with("msg_"))
                    .unwrap_or(false)
            })
            .map(|p| read_json::<MessageFile>(&p))
            .filter(|m| m.session_id.as_deref() == Some(session_id))
            .collect();

        let mut messages = if from_files.is_empty() {
            // Fall back to the SQLite mirror; the query itself blocks on
            // disk I/O, so run it on a blocking-friendly thread the same
            // way the teacher's synchronous rusqlite call sites do.
            let root = self.root.clone();
            let sid = session_id.to_string();
            tokio::task::block_in_place(|| db::read_messages(&root, &sid))
                .into_iter()
                .filter_map(|v| serde_json::from_value::<MessageFile>(v).ok())
                .collect()
        } else {
            from_files
        };
        messages.sort_by_key(|m| m.time.and_then(|t| t.created_sort()).unwrap_or(-1));
        messages
    }

    fn read_parts(&self, message_id: &str) -> Vec<PartFile> {
        let dir = self.part_dir(message_id);
        let from_files: Vec<PartFile> = std::fs::read_dir(&dir)
            .into_iter()
            .flatten()
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|s| s.to_str())
                    .map(|s| s.starts_with("prt_"))
                    .unwrap_or(false)
            })
            .map(|p| read_json::<PartFile>(&p))
            .filter(|p| p.message_id.as_deref() == Some(message_id))
            .collect();

        if !from_files.is_empty() {
            return from_files;
        }
        let root = self.root.clone();
        let mid = message_id.to_string();
        tokio::task::block_in_place(|| db::read_parts(&root, &mid))
            .into_iter()
            .filter_map(|v| serde_json::from_value::<PartFile>(v).ok())
            .collect()
    }

    /// Prefer visible `text` parts; fall back to `reasoning` parts only
    /// when no text part exists (spec §4.3.4 "reasoning-only parts are
    /// used only as a fallback").
    fn extract_text(parts: &[PartFile]) -> String {
        let text: String = parts
            .iter()
            .filter(|p| p.kind.as_deref() == Some("text"))
            .filter_map(|p| p.text.clone())
            .collect::<Vec<_>>()
            .join("");
        if !text.trim().is_empty() {
            return text.trim().to_string();
        }
        parts
            .iter()
            .filter(|p| p.kind.as_deref() == Some("reasoning"))
            .filter_map(|p| p.text.clone())
            .collect::<Vec<_>>()
            .join("")
            .trim()
            .to_string()
    }

    /// Locate the newest completed assistant reply for `session_id`,
    /// treating an `[EXECUTION_COMPLETE]`/`CCB_DONE:` marker as completion
    /// when the provider omits `time.completed` (spec §4.3.4).
    fn latest_assistant_reply(&self, session_id: &str) -> Option<(MessageFile, String, bool, i64)> {
        let messages = self.read_messages(session_id);
        let latest = messages
            .into_iter()
            .filter(|m| m.role.as_deref() == Some("assistant") && m.id.is_some())
            .last()?;
        let parts = self.read_parts(latest.id.as_deref().unwrap());
        let text = Self::extract_text(&parts);
        let has_done = !text.is_empty() && text.contains("CCB_DONE:");

        let mut completed = latest.time.and_then(|t| t.completed);
        if completed.is_none() {
            let has_marker = !text.is_empty()
                && (text.contains(&self.execution_complete_marker) || has_done);
            if has_marker {
                completed = Some(0);
            } else {
                return None;
            }
        }
        Some((latest, text, has_done, completed.unwrap_or(0)))
    }
}

impl TimeInfo {
    fn created_sort(&self) -> Option<i64> {
        self.created
    }
}

#[async_trait]
impl LogReader for OpenCodeReader {
    async fn bind(work_dir: &str, mode: SelectionMode) -> Result<Self, ReaderError> {
        let allow_parent = std::env::var("OPENCODE_ALLOW_PARENT_WORKDIR_MATCH")
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
        let allow_any = mode == SelectionMode::Permissive
            || std::env::var("OPENCODE_ALLOW_ANY_SESSION")
                .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
                .unwrap_or(false);
        let allow_git_root_fallback = std::env::var("OPENCODE_ALLOW_GIT_ROOT_FALLBACK")
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);
        Self::bind_with_options(work_dir, None, allow_parent, allow_any, allow_git_root_fallback).await
    }

    fn capture_state(&self) -> CursorState {
        CursorState::MessageCursor {
            session_id: self.current_session_id.clone().unwrap_or_default(),
            session_updated_ts: None,
            assistant_count: self.assistant_count,
            last_assistant_id: self.last_assistant_id.clone(),
            last_assistant_completed_ts: self.last_assistant_completed,
            last_assistant_has_done_marker: self.last_assistant_has_done,
        }
    }

    async fn seed_from_tail(&mut self, _tail_bytes: u64) -> Result<CursorState, ReaderError> {
        if let Some(session) = self.latest_session() {
            self.current_session_id = Some(session.session_id.clone());
            let messages = self.read_messages(&session.session_id);
            let assistants: Vec<_> = messages
                .into_iter()
                .filter(|m| m.role.as_deref() == Some("assistant") && m.id.is_some())
                .collect();
            self.assistant_count = assistants.len() as u64;
            self.last_assistant_id = assistants.last().and_then(|m| m.id.clone());
            self.last_assistant_completed = assistants.last().and_then(|m| m.time).and_then(|t| t.completed);
            self.last_assistant_has_done = false;
        }
        Ok(self.capture_state())
    }

    async fn wait_for_events(
        &mut self,
        state: &CursorState,
        dt: Duration,
    ) -> Result<(Vec<Event>, CursorState), ReaderError> {
        if let CursorState::MessageCursor {
            session_id,
            assistant_count,
            last_assistant_id,
            last_assistant_completed_ts,
            last_assistant_has_done_marker,
            ..
        } = state
        {
            if !session_id.is_empty() {
                self.current_session_id = Some(session_id.clone());
            }
            self.assistant_count = *assistant_count;
            self.last_assistant_id = last_assistant_id.clone();
            self.last_assistant_completed = *last_assistant_completed_ts;
            self.last_assistant_has_done = *last_assistant_has_done_marker;
        }

        tokio::time::sleep(dt.min(Duration::from_millis(200))).await;

        let Some(session) = self.latest_session() else {
            return Ok((Vec::new(), self.capture_state()));
        };

        // Session switching within a single wait: follow the newest
        // session immediately and reset the per-session reply cursor
        // (spec §4.3.4 "Session switching").
        if self.current_session_id.as_deref() != Some(session.session_id.as_str()) {
            self.current_session_id = Some(session.session_id.clone());
            self.assistant_count = 0;
            self.last_assistant_id = None;
            self.last_assistant_completed = None;
            self.last_assistant_has_done = false;
        }

        let Some((latest, text, has_done, completed)) =
            self.latest_assistant_reply(&session.session_id)
        else {
            return Ok((Vec::new(), self.capture_state()));
        };

        let latest_id = latest.id.clone();
        let messages = self.read_messages(&session.session_id);
        let assistant_count = messages
            .iter()
            .filter(|m| m.role.as_deref() == Some("assistant") && m.id.is_some())
            .count() as u64;

        let unchanged = assistant_count <= self.assistant_count
            && latest_id == self.last_assistant_id
            && Some(completed) == self.last_assistant_completed
            && has_done == self.last_assistant_has_done;
        if unchanged {
            return Ok((Vec::new(), self.capture_state()));
        }

        self.assistant_count = assistant_count;
        self.last_assistant_id = latest_id;
        self.last_assistant_completed = Some(completed);
        self.last_assistant_has_done = has_done;

        if text.is_empty() {
            return Ok((Vec::new(), self.capture_state()));
        }

        Ok((
            vec![Event::AssistantSnapshot {
                text,
                completed: true,
            }],
            self.capture_state(),
        ))
    }

    async fn latest_conversations(&self, n: usize) -> Result<Vec<(String, String)>, ReaderError> {
        let Some(session) = self.latest_session() else {
            return Ok(Vec::new());
        };
        let messages = self.read_messages(&session.session_id);
        let mut pairs = Vec::new();
        let mut pending_user: Option<String> = None;
        for msg in &messages {
            let Some(id) = &msg.id else { continue };
            let parts = self.read_parts(id);
            let text = Self::extract_text(&parts);
            match msg.role.as_deref() {
                Some("user") => pending_user = Some(text),
                Some("assistant") if !text.is_empty() => {
                    pairs.push((pending_user.take().unwrap_or_default(), text));
                }
                _ => {}
            }
        }
        pairs.reverse();
        pairs.truncate(n);
        Ok(pairs)
    }

    /// Runs both spec §4.3.4 abort-detection paths; the lifecycle engine
    /// polls this alongside the cooperative `cancelled` flag (spec.md:239).
    async fn detect_cancelled(&mut self, req_id: &str) -> bool {
        if self.detect_cancelled_since(req_id) {
            return true;
        }
        let Some(session_id) = self.current_session_id.clone() else {
            return false;
        };
        let since_epoch_s = laskd_protocol::codec::req_id_submitted_epoch_s(req_id).unwrap_or(0.0);
        self.detect_cancel_event_in_logs(&session_id, since_epoch_s)
    }
}

impl OpenCodeReader {
    /// Spec §4.3.4 path (a): a new assistant message appears with
    /// `error.name` containing "aborted" whose `parentID` message's text
    /// carries our `CCB_REQ_ID`.
    pub fn detect_cancelled_since(&self, req_id: &str) -> bool {
        let req_id = req_id.to_ascii_lowercase();
        let Some(session_id) = &self.current_session_id else {
            return false;
        };
        let messages = self.read_messages(session_id);
        let by_id: HashMap<String, MessageFile> = messages
            .iter()
            .filter_map(|m| m.id.clone().map(|id| (id, m.clone())))
            .collect();

        for msg in messages.iter().filter(|m| m.role.as_deref() == Some("assistant")) {
            let Some(error) = &msg.error else { continue };
            if !is_aborted_error(error) {
                continue;
            }
            let Some(parent_id) = &msg.parent_id else { continue };
            let Some(parent) = by_id.get(parent_id) else { continue };
            let Some(parent_mid) = &parent.id else { continue };
            let parts = self.read_parts(parent_mid);
            let prompt_text = Self::extract_text(&parts);
            if let Some(found) = extract_req_id_from_text(&prompt_text) {
                if found == req_id {
                    return true;
                }
            }
        }
        false
    }

    /// Spec §4.3.4 path (b): tail OpenCode's server log for a `cancel`/
    /// `abort` line naming `session_id`, timestamped at or after
    /// `since_epoch_s`. Fallback for the race where the client interrupts
    /// before the aborted-message path (a) is persisted to storage. Tails
    /// from the cursor left by the previous call, starting at EOF on first
    /// use so only lines written after binding are considered.
    fn detect_cancel_event_in_logs(&mut self, session_id: &str, since_epoch_s: f64) -> bool {
        let root = log_root();
        let Some(latest) = latest_log_file(&root) else {
            return false;
        };
        let latest_mtime = std::fs::metadata(&latest)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let path = match &self.cancel_log_path {
            Some(p) if p.is_file() && (*p == latest || latest_mtime <= self.cancel_log_mtime + 0.5) => p.clone(),
            _ => {
                self.cancel_log_offset = std::fs::metadata(&latest).map(|m| m.len()).unwrap_or(0);
                latest.clone()
            }
        };

        let Ok(content) = std::fs::read_to_string(&path) else {
            self.cancel_log_path = Some(path);
            return false;
        };
        let size = content.len() as u64;
        let offset = self.cancel_log_offset.min(size) as usize;
        let chunk = &content[offset..];

        self.cancel_log_path = Some(path);
        self.cancel_log_offset = size;
        self.cancel_log_mtime = latest_mtime;

        for line in chunk.lines() {
            if !is_cancel_log_line(line, session_id) {
                continue;
            }
            let Some(ts) = parse_log_epoch_s(line) else {
                continue;
            };
            if ts + 0.1 < since_epoch_s {
                continue;
            }
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_json(path: &Path, value: serde_json::Value) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, serde_json::to_string(&value).unwrap()).unwrap();
    }

    fn setup_basic_session(root: &Path, project_id: &str, session_id: &str, work_dir: &str) {
        write_json(
            &root.join("project").join(format!("{project_id}.json")),
            serde_json::json!({"id": project_id, "worktree": work_dir, "time": {"updated": 1}}),
        );
        write_json(
            &root.join("session").join(project_id).join(format!("ses_{session_id}.json")),
            serde_json::json!({"id": session_id, "directory": work_dir, "time": {"updated": 1}}),
        );
    }

    #[tokio::test]
    async fn detects_project_id_by_worktree_match() {
        let tmp = tempfile::tempdir().unwrap();
        setup_basic_session(tmp.path(), "proj1", "ses1", "/work/proj");

        let reader =
            OpenCodeReader::bind_with_options("/work/proj", None, false, false, false)
                .await;
        // bind_with_options uses the real storage_root() internally via
        // detect_project_id being called on a custom root in unit tests below
        // instead; this test only exercises the standalone helper.
        let _ = reader;

        let pid = OpenCodeReader::detect_project_id(tmp.path(), "/work/proj", false);
        assert_eq!(pid, Some("proj1".to_string()));
    }

    #[test]
    fn s8_cancellation_via_error_and_matching_req_id() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let session_id = "ses1";

        write_json(
            &root.join("message").join(session_id).join("msg_user1.json"),
            serde_json::json!({"id": "user1", "sessionID": session_id, "role": "user"}),
        );
        write_json(
            &root.join("part").join("user1").join("prt_1.json"),
            serde_json::json!({"messageID": "user1", "type": "text", "text": "CCB_REQ_ID: 20260101-000000-000-1-1\ndo it"}),
        );
        write_json(
            &root.join("message").join(session_id).join("msg_asst1.json"),
            serde_json::json!({
                "id": "asst1",
                "sessionID": session_id,
                "role": "assistant",
                "parentID": "user1",
                "error": {"name": "MessageAbortedError", "data": {"message": "The operation was aborted."}}
            }),
        );

        let reader = OpenCodeReader {
            root: root.to_path_buf(),
            project_id: "global".to_string(),
            session_id_filter: None,
            work_dir: "/work/proj".to_string(),
            allow_parent_match: false,
            allow_any_session: false,
            execution_complete_marker: "[EXECUTION_COMPLETE]".to_string(),
            current_session_id: Some(session_id.to_string()),
            assistant_count: 0,
            last_assistant_id: None,
            last_assistant_completed: None,
            last_assistant_has_done: false,

            cancel_log_path: None,
            cancel_log_offset: 0,
            cancel_log_mtime: 0.0,
        };

        assert!(reader.detect_cancelled_since("20260101-000000-000-1-1"));
        assert!(!reader.detect_cancelled_since("20260101-000000-000-9-9"));
    }

    #[test]
    fn s8_cancellation_via_server_log_line() {
        let tmp = tempfile::tempdir().unwrap();
        let log_dir = tmp.path().join("log");
        fs::create_dir_all(&log_dir).unwrap();
        fs::write(
            log_dir.join("opencode.log"),
            "INFO  2026-01-09T12:11:12 +1ms service=server path=/session/ses1/abort\n",
        )
        .unwrap();
        std::env::set_var("OPENCODE_LOG_ROOT", &log_dir);

        let mut reader = OpenCodeReader {
            root: tmp.path().to_path_buf(),
            project_id: "global".to_string(),
            session_id_filter: None,
            work_dir: "/work/proj".to_string(),
            allow_parent_match: false,
            allow_any_session: false,
            execution_complete_marker: "[EXECUTION_COMPLETE]".to_string(),
            current_session_id: Some("ses1".to_string()),
            assistant_count: 0,
            last_assistant_id: None,
            last_assistant_completed: None,
            last_assistant_has_done: false,

            cancel_log_path: None,
            cancel_log_offset: 0,
            cancel_log_mtime: 0.0,
        };

        let before = 1767960672.0 + 5.0; // after the log line's timestamp
        assert!(!reader.detect_cancel_event_in_logs("ses1", before));

        fs::write(
            log_dir.join("opencode.log"),
            "INFO  2026-01-09T12:11:12 +1ms service=server path=/session/ses1/abort\nINFO  2026-01-09T12:11:20 +1ms service=server path=/session/ses1/abort\n",
        )
        .unwrap();
        let since = 1767960680.0 - 1.0;
        assert!(reader.detect_cancel_event_in_logs("ses1", since));

        std::env::remove_var("OPENCODE_LOG_ROOT");
    }

    #[test]
    fn extract_text_falls_back_to_reasoning_only_when_no_text_part() {
        let parts = vec![PartFile {
            message_id: Some("m1".to_string()),
            kind: Some("reasoning".to_string()),
            text: Some("thinking...".to_string()),
        }];
        assert_eq!(OpenCodeReader::extract_text(&parts), "thinking...");

        let parts_with_text = vec![
            PartFile {
                message_id: Some("m1".to_string()),
                kind: Some("reasoning".to_string()),
                text: Some("thinking...".to_string()),
            },
            PartFile {
                message_id: Some("m1".to_string()),
                kind: Some("text".to_string()),
                text: Some("final answer".to_string()),
            },
        ];
        assert_eq!(OpenCodeReader::extract_text(&parts_with_text), "final answer");
    }
}
