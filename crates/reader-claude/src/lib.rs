//! Claude JSONL rollout tailer: locates the `.jsonl` log belonging to a
//! work_dir (3-tier selection, sidechain exclusion), then tails it with an
//! offset + carry-buffer cursor. Grounded on the teacher's
//! `rollout_watcher.rs` offset-tracking idiom and the original
//! `laskd_registry.py` selection priority.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use laskd_protocol::{CursorState, Event, EventRole};
use laskd_reader_core::{LogReader, ReaderError, SelectionMode};
use serde::Deserialize;
use tracing::{debug, warn};

/// How many of a candidate file's leading lines we parse when
/// heap-scanning for `cwd`/`sessionId`/`isSidechain` (spec §4.3.1 step 3).
const HEAD_SCAN_LINES: usize = 30;

#[derive(Debug, Deserialize)]
struct RolloutLine {
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
    cwd: Option<String>,
    #[serde(rename = "isSidechain")]
    is_sidechain: Option<bool>,
    message: Option<MessagePayload>,
}

#[derive(Debug, Deserialize)]
struct MessagePayload {
    content: Option<Vec<ContentBlock>>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: Option<String>,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionIndexEntry {
    #[serde(rename = "projectPath")]
    project_path: Option<String>,
    #[serde(rename = "fullPath")]
    full_path: String,
    #[serde(rename = "fileMtime")]
    file_mtime: Option<f64>,
    #[serde(rename = "isSidechain")]
    is_sidechain: Option<bool>,
}

pub struct ClaudeReader {
    path: PathBuf,
    offset: u64,
    carry: String,
}

fn projects_root() -> PathBuf {
    std::env::var("CCB_CLAUDE_PROJECTS_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".claude")
                .join("projects")
        })
}

fn file_mtime_secs(path: &Path) -> Option<f64> {
    let meta = fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    Some(
        modified
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64(),
    )
}

fn collect_jsonl_files(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let Ok(entries) = fs::read_dir(root) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            out.extend(collect_jsonl_files(&path));
        } else if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
            out.push(path);
        }
    }
    out
}

fn read_head_lines(path: &Path, n: usize) -> Vec<String> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };
    content.lines().take(n).map(|l| l.to_string()).collect()
}

/// Parse the head of `path` to recover `cwd`/`sessionId`/`isSidechain`
/// without reading the whole file.
fn head_meta(path: &Path) -> Option<(Option<String>, Option<String>, bool)> {
    for line in read_head_lines(path, HEAD_SCAN_LINES) {
        if let Ok(parsed) = serde_json::from_str::<RolloutLine>(&line) {
            if parsed.cwd.is_some() || parsed.session_id.is_some() {
                return Some((
                    parsed.cwd,
                    parsed.session_id,
                    parsed.is_sidechain.unwrap_or(false),
                ));
            }
        }
    }
    None
}

/// Tier 1: a known session-id hint (UUID from `start_cmd`).
fn find_by_session_id(root: &Path, session_id: &str) -> Option<PathBuf> {
    collect_jsonl_files(root)
        .into_iter()
        .find(|p| p.file_stem().and_then(|s| s.to_str()) == Some(session_id))
}

/// Slugify a work_dir path into Claude's project-key directory name
/// (`_project_key_for_path`: every non-alphanumeric byte becomes `-`).
fn project_key_for_path(work_dir_norm: &str) -> String {
    work_dir_norm
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Tier 2: `sessions-index.json` under `<projectsRoot>/<project_key>/`,
/// where `project_key` is the work_dir slugified per `project_key_for_path`.
fn find_via_sessions_index(root: &Path, work_dir_norm: &str) -> Option<PathBuf> {
    let project_dir = root.join(project_key_for_path(work_dir_norm));
    let index_path = project_dir.join("sessions-index.json");
    let content = fs::read_to_string(index_path).ok()?;
    let entries: Vec<SessionIndexEntry> = serde_json::from_str(&content).ok()?;

    entries
        .into_iter()
        .filter(|e| !e.is_sidechain.unwrap_or(false))
        .filter(|e| {
            e.project_path
                .as_deref()
                .map(|p| laskd_protocol::normalize_work_dir(p) == work_dir_norm)
                .unwrap_or(false)
        })
        .max_by(|a, b| {
            a.file_mtime
                .unwrap_or(0.0)
                .partial_cmp(&b.file_mtime.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|e| PathBuf::from(e.full_path))
}

/// Tier 3: bounded heap-scan of the N most recently modified `*.jsonl`
/// files, newest-`cwd`-match wins.
fn heap_scan(root: &Path, work_dir_norm: &str, scan_limit: u64) -> Option<PathBuf> {
    let mut files = collect_jsonl_files(root);
    files.sort_by(|a, b| {
        file_mtime_secs(b)
            .unwrap_or(0.0)
            .partial_cmp(&file_mtime_secs(a).unwrap_or(0.0))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    files.truncate(scan_limit as usize);

    let mut best: Option<(PathBuf, f64)> = None;
    for path in files {
        let Some((cwd, _session_id, is_sidechain)) = head_meta(&path) else {
            continue;
        };
        if is_sidechain {
            continue;
        }
        let Some(cwd) = cwd else { continue };
        let norm = laskd_protocol::normalize_work_dir(&cwd);
        let matches = norm == work_dir_norm || norm.starts_with(&format!("{work_dir_norm}/"));
        if !matches {
            continue;
        }
        let mtime = file_mtime_secs(&path).unwrap_or(0.0);
        if best.as_ref().map(|(_, m)| mtime > *m).unwrap_or(true) {
            best = Some((path, mtime));
        }
    }
    best.map(|(p, _)| p)
}

/// Select the Claude rollout file for `work_dir`, following spec §4.3.1's
/// priority order. `session_id_hint` is tier 1 (`start_cmd` UUID);
/// `Permissive` mode skips tier 2 (used by the rebind path, spec §4.3.1
/// "Rebinding").
pub fn select_log(
    root: &Path,
    work_dir: &str,
    session_id_hint: Option<&str>,
    mode: SelectionMode,
    scan_limit: u64,
) -> Option<PathBuf> {
    if let Some(hint) = session_id_hint {
        if let Some(p) = find_by_session_id(root, hint) {
            return Some(p);
        }
    }

    let work_dir_norm = laskd_protocol::normalize_work_dir(work_dir);

    if mode == SelectionMode::Normal {
        if let Some(p) = find_via_sessions_index(root, &work_dir_norm) {
            return Some(p);
        }
    }

    heap_scan(root, &work_dir_norm, scan_limit)
}

impl ClaudeReader {
    pub async fn bind_with_hint(
        work_dir: &str,
        mode: SelectionMode,
        session_id_hint: Option<&str>,
        scan_limit: u64,
    ) -> Result<Self, ReaderError> {
        let root = projects_root();
        let path = select_log(&root, work_dir, session_id_hint, mode, scan_limit)
            .ok_or(ReaderError::NoMatchingLog)?;
        Ok(Self {
            path,
            offset: 0,
            carry: String::new(),
        })
    }

    fn read_new_chunk(&mut self) -> std::io::Result<String> {
        let mut file = fs::File::open(&self.path)?;
        let len = file.metadata()?.len();
        if len < self.offset {
            // Truncation or rotation: restart from the beginning.
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
        let mut events = Vec::new();
        let combined = format!("{}{}", self.carry, chunk);
        let mut lines: Vec<&str> = combined.split('\n').collect();
        // The last element is either empty (chunk ended with \n) or a
        // partial line carried to the next read.
        self.carry = lines.pop().unwrap_or_default().to_string();

        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let parsed: RolloutLine = match serde_json::from_str(line) {
                Ok(p) => p,
                Err(e) => {
                    debug!(error = %e, "laskd_reader_claude.partial_json_line");
                    continue;
                }
            };
            if parsed.is_sidechain.unwrap_or(false) {
                continue;
            }
            let Some(kind) = parsed.kind.as_deref() else {
                continue;
            };
            let role = match kind {
                "user" => EventRole::User,
                "assistant" => EventRole::Assistant,
                "system" => EventRole::System,
                _ => continue,
            };
            let text = parsed
                .message
                .and_then(|m| m.content)
                .map(|blocks| {
                    blocks
                        .into_iter()
                        .filter(|b| b.kind.as_deref() != Some("tool_use"))
                        .filter_map(|b| b.text)
                        .collect::<Vec<_>>()
                        .join("")
                })
                .unwrap_or_default();
            if text.is_empty() {
                continue;
            }
            events.push(Event::Turn { role, text });
        }
        events
    }
}

#[async_trait]
impl LogReader for ClaudeReader {
    async fn bind(work_dir: &str, mode: SelectionMode) -> Result<Self, ReaderError> {
        let scan_limit = laskd_protocol::Config::from_env().bind_scan_limit;
        Self::bind_with_hint(work_dir, mode, None, scan_limit).await
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
            let Ok(parsed) = serde_json::from_str::<RolloutLine>(line) else {
                continue;
            };
            if parsed.is_sidechain.unwrap_or(false) {
                continue;
            }
            let text = parsed
                .message
                .as_ref()
                .and_then(|m| m.content.as_ref())
                .map(|blocks| {
                    blocks
                        .iter()
                        .filter_map(|b| b.text.clone())
                        .collect::<Vec<_>>()
                        .join("")
                })
                .unwrap_or_default();
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

pub fn projects_root_for_tests() -> PathBuf {
    projects_root()
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
    fn heap_scan_finds_matching_cwd_skipping_sidechains() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();

        let sidechain = root.join("a.jsonl");
        write_jsonl(
            &sidechain,
            &[r#"{"type":"user","cwd":"/work/proj","isSidechain":true}"#],
        );

        let matching = root.join("b.jsonl");
        write_jsonl(
            &matching,
            &[r#"{"type":"user","cwd":"/work/proj","sessionId":"s1"}"#],
        );

        let found = heap_scan(root, &laskd_protocol::normalize_work_dir("/work/proj"), 400);
        assert_eq!(found, Some(matching));
    }

    #[test]
    fn session_id_hint_wins_over_scan() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let target = root.join("deadbeef-0000.jsonl");
        write_jsonl(&target, &[r#"{"type":"user","cwd":"/other"}"#]);

        let found = select_log(root, "/work/proj", Some("deadbeef-0000"), SelectionMode::Normal, 400);
        assert_eq!(found, Some(target));
    }

    #[test]
    fn sessions_index_resolved_under_slugified_project_key() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        let work_dir_norm = laskd_protocol::normalize_work_dir("/work/proj");

        let project_dir = root.join(project_key_for_path(&work_dir_norm));
        fs::create_dir_all(&project_dir).unwrap();

        let target = root.join("deadbeef-1111.jsonl");
        write_jsonl(&target, &[r#"{"type":"user","cwd":"/work/proj","sessionId":"deadbeef-1111"}"#]);

        let index = serde_json::json!([
            {
                "projectPath": "/work/proj",
                "fullPath": target.to_string_lossy(),
                "fileMtime": 100.0,
                "isSidechain": false,
            }
        ]);
        fs::write(
            project_dir.join("sessions-index.json"),
            serde_json::to_string(&index).unwrap(),
        )
        .unwrap();

        let found = find_via_sessions_index(root, &work_dir_norm);
        assert_eq!(found, Some(target));
    }

    #[tokio::test]
    async fn tails_new_lines_with_offset_and_carry() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("s.jsonl");
        write_jsonl(&path, &[r#"{"type":"user","cwd":"/w","message":{"content":[{"type":"text","text":"hi"}]}}"#]);

        let mut reader = ClaudeReader {
            path: path.clone(),
            offset: 0,
            carry: String::new(),
        };
        let state = reader.capture_state();
        let (events, _next) = reader
            .wait_for_events(&state, Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Turn { role, text } => {
                assert_eq!(*role, EventRole::User);
                assert_eq!(text, "hi");
            }
            _ => panic!("expected a Turn event"),
        }
    }
}
