//! `SessionBinding` persistence: the per-`(work_dir, provider)` JSON file
//! at `<work_dir>/.ccb/.<provider>-session` (legacy `<work_dir>/.ccb_config/...`).
//! Grounded on `examples/original_source/lib/laskd_session.py`: atomic
//! temp-file + rename writes, BOM-tolerant reads with bounded retry
//! against a writer racing a reader, and the `old_*` rotation fields
//! copied exactly once per transition (spec §3).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use laskd_protocol::{Provider, SessionBinding};
use tracing::{debug, warn};

const READ_RETRY_ATTEMPTS: u32 = 5;

fn session_file_name(provider: Provider) -> String {
    format!(".{}-session", provider.as_str())
}

pub fn session_dir(work_dir: &Path) -> PathBuf {
    work_dir.join(".ccb")
}

pub fn legacy_session_dir(work_dir: &Path) -> PathBuf {
    work_dir.join(".ccb_config")
}

pub fn session_file_path(work_dir: &Path, provider: Provider) -> PathBuf {
    session_dir(work_dir).join(session_file_name(provider))
}

fn legacy_session_file_path(work_dir: &Path, provider: Provider) -> PathBuf {
    legacy_session_dir(work_dir).join(session_file_name(provider))
}

fn strip_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes)
}

/// Bounded retry read tolerating a writer racing us mid-replace (spec §5
/// "readers may race with writers; they must tolerate a short re-read
/// loop, bounded retries, ≤ 5 attempts with 50–200 ms sleeps").
pub async fn read_binding(work_dir: &Path, provider: Provider) -> Option<SessionBinding> {
    let primary = session_file_path(work_dir, provider);
    let legacy = legacy_session_file_path(work_dir, provider);
    let path = if primary.is_file() {
        primary
    } else if legacy.is_file() {
        legacy
    } else {
        return None;
    };

    for attempt in 0..READ_RETRY_ATTEMPTS {
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let text = String::from_utf8_lossy(strip_bom(&bytes)).to_string();
                if text.trim().is_empty() {
                    // Reader observed the temp-file-truncated window of an
                    // in-flight rename; retry rather than treat as absent.
                } else {
                    match serde_json::from_str::<SessionBinding>(&text) {
                        Ok(binding) => return Some(binding),
                        Err(e) => {
                            debug!(
                                component = "session_file",
                                event = "session_file.parse_retry",
                                attempt,
                                error = %e,
                                "transient parse failure reading session file"
                            );
                        }
                    }
                }
            }
            Err(e) => {
                debug!(
                    component = "session_file",
                    event = "session_file.read_retry",
                    attempt,
                    error = %e,
                    "transient read failure"
                );
            }
        }
        tokio::time::sleep(Duration::from_millis(50 + 30 * attempt as u64)).await;
    }

    warn!(
        component = "session_file",
        event = "session_file.read_failed",
        path = %path.display(),
        "giving up after bounded retries"
    );
    None
}

/// Atomic replace: write to a process-unique temp file in the same
/// directory, `fsync`-free rename over the target. UTF-8, pretty-printed
/// (2-space indent), LF line endings, trailing newline, mode 0600.
pub async fn write_binding(
    work_dir: &Path,
    provider: Provider,
    binding: &SessionBinding,
) -> std::io::Result<()> {
    let dir = session_dir(work_dir);
    tokio::fs::create_dir_all(&dir).await?;

    let mut json = serde_json::to_string_pretty(binding)?;
    json.push('\n');

    let tmp_path = dir.join(format!(
        "{}.tmp-{}-{}",
        session_file_name(provider),
        std::process::id(),
        Instant::now().elapsed().as_nanos() % 1_000_000
    ));
    tokio::fs::write(&tmp_path, json.as_bytes()).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    let final_path = session_file_path(work_dir, provider);
    tokio::fs::rename(&tmp_path, &final_path).await?;
    Ok(())
}

/// Record a rotation (spec §3 "old_* fields ... copied exactly once per
/// transition") and persist it atomically.
pub async fn rotate_and_persist(
    work_dir: &Path,
    provider: Provider,
    mut binding: SessionBinding,
    new_path: Option<String>,
    new_id: Option<String>,
    now: &str,
) -> std::io::Result<SessionBinding> {
    binding.rotate_to(new_path, new_id, now);
    write_binding(work_dir, provider, &binding).await?;
    Ok(binding)
}

/// Dedup guard for the auto-transfer feature (spec §5): a keyed set with
/// a 1-hour TTL, guarded by a mutex, preventing a storm of extractions on
/// rapid session toggling. Ported from `_AUTO_TRANSFER_LOCK`/
/// `_AUTO_TRANSFER_SEEN` in `laskd_session.py`.
pub struct TransferDedupGuard {
    seen: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl TransferDedupGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Returns `true` the first time `key` is marked within the TTL
    /// window; `false` on every subsequent call until the entry expires.
    pub fn mark_if_new(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut guard = self.seen.lock().expect("TransferDedupGuard poisoned");
        guard.retain(|_, seen_at| now.duration_since(*seen_at) < self.ttl);
        if guard.contains_key(key) {
            false
        } else {
            guard.insert(key.to_string(), now);
            true
        }
    }
}

impl Default for TransferDedupGuard {
    fn default() -> Self {
        Self::new(laskd_protocol::Config::AUTO_TRANSFER_DEDUP_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use laskd_protocol::TerminalKind;

    fn sample_binding(session_path: &str) -> SessionBinding {
        SessionBinding {
            work_dir: "/work/proj".to_string(),
            work_dir_norm: "/work/proj".to_string(),
            ccb_project_id: "deadbeef".to_string(),
            terminal: Some(TerminalKind::Tmux),
            pane_id: Some("main".to_string()),
            pane_title_marker: None,
            session_path: Some(session_path.to_string()),
            session_id: Some("s1".to_string()),
            old_session_path: None,
            old_session_id: None,
            old_updated_at: None,
            updated_at: "2026-01-01T00:00:00Z".to_string(),
            active: true,
        }
    }

    #[tokio::test]
    async fn write_then_read_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        let binding = sample_binding("/logs/a.jsonl");
        write_binding(tmp.path(), Provider::Claude, &binding).await.unwrap();

        let read_back = read_binding(tmp.path(), Provider::Claude).await.unwrap();
        assert_eq!(read_back.session_path.as_deref(), Some("/logs/a.jsonl"));
        assert_eq!(read_back.pane_id.as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn write_is_pretty_printed_with_trailing_newline_and_mode_0600() {
        let tmp = tempfile::tempdir().unwrap();
        let binding = sample_binding("/logs/a.jsonl");
        write_binding(tmp.path(), Provider::Claude, &binding).await.unwrap();

        let path = session_file_path(tmp.path(), Provider::Claude);
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.ends_with('\n'));
        assert!(contents.contains("  \"work_dir\""));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[tokio::test]
    async fn invariant9_rotation_recorded_exactly_once() {
        let tmp = tempfile::tempdir().unwrap();
        let binding = sample_binding("/logs/a.jsonl");
        write_binding(tmp.path(), Provider::Claude, &binding).await.unwrap();

        let loaded = read_binding(tmp.path(), Provider::Claude).await.unwrap();
        let rotated = rotate_and_persist(
            tmp.path(),
            Provider::Claude,
            loaded,
            Some("/logs/b.jsonl".to_string()),
            Some("s2".to_string()),
            "2026-01-01T00:01:00Z",
        )
        .await
        .unwrap();

        assert_eq!(rotated.old_session_path.as_deref(), Some("/logs/a.jsonl"));
        assert_eq!(rotated.old_session_id.as_deref(), Some("s1"));
        assert!(rotated.old_updated_at.is_some());

        // A second rotation to the same path must not re-copy the old_* fields.
        let again = rotate_and_persist(
            tmp.path(),
            Provider::Claude,
            rotated.clone(),
            Some("/logs/b.jsonl".to_string()),
            Some("s2".to_string()),
            "2026-01-01T00:02:00Z",
        )
        .await
        .unwrap();
        assert_eq!(again.old_session_path.as_deref(), Some("/logs/a.jsonl"));
    }

    #[tokio::test]
    async fn reads_bom_prefixed_file() {
        let tmp = tempfile::tempdir().unwrap();
        let binding = sample_binding("/logs/a.jsonl");
        let dir = session_dir(tmp.path());
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = session_file_path(tmp.path(), Provider::Claude);
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(serde_json::to_string(&binding).unwrap().as_bytes());
        tokio::fs::write(&path, bytes).await.unwrap();

        let read_back = read_binding(tmp.path(), Provider::Claude).await;
        assert!(read_back.is_some());
    }

    #[test]
    fn transfer_dedup_guard_marks_once_per_ttl() {
        let guard = TransferDedupGuard::new(Duration::from_millis(50));
        assert!(guard.mark_if_new("k"));
        assert!(!guard.mark_if_new("k"));
        std::thread::sleep(Duration::from_millis(70));
        assert!(guard.mark_if_new("k"));
    }
}
