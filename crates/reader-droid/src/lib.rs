//! Droid log reader: analogous to Codex's rotating-log tailer, but a
//! preferred session path may be supplied up front (spec §4.3.5).

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use laskd_protocol::{CursorState, Event};
use laskd_reader_codex::CodexReader;
use laskd_reader_core::{LogReader, ReaderError, SelectionMode};

fn logs_root() -> PathBuf {
    std::env::var("CCB_DROID_LOG_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".factory")
                .join("sessions")
        })
}

pub struct DroidReader {
    inner: CodexReader,
}

impl DroidReader {
    pub async fn bind_with_preferred_path(
        work_dir: &str,
        preferred_session_path: Option<&str>,
    ) -> Result<Self, ReaderError> {
        if let Some(path) = preferred_session_path {
            if std::path::Path::new(path).is_file() {
                return Ok(Self {
                    inner: CodexReader::at_path(PathBuf::from(path)),
                });
            }
        }
        let inner = CodexReader::bind_in(&logs_root(), work_dir).await?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl LogReader for DroidReader {
    async fn bind(work_dir: &str, _mode: SelectionMode) -> Result<Self, ReaderError> {
        Self::bind_with_preferred_path(work_dir, None).await
    }

    fn capture_state(&self) -> CursorState {
        self.inner.capture_state()
    }

    async fn seed_from_tail(&mut self, tail_bytes: u64) -> Result<CursorState, ReaderError> {
        self.inner.seed_from_tail(tail_bytes).await
    }

    async fn wait_for_events(
        &mut self,
        state: &CursorState,
        dt: Duration,
    ) -> Result<(Vec<Event>, CursorState), ReaderError> {
        self.inner.wait_for_events(state, dt).await
    }

    async fn latest_conversations(&self, n: usize) -> Result<Vec<(String, String)>, ReaderError> {
        self.inner.latest_conversations(n).await
    }
}
