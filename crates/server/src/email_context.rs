//! Email context envelope: `~/.laskd/mail/pending/<reqId>.json`, written
//! before submission and removed after delivery (spec §6 "Email context
//! envelope"). IMAP/SMTP wire code is out of scope; only this file's
//! lifecycle is core.

use std::path::PathBuf;

use laskd_protocol::EmailContext;

pub fn pending_path(req_id: &str) -> PathBuf {
    crate::paths::mail_pending_dir().join(format!("{req_id}.json"))
}

pub async fn save(ctx: &EmailContext) -> std::io::Result<()> {
    let dir = crate::paths::mail_pending_dir();
    tokio::fs::create_dir_all(&dir).await?;

    let mut json = serde_json::to_string_pretty(ctx)?;
    json.push('\n');

    let path = pending_path(&ctx.request_id);
    let tmp = dir.join(format!("{}.tmp-{}", ctx.request_id, std::process::id()));
    tokio::fs::write(&tmp, json.as_bytes()).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
    }

    tokio::fs::rename(&tmp, &path).await
}

pub async fn load(req_id: &str) -> Option<EmailContext> {
    let bytes = tokio::fs::read(pending_path(req_id)).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

pub async fn remove(req_id: &str) {
    let _ = tokio::fs::remove_file(pending_path(req_id)).await;
}

/// Prune envelopes older than `PENDING_LOG_PRUNE_AFTER` whose request
/// never completed (e.g. daemon crash mid-wait). Best-effort; failures
/// are logged and otherwise ignored.
pub async fn prune_stale() {
    let dir = crate::paths::mail_pending_dir();
    let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
        return;
    };

    let max_age = laskd_protocol::Config::PENDING_LOG_PRUNE_AFTER;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        if modified.elapsed().map(|age| age > max_age).unwrap_or(false) {
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_load_remove_roundtrips() {
        let tmp = tempfile::tempdir().unwrap();
        crate::paths::reset_data_dir();
        crate::paths::init_data_dir(Some(tmp.path()));

        let ctx = EmailContext {
            request_id: "r1".to_string(),
            message_id: "m1".to_string(),
            from_addr: "a@b.com".to_string(),
            subject: "hi".to_string(),
            thread_id: None,
            references: vec![],
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        };
        save(&ctx).await.unwrap();

        let loaded = load("r1").await.unwrap();
        assert_eq!(loaded.from_addr, "a@b.com");

        remove("r1").await;
        assert!(load("r1").await.is_none());
    }
}
