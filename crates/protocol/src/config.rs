//! Env-knob configuration, parsed once at daemon startup. Shared by the
//! server and every reader crate so a knob is clamped in exactly one place.

use std::time::Duration;

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn clamp_u64(value: u64, lo: u64, hi: u64) -> u64 {
    value.clamp(lo, hi)
}

fn clamp_f64(value: f64, lo: f64, hi: f64) -> f64 {
    value.clamp(lo, hi)
}

/// Process-wide configuration object, built once from environment
/// variables at boot. Mirrors spec §6's "Env knobs" table.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_refresh_interval: Duration,
    pub bind_scan_limit: u64,
    pub rebind_tail_bytes: u64,
    pub pane_check_interval: Duration,
    pub opencode_poll_interval: Duration,
    pub opencode_force_read_interval: Duration,
    pub opencode_allow_parent_workdir_match: bool,
    pub opencode_allow_any_session: bool,
    pub opencode_allow_git_root_fallback: bool,
    pub completion_hook_enabled: bool,
    pub execution_complete_marker: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_refresh_interval: Duration::from_secs(env_u64(
                "CCB_LASKD_BIND_REFRESH_INTERVAL",
                60,
            )),
            bind_scan_limit: clamp_u64(env_u64("CCB_LASKD_BIND_SCAN_LIMIT", 400), 50, 20_000),
            rebind_tail_bytes: env_u64("CCB_LASKD_REBIND_TAIL_BYTES", 2 * 1024 * 1024),
            pane_check_interval: Duration::from_secs_f64(env_f64(
                "CCB_LASKD_PANE_CHECK_INTERVAL",
                2.0,
            )),
            opencode_poll_interval: Duration::from_secs_f64(clamp_f64(
                env_f64("OPENCODE_POLL_INTERVAL", 0.05),
                0.02,
                0.5,
            )),
            opencode_force_read_interval: Duration::from_secs_f64(env_f64(
                "OPENCODE_FORCE_READ_INTERVAL",
                1.0,
            )),
            opencode_allow_parent_workdir_match: env_bool(
                "OPENCODE_ALLOW_PARENT_WORKDIR_MATCH",
                false,
            ),
            opencode_allow_any_session: env_bool("OPENCODE_ALLOW_ANY_SESSION", false),
            opencode_allow_git_root_fallback: env_bool("OPENCODE_ALLOW_GIT_ROOT_FALLBACK", false),
            completion_hook_enabled: env_bool("CCB_COMPLETION_HOOK_ENABLED", true),
            execution_complete_marker: std::env::var("CCB_EXECUTION_COMPLETE_MARKER")
                .unwrap_or_else(|_| "[EXECUTION_COMPLETE]".to_string()),
        }
    }

    /// Rebind grace window and anchor-collect grace are fixed constants in
    /// the original (not env-tunable); kept as associated constants rather
    /// than config fields.
    pub const ANCHOR_COLLECT_GRACE: Duration = Duration::from_secs(2);
    pub const ANCHOR_GRACE_DEADLINE: Duration = Duration::from_millis(1500);
    pub const REGISTRY_MONITOR_INTERVAL: Duration = Duration::from_secs(10);
    pub const REGISTRY_EVICT_AFTER: Duration = Duration::from_secs(300);
    pub const BIND_REFRESH_BASE_SECS: u64 = 60;
    pub const BIND_REFRESH_MAX_BACKOFF_SECS: u64 = 600;
    pub const AUTO_TRANSFER_DEDUP_TTL: Duration = Duration::from_secs(3600);
    pub const ROOT_WATCHER_DEBOUNCE: Duration = Duration::from_millis(400);
    pub const PENDING_LOG_PRUNE_AFTER: Duration = Duration::from_secs(120);
    pub const CLAUDE_SIDECHAIN_SCAN_LINES: usize = 30;
}

/// Exponential backoff for binding refresh: `min(600, max(base, backoff*2))`.
pub fn next_bind_backoff_secs(current: u64) -> u64 {
    (Config::BIND_REFRESH_BASE_SECS.max(current * 2)).min(Config::BIND_REFRESH_MAX_BACKOFF_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_is_capped() {
        let mut b = Config::BIND_REFRESH_BASE_SECS;
        for _ in 0..20 {
            b = next_bind_backoff_secs(b);
        }
        assert_eq!(b, Config::BIND_REFRESH_MAX_BACKOFF_SECS);
    }

    #[test]
    fn scan_limit_clamped() {
        std::env::set_var("CCB_LASKD_BIND_SCAN_LIMIT", "5");
        assert_eq!(Config::from_env().bind_scan_limit, 50);
        std::env::set_var("CCB_LASKD_BIND_SCAN_LIMIT", "999999");
        assert_eq!(Config::from_env().bind_scan_limit, 20_000);
        std::env::remove_var("CCB_LASKD_BIND_SCAN_LIMIT");
    }
}
