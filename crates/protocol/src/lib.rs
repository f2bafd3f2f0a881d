//! Shared wire-level data model and protocol codec for the laskd daemon
//! and every reader/pane-driver crate that plugs into it.

pub mod codec;
pub mod config;
pub mod project_id;
pub mod types;

pub use codec::{
    done_line_regex, extract_reply_for_req, is_done_text, make_req_id, strip_done_text,
    strip_trailing_markers, wrap_claude_prompt, wrap_codex_prompt, wrap_default_prompt,
};
pub use config::Config;
pub use project_id::{
    compute_ccb_project_id, find_ccb_config_root, find_git_root, normalize_work_dir,
};
pub use types::*;
