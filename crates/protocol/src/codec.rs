//! Protocol codec: frame a prompt with a request id, detect its completion
//! marker, and extract the reply segment belonging to that request.
//!
//! Ported from the original `ccb_protocol` module. The wire format never
//! changes across providers: only the wrapping instructions differ.

use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use regex::Regex;

pub const REQ_ID_PREFIX: &str = "CCB_REQ_ID:";
pub const BEGIN_PREFIX: &str = "CCB_BEGIN:";
pub const DONE_PREFIX: &str = "CCB_DONE:";

/// Matches a generic `*_DONE` trailer tag that is not our own `CCB_DONE:` form.
static GENERIC_DONE_TAG_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*[A-Z][A-Z0-9_]*_DONE(?:\s*:\s*\d{8}-\d{6}-\d{3}-\d+-\d+)?\s*$")
        .expect("static regex")
});

static ANY_CCB_DONE_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*CCB_DONE:\s*\d{8}-\d{6}-\d{3}-\d+-\d+\s*$").expect("static regex"));

fn is_trailing_noise_line(line: &str) -> bool {
    if line.trim().is_empty() {
        return true;
    }
    // A bare `CCB_DONE:` line is never noise by itself; only a *different*,
    // non-CCB `*_DONE` tag is treated as an ignorable harness trailer.
    if line.trim_start().starts_with("CCB_DONE") {
        return false;
    }
    GENERIC_DONE_TAG_RE.is_match(line)
}

pub fn done_line_regex(req_id: &str) -> Regex {
    Regex::new(&format!(r"^\s*CCB_DONE:\s*{}\s*$", regex::escape(req_id))).expect("valid done regex")
}

/// Remove trailing protocol/harness marker lines for cosmetic display.
pub fn strip_trailing_markers(text: &str) -> String {
    let mut lines: Vec<&str> = text.lines().collect();
    while let Some(&last) = lines.last() {
        if is_trailing_noise_line(last) || ANY_CCB_DONE_LINE_RE.is_match(last) {
            lines.pop();
            continue;
        }
        break;
    }
    lines.join("\n").trim_end().to_string()
}

static REQ_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// `YYYYMMDD-HHMMSS-mmm-<pid>-<seq>`, dense and monotonically unique per
/// process.
pub fn make_req_id() -> String {
    let now = chrono::Local::now();
    let seq = REQ_ID_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!(
        "{}-{:03}-{}-{}",
        now.format("%Y%m%d-%H%M%S"),
        now.timestamp_subsec_millis(),
        std::process::id(),
        seq
    )
}

/// Recover the wall-clock submission time encoded in a `make_req_id()`
/// value (`YYYYMMDD-HHMMSS-mmm-...`), for callers that need a submission
/// epoch without threading it through separately (OpenCode's server-log
/// cancellation check, spec §4.3.4 path (b)).
pub fn req_id_submitted_epoch_s(req_id: &str) -> Option<f64> {
    use chrono::TimeZone;

    let mut parts = req_id.splitn(4, '-');
    let date = parts.next()?;
    let time = parts.next()?;
    let millis_str = parts.next()?;
    if date.len() != 8 || time.len() != 6 {
        return None;
    }
    let millis: u32 = millis_str.parse().ok()?;
    let naive_date = chrono::NaiveDate::parse_from_str(date, "%Y%m%d").ok()?;
    let naive_time = chrono::NaiveTime::parse_from_str(time, "%H%M%S").ok()?;
    let naive = chrono::NaiveDateTime::new(naive_date, naive_time);
    let local = chrono::Local.from_local_datetime(&naive).single()?;
    Some(local.timestamp() as f64 + millis as f64 / 1000.0)
}

fn wrap_body(message: &str, req_id: &str, tail: &str) -> String {
    format!(
        "{prefix} {req_id}\n\n{message}\n\n{tail}{done_prefix} {req_id}\n",
        prefix = REQ_ID_PREFIX,
        req_id = req_id,
        message = message.trim_end(),
        tail = tail,
        done_prefix = DONE_PREFIX,
    )
}

/// Default wrapper used by Gemini, OpenCode, and Droid.
pub fn wrap_default_prompt(message: &str, req_id: &str) -> String {
    wrap_body(
        message,
        req_id,
        "IMPORTANT:\n\
         - Reply normally.\n\
         - Reply normally, in English.\n\
         - End your reply with this exact final line (verbatim, on its own line):\n",
    )
}

/// Codex variant: identical contract, matches the original's wording.
pub fn wrap_codex_prompt(message: &str, req_id: &str) -> String {
    wrap_default_prompt(message, req_id)
}

/// Claude variant: same two contracts, phrased to match Claude's system
/// prompt conventions (imperative, no repeated "Reply normally" line).
pub fn wrap_claude_prompt(message: &str, req_id: &str) -> String {
    wrap_body(
        message,
        req_id,
        "IMPORTANT:\n\
         - Respond normally, in English.\n\
         - Finish your response with this exact final line, verbatim, on its own line:\n",
    )
}

/// True iff, after stripping trailing noise lines, the final non-noise
/// line matches exactly `CCB_DONE: <reqId>`.
pub fn is_done_text(text: &str, req_id: &str) -> bool {
    let lines: Vec<&str> = text.lines().collect();
    let done_re = done_line_regex(req_id);
    for line in lines.iter().rev() {
        if is_trailing_noise_line(line) {
            continue;
        }
        return done_re.is_match(line);
    }
    false
}

pub fn strip_done_text(text: &str, req_id: &str) -> String {
    let mut lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return String::new();
    }

    while matches!(lines.last(), Some(l) if is_trailing_noise_line(l)) {
        lines.pop();
    }

    let done_re = done_line_regex(req_id);
    if matches!(lines.last(), Some(l) if done_re.is_match(l)) {
        lines.pop();
    }

    while matches!(lines.last(), Some(l) if is_trailing_noise_line(l)) {
        lines.pop();
    }

    lines.join("\n").trim_end().to_string()
}

/// Extract the reply segment for `req_id` from a message that may contain
/// several completed turns back to back.
///
/// When multiple replies are present (each ending with `CCB_DONE: <req_id>`),
/// extract only the segment between the previous done line and the done
/// line for our req_id. This prevents mixing old/stale content into the
/// current reply.
pub fn extract_reply_for_req(text: &str, req_id: &str) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return String::new();
    }

    let target_re = done_line_regex(req_id);
    let done_idxs: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, l)| ANY_CCB_DONE_LINE_RE.is_match(l))
        .map(|(i, _)| i)
        .collect();
    let target_idxs: Vec<usize> = done_idxs
        .iter()
        .copied()
        .filter(|&i| target_re.is_match(lines[i]))
        .collect();

    let Some(&target_i) = target_idxs.last() else {
        if !done_idxs.is_empty() {
            // Some other turn's done marker is present; this is stale
            // content from a different request. Never mix it in.
            return String::new();
        }
        // No done markers at all; fall back to a cosmetic strip.
        return strip_done_text(text, req_id);
    };

    let prev_done_i = done_idxs
        .iter()
        .rev()
        .copied()
        .find(|&i| i < target_i)
        .map(|i| i as isize)
        .unwrap_or(-1);

    let start = (prev_done_i + 1) as usize;
    let mut segment = &lines[start..target_i];
    while matches!(segment.first(), Some(l) if l.trim().is_empty()) {
        segment = &segment[1..];
    }
    while matches!(segment.last(), Some(l) if l.trim().is_empty()) {
        segment = &segment[..segment.len() - 1];
    }

    segment.join("\n").trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_extract_between_done_markers() {
        let log = "CCB_DONE: 20260101-000000-000-1-1\nhello world\nCCB_DONE: 20260101-000000-000-1-2\n";
        assert_eq!(
            extract_reply_for_req(log, "20260101-000000-000-1-2"),
            "hello world"
        );
    }

    #[test]
    fn s2_missing_req_returns_empty() {
        let log = "CCB_DONE: A\nsome text\nCCB_DONE: C\n";
        // `A`/`C` are not well-formed req-ids so they won't match
        // ANY_CCB_DONE_LINE_RE; use well-formed ones instead.
        let log = log.replace("A", "20260101-000000-000-1-1");
        let log = log.replace('C', "20260101-000000-000-1-3");
        assert_eq!(extract_reply_for_req(&log, "20260101-000000-000-1-2"), "");
    }

    #[test]
    fn invariant_roundtrip_trims_only_blank_lines() {
        let req_id = make_req_id();
        let wrapped = wrap_default_prompt("do the thing", &req_id);
        let x = "line one\nline two";
        let log = format!("{wrapped}{x}\nCCB_DONE: {req_id}\n");
        assert_eq!(extract_reply_for_req(&log, &req_id), x);
    }

    #[test]
    fn is_done_ignores_trailing_blank_lines() {
        let req_id = make_req_id();
        let text = format!("reply text\nCCB_DONE: {req_id}\n\n\n");
        assert!(is_done_text(&text, &req_id));
    }

    #[test]
    fn is_done_rejects_generic_done_tag() {
        let req_id = make_req_id();
        let text = format!("reply text\nCCB_DONE: {req_id}\nHARNESS_DONE\n");
        assert!(is_done_text(&text, &req_id));
    }

    #[test]
    fn strip_trailing_markers_removes_done_and_blank_lines() {
        let text = "hello\nCCB_DONE: 20260101-000000-000-1-1\n\n";
        assert_eq!(strip_trailing_markers(text), "hello");
    }

    #[test]
    fn req_id_submitted_epoch_s_parses_own_format() {
        let req_id = make_req_id();
        assert!(req_id_submitted_epoch_s(&req_id).is_some());
        assert_eq!(req_id_submitted_epoch_s("not-a-req-id"), None);
    }
}
