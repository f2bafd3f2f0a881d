//! Path normalization and `ccb_project_id` derivation, ported from
//! `project_id.py`. Deliberately avoids symlink resolution: only
//! `~`-expansion, absolutization, separator/dot-segment normalization, and
//! WSL/MSYS drive-letter mapping.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

static WIN_DRIVE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z]:([/\\]|$)").unwrap());
static MNT_DRIVE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^/mnt/([A-Za-z])/(.*)$").unwrap());
static MSYS_DRIVE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^/([A-Za-z])/(.*)$").unwrap());

/// Collapse `.`/`..` segments using POSIX semantics over a string that has
/// already been forced to `/` separators.
fn posix_normpath(path: &str) -> String {
    let is_abs = path.starts_with('/');
    let mut out: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => continue,
            ".." => {
                if matches!(out.last(), Some(&s) if s != "..") {
                    out.pop();
                } else if !is_abs {
                    out.push("..");
                }
            }
            _ => out.push(seg),
        }
    }
    let joined = out.join("/");
    if is_abs {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Running on a host where MSYS-style `/c/...` drive paths should be
/// mapped. Mirrors the original's `"MSYSTEM" in os.environ or os.name ==
/// "nt"` check.
fn msys_drive_mapping_active() -> bool {
    std::env::var_os("MSYSTEM").is_some() || cfg!(windows)
}

/// Normalize a work_dir into a stable string for hashing and matching.
///
/// Goals: stable within a single environment (Linux/WSL/Windows/MSYS);
/// reduce trivial path-format mismatches; avoid `resolve()` to sidestep
/// symlink/interop surprises.
pub fn normalize_work_dir(value: &str) -> String {
    let raw = value.trim();
    if raw.is_empty() {
        return String::new();
    }

    let mut raw = raw.to_string();

    if raw.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            if raw == "~" {
                raw = home.to_string_lossy().to_string();
            } else if let Some(rest) = raw.strip_prefix("~/") {
                raw = home.join(rest).to_string_lossy().to_string();
            }
        }
    }

    {
        let preview = raw.replace('\\', "/");
        let is_abs = preview.starts_with('/')
            || preview.starts_with("\\\\")
            || WIN_DRIVE_RE.is_match(&preview);
        if !is_abs {
            if let Ok(cwd) = std::env::current_dir() {
                raw = cwd.join(&raw).to_string_lossy().to_string();
            }
        }
    }

    let mut s = raw.replace('\\', "/");

    if let Some(caps) = MNT_DRIVE_RE.captures(&s) {
        let drive = caps[1].to_lowercase();
        let rest = &caps[2];
        s = format!("{drive}:/{rest}");
    } else if msys_drive_mapping_active() {
        if let Some(caps) = MSYS_DRIVE_RE.captures(&s) {
            let drive = caps[1].to_lowercase();
            let rest = &caps[2];
            s = format!("{drive}:/{rest}");
        }
    }

    if let Some(rest) = s.strip_prefix("//") {
        s = format!("//{}", posix_normpath(rest).trim_start_matches('/'));
    } else {
        s = posix_normpath(&s);
    }

    if WIN_DRIVE_RE.is_match(&s) {
        let mut chars = s.chars();
        if let Some(first) = chars.next() {
            s = format!("{}{}", first.to_ascii_lowercase(), chars.as_str());
        }
    }

    s
}

/// Find the root of the git repository by traversing up from `start_dir`.
pub fn find_git_root(start_dir: &Path) -> Option<PathBuf> {
    let mut current = absolutize(start_dir);
    loop {
        if current.join(".git").exists() {
            return Some(current);
        }
        let parent = current.parent()?.to_path_buf();
        if parent == current {
            return None;
        }
        current = parent;
    }
}

fn absolutize(p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(p))
            .unwrap_or_else(|_| p.to_path_buf())
    }
}

/// Find a `.ccb/` (or legacy `.ccb_config/`) directory by traversing up
/// from `start_dir`, bounded by the enclosing git root or 10 levels.
pub fn find_ccb_config_root(start_dir: &Path) -> Option<PathBuf> {
    let mut current = absolutize(start_dir);
    let git_root = find_git_root(&current);

    const MAX_LEVELS: u32 = 10;
    let mut level = 0u32;

    loop {
        if current.join(".ccb").is_dir() || current.join(".ccb_config").is_dir() {
            return Some(current);
        }

        if let Some(ref root) = git_root {
            if &current == root {
                break;
            }
        }

        let Some(parent) = current.parent().map(|p| p.to_path_buf()) else {
            break;
        };
        if parent == current {
            break;
        }

        if git_root.is_none() {
            level += 1;
            if level >= MAX_LEVELS {
                break;
            }
        }

        current = parent;
    }

    None
}

/// `ccb_project_id = sha256(normalize(project anchor dir))`.
///
/// Priority: the closest ancestor directory containing `.ccb/` (or legacy
/// `.ccb_config/`), else `work_dir` itself.
pub fn compute_ccb_project_id(work_dir: &Path) -> String {
    let wd = absolutize(work_dir);
    let base = find_ccb_config_root(&wd).unwrap_or_else(|| wd.clone());

    let mut norm = normalize_work_dir(&base.to_string_lossy());
    if norm.is_empty() {
        norm = normalize_work_dir(&wd.to_string_lossy());
    }

    let mut hasher = Sha256::new();
    hasher.update(norm.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn s6_mnt_drive_mapping() {
        assert_eq!(normalize_work_dir("/mnt/C/Users/alice/"), "c:/Users/alice");
    }

    #[test]
    fn s6_posix_dot_dot_collapse() {
        assert_eq!(normalize_work_dir("/a//b/../c"), "/a/c");
    }

    #[test]
    fn invariant6_idempotent() {
        let p = "/mnt/C/Users/alice/../bob/./x";
        let once = normalize_work_dir(p);
        let twice = normalize_work_dir(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn s7_project_id_stable_under_ccb_anchor() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("p");
        let sub = root.join("sub").join("dir");
        fs::create_dir_all(&sub).unwrap();
        fs::create_dir_all(root.join(".ccb")).unwrap();

        let id_root = compute_ccb_project_id(&root);
        let id_sub = compute_ccb_project_id(&sub);
        assert_eq!(id_root, id_sub);
    }

    #[test]
    fn s7_without_anchor_differs_per_descendant() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("a").join("b");
        fs::create_dir_all(&b).unwrap();

        let id_a = compute_ccb_project_id(&a);
        let id_b = compute_ccb_project_id(&b);
        assert_ne!(id_a, id_b);
    }
}
