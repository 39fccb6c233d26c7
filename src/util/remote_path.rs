// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Syntactic manipulation of remote POSIX paths, without local access to
//! those paths. Remote paths are plain `/`-separated strings; none of the
//! helpers here touch the filesystem.

use uuid::Uuid;

/// Subdirectory of the remote base where leftover working directories from
/// crashed attempts are archived instead of being deleted.
pub const LOST_FOUND_DIR: &str = "lost+found";

/// Join a remote base directory and a relative path using '/' separators.
/// The relative part is normalized first, so "./a//b" and "a/b" join the same.
pub fn join_remote(base: &str, rel: &str) -> String {
    let mut out = base.trim_end_matches('/').to_string();
    for seg in normalized_segments(rel) {
        out.push('/');
        out.push_str(&seg);
    }
    out
}

/// Normalize a relative remote path: strip leading "./" and any root, drop
/// "." segments and empty segments, resolve ".." where possible. Equivalent
/// relative spellings normalize to the same string, which is what the
/// provenance exclusion comparison relies on.
pub fn normalize_rel(path: &str) -> String {
    normalized_segments(path).join("/")
}

fn normalized_segments(path: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if out.pop().is_none() {
                    out.push("..".to_string());
                }
            }
            other => out.push(other.to_string()),
        }
    }
    out
}

/// Shard a calculation uuid into a three-level relative path, bounding the
/// fan-out of any single remote directory: "abcdef12..." becomes
/// "ab/cd/ef12...".
pub fn shard_uuid(uuid: &Uuid) -> String {
    let s = uuid.to_string();
    format!("{}/{}/{}", &s[0..2], &s[2..4], &s[4..])
}

/// The suffix of a relative remote path retained when staging it locally.
///
/// `depth` counts the directory levels kept above the file name: `None`
/// keeps the full relative path, `Some(0)` flattens to the base name, and
/// `Some(n)` keeps the last `n` directories plus the base name.
pub fn retained_suffix(rel: &str, depth: Option<u32>) -> String {
    let segments = normalized_segments(rel);
    match depth {
        None => segments.join("/"),
        Some(n) => {
            let keep = (n as usize + 1).min(segments.len());
            segments[segments.len() - keep..].join("/")
        }
    }
}

/// Whether a source entry is a glob pattern that must be expanded remotely.
pub fn has_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Final component of a remote path.
pub fn basename(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

/// The path of `full` relative to the remote directory `base`, when `full`
/// lies underneath it.
pub fn relative_to<'a>(full: &'a str, base: &str) -> Option<&'a str> {
    let base = base.trim_end_matches('/');
    full.strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('/'))
        .filter(|rest| !rest.is_empty())
}
