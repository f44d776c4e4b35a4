//! Path helpers for Windows-flavored names on Linux
//!
//! Mod archives are usually packed on Windows, so entry names may use `\`
//! as separator, and users drop files with whatever case the vendor chose.

use std::path::{Path, PathBuf};

/// Split an archive entry name into its path segments, accepting both separators
pub fn segments(name: &str) -> impl Iterator<Item = &str> {
    name.split(['\\', '/']).filter(|s| !s.is_empty())
}

/// First path segment of an entry, if the entry sits below a folder.
///
/// `ModEngine/dinput8.dll` -> `Some("ModEngine")`, `dinput8.dll` -> `None`
pub fn top_level_folder(name: &str) -> Option<&str> {
    let mut parts = segments(name);
    let first = parts.next()?;
    parts.next().map(|_| first)
}

/// Strip a leading folder from an entry name, keeping the original separators
/// of the remainder. Returns `None` if the entry is not under `folder`.
pub fn strip_top_level<'a>(name: &'a str, folder: &str) -> Option<&'a str> {
    let trimmed = name.trim_start_matches(['\\', '/']);
    let rest = trimmed.strip_prefix(folder)?;
    let mut chars = rest.chars();
    match chars.next() {
        Some('/') | Some('\\') => Some(chars.as_str()),
        _ => None,
    }
}

/// Find a file case-insensitively within a directory (one level deep)
pub fn resolve_case_insensitive(dir: &Path, file_name: &str) -> Option<PathBuf> {
    let exact = dir.join(file_name);
    if exact.is_file() {
        return Some(exact);
    }

    let target = file_name.to_lowercase();
    std::fs::read_dir(dir).ok()?.find_map(|entry| {
        let entry = entry.ok()?;
        let name = entry.file_name();
        if name.to_string_lossy().to_lowercase() == target && entry.path().is_file() {
            Some(entry.path())
        } else {
            None
        }
    })
}
