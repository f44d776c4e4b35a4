//! Detects assets that are already on disk
//!
//! An asset counts as present when its canonical file exists, or when a file
//! matching its kind's name heuristic does. That lets files saved by hand
//! under the vendor's own name satisfy the requirement.

use crate::catalog::AssetDescriptor;
use crate::paths;
use regex::{Regex, RegexBuilder};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

/// Key markers and the globs they select. First matching row wins.
const HEURISTICS: &[(&[&str], &[&str])] = &[
    (&["modengine"], &["ModEngine*.zip"]),
    (&["foggate"], &["*Fog*Gate*.zip"]),
    (&["itemenemy", "item_enemy"], &["*Item*Enemy*.zip", "*Static*Item*.zip"]),
    (&["combinedsfx"], &["*Combined*SFX*.zip"]),
    (&["divinedragon"], &["*Divine*Dragon*.zip"]),
    (&["crashfix"], &["DarkSoulsIII.exe", "*DarkSouls*.exe"]),
    (&["randomizer"], &["*Randomizer*.zip"]),
];

/// Globs for an asset key, empty when the key has no heuristic
pub fn patterns_for(key: &str) -> &'static [&'static str] {
    let key = key.to_lowercase();
    HEURISTICS
        .iter()
        .find(|(markers, _)| markers.iter().any(|m| key.contains(m)))
        .map(|(_, globs)| *globs)
        .unwrap_or(&[])
}

/// Case-insensitive shell glob (`*` and `?`) as an anchored regex
pub fn glob_to_regex(glob: &str) -> Option<Regex> {
    let mut pattern = String::from("^");
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            c => pattern.push_str(&regex::escape(&c.to_string())),
        }
    }
    pattern.push('$');
    RegexBuilder::new(&pattern).case_insensitive(true).build().ok()
}

/// Newest file directly in `dir` whose name matches one of `globs`
pub fn newest_match(dir: &Path, globs: &[&str]) -> Option<PathBuf> {
    let regexes: Vec<Regex> = globs.iter().filter_map(|g| glob_to_regex(g)).collect();
    if regexes.is_empty() {
        return None;
    }

    let entries = std::fs::read_dir(dir).ok()?;
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            regexes.iter().any(|re| re.is_match(&name))
        })
        .map(|entry| {
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, entry.path())
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

/// Presence checks relative to a data root
#[derive(Debug, Clone)]
pub struct PresenceDetector {
    data_root: PathBuf,
}

impl PresenceDetector {
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    pub fn output_dir(&self, descriptor: &AssetDescriptor) -> PathBuf {
        self.data_root.join(&descriptor.output_dir)
    }

    /// Where the canonical file belongs
    pub fn expected_path(&self, descriptor: &AssetDescriptor) -> PathBuf {
        self.output_dir(descriptor).join(&descriptor.file_name)
    }

    /// Path of the file satisfying `descriptor`, if any
    pub fn find(&self, descriptor: &AssetDescriptor) -> Option<PathBuf> {
        let dir = self.output_dir(descriptor);
        if let Some(exact) = paths::resolve_case_insensitive(&dir, &descriptor.file_name) {
            return Some(exact);
        }

        let found = newest_match(&dir, patterns_for(&descriptor.key));
        if let Some(path) = &found {
            debug!("{} satisfied by {}", descriptor.key, path.display());
        }
        found
    }

    pub fn is_present(&self, descriptor: &AssetDescriptor) -> bool {
        self.find(descriptor).is_some()
    }

    /// Locate a fresh download for normalization. Keys without a heuristic
    /// fall back to the newest zip in the folder.
    pub fn locate_download(&self, descriptor: &AssetDescriptor) -> Option<PathBuf> {
        self.find(descriptor)
            .or_else(|| newest_match(&self.output_dir(descriptor), &["*.zip"]))
    }
}
