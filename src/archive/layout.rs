use crate::error::ArchiveError;
use crate::paths;
use std::collections::BTreeSet;
use std::fs::File;
use std::path::Path;

/// Shape of an archive's entry tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    /// Every file sits under this one folder, nothing at the root
    SingleRoot(String),
    /// Every file sits at the root
    RootLevel,
    Mixed,
}

/// Layout plus the entry names it was computed from
#[derive(Debug, Clone)]
pub struct ArchiveReport {
    pub layout: Layout,
    pub entries: Vec<String>,
}

fn is_dir_entry(name: &str) -> bool {
    name.ends_with('/') || name.ends_with('\\')
}

/// Classify a list of entry names
pub fn classify<S: AsRef<str>>(names: &[S]) -> Layout {
    let mut folders = BTreeSet::new();
    let mut at_root = 0usize;

    for name in names.iter().map(AsRef::as_ref).filter(|n| !is_dir_entry(n)) {
        match paths::top_level_folder(name) {
            Some(folder) => {
                folders.insert(folder);
            }
            None => at_root += 1,
        }
    }

    match (folders.len(), at_root) {
        (1, 0) => Layout::SingleRoot(folders.into_iter().next().unwrap_or_default().to_string()),
        (0, _) => Layout::RootLevel,
        _ => Layout::Mixed,
    }
}

/// Read a zip's entry names and classify them
pub fn analyze(path: &Path) -> Result<ArchiveReport, ArchiveError> {
    let archive = zip::ZipArchive::new(File::open(path)?)?;
    let entries: Vec<String> = archive.file_names().map(str::to_string).collect();
    let layout = classify(&entries);
    Ok(ArchiveReport { layout, entries })
}
