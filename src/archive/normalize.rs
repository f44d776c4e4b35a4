use crate::error::ArchiveError;
use crate::paths;
use std::fs::File;
use std::path::Path;
use tracing::{debug, info, warn};
use zip::{ZipArchive, ZipWriter};

use super::{analyze, is_zip, Layout};

/// What `normalize` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormalizeResult {
    /// Rewritten without the wrapper folder; the source is gone
    Flattened { root: String },
    /// Moved to the target unchanged
    Moved,
    /// Already at the target, nothing to do
    Unchanged,
    /// Rewrite failed; the source was copied byte for byte and kept
    Copied { reason: String },
}

/// Put `source` at `target` in canonical shape.
///
/// With `flatten` set, a zip whose files all share one top-level folder is
/// rewritten without it. Entries are raw-copied, so compressed bytes and
/// timestamps are unchanged. Everything else is moved as-is.
pub fn normalize(source: &Path, target: &Path, flatten: bool) -> Result<NormalizeResult, ArchiveError> {
    if let Some(dir) = target.parent() {
        std::fs::create_dir_all(dir)?;
    }

    if !flatten || !is_zip(source) {
        return move_into_place(source, target);
    }

    let root = match analyze(source) {
        Ok(report) => match report.layout {
            Layout::SingleRoot(root) => root,
            layout => {
                debug!("{} has layout {:?}, leaving entries alone", source.display(), layout);
                return move_into_place(source, target);
            }
        },
        Err(e) => return copy_fallback(source, target, e),
    };

    match rewrite_flattened(source, target, &root) {
        Ok(count) => {
            if source != target {
                std::fs::remove_file(source)?;
            }
            info!("Flattened {} ({} entries moved out of '{}')", target.display(), count, root);
            Ok(NormalizeResult::Flattened { root })
        }
        Err(e) => copy_fallback(source, target, e),
    }
}

/// Write a copy of `source` without the `root` folder to a temp file beside
/// `target`, then rename it over `target`.
fn rewrite_flattened(source: &Path, target: &Path, root: &str) -> Result<usize, ArchiveError> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let mut archive = ZipArchive::new(File::open(source)?)?;
    let mut writer = ZipWriter::new(tempfile::NamedTempFile::new_in(dir)?);
    let mut count = 0;

    for i in 0..archive.len() {
        let entry = archive.by_index_raw(i)?;
        let name = entry.name().to_string();
        match paths::strip_top_level(&name, root) {
            // The wrapper folder's own entry
            Some("") => continue,
            Some(stripped) => {
                writer.raw_copy_file_rename(entry, stripped.to_string())?;
                count += 1;
            }
            None => {
                // Only directory entries can get here for a single-root archive
                debug!("Dropping entry outside '{}': {}", root, name);
            }
        }
    }

    let temp = writer.finish()?;
    temp.persist(target).map_err(|e| ArchiveError::Io(e.error))?;
    Ok(count)
}

fn move_into_place(source: &Path, target: &Path) -> Result<NormalizeResult, ArchiveError> {
    if source == target {
        return Ok(NormalizeResult::Unchanged);
    }
    if std::fs::rename(source, target).is_err() {
        // Different filesystem
        std::fs::copy(source, target)?;
        std::fs::remove_file(source)?;
    }
    debug!("Moved {} -> {}", source.display(), target.display());
    Ok(NormalizeResult::Moved)
}

fn copy_fallback(
    source: &Path,
    target: &Path,
    error: ArchiveError,
) -> Result<NormalizeResult, ArchiveError> {
    warn!(
        "Could not rewrite {} ({}), keeping the original layout",
        source.display(),
        error
    );
    if source == target {
        return Ok(NormalizeResult::Unchanged);
    }
    std::fs::copy(source, target)?;
    Ok(NormalizeResult::Copied {
        reason: error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::io::{Read, Write};
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;
    use zip::{CompressionMethod, DateTime};

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) -> Result<()> {
        let file = File::create(path)?;
        let mut zip = ZipWriter::new(file);
        let stamp = DateTime::from_date_and_time(2019, 3, 22, 14, 30, 10).unwrap();
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(stamp);

        for (name, data) in entries {
            if name.ends_with('/') {
                zip.add_directory(name.trim_end_matches('/'), options)?;
            } else {
                zip.start_file(*name, options)?;
                zip.write_all(data)?;
            }
        }
        zip.finish()?;
        Ok(())
    }

    fn read_entries(path: &Path) -> Result<Vec<(String, Vec<u8>)>> {
        let mut archive = ZipArchive::new(File::open(path)?)?;
        let mut out = Vec::new();
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            if entry.is_dir() {
                continue;
            }
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            out.push((entry.name().to_string(), data));
        }
        Ok(out)
    }

    #[test]
    fn test_single_root_is_flattened() -> Result<()> {
        let dir = tempdir()?;
        let source = dir.path().join("ModEngine-0.1.16.zip");
        let target = dir.path().join("ModEngine.zip");
        write_zip(
            &source,
            &[
                ("ModEngine-0.1.16/", b""),
                ("ModEngine-0.1.16/dinput8.dll", b"dll bytes"),
                ("ModEngine-0.1.16/mods/", b""),
                ("ModEngine-0.1.16/mods/readme.txt", b"hello"),
            ],
        )?;

        let result = normalize(&source, &target, true)?;
        assert_eq!(result, NormalizeResult::Flattened { root: "ModEngine-0.1.16".into() });
        assert!(!source.exists());

        let entries = read_entries(&target)?;
        assert_eq!(
            entries,
            vec![
                ("dinput8.dll".to_string(), b"dll bytes".to_vec()),
                ("mods/readme.txt".to_string(), b"hello".to_vec()),
            ]
        );

        let mut archive = ZipArchive::new(File::open(&target)?)?;
        let stamp = archive.by_name("dinput8.dll")?.last_modified();
        assert_eq!(stamp, DateTime::from_date_and_time(2019, 3, 22, 14, 30, 10).ok());
        Ok(())
    }

    #[test]
    fn test_mixed_layout_only_moves() -> Result<()> {
        let dir = tempdir()?;
        let source = dir.path().join("vendor name.zip");
        let target = dir.path().join("ModEngine.zip");
        write_zip(&source, &[("readme.txt", b"r"), ("ModEngine/dinput8.dll", b"d")])?;
        let before = std::fs::read(&source)?;

        let result = normalize(&source, &target, true)?;
        assert_eq!(result, NormalizeResult::Moved);
        assert!(!source.exists());
        assert_eq!(std::fs::read(&target)?, before);
        Ok(())
    }

    #[test]
    fn test_without_flatten_single_root_is_kept() -> Result<()> {
        let dir = tempdir()?;
        let source = dir.path().join("DS3 Fog Gate Randomizer v0.3.zip");
        let target = dir.path().join("DS3_FogGate_Randomizer.zip");
        write_zip(&source, &[("FogMod/FogMod.exe", b"exe")])?;

        assert_eq!(normalize(&source, &target, false)?, NormalizeResult::Moved);
        let names: Vec<String> = read_entries(&target)?.into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["FogMod/FogMod.exe"]);
        Ok(())
    }

    #[test]
    fn test_in_place_flatten() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("ModEngine.zip");
        write_zip(&path, &[("Wrapper/a.dll", b"a"), ("Wrapper/b.ini", b"b")])?;

        normalize(&path, &path, true)?;
        let names: Vec<String> = read_entries(&path)?.into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["a.dll", "b.ini"]);

        // Second pass sees a root-level archive
        assert_eq!(normalize(&path, &path, true)?, NormalizeResult::Unchanged);
        Ok(())
    }

    #[test]
    fn test_corrupt_archive_falls_back_to_copy() -> Result<()> {
        let dir = tempdir()?;
        let source = dir.path().join("download.zip");
        let target = dir.path().join("ModEngine.zip");
        std::fs::write(&source, b"definitely not a zip")?;

        let result = normalize(&source, &target, true)?;
        assert!(matches!(result, NormalizeResult::Copied { .. }));
        assert!(source.exists());
        assert_eq!(std::fs::read(&target)?, b"definitely not a zip");
        Ok(())
    }

    #[test]
    fn test_executable_is_moved() -> Result<()> {
        let dir = tempdir()?;
        let source = dir.path().join("DarkSoulsIII (1).exe");
        let target = dir.path().join("DarkSoulsIII.exe");
        std::fs::write(&source, b"MZ")?;

        assert_eq!(normalize(&source, &target, true)?, NormalizeResult::Moved);
        assert_eq!(std::fs::read(&target)?, b"MZ");
        Ok(())
    }
}
