//! Archive layout analysis and normalization.
//!
//! Downloaded zips come in two shapes: files at the root, or everything
//! wrapped in a single folder. Loader packages have to sit at the install
//! root, so those get rewritten with the wrapper folder stripped.

mod layout;
mod normalize;

pub use layout::{analyze, classify, ArchiveReport, Layout};
pub use normalize::{normalize, NormalizeResult};

use std::path::Path;

/// Whether a file is handled as a zip archive
pub fn is_zip(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}
