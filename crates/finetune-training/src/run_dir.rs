//! Allocation of numbered run folders, `<name>-run<N>`.

use finetune_core::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// Creates `parent` if needed and returns a new `<parent>/<name>-run<N>`,
/// where `N` is one more than the highest run number already present.
///
/// The number is whatever follows the last `-run` of a subdirectory name
/// (the whole name when there is none). Folders where it does not parse
/// and plain files are skipped.
pub fn get_output_folder(parent: &Path, name: &str) -> Result<PathBuf> {
    fs::create_dir_all(parent)?;

    let mut last = 0u64;
    for entry in fs::read_dir(parent)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let folder = entry.file_name();
        let Some(folder) = folder.to_str() else {
            continue;
        };
        if let Some(n) = folder.rsplit("-run").next().and_then(|n| n.parse::<u64>().ok()) {
            last = last.max(n);
        }
    }

    let path = parent.join(format!("{name}-run{}", last + 1));
    fs::create_dir_all(&path)?;
    Ok(path)
}
