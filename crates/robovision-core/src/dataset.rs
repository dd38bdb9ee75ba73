//! Dataset scanner — deterministic walk over a `<root>/<person>/<image>` tree.
//!
//! The walk is depth-first and pre-order with entries sorted by file name at
//! every level, so rescanning an unchanged tree yields the same sequence (and
//! therefore the same identity IDs).

use crate::labels::normalize_label;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::{DirEntry, WalkDir};

/// Image extensions accepted by the scanner, compared case-insensitively.
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("dataset root {path} is not readable: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("dataset root {0} is not a directory")]
    NotADirectory(PathBuf),
}

/// One image discovered in the dataset, labelled by its parent directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabeledImage {
    pub label: String,
    pub path: PathBuf,
}

/// Step of a scan: either a directory being entered or an image found in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Directory(PathBuf),
    Image(LabeledImage),
}

/// Single-pass, lazy traversal started by [`scan`].
///
/// Iterating yields only [`LabeledImage`]s; [`DatasetScan::next_event`] also
/// reports every directory as it is entered. Symbolic links are never
/// followed, so a link cycle cannot repeat images.
pub struct DatasetScan {
    entries: walkdir::IntoIter,
}

/// Start scanning `root`. Only the root itself is checked eagerly.
pub fn scan(root: &Path) -> Result<DatasetScan, ScanError> {
    let meta = std::fs::metadata(root).map_err(|source| ScanError::Root {
        path: root.to_path_buf(),
        source,
    })?;
    if !meta.is_dir() {
        return Err(ScanError::NotADirectory(root.to_path_buf()));
    }
    let entries = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();
    Ok(DatasetScan { entries })
}

impl DatasetScan {
    pub fn next_event(&mut self) -> Option<ScanEvent> {
        loop {
            let entry = match self.entries.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(path = ?e.path(), error = %e, "skipping unreadable dataset entry");
                    continue;
                }
            };
            if let Some(event) = classify(entry) {
                return Some(event);
            }
        }
    }
}

fn classify(entry: DirEntry) -> Option<ScanEvent> {
    let file_type = entry.file_type();
    if file_type.is_dir() {
        return Some(ScanEvent::Directory(entry.into_path()));
    }
    if !file_type.is_file() || !has_image_extension(entry.path()) {
        return None;
    }
    // Depth 1 is directly under the root, where there is no person directory.
    if entry.depth() < 2 {
        tracing::debug!(path = %entry.path().display(), "ignoring image at dataset root");
        return None;
    }
    let label = entry
        .path()
        .parent()
        .and_then(Path::file_name)
        .map(|name| normalize_label(&name.to_string_lossy()))?;
    Some(ScanEvent::Image(LabeledImage {
        label,
        path: entry.into_path(),
    }))
}

impl Iterator for DatasetScan {
    type Item = LabeledImage;

    fn next(&mut self) -> Option<LabeledImage> {
        loop {
            match self.next_event()? {
                ScanEvent::Image(image) => return Some(image),
                ScanEvent::Directory(_) => continue,
            }
        }
    }
}

pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| IMAGE_EXTENSIONS.iter().any(|ok| ext.eq_ignore_ascii_case(ok)))
        .unwrap_or(false)
}
