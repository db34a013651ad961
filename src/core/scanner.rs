use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use walkdir::WalkDir;

use super::identity::RawIdentity;
use crate::config::PipelineConfig;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

/// A product folder found in the archive (or listed in an inventory file).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedItem {
    pub location: PathBuf,
    pub raw: RawIdentity,
    pub asset_count: usize,
    #[serde(default)]
    pub total_bytes: u64,
}

/// Walks an archive laid out as `<size>/<name>/<surface>/<images>`.
pub struct ArchiveScanner {
    config: PipelineConfig,
    cancellation_token: Arc<AtomicBool>,
}

impl ArchiveScanner {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            cancellation_token: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn get_cancellation_token(&self) -> Arc<AtomicBool> {
        self.cancellation_token.clone()
    }

    /// One item per directory that holds eligible images or has no
    /// subdirectories at all (an empty product folder), in file-name order.
    pub fn scan(&self, root: &Path) -> Result<Vec<ScannedItem>, ScanError> {
        if !root.is_dir() {
            return Err(ScanError::InvalidPath {
                path: root.to_string_lossy().to_string(),
            });
        }

        let mut items = Vec::new();
        let walker = WalkDir::new(root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| !is_hidden(entry.file_name()));

        for entry in walker {
            if self.cancellation_token.load(Ordering::Relaxed) {
                return Err(ScanError::Cancelled);
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }

            let listing = match self.list_directory(entry.path()) {
                Ok(listing) => listing,
                Err(e) => {
                    tracing::warn!("Skipping unreadable directory {}: {}", entry.path().display(), e);
                    continue;
                }
            };

            if listing.images.is_empty() && listing.has_subdirectories {
                continue;
            }

            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            items.push(ScannedItem {
                location: entry.path().to_path_buf(),
                raw: identity_from_path(relative),
                asset_count: listing.images.len(),
                total_bytes: listing.total_bytes,
            });
        }

        tracing::info!("Scanned {}: {} product folders", root.display(), items.len());
        Ok(items)
    }

    fn list_directory(&self, dir: &Path) -> std::io::Result<DirectoryListing> {
        let mut listing = DirectoryListing::default();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                if !is_hidden(&entry.file_name()) {
                    listing.has_subdirectories = true;
                }
            } else if file_type.is_file() && is_eligible_image(&entry, &self.config) {
                listing.total_bytes += entry.metadata()?.len();
                listing.images.push(entry.path());
            }
        }
        listing.images.sort();
        Ok(listing)
    }
}

#[derive(Debug, Default)]
struct DirectoryListing {
    images: Vec<PathBuf>,
    total_bytes: u64,
    has_subdirectories: bool,
}

/// Eligible image files directly inside `dir`, sorted by path.
pub fn eligible_files(dir: &Path, config: &PipelineConfig) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() && is_eligible_image(&entry, config) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

/// Innermost folder is the surface, its parent the name, its grandparent the size.
/// Shallower paths only give a name.
pub fn identity_from_path(relative: &Path) -> RawIdentity {
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();

    match parts.as_slice() {
        [.., size, name, surface] => RawIdentity::new(name.clone(), size.clone(), surface.clone()),
        [.., name] => RawIdentity::new(name.clone(), "", ""),
        [] => RawIdentity::default(),
    }
}

/// Shared by counting and listing so `asset_count` matches what gets processed.
fn is_eligible_image(entry: &fs::DirEntry, config: &PipelineConfig) -> bool {
    !is_hidden(&entry.file_name()) && config.is_eligible(&entry.path())
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|s| s.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(path: &Path, bytes: usize) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![0u8; bytes]).unwrap();
    }

    #[test]
    fn test_identity_from_path() {
        assert_eq!(
            identity_from_path(Path::new("60X120/ABACO BAMBU/MAT")),
            RawIdentity::new("ABACO BAMBU", "60X120", "MAT")
        );
        assert_eq!(
            identity_from_path(Path::new("archive/60X120/ABACO/FLP")),
            RawIdentity::new("ABACO", "60X120", "FLP")
        );
        assert_eq!(identity_from_path(Path::new("LOOSE")), RawIdentity::new("LOOSE", "", ""));
    }

    #[test]
    fn test_scan_counts_images_per_folder() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        touch(&root.join("60X120/ABACO/MAT/1.jpg"), 10);
        touch(&root.join("60X120/ABACO/MAT/2.JPEG"), 20);
        touch(&root.join("60X120/ABACO/MAT/notes.txt"), 5);
        touch(&root.join("30X60/ZEUS/FLP/a.jpg"), 7);

        let items = ArchiveScanner::new(PipelineConfig::default()).scan(root).unwrap();

        assert_eq!(items.len(), 2);
        // File-name order: 30X60 before 60X120.
        assert_eq!(items[0].raw, RawIdentity::new("ZEUS", "30X60", "FLP"));
        assert_eq!(items[1].raw, RawIdentity::new("ABACO", "60X120", "MAT"));
        assert_eq!(items[1].asset_count, 2);
        assert_eq!(items[1].total_bytes, 30);
    }

    #[test]
    fn test_scan_reports_empty_leaf_folders() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("60X120/EMPTY/MAT")).unwrap();
        touch(&root.join("60X120/EMPTY/MAT/readme.txt"), 1);

        let items = ArchiveScanner::new(PipelineConfig::default()).scan(root).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].asset_count, 0);
    }

    #[test]
    fn test_scan_skips_hidden_directories() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        touch(&root.join(".trash/60X120/OLD/MAT/1.jpg"), 1);
        touch(&root.join("60X120/NEW/MAT/1.jpg"), 1);

        let items = ArchiveScanner::new(PipelineConfig::default()).scan(root).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].raw.name, "NEW");
    }

    #[test]
    fn test_hidden_companion_files_are_not_counted() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("60X120/ABACO/mat");
        touch(&dir.join("0.jpg"), 10);
        touch(&dir.join("1.jpg"), 10);
        touch(&dir.join("._0.jpg"), 4);
        touch(&dir.join("._1.jpg"), 4);

        let items = ArchiveScanner::new(PipelineConfig::default()).scan(temp_dir.path()).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].asset_count, 2);
        assert_eq!(items[0].total_bytes, 20);
        assert_eq!(
            eligible_files(&dir, &PipelineConfig::default()).unwrap().len(),
            items[0].asset_count
        );
    }

    #[test]
    fn test_scan_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let result = ArchiveScanner::new(PipelineConfig::default()).scan(&temp_dir.path().join("nope"));
        assert!(matches!(result, Err(ScanError::InvalidPath { .. })));
    }

    #[test]
    fn test_scan_cancellation() {
        let temp_dir = TempDir::new().unwrap();
        touch(&temp_dir.path().join("60X120/A/MAT/1.jpg"), 1);

        let scanner = ArchiveScanner::new(PipelineConfig::default());
        scanner.get_cancellation_token().store(true, Ordering::Relaxed);
        assert!(matches!(scanner.scan(temp_dir.path()), Err(ScanError::Cancelled)));
    }

    #[test]
    fn test_eligible_files_sorted() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        touch(&dir.join("b.jpg"), 1);
        touch(&dir.join("a.JPG"), 1);
        touch(&dir.join("c.png"), 1);
        touch(&dir.join(".hidden.jpg"), 1);

        let files = eligible_files(dir, &PipelineConfig::default()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.JPG", "b.jpg"]);
    }
}
