//! Discovery of complete IFCB sample file sets.

use std::path::{Path, PathBuf};

use log::{debug, info};
use thiserror::Error;
use walkdir::WalkDir;

/// Errors that can occur during sample discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Directory not found: {0}")]
    DirectoryNotFound(PathBuf),
}

/// The three files describing one sample (bin).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplePair {
    /// Bin name, the shared file stem.
    pub stem: String,
    pub hdr: PathBuf,
    pub adc: PathBuf,
    pub class: PathBuf,
}

impl SamplePair {
    /// Companion file paths for a `.hdr` file.
    pub fn for_hdr(hdr: &Path, class_suffix: &str) -> Self {
        let stem = hdr
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let adc = hdr.with_extension("adc");
        let class = hdr.with_file_name(format!("{}{}", stem, class_suffix));
        Self {
            stem,
            hdr: hdr.to_path_buf(),
            adc,
            class,
        }
    }

    /// True when the ADC and class files both exist.
    pub fn is_complete(&self) -> bool {
        self.adc.is_file() && self.class.is_file()
    }
}

/// Samples found under a directory.
#[derive(Debug, Default)]
pub struct Discovery {
    pub complete: Vec<SamplePair>,
    /// Header files lacking an ADC or class file.
    pub skipped: Vec<SamplePair>,
}

fn is_hdr(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("hdr"))
        .unwrap_or(false)
}

/// Recursively collect `.hdr` files under `dir`, sorted.
///
/// Directory symlinks are not followed, so a link back into the tree cannot
/// report the same sample twice.
pub fn find_hdr_files(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::with_capacity(64);

    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_dir() && is_hdr(entry.path()) {
            found.push(entry.into_path());
        }
    }

    found.sort();
    found
}

/// Find every sample under `root` and split complete from incomplete sets.
///
/// # Errors
///
/// Returns [`DiscoveryError::DirectoryNotFound`] if `root` is not a directory.
pub fn discover_samples(root: &Path, class_suffix: &str) -> Result<Discovery, DiscoveryError> {
    if !root.is_dir() {
        return Err(DiscoveryError::DirectoryNotFound(root.to_path_buf()));
    }

    let mut discovery = Discovery::default();
    for hdr in find_hdr_files(root) {
        let pair = SamplePair::for_hdr(&hdr, class_suffix);
        if pair.is_complete() {
            discovery.complete.push(pair);
        } else {
            info!("Skipping incomplete set for: {}", pair.stem);
            discovery.skipped.push(pair);
        }
    }

    Ok(discovery)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use tempfile::TempDir;

    const SUFFIX: &str = "_class_vNone.csv";

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        File::create(path).unwrap();
    }

    #[test]
    fn test_for_hdr_paths() {
        let pair = SamplePair::for_hdr(Path::new("/data/D20240418T084427_IFCB124.hdr"), SUFFIX);
        assert_eq!(pair.stem, "D20240418T084427_IFCB124");
        assert_eq!(pair.adc, PathBuf::from("/data/D20240418T084427_IFCB124.adc"));
        assert_eq!(
            pair.class,
            PathBuf::from("/data/D20240418T084427_IFCB124_class_vNone.csv")
        );
    }

    #[test]
    fn test_discover_samples_recursive() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        for stem in ["D20240418T084427_IFCB124", "nested/D20240419T084427_IFCB124"] {
            touch(&root.join(format!("{}.hdr", stem)));
            touch(&root.join(format!("{}.adc", stem)));
            touch(&root.join(format!("{}{}", stem, SUFFIX)));
        }
        // Missing class file
        touch(&root.join("D20240420T084427_IFCB124.hdr"));
        touch(&root.join("D20240420T084427_IFCB124.adc"));

        let discovery = discover_samples(root, SUFFIX).unwrap();
        assert_eq!(discovery.complete.len(), 2);
        assert_eq!(discovery.skipped.len(), 1);
        assert_eq!(discovery.skipped[0].stem, "D20240420T084427_IFCB124");
        assert!(discovery
            .complete
            .iter()
            .any(|p| p.stem == "D20240419T084427_IFCB124"));
    }

    #[cfg(unix)]
    #[test]
    fn test_find_hdr_files_ignores_symlink_cycle() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        touch(&root.join("a").join("D1_IFCB1.hdr"));
        std::os::unix::fs::symlink(root, root.join("a").join("loop")).unwrap();

        let found = find_hdr_files(root);

        assert_eq!(found, vec![root.join("a").join("D1_IFCB1.hdr")]);
    }

    #[test]
    fn test_discover_samples_missing_dir() {
        let temp_dir = TempDir::new().unwrap();
        let err = discover_samples(&temp_dir.path().join("absent"), SUFFIX).unwrap_err();
        assert!(matches!(err, DiscoveryError::DirectoryNotFound(_)));
    }
}
