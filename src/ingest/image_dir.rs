use anyhow::{Context, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

/// One image file in a frame directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageEntry {
    pub path: PathBuf,
    /// Frame index embedded in the file name (last digit run), if any.
    pub index: Option<u64>,
}

/// Sorted listing of a directory of frame images.
#[derive(Clone, Debug, Default)]
pub struct ImageDirectory {
    root: PathBuf,
    entries: Vec<ImageEntry>,
}

impl ImageDirectory {
    /// List image files directly under `dir`, ordered by embedded frame index
    /// and then by name. Files without an index sort after indexed ones.
    pub fn scan(dir: &Path) -> Result<Self> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("failed to list image directory {}", dir.display()))?
        {
            let path = entry?.path();
            if !path.is_file() || !has_image_extension(&path) {
                continue;
            }
            let index = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(embedded_index);
            entries.push(ImageEntry { path, index });
        }
        entries.sort_by(|a, b| {
            let key = |e: &ImageEntry| (e.index.is_none(), e.index.unwrap_or(0));
            key(a).cmp(&key(b)).then_with(|| a.path.cmp(&b.path))
        });
        Ok(Self {
            root: dir.to_path_buf(),
            entries,
        })
    }

    /// Directory built from already-known entries (e.g. just-extracted files).
    pub fn from_entries(root: PathBuf, entries: Vec<ImageEntry>) -> Self {
        Self { root, entries }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries(&self) -> &[ImageEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn embedded_index(stem: &str) -> Option<u64> {
    static DIGITS_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = DIGITS_RE.get_or_init(|| Regex::new(r"(\d+)\D*$").ok()).as_ref()?;
    re.captures(stem)?.get(1)?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn extracts_trailing_index() {
        assert_eq!(embedded_index("frame_000123"), Some(123));
        assert_eq!(embedded_index("cam2_frame_000045"), Some(45));
        assert_eq!(embedded_index("snapshot"), None);
    }

    #[test]
    fn sorts_by_embedded_index_not_lexically() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for name in ["frame_10.jpg", "frame_9.png", "frame_100.jpeg", "notes.txt", "cover.jpg"] {
            fs::write(dir.path().join(name), b"x")?;
        }
        fs::create_dir(dir.path().join("frame_1.jpg"))?;

        let listing = ImageDirectory::scan(dir.path())?;
        let names: Vec<String> = listing
            .entries()
            .iter()
            .filter_map(|e| e.path.file_name()?.to_str().map(str::to_string))
            .collect();
        assert_eq!(
            names,
            vec!["frame_9.png", "frame_10.jpg", "frame_100.jpeg", "cover.jpg"]
        );
        assert_eq!(listing.entries()[1].index, Some(10));
        Ok(())
    }

    #[test]
    fn missing_directory_is_an_error() {
        assert!(ImageDirectory::scan(Path::new("/nonexistent/frames")).is_err());
    }
}
