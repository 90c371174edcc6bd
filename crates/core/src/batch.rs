use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::{Error, Result};

const IMAGE_EXTENSIONS: &[(&str, &str)] = &[
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("webp", "image/webp"),
    ("gif", "image/gif"),
    ("bmp", "image/bmp"),
    ("tiff", "image/tiff"),
    ("tif", "image/tiff"),
    ("avif", "image/avif"),
];

/// One file of a batch. `filename` is relative to the scanned folder and
/// always uses `/` separators; it doubles as the resume log key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFile {
    pub path: PathBuf,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
}

impl BatchFile {
    pub async fn read(&self) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(&self.path).await?)
    }
}

/// MIME type for a supported image extension (case-insensitive).
pub fn image_mime_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    IMAGE_EXTENSIONS
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, mime)| *mime)
}

/// Recursively lists supported images under `folder`, sorted by relative path.
pub fn scan_folder(folder: &Path) -> Result<Vec<BatchFile>> {
    if !folder.is_dir() {
        return Err(Error::InvalidConfig {
            message: format!("not a directory: {}", folder.display()),
        });
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(folder).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Some(mime_type) = image_mime_type(path) else {
            continue;
        };

        let rel_path = path
            .strip_prefix(folder)
            .map_err(|_| Error::InvalidConfig {
                message: "path strip_prefix failed".to_string(),
            })?;
        let filename = relative_name(rel_path)?;
        let size = entry.metadata()?.len();

        files.push(BatchFile {
            path: path.to_path_buf(),
            filename,
            mime_type: mime_type.to_string(),
            size,
        });
    }

    files.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(files)
}

fn relative_name(rel_path: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for c in rel_path.components() {
        let s = c.as_os_str().to_str().ok_or_else(|| Error::NonUtf8Path {
            path: rel_path.to_path_buf(),
        })?;
        parts.push(s);
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_types_cover_image_extensions() {
        assert_eq!(image_mime_type(Path::new("a.PNG")), Some("image/png"));
        assert_eq!(image_mime_type(Path::new("a.jpg")), Some("image/jpeg"));
        assert_eq!(image_mime_type(Path::new("a.tif")), Some("image/tiff"));
        assert_eq!(image_mime_type(Path::new("a.avif")), Some("image/avif"));
        assert_eq!(image_mime_type(Path::new("a.txt")), None);
        assert_eq!(image_mime_type(Path::new("noext")), None);
    }

    #[test]
    fn scan_is_recursive_sorted_and_filtered() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("b.png"), b"bb").unwrap();
        std::fs::write(root.join("a.gif"), b"a").unwrap();
        std::fs::write(root.join("notes.txt"), b"skip").unwrap();
        std::fs::write(root.join("sub/c.webp"), b"ccc").unwrap();

        let files = scan_folder(root).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, vec!["a.gif", "b.png", "sub/c.webp"]);
        assert_eq!(files[2].size, 3);
        assert_eq!(files[2].mime_type, "image/webp");
    }

    #[test]
    fn scan_of_missing_folder_is_invalid_config() {
        let temp = tempfile::tempdir().unwrap();
        let err = scan_folder(&temp.path().join("missing")).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }
}
