//! Allow-listed file reads for `POST /files/read`.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::FileAccessError;

pub const DEFAULT_MAX_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct FileContent {
    pub path: String,
    pub size: u64,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct FileReader {
    roots: Vec<PathBuf>,
    max_bytes: u64,
}

impl FileReader {
    /// Relative paths resolve against the first root.
    pub fn new(roots: Vec<PathBuf>, max_bytes: u64) -> Self {
        Self { roots, max_bytes }
    }

    pub async fn read(&self, requested: &str) -> Result<FileContent, FileAccessError> {
        let requested_path = Path::new(requested);
        let candidate = if requested_path.is_absolute() {
            requested_path.to_path_buf()
        } else {
            match self.roots.first() {
                Some(root) => root.join(requested_path),
                None => return Err(FileAccessError::Forbidden(requested.to_string())),
            }
        };

        let resolved = match tokio::fs::canonicalize(&candidate).await {
            Ok(p) => p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FileAccessError::NotFound(requested.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut allowed = false;
        for root in &self.roots {
            if let Ok(root) = tokio::fs::canonicalize(root).await
                && resolved.starts_with(&root)
            {
                allowed = true;
                break;
            }
        }
        if !allowed {
            return Err(FileAccessError::Forbidden(requested.to_string()));
        }

        let meta = tokio::fs::metadata(&resolved).await?;
        if !meta.is_file() {
            return Err(FileAccessError::NotFound(requested.to_string()));
        }
        if meta.len() > self.max_bytes {
            return Err(FileAccessError::TooLarge {
                path: requested.to_string(),
                size: meta.len(),
                limit: self.max_bytes,
            });
        }

        let bytes = tokio::fs::read(&resolved).await?;
        Ok(FileContent {
            path: resolved.to_string_lossy().into_owned(),
            size: meta.len(),
            content: String::from_utf8_lossy(&bytes).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(root: &Path, max: u64) -> FileReader {
        FileReader::new(vec![root.to_path_buf()], max)
    }

    #[tokio::test]
    async fn reads_relative_and_absolute_paths_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.rs"), "pub fn x() {}").unwrap();
        let r = reader(dir.path(), DEFAULT_MAX_BYTES);

        let rel = r.read("src/lib.rs").await.unwrap();
        assert_eq!(rel.content, "pub fn x() {}");

        let abs = dir.path().join("src/lib.rs");
        let abs = r.read(abs.to_str().unwrap()).await.unwrap();
        assert_eq!(abs.size, 13);
    }

    #[tokio::test]
    async fn traversal_outside_root_is_forbidden() {
        let outer = tempfile::tempdir().unwrap();
        let root = outer.path().join("workspace");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(outer.path().join("secret"), "token").unwrap();

        let err = reader(&root, DEFAULT_MAX_BYTES)
            .read("../secret")
            .await
            .unwrap_err();
        assert!(matches!(err, FileAccessError::Forbidden(_)));
    }

    #[tokio::test]
    async fn missing_and_oversized_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("big.txt"), vec![b'a'; 64]).unwrap();
        let r = reader(dir.path(), 16);

        assert!(matches!(
            r.read("nope.txt").await.unwrap_err(),
            FileAccessError::NotFound(_)
        ));
        assert!(matches!(
            r.read("big.txt").await.unwrap_err(),
            FileAccessError::TooLarge { size: 64, limit: 16, .. }
        ));
    }
}
