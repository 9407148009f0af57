//! Filesystem collaborator.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Reads and writes text files on behalf of remote requests.
#[async_trait]
pub trait FileSystem: Send + Sync + 'static {
    async fn read(&self, path: &str) -> Result<String, String>;

    /// Write `contents` to `path`, replacing the file. Returns bytes written.
    async fn write(&self, path: &str, contents: &str) -> Result<usize, String>;
}

/// Host filesystem, optionally confined to a root directory.
#[derive(Debug, Clone, Default)]
pub struct LocalFs {
    root: Option<PathBuf>,
}

impl LocalFs {
    /// Unconfined access to the host filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve every path relative to `root` and refuse to leave it.
    pub fn confined(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        if path.is_empty() {
            return Err("empty path".to_string());
        }
        let requested = Path::new(path);
        let Some(root) = &self.root else {
            return Ok(requested.to_path_buf());
        };
        for component in requested.components() {
            match component {
                Component::ParentDir => {
                    return Err(format!("path '{path}' contains '..' which is not allowed"))
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(format!("path '{path}' must be relative to the sandbox root"))
                }
                _ => {}
            }
        }
        Ok(root.join(requested))
    }
}

#[async_trait]
impl FileSystem for LocalFs {
    async fn read(&self, path: &str) -> Result<String, String> {
        let resolved = self.resolve(path)?;
        debug!(path = %resolved.display(), "Reading file");
        tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| format!("cannot read {}: {e}", resolved.display()))
    }

    async fn write(&self, path: &str, contents: &str) -> Result<usize, String> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("cannot create {}: {e}", parent.display()))?;
        }
        debug!(path = %resolved.display(), bytes = contents.len(), "Writing file");
        tokio::fs::write(&resolved, contents)
            .await
            .map_err(|e| format!("cannot write {}: {e}", resolved.display()))?;
        Ok(contents.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read_in_root() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::confined(dir.path());
        assert_eq!(fs.write("notes/a.txt", "hello").await.unwrap(), 5);
        assert_eq!(fs.read("notes/a.txt").await.unwrap(), "hello");
        assert!(dir.path().join("notes/a.txt").exists());
    }

    #[tokio::test]
    async fn test_confinement() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::confined(dir.path());
        assert!(fs.read("../etc/passwd").await.unwrap_err().contains(".."));
        assert!(fs.write("/tmp/x", "y").await.is_err());
        assert!(fs.read("").await.is_err());
    }

    #[tokio::test]
    async fn test_unconfined_absolute_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.txt");
        let fs = LocalFs::new();
        fs.write(path.to_str().unwrap(), "x").await.unwrap();
        assert_eq!(fs.read(path.to_str().unwrap()).await.unwrap(), "x");
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::confined(dir.path());
        assert!(fs.read("nope.txt").await.unwrap_err().contains("cannot read"));
    }
}
