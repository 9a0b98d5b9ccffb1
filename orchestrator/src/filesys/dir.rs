//! Directory operations

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::OrchestratorError;
use crate::filesys::file::{mode_bits, File};

/// A directory wrapper with path
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    /// Create a new directory reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the directory exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Create the directory (and parents)
    pub async fn create(&self) -> Result<(), OrchestratorError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// Create the directory and restrict it to its owner (0o700 on Unix)
    pub async fn create_private(&self) -> Result<(), OrchestratorError> {
        self.create().await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o700)).await?;
        }
        Ok(())
    }

    /// Permission bits of the directory (always 0 on non-Unix platforms)
    pub async fn mode(&self) -> Result<u32, OrchestratorError> {
        let meta = fs::metadata(&self.path).await?;
        Ok(mode_bits(&meta))
    }

    /// List files in the directory with the given extension
    pub async fn list_files_with_ext(&self, ext: &str) -> Result<Vec<PathBuf>, OrchestratorError> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let matches = path.extension().map(|e| e == ext).unwrap_or(false);
            if matches && entry.file_type().await?.is_file() {
                files.push(path);
            }
        }

        files.sort();
        Ok(files)
    }

    /// Get a file within this directory
    pub fn file(&self, name: &str) -> File {
        File::new(self.path.join(name))
    }
}
