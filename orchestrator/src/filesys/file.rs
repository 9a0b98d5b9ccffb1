//! File operations

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::errors::OrchestratorError;

/// A file wrapper with path
#[derive(Debug, Clone)]
pub struct File {
    path: PathBuf,
}

impl File {
    /// Create a new file reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the file exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Read file contents as string
    pub async fn read_string(&self) -> Result<String, OrchestratorError> {
        Ok(fs::read_to_string(&self.path).await?)
    }

    /// Read file as JSON
    pub async fn read_json<T: DeserializeOwned>(&self) -> Result<T, OrchestratorError> {
        let contents = self.read_string().await?;
        let value = serde_json::from_str(&contents)?;
        Ok(value)
    }

    /// Read file as JSON, falling back to `T::default()` when the file is missing
    pub async fn read_json_or_default<T: DeserializeOwned + Default>(
        &self,
    ) -> Result<T, OrchestratorError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read file as YAML
    pub async fn read_yaml<T: DeserializeOwned>(&self) -> Result<T, OrchestratorError> {
        let contents = self.read_string().await?;
        let value = serde_yaml::from_str(&contents)?;
        Ok(value)
    }

    /// Write JSON to file atomically
    pub async fn write_json<T: Serialize>(&self, value: &T) -> Result<(), OrchestratorError> {
        let contents = serde_json::to_string_pretty(value)?;
        self.write_atomic(contents.as_bytes()).await
    }

    /// Delete the file; a missing file is not an error
    pub async fn delete(&self) -> Result<(), OrchestratorError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Permission bits of the file (always 0 on non-Unix platforms)
    pub async fn mode(&self) -> Result<u32, OrchestratorError> {
        let meta = fs::metadata(&self.path).await?;
        Ok(mode_bits(&meta))
    }

    /// Set file permissions to owner-read/write only (0o600) on Unix.
    ///
    /// A no-op on non-Unix platforms.
    pub async fn set_permissions_600(&self) -> Result<(), OrchestratorError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        Ok(())
    }

    /// Atomic write using a temporary sibling file and a rename.
    ///
    /// Readers observe either the old or the new contents, never a partial file.
    pub async fn write_atomic(&self, contents: &[u8]) -> Result<(), OrchestratorError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = self.path.with_file_name(format!(".{file_name}.tmp"));

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

pub(crate) fn mode_bits(meta: &std::fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o7777
    }

    #[cfg(not(unix))]
    {
        let _ = meta;
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn test_write_atomic_then_read_json() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::new(dir.path().join("nested").join("sample.json"));

        let sample = Sample {
            name: "api".to_string(),
            count: 3,
        };
        file.write_json(&sample).await.unwrap();

        let read: Sample = file.read_json().await.unwrap();
        assert_eq!(read, sample);

        // No temp file left behind
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_read_json_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::new(dir.path().join("missing.json"));
        let read: Sample = file.read_json_or_default().await.unwrap();
        assert_eq!(read, Sample::default());
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::new(dir.path().join("gone.json"));
        assert!(file.delete().await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_set_permissions_600() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::new(dir.path().join("secret.env"));
        file.write_atomic(b"KEY=value\n").await.unwrap();
        file.set_permissions_600().await.unwrap();
        assert_eq!(file.mode().await.unwrap(), 0o600);
    }
}
