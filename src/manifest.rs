use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// The rendered manifest on disk, owned by one execution.
#[derive(Debug)]
pub struct ManifestFile {
    path: PathBuf,
}

impl ManifestFile {
    /// Write `content` to `path`, replacing any previous file, and sync it.
    pub async fn write(path: &Path, content: &str) -> Result<Self> {
        let to_error = |source| Error::ManifestWrite {
            path: path.display().to_string(),
            source,
        };

        let mut file = tokio::fs::File::create(path).await.map_err(to_error)?;
        file.write_all(content.as_bytes()).await.map_err(to_error)?;
        file.sync_all().await.map_err(to_error)?;

        debug!("Wrote manifest to {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file. Failures are logged only.
    pub async fn remove(self) {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!("Removed manifest {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Manifest {} was already gone", self.path.display());
            }
            Err(e) => warn!("File: {} was not deleted: {}", self.path.display(), e),
        }
    }
}
