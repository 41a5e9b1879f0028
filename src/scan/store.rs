//! JSON snapshot of the latest working-proxy set

use crate::error::ScanError;
use crate::proxy::models::WorkingProxy;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

/// File-backed result store. Writes go to a sibling temp file that is then
/// renamed over the destination, so readers never see a partial file.
#[derive(Debug, Clone)]
pub struct ResultStore {
    path: PathBuf,
}

impl ResultStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(OsString::from)
            .unwrap_or_else(|| OsString::from("results.json"));
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Replace the stored set
    pub async fn save(&self, working: &[WorkingProxy]) -> Result<(), ScanError> {
        let store_error = |source: io::Error| ScanError::Store {
            path: self.path.clone(),
            source,
        };

        let json = serde_json::to_vec_pretty(working)
            .map_err(|e| store_error(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        let temp = self.temp_path();
        tokio::fs::write(&temp, json).await.map_err(store_error)?;
        if let Err(e) = tokio::fs::rename(&temp, &self.path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(store_error(e));
        }
        Ok(())
    }

    /// Read the stored set; a missing file is an empty set
    pub async fn load(&self) -> io::Result<Vec<WorkingProxy>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}
