use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::builder::BuiltArtifact;
use crate::digest::{compute_sha256, write_sha256};
use crate::error::{PipelineError, Result};
use crate::version::VersionString;

/// `<product>-v<version>-<suffix>`
pub fn artifact_name(product: &str, version: &VersionString, suffix: &str) -> String {
    format!("{product}-v{version}-{suffix}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedArtifact {
    pub name: String,
    pub file_name: String,
    pub location: PathBuf,
    pub sha256: String,
    pub size_bytes: u64,
}

pub trait ArtifactStore: Send + Sync {
    /// Store `file` under `name`. Re-uploading the same name replaces it.
    fn upload(&self, name: &str, file: &Path) -> Result<PublishedArtifact>;
}

/// Stores each artifact as `<root>/<name>/<file>` with a `.sha256` sidecar.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArtifactStore for DirectoryStore {
    fn upload(&self, name: &str, file: &Path) -> Result<PublishedArtifact> {
        let file_name = file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                PipelineError::publish(format!("{} has no file name", file.display()))
            })?;

        let dir = self.root.join(name);
        fs::create_dir_all(&dir).map_err(|err| {
            PipelineError::publish(format!("Failed to create {}: {err}", dir.display()))
        })?;

        let location = dir.join(&file_name);
        let staging = dir.join(format!(".{file_name}.partial"));
        fs::copy(file, &staging).map_err(|err| {
            PipelineError::publish(format!(
                "Failed to copy {} into {}: {err}",
                file.display(),
                dir.display()
            ))
        })?;
        fs::rename(&staging, &location).map_err(|err| {
            let _ = fs::remove_file(&staging);
            PipelineError::publish(format!("Failed to store {}: {err}", location.display()))
        })?;

        let checksum = dir.join(format!("{file_name}.sha256"));
        let sha256 = write_sha256(&location, &checksum)
            .map_err(|err| PipelineError::publish(format!("{err:#}")))?;
        let size_bytes = fs::metadata(&location)
            .map(|m| m.len())
            .map_err(|err| PipelineError::publish(err.to_string()))?;

        Ok(PublishedArtifact {
            name: name.to_string(),
            file_name,
            location,
            sha256,
            size_bytes,
        })
    }
}

pub struct ArtifactPublisher {
    product: String,
    store: Arc<dyn ArtifactStore>,
}

impl ArtifactPublisher {
    pub fn new(product: impl Into<String>, store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            product: product.into(),
            store,
        }
    }

    pub fn publish(&self, built: BuiltArtifact, version: &VersionString) -> Result<PublishedArtifact> {
        let name = artifact_name(&self.product, version, &built.artifact_suffix);
        let published = self.store.upload(&name, &built.path)?;
        info!(
            artifact = published.name.as_str(),
            sha256 = published.sha256.as_str(),
            size = published.size_bytes,
            "Artifact published"
        );
        Ok(published)
    }
}

pub fn stored_digest(artifact: &PublishedArtifact) -> Result<String> {
    compute_sha256(&artifact.location).map_err(|err| PipelineError::publish(format!("{err:#}")))
}
