use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use cargo_metadata::MetadataCommand;
use cargo_metadata::semver::Version;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::process::{Budget, CommandRunner, CommandSpec};

/// The subset of `cargo metadata` output the resolver needs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetadataDocument {
    #[serde(default)]
    pub packages: Vec<PackageEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PackageEntry {
    pub name: String,
    pub version: String,
}

impl MetadataDocument {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|err| {
            PipelineError::configuration(format!("Failed to parse build metadata: {err}"))
        })
    }
}

/// Where build metadata comes from. Host-specific setup stays inside the
/// implementation; callers only ever see a [`MetadataDocument`].
pub trait MetadataSource: Send + Sync {
    fn describe(&self) -> String;
    fn read(&self, budget: &Budget) -> Result<MetadataDocument>;
}

/// Queries `cargo metadata --no-deps` for the workspace at `manifest_path`.
#[derive(Clone)]
pub struct CargoMetadataSource {
    manifest_path: Option<PathBuf>,
    runner: Arc<dyn CommandRunner>,
}

impl CargoMetadataSource {
    pub fn new(manifest_path: Option<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            manifest_path,
            runner,
        }
    }

    pub fn command(&self) -> CommandSpec {
        let mut metadata = MetadataCommand::new();
        metadata.no_deps();
        if let Some(path) = &self.manifest_path {
            metadata.manifest_path(path);
        }
        let command = metadata.cargo_command();
        CommandSpec::new(command.get_program().to_string_lossy())
            .args(command.get_args().map(|arg| arg.to_string_lossy().to_string()))
    }
}

impl MetadataSource for CargoMetadataSource {
    fn describe(&self) -> String {
        match &self.manifest_path {
            Some(path) => format!("cargo metadata ({})", path.display()),
            None => "cargo metadata".to_string(),
        }
    }

    fn read(&self, budget: &Budget) -> Result<MetadataDocument> {
        let output = budget.run(self.runner.as_ref(), &self.command())?;
        if !output.success {
            return Err(PipelineError::configuration(format!(
                "cargo metadata failed with {}: {}",
                output.describe_status(),
                output.diagnostics_tail(5)
            )));
        }
        MetadataDocument::from_json(&output.stdout)
    }
}

/// Reads a saved `cargo metadata --format-version 1` document.
#[derive(Debug, Clone)]
pub struct MetadataFileSource {
    path: PathBuf,
}

impl MetadataFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MetadataSource for MetadataFileSource {
    fn describe(&self) -> String {
        format!("metadata file {}", self.path.display())
    }

    fn read(&self, _budget: &Budget) -> Result<MetadataDocument> {
        let content = std::fs::read_to_string(&self.path).map_err(|err| {
            PipelineError::configuration(format!(
                "Failed to read build metadata {}: {err}",
                self.path.display()
            ))
        })?;
        MetadataDocument::from_json(&content)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct VersionString(String);

impl VersionString {
    pub fn parse(raw: &str) -> Result<Self> {
        let cleaned = raw
            .trim()
            .trim_matches(|c| c == '"' || c == '\'')
            .trim();
        if cleaned.is_empty() {
            return Err(PipelineError::configuration(
                "Build metadata reports an empty version",
            ));
        }
        Version::parse(cleaned).map_err(|err| {
            PipelineError::configuration(format!("Version '{cleaned}' is not valid semver: {err}"))
        })?;
        Ok(Self(cleaned.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pick the version of `product` when listed, otherwise the first package.
pub fn resolve_version(document: &MetadataDocument, product: Option<&str>) -> Result<VersionString> {
    let first = document
        .packages
        .first()
        .ok_or_else(|| PipelineError::configuration("Build metadata lists no packages"))?;

    let package = product
        .and_then(|name| document.packages.iter().find(|p| p.name == name))
        .unwrap_or(first);

    debug!(package = package.name.as_str(), raw = package.version.as_str(), "Resolving version");
    VersionString::parse(&package.version)
}

#[derive(Clone)]
pub struct VersionResolver {
    source: Arc<dyn MetadataSource>,
    product: Option<String>,
}

impl fmt::Debug for VersionResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionResolver")
            .field("source", &self.source.describe())
            .field("product", &self.product)
            .finish()
    }
}

impl VersionResolver {
    pub fn new(source: Arc<dyn MetadataSource>, product: Option<String>) -> Self {
        Self { source, product }
    }

    pub fn resolve(&self) -> Result<VersionString> {
        self.resolve_within(&Budget::unbounded())
    }

    pub fn resolve_within(&self, budget: &Budget) -> Result<VersionString> {
        let document = self.source.read(budget)?;
        resolve_version(&document, self.product.as_deref())
    }
}
