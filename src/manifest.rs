use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::config::ColorChoice;
use crate::matrix::TargetMatrix;
use crate::scheduler::{RunPolicy, VersionMode};
use crate::trigger::TriggerSpec;

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineManifest {
    pub version: u32,
    pub product: String,
    #[serde(default)]
    pub triggers: TriggerSpec,
    #[serde(default)]
    pub matrix: MatrixSpec,
    #[serde(default)]
    pub build: BuildSpec,
    #[serde(default)]
    pub cache: CacheSpec,
    #[serde(default)]
    pub publish: PublishSpec,
    #[serde(default)]
    pub version_mode: VersionMode,
    #[serde(default)]
    pub policy: RunPolicy,
    /// Unset defers to `CARGO_TERM_COLOR`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<ColorChoice>,
}

impl PipelineManifest {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline manifest: {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse pipeline manifest: {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn with_matrix(product: &str, matrix: TargetMatrix) -> Self {
        Self {
            version: MANIFEST_VERSION,
            product: product.to_string(),
            triggers: TriggerSpec::default(),
            matrix: MatrixSpec {
                include: matrix,
                ..MatrixSpec::default()
            },
            build: BuildSpec::default(),
            cache: CacheSpec::default(),
            publish: PublishSpec::default(),
            version_mode: VersionMode::default(),
            policy: RunPolicy::default(),
            color: None,
        }
    }

    /// Cargo manifest of the product; defaults to `./Cargo.toml`.
    pub fn cargo_manifest(&self) -> PathBuf {
        self.build
            .manifest_path
            .clone()
            .unwrap_or_else(|| PathBuf::from("Cargo.toml"))
    }

    pub fn parallelism(&self) -> usize {
        self.matrix
            .max_parallel
            .unwrap_or_else(|| self.matrix.include.len())
            .max(1)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MatrixSpec {
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
    #[serde(default)]
    pub include: TargetMatrix,
}

/// Six hours, the usual ceiling of hosted CI runners.
fn default_job_timeout() -> u64 {
    6 * 60 * 60
}

impl Default for MatrixSpec {
    fn default() -> Self {
        Self {
            fail_fast: false,
            max_parallel: None,
            job_timeout_secs: default_job_timeout(),
            include: TargetMatrix::default(),
        }
    }
}

impl MatrixSpec {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BuildSpec {
    #[serde(default = "default_build_root")]
    pub root: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_path: Option<PathBuf>,
    /// Saved `cargo metadata` output to read instead of invoking cargo.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_file: Option<PathBuf>,
    #[serde(default)]
    pub cross_compile: bool,
    #[serde(default = "enabled")]
    pub install_toolchain: bool,
}

fn default_build_root() -> PathBuf {
    PathBuf::from("target")
}

fn enabled() -> bool {
    true
}

impl Default for BuildSpec {
    fn default() -> Self {
        Self {
            root: default_build_root(),
            manifest_path: None,
            metadata_file: None,
            cross_compile: false,
            install_toolchain: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheSpec {
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default = "default_cache_dir")]
    pub directory: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workspace_packages: Vec<String>,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".slsk-release/cache")
}

impl Default for CacheSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: default_cache_dir(),
            workspace_packages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PublishSpec {
    #[serde(default = "default_publish_dir")]
    pub directory: PathBuf,
}

fn default_publish_dir() -> PathBuf {
    PathBuf::from("dist")
}

impl Default for PublishSpec {
    fn default() -> Self {
        Self {
            directory: default_publish_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_manifest_fills_defaults() {
        let manifest = PipelineManifest::from_yaml(
            r#"
version: 1
product: slsk-rs
matrix:
  include:
    - target: x86_64-unknown-linux-gnu
      os: ubuntu-latest
      suffix: linux-x86_64
"#,
        )
        .unwrap();

        assert_eq!(manifest.triggers.branch, "main");
        assert!(!manifest.matrix.fail_fast);
        assert_eq!(manifest.matrix.job_timeout(), Duration::from_secs(21_600));
        assert_eq!(manifest.parallelism(), 1);
        let entry = &manifest.matrix.include.entries[0];
        assert_eq!(entry.toolchain_id, "stable");
        assert_eq!(entry.file_extension, "");
        assert_eq!(manifest.build.root, PathBuf::from("target"));
        assert_eq!(manifest.cargo_manifest(), PathBuf::from("Cargo.toml"));
        assert!(manifest.cache.enabled);
        assert_eq!(manifest.version_mode, VersionMode::PerJob);
        assert_eq!(manifest.policy, RunPolicy::RequireAll);
        assert_eq!(manifest.color, None);
    }

    #[test]
    fn explicit_color_and_workspace_packages_parse() {
        let manifest = PipelineManifest::from_yaml(
            "version: 1\nproduct: x\ncolor: never\ncache:\n  workspace_packages: [slsk-proto]\n",
        )
        .unwrap();
        assert_eq!(manifest.color, Some(ColorChoice::Never));
        assert_eq!(manifest.cache.workspace_packages, ["slsk-proto"]);
    }

    #[test]
    fn unknown_policy_is_rejected() {
        let result = PipelineManifest::from_yaml("version: 1\nproduct: x\npolicy: best-effort\n");
        assert!(result.is_err());
    }
}
