use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::manifest::PipelineManifest;
use crate::matrix::{MatrixEntry, TargetMatrix};

pub const PRESETS: &[&str] = &["slsk-rs", "linux"];

pub fn preset_manifest(name: &str) -> Result<PipelineManifest> {
    let manifest = match name {
        "slsk-rs" => PipelineManifest::with_matrix("slsk-rs", TargetMatrix::slsk_default()),
        "linux" => linux_preset(),
        other => anyhow::bail!(
            "Unknown preset '{other}'. Available presets: {}",
            PRESETS.join(", ")
        ),
    };
    Ok(manifest)
}

pub fn generate_preset(name: &str, destination: &Path) -> Result<PathBuf> {
    let manifest = preset_manifest(name)?;
    let rendered = serde_yaml::to_string(&manifest)?;
    if let Some(parent) = destination.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(destination, rendered)
        .with_context(|| format!("Failed to write manifest: {}", destination.display()))?;

    Ok(destination.to_path_buf())
}

fn linux_preset() -> PipelineManifest {
    let mut manifest = PipelineManifest::with_matrix(
        "slsk-rs",
        TargetMatrix::new(vec![MatrixEntry::new(
            "x86_64-unknown-linux-gnu",
            "ubuntu-latest",
            "stable",
            "linux-x86_64",
            "",
        )]),
    );
    manifest.matrix.max_parallel = Some(1);
    manifest
}
