use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use crate::cache::{CacheKey, CacheScope, DependencyCache};
use crate::config;
use crate::error::{PipelineError, Result};
use crate::job::JobContext;
use crate::matrix::{MatrixEntry, OsFamily};
use crate::process::CommandSpec;
use crate::toolchain::ToolchainInstaller;

const DIAGNOSTIC_LINES: usize = 40;

#[derive(Debug)]
pub struct BuiltArtifact {
    pub platform_id: String,
    pub artifact_suffix: String,
    pub path: PathBuf,
    pub cache_hit: bool,
}

#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub build_root: PathBuf,
    pub manifest_path: Option<PathBuf>,
    pub lockfile_hash: String,
    pub cross_compile: bool,
        pub workspace_packages: Vec<String>,
}

pub struct BuildExecutor {
    settings: BuildSettings,
    installer: Arc<dyn ToolchainInstaller>,
    cache: Arc<dyn DependencyCache>,
}

impl BuildExecutor {
    pub fn new(
        settings: BuildSettings,
        installer: Arc<dyn ToolchainInstaller>,
        cache: Arc<dyn DependencyCache>,
    ) -> Self {
        Self {
            settings,
            installer,
            cache,
        }
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    pub fn cache_key(&self, entry: &MatrixEntry) -> CacheKey {
        CacheKey::new(
            &entry.operating_system,
            &entry.platform_id,
            &self.settings.lockfile_hash,
        )
    }

    pub fn cache_scope(&self, product: &str) -> CacheScope {
        CacheScope::new(
            std::iter::once(product).chain(self.settings.workspace_packages.iter().map(String::as_str)),
        )
    }

    /// Toolchain and color only apply to this child process.
    pub fn cargo_command(&self, entry: &MatrixEntry) -> CommandSpec {
        let mut spec = CommandSpec::new("cargo").args([
            "build".to_string(),
            "--release".to_string(),
            "--target".to_string(),
            entry.platform_id.clone(),
            "--target-dir".to_string(),
            self.settings.build_root.display().to_string(),
        ]);
        if let Some(manifest) = &self.settings.manifest_path {
            spec = spec.args(["--manifest-path".to_string(), manifest.display().to_string()]);
        }
        spec.env("RUSTUP_TOOLCHAIN", &entry.toolchain_id)
            .env("CARGO_TERM_COLOR", config::color().as_str())
    }

    pub fn build(&self, ctx: &JobContext) -> Result<BuiltArtifact> {
        let entry = &ctx.entry;
        self.check_host(entry)?;

        self.installer
            .install(ctx, &entry.toolchain_id, &entry.platform_id)?;

        let key = self.cache_key(entry);
        let scope = self.cache_scope(&ctx.product);
        let platform_dir = self.settings.build_root.join(&entry.platform_id);
        let cache_hit = match self.cache.restore(&key, &platform_dir, &scope) {
            Ok(hit) => hit,
            Err(err) => {
                warn!(key = %key, error = %err, "Cache restore failed; building cold");
                false
            }
        };

        ctx.checkpoint()?;
        let command = self.cargo_command(entry);
        info!(command = %command, cache_hit, "Building");
        let output = ctx.run_command(&command)?;
        if !output.success {
            return Err(PipelineError::Build {
                message: format!(
                    "cargo build for {} failed with {}",
                    entry.platform_id,
                    output.describe_status()
                ),
                diagnostics: output.diagnostics_tail(DIAGNOSTIC_LINES),
            });
        }

        let path = entry.output_path(&self.settings.build_root, &ctx.product);
        if !path.is_file() {
            return Err(PipelineError::Build {
                message: format!("Expected binary not found at {}", path.display()),
                diagnostics: output.diagnostics_tail(DIAGNOSTIC_LINES),
            });
        }

        if !cache_hit
            && let Err(err) = self.cache.save(&key, &platform_dir, &scope)
        {
            warn!(key = %key, error = %err, "Cache save failed");
        }

        Ok(BuiltArtifact {
            platform_id: entry.platform_id.clone(),
            artifact_suffix: entry.artifact_suffix.clone(),
            path,
            cache_hit,
        })
    }

    fn check_host(&self, entry: &MatrixEntry) -> Result<()> {
        if self.settings.cross_compile {
            return Ok(());
        }
        let wanted = entry.os_family();
        let host = OsFamily::current();
        if wanted.is_some() && wanted != host {
            return Err(PipelineError::environment(format!(
                "{} needs a {} host but this is {}; run it on a matching runner or enable build.cross_compile",
                entry.platform_id,
                entry.operating_system,
                std::env::consts::OS
            )));
        }
        Ok(())
    }
}
