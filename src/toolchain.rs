use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::job::JobContext;
use crate::process::CommandSpec;

pub trait ToolchainInstaller: Send + Sync {
    fn install(&self, ctx: &JobContext, toolchain_id: &str, platform_id: &str) -> Result<()>;
}

/// Jobs on one host share a rustup home: installs of one toolchain are
/// serialized and each (toolchain, target) pair is installed once.
#[derive(Debug, Default)]
pub struct RustupInstaller {
    toolchains: Mutex<HashMap<String, Arc<Mutex<HashSet<String>>>>>,
}

impl RustupInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command(toolchain_id: &str, platform_id: &str) -> CommandSpec {
        CommandSpec::new("rustup").args([
            "toolchain",
            "install",
            toolchain_id,
            "--profile",
            "minimal",
            "--target",
            platform_id,
            "--no-self-update",
        ])
    }

    fn toolchain_slot(&self, toolchain_id: &str) -> Arc<Mutex<HashSet<String>>> {
        let mut toolchains = self
            .toolchains
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        toolchains.entry(toolchain_id.to_string()).or_default().clone()
    }
}

impl ToolchainInstaller for RustupInstaller {
    fn install(&self, ctx: &JobContext, toolchain_id: &str, platform_id: &str) -> Result<()> {
        let slot = self.toolchain_slot(toolchain_id);
        let mut installed = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if installed.contains(platform_id) {
            debug!(toolchain = toolchain_id, target = platform_id, "Toolchain already installed");
            return Ok(());
        }

        let output = ctx.run_command(&Self::command(toolchain_id, platform_id))?;
        if !output.success {
            return Err(PipelineError::environment(format!(
                "rustup could not install {toolchain_id} for {platform_id} ({}): {}",
                output.describe_status(),
                output.diagnostics_tail(5)
            )));
        }
        installed.insert(platform_id.to_string());
        info!(toolchain = toolchain_id, target = platform_id, "Toolchain ready");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PreinstalledToolchain;

impl ToolchainInstaller for PreinstalledToolchain {
    fn install(&self, _ctx: &JobContext, _toolchain_id: &str, _platform_id: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::matrix::TargetMatrix;
    use crate::process::{CancellationToken, CommandError, CommandOutput, CommandRunner};

    /// Records how many rustup calls overlap.
    #[derive(Default)]
    struct SlowRustup {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail: bool,
    }

    impl CommandRunner for SlowRustup {
        fn run(
            &self,
            _spec: &CommandSpec,
            _cancel: &CancellationToken,
            _deadline: Option<Instant>,
        ) -> std::result::Result<CommandOutput, CommandError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                Ok(CommandOutput::failure(1, "error: could not rename component file"))
            } else {
                Ok(CommandOutput::success())
            }
        }
    }

    fn contexts(runner: Arc<SlowRustup>) -> Vec<JobContext> {
        TargetMatrix::slsk_default()
            .entries
            .into_iter()
            .map(|entry| {
                JobContext::new("slsk-rs", entry, CancellationToken::new(), runner.clone(), None)
            })
            .collect()
    }

    #[test]
    fn rustup_command_targets_platform() {
        let spec = RustupInstaller::command("stable", "i686-pc-windows-msvc");
        assert_eq!(spec.program, "rustup");
        assert_eq!(
            spec.to_string(),
            "rustup toolchain install stable --profile minimal --target i686-pc-windows-msvc --no-self-update"
        );
    }

    #[test]
    fn same_toolchain_installs_one_at_a_time() {
        let runner = Arc::new(SlowRustup::default());
        let installer = RustupInstaller::new();
        let jobs = contexts(runner.clone());

        thread::scope(|scope| {
            for ctx in &jobs {
                let installer = &installer;
                scope.spawn(move || {
                    installer
                        .install(ctx, &ctx.entry.toolchain_id, &ctx.entry.platform_id)
                        .unwrap();
                });
            }
        });

        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(runner.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn installed_pair_is_not_reinstalled() {
        let runner = Arc::new(SlowRustup::default());
        let installer = RustupInstaller::new();
        let ctx = &contexts(runner.clone())[0];

        installer.install(ctx, "stable", "x86_64-pc-windows-msvc").unwrap();
        installer.install(ctx, "stable", "x86_64-pc-windows-msvc").unwrap();
        installer.install(ctx, "1.80.0", "x86_64-pc-windows-msvc").unwrap();
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_install_is_retried_by_the_next_job() {
        let runner = Arc::new(SlowRustup {
            fail: true,
            ..SlowRustup::default()
        });
        let installer = RustupInstaller::new();
        let ctx = &contexts(runner.clone())[0];

        let err = installer.install(ctx, "stable", "x86_64-pc-windows-msvc").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Environment);
        assert!(installer.install(ctx, "stable", "x86_64-pc-windows-msvc").is_err());
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }
}
