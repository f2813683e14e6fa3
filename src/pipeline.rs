use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::builder::{BuildExecutor, BuildSettings, BuiltArtifact};
use crate::cache::{CacheKey, DependencyCache, DirectoryCache, NoCache};
use crate::error::{PipelineError, Result};
use crate::job::{JobContext, JobOutcome, JobState, JobTracker, StepTiming};
use crate::lockfile::lockfile_hash;
use crate::manifest::PipelineManifest;
use crate::matrix::{MatrixEntry, TargetMatrix};
use crate::observability::{MetricsCollector, MetricsSnapshot};
use crate::process::{Budget, CancellationToken, CommandRunner, SystemRunner};
use crate::publish::{ArtifactPublisher, ArtifactStore, DirectoryStore, PublishedArtifact, artifact_name};
use crate::scheduler::{JobScheduler, RunPolicy, VersionMode};
use crate::toolchain::{PreinstalledToolchain, RustupInstaller, ToolchainInstaller};
use crate::validation::validate_manifest;
use crate::version::{
    CargoMetadataSource, MetadataFileSource, MetadataSource, VersionResolver, VersionString,
};

#[derive(Debug, Default)]
pub struct JobWork {
    pub version: Option<VersionString>,
    pub built: Option<BuiltArtifact>,
    pub published: Option<PublishedArtifact>,
    pub cache_hit: Option<bool>,
}

pub trait Step: Send + Sync {
    fn name(&self) -> &'static str;
    /// State the job is in while this step runs.
    fn state(&self) -> JobState;
    fn run(&self, work: &mut JobWork, ctx: &JobContext) -> Result<()>;
}

struct ResolveVersionStep {
    resolver: VersionResolver,
    fixed: Option<VersionString>,
}

impl Step for ResolveVersionStep {
    fn name(&self) -> &'static str {
        "resolve-version"
    }

    fn state(&self) -> JobState {
        JobState::ResolvingVersion
    }

    fn run(&self, work: &mut JobWork, ctx: &JobContext) -> Result<()> {
        ctx.checkpoint()?;
        let version = match &self.fixed {
            Some(version) => version.clone(),
            None => self.resolver.resolve_within(&ctx.budget())?,
        };
        info!(version = %version, "Version resolved");
        work.version = Some(version);
        Ok(())
    }
}

struct BuildStep {
    executor: Arc<BuildExecutor>,
}

impl Step for BuildStep {
    fn name(&self) -> &'static str {
        "build"
    }

    fn state(&self) -> JobState {
        JobState::Building
    }

    fn run(&self, work: &mut JobWork, ctx: &JobContext) -> Result<()> {
        let built = self.executor.build(ctx)?;
        work.cache_hit = Some(built.cache_hit);
        work.built = Some(built);
        Ok(())
    }
}

struct PublishStep {
    publisher: Arc<ArtifactPublisher>,
}

impl Step for PublishStep {
    fn name(&self) -> &'static str {
        "publish"
    }

    fn state(&self) -> JobState {
        JobState::Publishing
    }

    fn run(&self, work: &mut JobWork, ctx: &JobContext) -> Result<()> {
        ctx.checkpoint()?;
        let built = work
            .built
            .take()
            .ok_or_else(|| PipelineError::publish("No built artifact to publish"))?;
        let version = work
            .version
            .as_ref()
            .ok_or_else(|| PipelineError::publish("No version to name the artifact with"))?;
        work.published = Some(self.publisher.publish(built, version)?);
        Ok(())
    }
}

#[derive(Clone)]
pub struct Backends {
    pub runner: Arc<dyn CommandRunner>,
    pub metadata: Arc<dyn MetadataSource>,
    pub installer: Arc<dyn ToolchainInstaller>,
    pub cache: Arc<dyn DependencyCache>,
    pub store: Arc<dyn ArtifactStore>,
}

impl Backends {
    pub fn system(manifest: &PipelineManifest) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let metadata: Arc<dyn MetadataSource> = match &manifest.build.metadata_file {
            Some(path) => Arc::new(MetadataFileSource::new(path)),
            None => Arc::new(CargoMetadataSource::new(
                manifest.build.manifest_path.clone(),
                runner.clone(),
            )),
        };
        let installer: Arc<dyn ToolchainInstaller> = if manifest.build.install_toolchain {
            Arc::new(RustupInstaller::new())
        } else {
            Arc::new(PreinstalledToolchain)
        };
        let cache: Arc<dyn DependencyCache> = if manifest.cache.enabled {
            Arc::new(DirectoryCache::new(&manifest.cache.directory))
        } else {
            Arc::new(NoCache)
        };
        Self {
            runner,
            metadata,
            installer,
            cache,
            store: Arc::new(DirectoryStore::new(&manifest.publish.directory)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedJob {
    pub suffix: String,
    pub platform_id: String,
    pub operating_system: String,
    pub toolchain_id: String,
    pub output_path: PathBuf,
    pub cache_key: CacheKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub product: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub policy: RunPolicy,
    pub succeeded: bool,
    pub jobs: Vec<JobOutcome>,
    pub metrics: MetricsSnapshot,
}

impl RunSummary {
    pub fn failed_jobs(&self) -> impl Iterator<Item = &JobOutcome> {
        self.jobs.iter().filter(|job| !job.succeeded())
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &PublishedArtifact> {
        self.jobs.iter().filter_map(|job| job.artifact.as_ref())
    }

    /// Distinct versions seen by the jobs. More than one means build
    /// metadata changed while the run was in flight.
    pub fn versions(&self) -> BTreeSet<&str> {
        self.jobs
            .iter()
            .filter_map(|job| job.version.as_ref().map(VersionString::as_str))
            .collect()
    }
}

pub struct PipelineExecutor {
    product: String,
    matrix: TargetMatrix,
    resolver: VersionResolver,
    builder: Arc<BuildExecutor>,
    publisher: Arc<ArtifactPublisher>,
    runner: Arc<dyn CommandRunner>,
    scheduler: JobScheduler,
    version_mode: VersionMode,
    policy: RunPolicy,
    job_timeout: Option<Duration>,
    metrics: MetricsCollector,
    cancel: CancellationToken,
}

impl PipelineExecutor {
    pub fn matrix(&self) -> &TargetMatrix {
        &self.matrix
    }

    pub fn metrics(&self) -> MetricsCollector {
        self.metrics.clone()
    }

    /// Token that cancels every unfinished job of the current run, or of the
    /// next run when fired between runs. It is cleared when a run finishes.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn resolver(&self) -> &VersionResolver {
        &self.resolver
    }

    pub fn with_targets(mut self, patterns: &[String]) -> Result<Self> {
        self.matrix = self.matrix.select(patterns)?;
        Ok(self)
    }

    pub fn plan(&self, version: Option<&VersionString>) -> Vec<PlannedJob> {
        let settings = self.builder.settings();
        self.matrix
            .iter()
            .map(|entry| PlannedJob {
                suffix: entry.artifact_suffix.clone(),
                platform_id: entry.platform_id.clone(),
                operating_system: entry.operating_system.clone(),
                toolchain_id: entry.toolchain_id.clone(),
                output_path: entry.output_path(&settings.build_root, &self.product),
                cache_key: self.builder.cache_key(entry),
                artifact_name: version
                    .map(|v| artifact_name(&self.product, v, &entry.artifact_suffix)),
            })
            .collect()
    }

    /// Fan the matrix out into jobs and wait for all of them. Configuration
    /// errors surface here before any job starts; job failures are reported
    /// in the summary.
    #[instrument(skip(self), fields(product = %self.product))]
    pub fn execute(&self) -> Result<RunSummary> {
        self.metrics.reset();
        self.matrix.validate()?;

        let started_at = Utc::now();
        let total_start = Instant::now();

        let fixed = match self.version_mode {
            VersionMode::Once => {
                let budget = Budget {
                    cancel: self.cancel.clone(),
                    ..Budget::unbounded()
                };
                let version = self
                    .resolver
                    .resolve_within(&budget)
                    .inspect_err(|_| self.cancel.reset())?;
                info!(version = %version, "Version resolved once for all jobs");
                Some(version)
            }
            VersionMode::PerJob => None,
        };

        let steps: Vec<Box<dyn Step>> = vec![
            Box::new(ResolveVersionStep {
                resolver: self.resolver.clone(),
                fixed,
            }),
            Box::new(BuildStep {
                executor: self.builder.clone(),
            }),
            Box::new(PublishStep {
                publisher: self.publisher.clone(),
            }),
        ];

        info!(
            jobs = self.matrix.len(),
            parallel = self.scheduler.max_parallel(),
            fail_fast = self.scheduler.fail_fast(),
            "Starting release run"
        );
        // Job threads do not inherit the caller's span.
        let run_span = tracing::Span::current();
        let jobs = self
            .scheduler
            .run_all(&self.matrix.entries, &self.cancel, |entry| {
                self.run_job(entry, &steps, &run_span)
            });
        self.cancel.reset();
        let jobs = jobs?;
        self.metrics.record_total_duration(total_start.elapsed());
        let summary = RunSummary {
            run_id: started_at.format("%Y%m%dT%H%M%S%.3fZ").to_string(),
            product: self.product.clone(),
            started_at,
            finished_at: Utc::now(),
            policy: self.policy,
            succeeded: self.policy.passes(&jobs),
            jobs,
            metrics: self.metrics.snapshot(),
        };

        let versions = summary.versions();
        if versions.len() > 1 {
            warn!(?versions, "Jobs resolved different versions within one run");
        }
        Ok(summary)
    }

    fn run_job(
        &self,
        entry: &MatrixEntry,
        steps: &[Box<dyn Step>],
        run_span: &tracing::Span,
    ) -> JobOutcome {
        let span = tracing::info_span!(
            parent: run_span,
            "job",
            suffix = entry.artifact_suffix.as_str(),
            target = entry.platform_id.as_str()
        );
        let _span_guard = span.enter();

        let ctx = JobContext::new(
            &self.product,
            entry.clone(),
            self.cancel.clone(),
            self.runner.clone(),
            self.job_timeout,
        );
        let mut tracker = JobTracker::new();
        let mut work = JobWork::default();
        let mut timings = Vec::with_capacity(steps.len());
        let mut failure: Option<(JobState, PipelineError)> = None;

        for step in steps {
            if let Err(err) = tracker.advance(step.state()) {
                failure = Some((tracker.state(), PipelineError::configuration(err.to_string())));
                break;
            }
            let step_span = tracing::debug_span!("step", step = step.name());
            let _step_guard = step_span.enter();
            let mut timer = self.metrics.start_step(step.name());
            let result = step.run(&mut work, &ctx);
            if result.is_err() {
                timer.mark_failed();
            }
            timings.push(StepTiming {
                state: step.state(),
                duration_ms: timer.elapsed().as_secs_f64() * 1_000.0,
            });
            drop(timer);

            if let Err(err) = result {
                failure = Some((step.state(), err));
                break;
            }
        }

        let final_state = if failure.is_none() {
            JobState::Succeeded
        } else {
            JobState::Failed
        };
        if let Err(err) = tracker.advance(final_state) {
            warn!(error = %err, "Job ended outside the state machine");
        }
        debug_assert!(tracker.state().is_terminal());
        self.metrics.record_job(failure.is_none());
        if let Some(hit) = work.cache_hit {
            self.metrics.record_cache(hit);
        }

        let (failed_in, error_kind, error_message, diagnostics) = match failure {
            None => {
                info!(elapsed_ms = ctx.elapsed().as_millis() as u64, "Job succeeded");
                (None, None, None, None)
            }
            Some((state, err)) => {
                let diagnostics = match &err {
                    PipelineError::Build { diagnostics, .. } if !diagnostics.is_empty() => {
                        Some(diagnostics.clone())
                    }
                    _ => None,
                };
                error!(failed_in = ?state, kind = %err.kind(), error = %err, "Job failed");
                if let Some(text) = &diagnostics {
                    error!("{text}");
                }
                (Some(state), Some(err.kind()), Some(err.to_string()), diagnostics)
            }
        };

        JobOutcome {
            suffix: entry.artifact_suffix.clone(),
            platform_id: entry.platform_id.clone(),
            state: final_state,
            history: tracker.history().to_vec(),
            failed_in,
            error_kind,
            error: error_message,
            diagnostics,
            version: work.version,
            artifact: work.published,
            cache_hit: work.cache_hit,
            steps: timings,
            duration_ms: ctx.elapsed().as_secs_f64() * 1_000.0,
        }
    }
}

pub fn build_pipeline(manifest: &PipelineManifest, backends: Backends) -> Result<PipelineExecutor> {
    let report = validate_manifest(manifest);
    if !report.is_ok() {
        return Err(PipelineError::configuration(report.errors.join("; ")));
    }
    for warning in &report.warnings {
        warn!("{warning}");
    }

    let settings = BuildSettings {
        build_root: manifest.build.root.clone(),
        manifest_path: manifest.build.manifest_path.clone(),
        lockfile_hash: lockfile_hash(&manifest.cargo_manifest())?,
        cross_compile: manifest.build.cross_compile,
        workspace_packages: manifest.cache.workspace_packages.clone(),
    };

    Ok(PipelineExecutor {
        product: manifest.product.clone(),
        matrix: manifest.matrix.include.clone(),
        resolver: VersionResolver::new(backends.metadata, Some(manifest.product.clone())),
        builder: Arc::new(BuildExecutor::new(settings, backends.installer, backends.cache)),
        publisher: Arc::new(ArtifactPublisher::new(&manifest.product, backends.store)),
        runner: backends.runner,
        scheduler: JobScheduler::new(manifest.parallelism(), manifest.matrix.fail_fast),
        version_mode: manifest.version_mode,
        policy: manifest.policy,
        job_timeout: Some(manifest.matrix.job_timeout()),
        metrics: MetricsCollector::new(),
        cancel: CancellationToken::new(),
    })
}
