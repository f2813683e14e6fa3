use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use serde_json::to_writer_pretty;
use slsk_release::config::{self, ColorChoice};
use slsk_release::digest::{compute_sha256, write_sha256};
use slsk_release::manifest::PipelineManifest;
use slsk_release::observability::log_snapshot;
use slsk_release::pipeline::{Backends, build_pipeline};
use slsk_release::presets::generate_preset;
use slsk_release::process::SystemRunner;
use slsk_release::publish::artifact_name;
use slsk_release::report::{render_summary, write_summary};
use slsk_release::trigger::{EventKind, TriggerEvent};
use slsk_release::validation::validate_manifest;
use slsk_release::version::{
    CargoMetadataSource, MetadataFileSource, MetadataSource, VersionResolver, VersionString,
};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

fn main() -> Result<()> {
    let cli = Cli::parse();
    configure_tracing()?;

    match cli.command {
        Commands::Run {
            manifest,
            only,
            event,
            branch,
            dry_run,
            summary_json,
            metrics_prometheus,
            print_metrics,
            color,
        } => run_manifest(RunArgs {
            manifest,
            only,
            event,
            branch,
            dry_run,
            summary_json,
            metrics_prometheus,
            print_metrics,
            color,
        }),
        Commands::Validate { manifest } => validate_manifest_cmd(&manifest),
        Commands::Matrix { manifest, json } => print_matrix(&manifest, json),
        Commands::Version {
            manifest_path,
            metadata_file,
            product,
        } => print_version(manifest_path, metadata_file, product),
        Commands::Name {
            product,
            release,
            suffix,
        } => {
            let version = VersionString::parse(&release)?;
            println!("{}", artifact_name(&product, &version, &suffix));
            Ok(())
        }
        Commands::Init { preset, output } => {
            let path = generate_preset(&preset, &output)?;
            info!(preset = preset.as_str(), manifest = %path.display(), "Manifest written");
            Ok(())
        }
        Commands::Digest { path, output } => digest_cmd(&path, output.as_deref()),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "slsk-release", &mut io::stdout());
            Ok(())
        }
    }
}

fn configure_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;
    Ok(())
}

struct RunArgs {
    manifest: PathBuf,
    only: Vec<String>,
    event: Option<EventKind>,
    branch: Option<String>,
    dry_run: bool,
    summary_json: Option<PathBuf>,
    metrics_prometheus: Option<PathBuf>,
    print_metrics: bool,
    color: Option<ColorChoice>,
}

fn run_manifest(args: RunArgs) -> Result<()> {
    let manifest = PipelineManifest::load(&args.manifest)?;
    let color = config::init_color(args.color, manifest.color);

    if let (Some(kind), Some(branch)) = (args.event, args.branch.as_deref()) {
        let event = TriggerEvent::new(kind, branch);
        if !event.should_run(&manifest.triggers) {
            info!(?event, primary = manifest.triggers.branch.as_str(), "Event does not trigger a release run");
            return Ok(());
        }
    }

    let executor = build_pipeline(&manifest, Backends::system(&manifest))?.with_targets(&args.only)?;

    if args.dry_run {
        let version = match executor.resolver().resolve() {
            Ok(version) => Some(version),
            Err(err) => {
                warn!(error = %err, "Version could not be resolved; artifact names omitted");
                None
            }
        };
        let plan = executor.plan(version.as_ref());
        to_writer_pretty(io::stdout(), &plan).context("Failed to print plan")?;
        println!();
        return Ok(());
    }

    info!(color = color.as_str(), jobs = executor.matrix().len(), "Release run starting");
    let summary = executor.execute()?;
    print!("{}", render_summary(&summary));

    if let Some(path) = &args.summary_json {
        write_summary(path, &summary)?;
        info!(summary = %path.display(), "Run summary written");
    }
    if args.print_metrics {
        log_snapshot(&summary.metrics);
    }
    if let Some(path) = &args.metrics_prometheus {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create metrics directory: {}", parent.display())
            })?;
        }
        std::fs::write(path, summary.metrics.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }

    if !summary.succeeded {
        bail!(
            "Release run failed: {} of {} job(s) failed",
            summary.failed_jobs().count(),
            summary.jobs.len()
        );
    }
    Ok(())
}

fn validate_manifest_cmd(path: &Path) -> Result<()> {
    let manifest = PipelineManifest::load(path)?;
    let report = validate_manifest(&manifest);
    for warning in &report.warnings {
        warn!("{warning}");
    }
    if report.is_ok() {
        println!("Manifest '{}' is valid", path.display());
        Ok(())
    } else {
        for error in &report.errors {
            eprintln!("error: {error}");
        }
        bail!("Manifest validation failed with {} error(s)", report.errors.len());
    }
}

fn print_matrix(path: &Path, json: bool) -> Result<()> {
    let manifest = PipelineManifest::load(path)?;
    let matrix = &manifest.matrix.include;
    if json {
        to_writer_pretty(io::stdout(), matrix).context("Failed to print matrix")?;
        println!();
        return Ok(());
    }
    for entry in matrix {
        println!(
            "{:<20}{:<32}{:<16}{:<10}{}",
            entry.artifact_suffix,
            entry.platform_id,
            entry.operating_system,
            entry.toolchain_id,
            entry.binary_file_name(&manifest.product)
        );
    }
    Ok(())
}

fn print_version(
    manifest_path: Option<PathBuf>,
    metadata_file: Option<PathBuf>,
    product: Option<String>,
) -> Result<()> {
    let source: Arc<dyn MetadataSource> = match metadata_file {
        Some(path) => Arc::new(MetadataFileSource::new(path)),
        None => Arc::new(CargoMetadataSource::new(manifest_path, Arc::new(SystemRunner))),
    };
    let version = VersionResolver::new(source, product).resolve()?;
    println!("{version}");
    Ok(())
}

fn digest_cmd(path: &Path, output: Option<&Path>) -> Result<()> {
    let digest = match output {
        Some(out_path) => {
            let digest = write_sha256(path, out_path)?;
            info!(file = %path.display(), digest_output = %out_path.display(), "SHA256 digest written");
            digest
        }
        None => compute_sha256(path)?,
    };
    println!("{}  {}", digest, path.display());
    Ok(())
}

#[derive(Parser)]
#[command(
    name = "slsk-release",
    version,
    about = "Build and publish slsk-rs release artifacts across a target matrix"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build every matrix target and publish its artifact.
    Run {
        manifest: PathBuf,
        /// Only run targets whose suffix or triple matches this glob.
        #[arg(long)]
        only: Vec<String>,
        #[arg(long, value_enum, requires = "branch")]
        event: Option<EventKind>,
        #[arg(long, requires = "event")]
        branch: Option<String>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long = "summary-json")]
        summary_json: Option<PathBuf>,
        #[arg(long = "metrics-prometheus")]
        metrics_prometheus: Option<PathBuf>,
        #[arg(long)]
        print_metrics: bool,
        #[arg(long, value_enum)]
        color: Option<ColorChoice>,
    },
    Validate {
        manifest: PathBuf,
    },
    /// List the targets of a manifest.
    Matrix {
        manifest: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Print the version found in build metadata.
    Version {
        #[arg(long, conflicts_with = "metadata_file")]
        manifest_path: Option<PathBuf>,
        #[arg(long)]
        metadata_file: Option<PathBuf>,
        #[arg(long)]
        product: Option<String>,
    },
    /// Print the artifact name for a product, version and suffix.
    Name {
        #[arg(long)]
        product: String,
        /// Version without the leading `v`.
        #[arg(long)]
        release: String,
        #[arg(long)]
        suffix: String,
    },
    Init {
        #[arg(long, default_value = "slsk-rs")]
        preset: String,
        #[arg(long, default_value = "release.yaml")]
        output: PathBuf,
    },
    Digest {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}
