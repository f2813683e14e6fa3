use std::fmt::Write as _;
use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};

use crate::pipeline::RunSummary;

pub fn write_summary(path: &Path, summary: &RunSummary) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create report directory: {}", parent.display()))?;
    }
    let file = File::create(path)
        .with_context(|| format!("Failed to create run summary: {}", path.display()))?;
    serde_json::to_writer_pretty(file, summary)
        .with_context(|| format!("Failed to write run summary JSON: {}", path.display()))?;
    Ok(())
}

/// One line per job, in matrix order.
pub fn render_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    for job in &summary.jobs {
        let status = if job.succeeded() { "ok" } else { "FAILED" };
        let detail = match (&job.artifact, &job.error) {
            (Some(artifact), _) => artifact.name.clone(),
            (None, Some(error)) => error.clone(),
            (None, None) => String::new(),
        };
        let _ = writeln!(out, "{status:<7}{:<20}{detail}", job.suffix);
    }
    let _ = writeln!(
        out,
        "{} of {} job(s) succeeded; run {}",
        summary.jobs.iter().filter(|j| j.succeeded()).count(),
        summary.jobs.len(),
        if summary.succeeded { "passed" } else { "failed" }
    );
    out
}
