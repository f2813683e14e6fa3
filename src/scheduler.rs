use clap::ValueEnum;
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{PipelineError, Result};
use crate::job::JobOutcome;
use crate::matrix::MatrixEntry;
use crate::process::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum VersionMode {
    /// Every job reads build metadata itself.
    PerJob,
    /// Resolve once before fan-out and hand the value to every job.
    Once,
}

impl Default for VersionMode {
    fn default() -> Self {
        VersionMode::PerJob
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RunPolicy {
    RequireAll,
    AllowFailures,
}

impl Default for RunPolicy {
    fn default() -> Self {
        RunPolicy::RequireAll
    }
}

impl RunPolicy {
    pub fn passes(self, outcomes: &[JobOutcome]) -> bool {
        match self {
            RunPolicy::RequireAll => outcomes.iter().all(JobOutcome::succeeded),
            RunPolicy::AllowFailures => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobScheduler {
    max_parallel: usize,
    fail_fast: bool,
}

impl JobScheduler {
    pub fn new(max_parallel: usize, fail_fast: bool) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
            fail_fast,
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    /// Run `job` for every entry on a bounded pool. Outcomes come back in
    /// matrix order regardless of completion order. With fail-fast off a
    /// failed job never touches `cancel`.
    pub fn run_all<F>(
        &self,
        entries: &[MatrixEntry],
        cancel: &CancellationToken,
        job: F,
    ) -> Result<Vec<JobOutcome>>
    where
        F: Fn(&MatrixEntry) -> JobOutcome + Sync,
    {
        let fail_fast = self.fail_fast;
        let run_one = |entry: &MatrixEntry| {
            let outcome = job(entry);
            if fail_fast && !outcome.succeeded() && !cancel.is_cancelled() {
                warn!(
                    suffix = entry.artifact_suffix.as_str(),
                    "Fail-fast enabled; cancelling remaining jobs"
                );
                cancel.cancel();
            }
            outcome
        };

        // One slot means strict matrix order.
        if self.max_parallel == 1 {
            return Ok(entries.iter().map(run_one).collect());
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.max_parallel)
            .thread_name(|i| format!("slsk-job-{i}"))
            .build()
            .map_err(|err| {
                PipelineError::environment(format!("Failed to start job pool: {err}"))
            })?;
        Ok(pool.install(|| entries.par_iter().map(run_one).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use crate::matrix::TargetMatrix;

    fn outcome(entry: &MatrixEntry, state: JobState) -> JobOutcome {
        JobOutcome {
            suffix: entry.artifact_suffix.clone(),
            platform_id: entry.platform_id.clone(),
            state,
            history: vec![JobState::Queued, state],
            failed_in: None,
            error_kind: None,
            error: None,
            diagnostics: None,
            version: None,
            artifact: None,
            cache_hit: None,
            steps: Vec::new(),
            duration_ms: 0.0,
        }
    }

    #[test]
    fn outcomes_keep_matrix_order() {
        let matrix = TargetMatrix::slsk_default();
        let scheduler = JobScheduler::new(3, false);
        let outcomes = scheduler
            .run_all(&matrix.entries, &CancellationToken::new(), |entry| {
                outcome(entry, JobState::Succeeded)
            })
            .unwrap();
        let suffixes: Vec<_> = outcomes.iter().map(|o| o.suffix.as_str()).collect();
        assert_eq!(suffixes, ["windows-x86_64", "windows-i686", "linux-x86_64"]);
        assert!(RunPolicy::RequireAll.passes(&outcomes));
    }

    #[test]
    fn failure_cancels_only_with_fail_fast() {
        let matrix = TargetMatrix::slsk_default();
        let fail_first = |entry: &MatrixEntry| {
            if entry.artifact_suffix == "windows-x86_64" {
                outcome(entry, JobState::Failed)
            } else {
                outcome(entry, JobState::Succeeded)
            }
        };

        let token = CancellationToken::new();
        let outcomes = JobScheduler::new(2, false)
            .run_all(&matrix.entries, &token, fail_first)
            .unwrap();
        assert!(!token.is_cancelled());
        assert!(!RunPolicy::RequireAll.passes(&outcomes));
        assert!(RunPolicy::AllowFailures.passes(&outcomes));

        let token = CancellationToken::new();
        JobScheduler::new(1, true)
            .run_all(&matrix.entries, &token, fail_first)
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn zero_parallelism_is_clamped() {
        assert_eq!(JobScheduler::new(0, false).max_parallel(), 1);
    }
}
