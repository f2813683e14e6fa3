use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{ErrorKind, Result};
use crate::matrix::MatrixEntry;
use crate::process::{Budget, CancellationToken, CommandOutput, CommandRunner, CommandSpec};
use crate::publish::PublishedArtifact;
use crate::version::VersionString;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Queued,
    ResolvingVersion,
    Building,
    Publishing,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, ResolvingVersion)
                | (ResolvingVersion, Building)
                | (Building, Publishing)
                | (Publishing, Succeeded)
                | (ResolvingVersion | Building | Publishing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("illegal job transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: JobState,
    pub to: JobState,
}

#[derive(Debug, Clone)]
pub struct JobTracker {
    state: JobState,
    history: Vec<JobState>,
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTracker {
    pub fn new() -> Self {
        Self {
            state: JobState::Queued,
            history: vec![JobState::Queued],
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    pub fn advance(&mut self, next: JobState) -> std::result::Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }
}

/// Everything a single job may touch. Nothing in here is shared mutably
/// with sibling jobs.
#[derive(Clone)]
pub struct JobContext {
    pub product: String,
    pub entry: MatrixEntry,
    pub cancel: CancellationToken,
    pub runner: Arc<dyn CommandRunner>,
    pub timeout: Option<Duration>,
    started: Instant,
}

impl JobContext {
    pub fn new(
        product: &str,
        entry: MatrixEntry,
        cancel: CancellationToken,
        runner: Arc<dyn CommandRunner>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            product: product.to_string(),
            entry,
            cancel,
            runner,
            timeout,
            started: Instant::now(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| self.started + t)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn budget(&self) -> Budget {
        Budget {
            cancel: self.cancel.clone(),
            timeout: self.timeout,
            deadline: self.deadline(),
        }
    }

    pub fn checkpoint(&self) -> Result<()> {
        self.budget().checkpoint()
    }

    pub fn run_command(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.budget().run(self.runner.as_ref(), spec)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepTiming {
    pub state: JobState,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub suffix: String,
    pub platform_id: String,
    pub state: JobState,
    pub history: Vec<JobState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_in: Option<JobState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionString>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<PublishedArtifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_hit: Option<bool>,
    pub steps: Vec<StepTiming>,
    pub duration_ms: f64,
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        self.state == JobState::Succeeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_visits_every_state() {
        let mut tracker = JobTracker::new();
        for next in [
            JobState::ResolvingVersion,
            JobState::Building,
            JobState::Publishing,
            JobState::Succeeded,
        ] {
            tracker.advance(next).unwrap();
        }
        assert_eq!(tracker.history().len(), 5);
        assert!(tracker.state().is_terminal());
    }

    #[test]
    fn states_cannot_be_skipped() {
        let mut tracker = JobTracker::new();
        let err = tracker.advance(JobState::Building).unwrap_err();
        assert_eq!(
            err,
            TransitionError {
                from: JobState::Queued,
                to: JobState::Building
            }
        );
        assert!(tracker.advance(JobState::Failed).is_err());
    }

    #[test]
    fn failure_reachable_from_working_states_only() {
        for state in [
            JobState::ResolvingVersion,
            JobState::Building,
            JobState::Publishing,
        ] {
            assert!(state.can_transition_to(JobState::Failed));
        }
        assert!(!JobState::Queued.can_transition_to(JobState::Failed));
        assert!(!JobState::Succeeded.can_transition_to(JobState::Failed));
        assert!(!JobState::Failed.can_transition_to(JobState::ResolvingVersion));
    }
}
