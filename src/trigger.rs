use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TriggerSpec {
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "enabled")]
    pub push: bool,
    #[serde(default = "enabled")]
    pub pull_request: bool,
}

fn default_branch() -> String {
    "main".to_string()
}

fn enabled() -> bool {
    true
}

impl Default for TriggerSpec {
    fn default() -> Self {
        Self {
            branch: default_branch(),
            push: true,
            pull_request: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EventKind {
    Push,
    PullRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerEvent {
    Push { branch: String },
    PullRequest { base: String },
}

impl TriggerEvent {
    pub fn new(kind: EventKind, branch: impl Into<String>) -> Self {
        let branch = normalize_ref(&branch.into());
        match kind {
            EventKind::Push => TriggerEvent::Push { branch },
            EventKind::PullRequest => TriggerEvent::PullRequest { base: branch },
        }
    }

    pub fn should_run(&self, spec: &TriggerSpec) -> bool {
        let primary = normalize_ref(&spec.branch);
        match self {
            TriggerEvent::Push { branch } => spec.push && *branch == primary,
            TriggerEvent::PullRequest { base } => spec.pull_request && *base == primary,
        }
    }
}

/// Accept both `main` and `refs/heads/main`.
fn normalize_ref(reference: &str) -> String {
    reference
        .trim()
        .trim_start_matches("refs/heads/")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_to_primary_branch_runs() {
        let spec = TriggerSpec::default();
        assert!(TriggerEvent::new(EventKind::Push, "main").should_run(&spec));
        assert!(TriggerEvent::new(EventKind::Push, "refs/heads/main").should_run(&spec));
        assert!(!TriggerEvent::new(EventKind::Push, "feature/search").should_run(&spec));
    }

    #[test]
    fn pull_requests_target_primary_branch() {
        let spec = TriggerSpec {
            branch: "master".into(),
            push: true,
            pull_request: false,
        };
        assert!(!TriggerEvent::new(EventKind::PullRequest, "master").should_run(&spec));
        let spec = TriggerSpec {
            pull_request: true,
            ..spec
        };
        assert!(TriggerEvent::new(EventKind::PullRequest, "master").should_run(&spec));
        assert!(!TriggerEvent::new(EventKind::PullRequest, "main").should_run(&spec));
    }
}
