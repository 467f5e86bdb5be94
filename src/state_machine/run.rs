use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::TransitionState;
use crate::jobs::{JobResult, ServantAction};

/// Which way a transition moves the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Standard cluster to edge-autonomous cluster.
    Convert,
    /// Edge-autonomous cluster back to a standard cluster.
    Revert,
}

impl Direction {
    pub fn servant_action(self) -> ServantAction {
        match self {
            Direction::Convert => ServantAction::Convert,
            Direction::Revert => ServantAction::Revert,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Convert => write!(f, "convert"),
            Direction::Revert => write!(f, "revert"),
        }
    }
}

/// One end-to-end convert or revert invocation.
#[derive(Debug, Clone)]
pub struct TransitionRun {
    pub id: String,
    pub direction: Direction,
    pub state: TransitionState,
    pub state_history: Vec<TransitionState>,
    pub edge_nodes: Vec<String>,
    pub job_results: Vec<JobResult>,
    pub error: Option<String>,
    /// Logged, never escalated: a stuck lock needs an operator.
    pub lock_release_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransitionRun {
    pub fn new(direction: Direction) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            direction,
            state: TransitionState::Idle,
            state_history: Vec::new(),
            edge_nodes: Vec::new(),
            job_results: Vec::new(),
            error: None,
            lock_release_error: None,
            started_at: now,
            updated_at: now,
        }
    }

    /// Short run identifier used to keep job names unique per run.
    pub fn short_id(&self) -> &str {
        &self.id[..5.min(self.id.len())]
    }

    pub fn lock_acquired(&self) -> bool {
        self.state == TransitionState::LockAcquired
            || self.state_history.contains(&TransitionState::LockAcquired)
    }

    pub(super) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Structured record produced when a run returns.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionReport {
    pub run_id: String,
    pub direction: Direction,
    pub succeeded: bool,
    pub final_state: TransitionState,
    pub state_transitions: Vec<TransitionState>,
    pub edge_nodes: Vec<String>,
    pub job_results: Vec<JobResult>,
    pub error: Option<String>,
    pub lock_release_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl TransitionReport {
    pub fn from_run(run: &TransitionRun) -> Self {
        let now = Utc::now();
        let mut transitions = run.state_history.clone();
        transitions.push(run.state);

        Self {
            run_id: run.id.clone(),
            direction: run.direction,
            succeeded: run.error.is_none() && transitions.contains(&TransitionState::Completed),
            final_state: run.state,
            state_transitions: transitions,
            edge_nodes: run.edge_nodes.clone(),
            job_results: run.job_results.clone(),
            error: run.error.clone(),
            lock_release_error: run.lock_release_error.clone(),
            started_at: run.started_at,
            completed_at: now,
            duration_ms: (now - run.started_at).num_milliseconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobOutcome;

    #[test]
    fn run_creation_defaults() {
        let run = TransitionRun::new(Direction::Revert);
        assert_eq!(run.state, TransitionState::Idle);
        assert!(run.state_history.is_empty());
        assert!(run.error.is_none());
        assert_eq!(run.short_id().len(), 5);
        assert!(!run.lock_acquired());
    }

    #[test]
    fn report_from_fresh_run_is_not_success() {
        let run = TransitionRun::new(Direction::Convert);
        let report = TransitionReport::from_run(&run);
        assert_eq!(report.run_id, run.id);
        assert!(!report.succeeded);
        assert_eq!(report.state_transitions, vec![TransitionState::Idle]);
    }

    #[test]
    fn report_serializes_job_outcomes() {
        let mut run = TransitionRun::new(Direction::Revert);
        run.job_results.push(JobResult {
            node: "edge-1".into(),
            job: "edgectl-servant-revert-edge-1-abcde".into(),
            outcome: JobOutcome::Failed("exit 1".into()),
        });
        let json = serde_json::to_value(TransitionReport::from_run(&run)).unwrap();
        assert_eq!(json["direction"], "revert");
        assert_eq!(json["final_state"], "Idle");
        assert_eq!(json["job_results"][0]["node"], "edge-1");
        assert_eq!(json["job_results"][0]["outcome"], "failed");
        assert_eq!(json["job_results"][0]["reason"], "exit 1");
    }

    #[test]
    fn direction_maps_to_servant_action() {
        assert_eq!(Direction::Convert.servant_action(), ServantAction::Convert);
        assert_eq!(Direction::Revert.servant_action().as_str(), "revert");
    }
}
