use std::fmt;

use serde::{Deserialize, Serialize};

use super::run::TransitionRun;

/// States of a convert or revert run.
///
/// A run flows `IDLE → LOCK_ACQUIRED → VALIDATED → NODES_CLASSIFIED →
/// RESOURCES_MUTATED → JOBS_DISPATCHED → COMPLETED`, may drop into `FAILED`
/// from any non-terminal state, and ends in `LOCK_RELEASED` whenever the lock
/// was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionState {
    Idle,
    LockAcquired,
    Validated,
    NodesClassified,
    ResourcesMutated,
    JobsDispatched,
    Completed,
    Failed,
    LockReleased,
}

impl TransitionState {
    fn successor(self) -> Option<TransitionState> {
        match self {
            TransitionState::Idle => Some(TransitionState::LockAcquired),
            TransitionState::LockAcquired => Some(TransitionState::Validated),
            TransitionState::Validated => Some(TransitionState::NodesClassified),
            TransitionState::NodesClassified => Some(TransitionState::ResourcesMutated),
            TransitionState::ResourcesMutated => Some(TransitionState::JobsDispatched),
            TransitionState::JobsDispatched => Some(TransitionState::Completed),
            TransitionState::Completed
            | TransitionState::Failed
            | TransitionState::LockReleased => None,
        }
    }
}

impl fmt::Display for TransitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransitionState::Idle => "IDLE",
            TransitionState::LockAcquired => "LOCK_ACQUIRED",
            TransitionState::Validated => "VALIDATED",
            TransitionState::NodesClassified => "NODES_CLASSIFIED",
            TransitionState::ResourcesMutated => "RESOURCES_MUTATED",
            TransitionState::JobsDispatched => "JOBS_DISPATCHED",
            TransitionState::Completed => "COMPLETED",
            TransitionState::Failed => "FAILED",
            TransitionState::LockReleased => "LOCK_RELEASED",
        };
        f.write_str(name)
    }
}

/// Result of the work done in the current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Success,
    Failure(String),
}

/// The result of evaluating a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Move to the given state.
    Next(TransitionState),
    /// The run is over; nothing further happens.
    Complete,
}

/// Drives a [`TransitionRun`] forward. There is no retry edge: a failed run
/// is re-invoked from `IDLE` as a new run.
pub struct StateMachine;

impl StateMachine {
    /// Compute and apply the next transition for `run` given the result of
    /// the work done in its current state.
    ///
    /// - Working states advance on success and go to `FAILED` on failure.
    /// - `COMPLETED` and `FAILED` always proceed to `LOCK_RELEASED`, except a
    ///   run that failed before the lock was acquired, which simply ends.
    /// - `LOCK_RELEASED` is terminal.
    pub fn next(run: &mut TransitionRun, result: StepResult) -> Transition {
        let transition = match (run.state, result) {
            (TransitionState::LockReleased, _) => Transition::Complete,
            (TransitionState::Failed, _) if !run.lock_acquired() => Transition::Complete,
            (TransitionState::Completed | TransitionState::Failed, _) => {
                Transition::Next(TransitionState::LockReleased)
            }
            (state, StepResult::Success) => match state.successor() {
                Some(next) => Transition::Next(next),
                None => Transition::Complete,
            },
            (_, StepResult::Failure(reason)) => {
                run.error = Some(reason);
                Transition::Next(TransitionState::Failed)
            }
        };

        if let Transition::Next(next) = transition {
            run.state_history.push(run.state);
            run.state = next;
            run.touch();
        }
        transition
    }
}
