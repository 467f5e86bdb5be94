mod run;
mod state;

pub use run::{Direction, TransitionReport, TransitionRun};
pub use state::{StateMachine, StepResult, TransitionState};
