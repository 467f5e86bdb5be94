//! Drives a convert or revert run through its fixed step order.
//!
//! The lock is taken first and released on every exit path once taken:
//! the working steps run inside [`TransitionSequencer::drive`], whose result
//! is only inspected after the release has been attempted.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::cluster::ControlPlane;
use crate::config::EdgectlConfig;
use crate::error::EdgeError;
use crate::jobs::ServantDispatcher;
use crate::lock::{LockGuard, LockManager};
use crate::nodes::{EdgeSelection, NodeClassifier};
use crate::resources::{ResourceCatalog, ResourceMutator};
use crate::state_machine::{
    Direction, StateMachine, StepResult, TransitionReport, TransitionRun, TransitionState,
};
use crate::version::VersionValidator;

/// Cooperative stop request, checked between steps.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// A signal that is never raised.
    pub fn never() -> Self {
        Self::new().1
    }

    pub fn is_raised(&self) -> bool {
        *self.rx.borrow()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionRequest {
    Convert {
        selection: EdgeSelection,
        autonomous: bool,
    },
    Revert,
}

impl TransitionRequest {
    pub fn direction(&self) -> Direction {
        match self {
            TransitionRequest::Convert { .. } => Direction::Convert,
            TransitionRequest::Revert => Direction::Revert,
        }
    }
}

/// What a run would do, computed without taking the lock or writing.
#[derive(Debug, Clone, Serialize)]
pub struct TransitionPlan {
    pub direction: Direction,
    pub edge_nodes: Vec<String>,
    pub node_updates: Vec<String>,
    pub resource_steps: Vec<String>,
    pub servant_jobs: Vec<String>,
}

/// Read-only snapshot used by `edgectl status`.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub server_version: String,
    pub edge_nodes: Vec<String>,
    pub cloud_nodes: Vec<String>,
    pub lock_holder: Option<String>,
    pub lock_acquired_at: Option<DateTime<Utc>>,
}

/// The single terminal outcome of a run.
#[derive(Debug)]
pub struct TransitionOutcome {
    pub report: TransitionReport,
    pub result: Result<(), EdgeError>,
}

type StateObserver = Box<dyn Fn(TransitionState) + Send + Sync>;

pub struct TransitionSequencer {
    lock: LockManager,
    validator: VersionValidator,
    classifier: NodeClassifier,
    catalog: ResourceCatalog,
    mutator: ResourceMutator,
    dispatcher: ServantDispatcher,
    skip_version_check: bool,
    observer: Option<StateObserver>,
}

impl TransitionSequencer {
    pub fn new(
        client: Arc<dyn ControlPlane>,
        config: &EdgectlConfig,
        holder: String,
    ) -> Result<Self, EdgeError> {
        let minimum = config.min_server_version.parse()?;
        Ok(Self {
            lock: LockManager::new(client.clone(), &config.namespace, &config.lock_name, holder),
            validator: VersionValidator::new(client.clone(), minimum),
            classifier: NodeClassifier::new(
                client.clone(),
                &config.edge_label_key,
                &config.autonomy_annotation_key,
            ),
            catalog: ResourceCatalog::standard(&config.component_settings())?,
            mutator: ResourceMutator::new(client.clone()),
            dispatcher: ServantDispatcher::new(client, config.dispatch_settings()),
            skip_version_check: false,
            observer: None,
        })
    }

    pub fn skip_version_check(mut self, skip: bool) -> Self {
        self.skip_version_check = skip;
        self
    }

    /// Called with every state the run enters.
    pub fn with_observer(mut self, observer: impl Fn(TransitionState) + Send + Sync + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    #[cfg(test)]
    pub(crate) fn with_catalog(mut self, catalog: ResourceCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    #[cfg(test)]
    pub(crate) fn classifier(&self) -> &NodeClassifier {
        &self.classifier
    }

    /// Run one transition to its terminal outcome.
    pub async fn run(&self, request: &TransitionRequest, stop: &StopSignal) -> TransitionOutcome {
        let mut run = TransitionRun::new(request.direction());
        info!(run = %run.id, direction = %run.direction, "transition starting");

        let guard = match self.lock.acquire().await {
            Ok(guard) => {
                self.step(&mut run, StepResult::Success);
                guard
            }
            Err(e) => {
                self.step(&mut run, StepResult::Failure(e.to_string()));
                self.step(&mut run, StepResult::Success);
                return self.finish(run, Err(e));
            }
        };

        let result = self.drive(request, &mut run, stop).await;
        if let Err(e) = &result {
            error!(run = %run.id, state = %run.state, error = %e, "transition failed");
            self.step(&mut run, StepResult::Failure(e.to_string()));
        }

        self.release(guard, &mut run).await;
        self.finish(run, result)
    }

    /// Compute the plan for `request` without mutating anything.
    pub async fn plan(&self, request: &TransitionRequest) -> Result<TransitionPlan, EdgeError> {
        if !self.skip_version_check {
            self.validator.validate().await?;
        }
        let classification = match request {
            TransitionRequest::Convert {
                selection,
                autonomous,
            } => self.classifier.plan_convert(selection, *autonomous).await?,
            TransitionRequest::Revert => self.classifier.plan_revert().await?,
        };
        let direction = request.direction();
        let jobs = self
            .dispatcher
            .plan(&classification.edge, direction.servant_action(), "dryrun");
        Ok(TransitionPlan {
            direction,
            node_updates: classification
                .patches
                .iter()
                .map(|(node, patch)| format!("{node}: {patch}"))
                .collect(),
            edge_nodes: classification.edge,
            resource_steps: self
                .catalog
                .plan(direction)
                .iter()
                .map(ToString::to_string)
                .collect(),
            servant_jobs: jobs
                .iter()
                .map(|j| format!("{} on {} ({} {})", j.name, j.node, j.action, j.image))
                .collect(),
        })
    }

    pub async fn status(&self) -> Result<ClusterStatus, EdgeError> {
        let version = self.validator.server_version().await?;
        let (edge_nodes, cloud_nodes) = self.classifier.partition().await?;
        let lock = self.lock.current().await?;
        Ok(ClusterStatus {
            server_version: version,
            edge_nodes,
            cloud_nodes,
            lock_holder: lock.as_ref().map(|l| l.holder.clone()),
            lock_acquired_at: lock.map(|l| l.acquired_at),
        })
    }

    async fn drive(
        &self,
        request: &TransitionRequest,
        run: &mut TransitionRun,
        stop: &StopSignal,
    ) -> Result<(), EdgeError> {
        self.checkpoint(run, stop)?;
        if self.skip_version_check {
            warn!("server version check skipped");
        } else {
            self.validator.validate().await?;
        }
        self.step(run, StepResult::Success);

        self.checkpoint(run, stop)?;
        run.edge_nodes = match request {
            TransitionRequest::Convert {
                selection,
                autonomous,
            } => self.classifier.convert(selection, *autonomous).await?,
            TransitionRequest::Revert => self.classifier.revert().await?,
        };
        self.step(run, StepResult::Success);

        self.checkpoint(run, stop)?;
        self.mutator.apply(&self.catalog.plan(run.direction)).await?;
        self.step(run, StepResult::Success);

        self.checkpoint(run, stop)?;
        let action = run.direction.servant_action();
        let results = self
            .dispatcher
            .dispatch(&run.edge_nodes, action, run.short_id())
            .await;
        run.job_results = results;
        ServantDispatcher::aggregate(&run.job_results)?;
        self.step(run, StepResult::Success);

        // JOBS_DISPATCHED -> COMPLETED
        self.step(run, StepResult::Success);
        Ok(())
    }

    fn checkpoint(&self, run: &TransitionRun, stop: &StopSignal) -> Result<(), EdgeError> {
        if stop.is_raised() {
            warn!(run = %run.id, after = %run.state, "stop requested, not starting next step");
            return Err(EdgeError::Cancelled { after: run.state });
        }
        Ok(())
    }

    async fn release(&self, guard: LockGuard, run: &mut TransitionRun) {
        if let Err(e) = self.lock.release(guard).await {
            error!(run = %run.id, error = %e, "failed to release transition lock; remove it manually");
            run.lock_release_error = Some(e.to_string());
        }
        self.step(run, StepResult::Success);
    }

    fn step(&self, run: &mut TransitionRun, result: StepResult) {
        StateMachine::next(run, result);
        if let Some(observer) = &self.observer {
            observer(run.state);
        }
    }

    fn finish(&self, run: TransitionRun, result: Result<(), EdgeError>) -> TransitionOutcome {
        let report = TransitionReport::from_run(&run);
        match &result {
            Ok(()) => info!(run = %run.id, duration_ms = report.duration_ms, "transition completed"),
            Err(e) => warn!(run = %run.id, final_state = %run.state, error = %e, "transition did not complete"),
        }
        TransitionOutcome { report, result }
    }
}
