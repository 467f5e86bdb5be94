//! Ordered, idempotent mutation of the managed object catalog.
//!
//! The catalog is one ordered list. Convert walks it forward; revert walks it
//! backward with every action inverted, so dependents (bindings) are removed
//! before what they reference (roles) and created after it.

#[cfg(test)]
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::cluster::{ControlPlane, Manifest, ObjectRef};
use crate::error::{ApiErrorKind, EdgeError};
use crate::manifests::{self, ComponentSettings};
use crate::state_machine::Direction;

/// How an entry relates to the edge-autonomous mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EntryRole {
    /// Exists only in edge mode: convert creates it, revert deletes it.
    Managed,
    /// Exists only in standard mode: convert deletes it, revert recreates it.
    Displaced,
}

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub manifest: Manifest,
    pub role: EntryRole,
    /// Also update on convert so a changed image reaches an existing object.
    pub converge: bool,
}

impl CatalogEntry {
    pub fn managed(manifest: Manifest) -> Self {
        Self {
            manifest,
            role: EntryRole::Managed,
            converge: false,
        }
    }

    pub fn displaced(manifest: Manifest) -> Self {
        Self {
            manifest,
            role: EntryRole::Displaced,
            converge: false,
        }
    }

    fn converging(mut self) -> Self {
        self.converge = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MutationAction {
    CreateIfAbsent(Manifest),
    UpdateIfPresent(Manifest),
    DeleteIfExists(ObjectRef),
}

impl MutationAction {
    pub fn verb(&self) -> &'static str {
        match self {
            MutationAction::CreateIfAbsent(_) => "create-if-absent",
            MutationAction::UpdateIfPresent(_) => "update-if-present",
            MutationAction::DeleteIfExists(_) => "delete-if-exists",
        }
    }

    pub fn target(&self) -> &ObjectRef {
        match self {
            MutationAction::CreateIfAbsent(m) | MutationAction::UpdateIfPresent(m) => &m.target,
            MutationAction::DeleteIfExists(target) => target,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MutationStep {
    /// 1-based position in the plan.
    pub position: usize,
    pub total: usize,
    pub action: MutationAction,
}

impl MutationStep {
    /// Short identity used in errors, e.g. `3/10 create-if-absent`.
    pub fn label(&self) -> String {
        format!("{}/{} {}", self.position, self.total, self.action.verb())
    }
}

impl fmt::Display for MutationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.label(), self.action.target())
    }
}

#[derive(Debug, Clone)]
pub struct ResourceCatalog {
    entries: Vec<CatalogEntry>,
}

impl ResourceCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    /// The fixed catalog in convert order.
    pub fn standard(settings: &ComponentSettings) -> Result<Self, EdgeError> {
        let ns = settings.namespace.as_str();
        Ok(Self::new(vec![
            CatalogEntry::displaced(manifests::service_account(ns, manifests::NODE_CONTROLLER)?),
            CatalogEntry::managed(manifests::tunnel_server_role()?),
            CatalogEntry::managed(manifests::service_account(ns, manifests::TUNNEL_SERVER)?),
            CatalogEntry::managed(manifests::tunnel_server_binding(ns)?),
            CatalogEntry::managed(manifests::tunnel_server_service(ns)?),
            CatalogEntry::managed(manifests::tunnel_server_daemon_set(settings)?),
            CatalogEntry::managed(manifests::tunnel_agent_role()?),
            CatalogEntry::managed(manifests::tunnel_agent_binding()?),
            CatalogEntry::managed(manifests::tunnel_agent_daemon_set(settings)?),
            CatalogEntry::managed(manifests::controller_manager_deployment(settings)?).converging(),
        ]))
    }

    /// Objects that exist only while the cluster is in edge mode.
    #[cfg(test)]
    pub fn managed_objects(&self) -> BTreeSet<ObjectRef> {
        self.objects_with(EntryRole::Managed)
    }

    /// Objects that exist only while the cluster is in standard mode.
    #[cfg(test)]
    pub fn displaced_objects(&self) -> BTreeSet<ObjectRef> {
        self.objects_with(EntryRole::Displaced)
    }

    #[cfg(test)]
    fn objects_with(&self, role: EntryRole) -> BTreeSet<ObjectRef> {
        self.entries
            .iter()
            .filter(|e| e.role == role)
            .map(|e| e.manifest.target.clone())
            .collect()
    }

    pub fn plan(&self, direction: Direction) -> Vec<MutationStep> {
        let actions: Vec<MutationAction> = match direction {
            Direction::Convert => self
                .entries
                .iter()
                .flat_map(|entry| match entry.role {
                    EntryRole::Managed if entry.converge => vec![
                        MutationAction::CreateIfAbsent(entry.manifest.clone()),
                        MutationAction::UpdateIfPresent(entry.manifest.clone()),
                    ],
                    EntryRole::Managed => {
                        vec![MutationAction::CreateIfAbsent(entry.manifest.clone())]
                    }
                    EntryRole::Displaced => {
                        vec![MutationAction::DeleteIfExists(entry.manifest.target.clone())]
                    }
                })
                .collect(),
            Direction::Revert => self
                .entries
                .iter()
                .rev()
                .map(|entry| match entry.role {
                    EntryRole::Managed => {
                        MutationAction::DeleteIfExists(entry.manifest.target.clone())
                    }
                    EntryRole::Displaced => MutationAction::CreateIfAbsent(entry.manifest.clone()),
                })
                .collect(),
        };
        let total = actions.len();
        actions
            .into_iter()
            .enumerate()
            .map(|(i, action)| MutationStep {
                position: i + 1,
                total,
                action,
            })
            .collect()
    }
}

/// Whether a step changed the cluster or found it already converged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Applied,
    AlreadySatisfied,
}

pub struct ResourceMutator {
    client: Arc<dyn ControlPlane>,
}

impl ResourceMutator {
    pub fn new(client: Arc<dyn ControlPlane>) -> Self {
        Self { client }
    }

    /// Apply steps in order, stopping at the first fatal error.
    ///
    /// Steps already applied are left in place; re-running the same
    /// direction converges because every step is idempotent.
    pub async fn apply(&self, steps: &[MutationStep]) -> Result<usize, EdgeError> {
        let mut applied = 0;
        for step in steps {
            if self.apply_step(step).await? == StepOutcome::Applied {
                applied += 1;
            }
        }
        info!(steps = steps.len(), applied, "managed resources mutated");
        Ok(applied)
    }

    pub async fn apply_step(&self, step: &MutationStep) -> Result<StepOutcome, EdgeError> {
        let result = match &step.action {
            MutationAction::CreateIfAbsent(m) => self.client.create_object(m).await,
            MutationAction::UpdateIfPresent(m) => self.client.update_object(m).await,
            MutationAction::DeleteIfExists(target) => self.client.delete_object(target).await,
        };

        let err = match result {
            Ok(()) => {
                info!(step = %step, "applied");
                return Ok(StepOutcome::Applied);
            }
            Err(err) => err,
        };

        let ignorable = match (&step.action, err.kind) {
            (MutationAction::CreateIfAbsent(_), ApiErrorKind::AlreadyExists) => true,
            (MutationAction::UpdateIfPresent(_), ApiErrorKind::NotFound) => true,
            (MutationAction::DeleteIfExists(_), ApiErrorKind::NotFound) => true,
            (_, ApiErrorKind::NotFound)
            | (_, ApiErrorKind::AlreadyExists)
            | (_, ApiErrorKind::Conflict)
            | (_, ApiErrorKind::Other) => false,
        };
        if ignorable {
            debug!(step = %step, reason = %err.kind, "already in desired state");
            return Ok(StepOutcome::AlreadySatisfied);
        }
        Err(EdgeError::ResourceMutationFailed {
            step: step.label(),
            target: step.action.target().to_string(),
            source: err,
        })
    }
}
