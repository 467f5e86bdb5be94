//! Control-plane client seam.
//!
//! Every component talks to the cluster through [`ControlPlane`], injected as
//! an `Arc<dyn ControlPlane>`. [`live::KubeControlPlane`] backs it with a real
//! API server; tests use the in-memory cluster in [`memory`].

pub mod live;
#[cfg(test)]
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ApiError;
use crate::jobs::ServantJob;

/// Version as reported by the API server's `/version` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerVersion {
    pub major: String,
    pub minor: String,
    pub git_version: String,
}

/// The parts of a node this tool reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeRecord {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl NodeRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_annotation(mut self, key: &str, value: &str) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }
}

/// Merge patch for node metadata. `None` removes the key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodePatch {
    pub labels: BTreeMap<String, Option<String>>,
    pub annotations: BTreeMap<String, Option<String>>,
}

impl NodePatch {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty() && self.annotations.is_empty()
    }

    pub fn apply_to(&self, node: &mut NodeRecord) {
        merge(&mut node.labels, &self.labels);
        merge(&mut node.annotations, &self.annotations);
    }

    pub fn to_merge_patch(&self) -> serde_json::Value {
        serde_json::json!({
            "metadata": {
                "labels": self.labels,
                "annotations": self.annotations,
            }
        })
    }
}

impl fmt::Display for NodePatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let render = |(k, v): (&String, &Option<String>)| match v {
            Some(v) => format!("{k}={v}"),
            None => format!("{k}-"),
        };
        let parts: Vec<String> = self
            .labels
            .iter()
            .map(render)
            .chain(self.annotations.iter().map(|(k, v)| format!("@{}", render((k, v)))))
            .collect();
        write!(f, "{}", parts.join(" "))
    }
}

fn merge(target: &mut BTreeMap<String, String>, changes: &BTreeMap<String, Option<String>>) {
    for (key, value) in changes {
        match value {
            Some(v) => {
                target.insert(key.clone(), v.clone());
            }
            None => {
                target.remove(key);
            }
        }
    }
}

/// Kinds of objects in the managed catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ResourceKind {
    ClusterRole,
    ClusterRoleBinding,
    ServiceAccount,
    Service,
    DaemonSet,
    Deployment,
}

impl ResourceKind {
    pub fn is_namespaced(self) -> bool {
        !matches!(self, ResourceKind::ClusterRole | ResourceKind::ClusterRoleBinding)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Identity of a control-plane object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ObjectRef {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn cluster(kind: ResourceKind, name: &str) -> Self {
        Self {
            kind,
            namespace: None,
            name: name.to_string(),
        }
    }

    pub fn namespaced(kind: ResourceKind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {ns}/{}", self.kind, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// A full object body together with its identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub target: ObjectRef,
    pub body: serde_json::Value,
}

/// The advisory transition lock as stored in the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub name: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

/// Observed state of a servant job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPhase {
    Active,
    Succeeded,
    Failed(String),
}

/// Operations the transition needs from the cluster.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn server_version(&self) -> Result<ServerVersion, ApiError>;

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, ApiError>;

    async fn patch_node(&self, name: &str, patch: &NodePatch) -> Result<(), ApiError>;

    async fn get_lock(&self, namespace: &str, name: &str) -> Result<Option<LockRecord>, ApiError>;

    /// Fails with `AlreadyExists` if any record with that name is present.
    async fn create_lock(&self, namespace: &str, record: &LockRecord) -> Result<(), ApiError>;

    async fn delete_lock(&self, namespace: &str, name: &str) -> Result<(), ApiError>;

    async fn create_object(&self, manifest: &Manifest) -> Result<(), ApiError>;

    /// Fails with `NotFound` if the object does not exist.
    async fn update_object(&self, manifest: &Manifest) -> Result<(), ApiError>;

    async fn delete_object(&self, target: &ObjectRef) -> Result<(), ApiError>;

    async fn create_job(&self, job: &ServantJob) -> Result<(), ApiError>;

    async fn job_phase(&self, namespace: &str, name: &str) -> Result<JobPhase, ApiError>;
}
