//! In-memory control plane for tests.
//!
//! Tracks nodes, the lock record, the managed object inventory and servant
//! jobs. Failures can be injected per operation and target, and job outcomes
//! can be scripted per node.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    ControlPlane, JobPhase, LockRecord, Manifest, NodePatch, NodeRecord, ObjectRef, ServerVersion,
};
use crate::error::{ApiError, ApiErrorKind};
use crate::jobs::ServantJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    ServerVersion,
    ListNodes,
    PatchNode,
    CreateLock,
    DeleteLock,
    CreateObject,
    UpdateObject,
    DeleteObject,
    CreateJob,
}

/// How a servant job on a given node behaves.
#[derive(Debug, Clone)]
pub enum JobScript {
    Succeed,
    SucceedAfterPolls(u32),
    Fail(String),
    Hang,
}

#[derive(Default)]
struct State {
    version: Option<ServerVersion>,
    nodes: BTreeMap<String, NodeRecord>,
    locks: BTreeMap<(String, String), LockRecord>,
    objects: BTreeMap<ObjectRef, serde_json::Value>,
    jobs: BTreeMap<String, ServantJob>,
    job_polls: HashMap<String, u32>,
    scripts: HashMap<String, JobScript>,
    failures: Vec<(Op, String, ApiErrorKind)>,
    mutations: Vec<String>,
}

pub struct MemoryCluster {
    state: Mutex<State>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        let state = State {
            version: Some(ServerVersion {
                major: "1".into(),
                minor: "18".into(),
                git_version: "v1.18.6".into(),
            }),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("memory cluster poisoned")
    }

    pub fn with_nodes(self, nodes: impl IntoIterator<Item = NodeRecord>) -> Self {
        {
            let mut state = self.lock();
            for node in nodes {
                state.nodes.insert(node.name.clone(), node);
            }
        }
        self
    }

    pub fn set_version(&self, major: &str, minor: &str, git_version: &str) {
        self.lock().version = Some(ServerVersion {
            major: major.into(),
            minor: minor.into(),
            git_version: git_version.into(),
        });
    }

    /// Fail `op` with a generic error when its target matches (`*` matches all).
    pub fn fail_on(&self, op: Op, target: &str) {
        self.fail_on_with(op, target, ApiErrorKind::Other);
    }

    pub fn fail_on_with(&self, op: Op, target: &str, kind: ApiErrorKind) {
        self.lock().failures.push((op, target.to_string(), kind));
    }

    pub fn script_job(&self, node: &str, script: JobScript) {
        self.lock().scripts.insert(node.to_string(), script);
    }

    pub fn insert_object(&self, target: ObjectRef) {
        self.lock().objects.insert(target, serde_json::Value::Null);
    }

    pub fn insert_lock(&self, namespace: &str, record: LockRecord) {
        self.lock()
            .locks
            .insert((namespace.to_string(), record.name.clone()), record);
    }

    pub fn lock_record(&self, namespace: &str, name: &str) -> Option<LockRecord> {
        self.lock()
            .locks
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn node(&self, name: &str) -> Option<NodeRecord> {
        self.lock().nodes.get(name).cloned()
    }

    pub fn object(&self, target: &ObjectRef) -> Option<serde_json::Value> {
        self.lock().objects.get(target).cloned()
    }

    pub fn inventory(&self) -> Vec<ObjectRef> {
        self.lock().objects.keys().cloned().collect()
    }

    pub fn created_jobs(&self) -> Vec<ServantJob> {
        self.lock().jobs.values().cloned().collect()
    }

    /// Successful writes to nodes, objects and jobs, in call order.
    pub fn mutations(&self) -> Vec<String> {
        self.lock().mutations.clone()
    }

    fn check(state: &State, op: Op, target: &str) -> Result<(), ApiError> {
        match state
            .failures
            .iter()
            .find(|(o, t, _)| *o == op && (t == "*" || t == target))
        {
            Some((_, _, kind)) => Err(ApiError::new(*kind, format!("injected {op:?} failure on {target}"))),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ControlPlane for MemoryCluster {
    async fn server_version(&self) -> Result<ServerVersion, ApiError> {
        let state = self.lock();
        Self::check(&state, Op::ServerVersion, "version")?;
        state
            .version
            .clone()
            .ok_or_else(|| ApiError::other("version unavailable"))
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, ApiError> {
        let state = self.lock();
        Self::check(&state, Op::ListNodes, "nodes")?;
        Ok(state.nodes.values().cloned().collect())
    }

    async fn patch_node(&self, name: &str, patch: &NodePatch) -> Result<(), ApiError> {
        let mut state = self.lock();
        Self::check(&state, Op::PatchNode, name)?;
        let node = state
            .nodes
            .get_mut(name)
            .ok_or_else(|| ApiError::not_found(format!("node {name}")))?;
        patch.apply_to(node);
        state.mutations.push(format!("patch node {name}"));
        Ok(())
    }

    async fn get_lock(&self, namespace: &str, name: &str) -> Result<Option<LockRecord>, ApiError> {
        Ok(self.lock_record(namespace, name))
    }

    async fn create_lock(&self, namespace: &str, record: &LockRecord) -> Result<(), ApiError> {
        let mut state = self.lock();
        Self::check(&state, Op::CreateLock, &record.name)?;
        let key = (namespace.to_string(), record.name.clone());
        if state.locks.contains_key(&key) {
            return Err(ApiError::already_exists(format!("configmap {}", record.name)));
        }
        state.locks.insert(key, record.clone());
        Ok(())
    }

    async fn delete_lock(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        let mut state = self.lock();
        Self::check(&state, Op::DeleteLock, name)?;
        state
            .locks
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| ApiError::not_found(format!("configmap {name}")))
    }

    async fn create_object(&self, manifest: &Manifest) -> Result<(), ApiError> {
        let mut state = self.lock();
        Self::check(&state, Op::CreateObject, &manifest.target.name)?;
        if state.objects.contains_key(&manifest.target) {
            return Err(ApiError::already_exists(manifest.target.to_string()));
        }
        state
            .objects
            .insert(manifest.target.clone(), manifest.body.clone());
        state.mutations.push(format!("create {}", manifest.target));
        Ok(())
    }

    async fn update_object(&self, manifest: &Manifest) -> Result<(), ApiError> {
        let mut state = self.lock();
        Self::check(&state, Op::UpdateObject, &manifest.target.name)?;
        match state.objects.get_mut(&manifest.target) {
            Some(body) => *body = manifest.body.clone(),
            None => return Err(ApiError::not_found(manifest.target.to_string())),
        }
        state.mutations.push(format!("update {}", manifest.target));
        Ok(())
    }

    async fn delete_object(&self, target: &ObjectRef) -> Result<(), ApiError> {
        let mut state = self.lock();
        Self::check(&state, Op::DeleteObject, &target.name)?;
        if state.objects.remove(target).is_none() {
            return Err(ApiError::not_found(target.to_string()));
        }
        state.mutations.push(format!("delete {target}"));
        Ok(())
    }

    async fn create_job(&self, job: &ServantJob) -> Result<(), ApiError> {
        let mut state = self.lock();
        Self::check(&state, Op::CreateJob, &job.node)?;
        if state.jobs.contains_key(&job.name) {
            return Err(ApiError::already_exists(format!("job {}", job.name)));
        }
        state.jobs.insert(job.name.clone(), job.clone());
        state.mutations.push(format!("create job {}", job.name));
        Ok(())
    }

    async fn job_phase(&self, _namespace: &str, name: &str) -> Result<JobPhase, ApiError> {
        let mut state = self.lock();
        let node = state
            .jobs
            .get(name)
            .map(|j| j.node.clone())
            .ok_or_else(|| ApiError::not_found(format!("job {name}")))?;
        let polls = {
            let count = state.job_polls.entry(name.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let script = state.scripts.get(&node).cloned().unwrap_or(JobScript::Succeed);
        Ok(match script {
            JobScript::Succeed => JobPhase::Succeeded,
            JobScript::SucceedAfterPolls(n) if polls >= n => JobPhase::Succeeded,
            JobScript::SucceedAfterPolls(_) | JobScript::Hang => JobPhase::Active,
            JobScript::Fail(reason) => JobPhase::Failed(reason),
        })
    }
}
