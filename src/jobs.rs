//! Servant job fan-out.
//!
//! One `batch/v1` Job per edge node carries the host-level remediation for a
//! transition. Jobs are created and awaited by independent per-node tasks that
//! are joined at a single barrier; every job is waited on even when another
//! one has already failed, and the joined results are aggregated into one
//! verdict.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, HostPathVolumeSource, PodSpec, PodTemplateSpec, SecurityContext, Toleration, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::cluster::{ControlPlane, JobPhase};
use crate::error::EdgeError;

/// Kubernetes object names are capped at 63 characters for labels and DNS.
const MAX_NAME_LEN: usize = 63;
const HOST_ROOT: &str = "/host";

/// What a servant does on its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServantAction {
    /// Point the kubelet at the local proxy and install the proxy manifest.
    Convert,
    /// Restore the kubelet configuration and remove the proxy manifest.
    Revert,
}

impl ServantAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ServantAction::Convert => "convert",
            ServantAction::Revert => "revert",
        }
    }
}

impl fmt::Display for ServantAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single per-node unit of remediation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServantJob {
    pub name: String,
    pub namespace: String,
    pub node: String,
    pub action: ServantAction,
    pub image: String,
}

impl ServantJob {
    pub fn new(
        node: &str,
        action: ServantAction,
        image: &str,
        namespace: &str,
        run_suffix: &str,
    ) -> Self {
        Self {
            name: servant_job_name(action, node, run_suffix),
            namespace: namespace.to_string(),
            node: node.to_string(),
            action,
            image: image.to_string(),
        }
    }
}

/// Short stable digest of a node name: 8 hex chars of its SHA-256.
pub fn node_digest(node: &str) -> String {
    Sha256::digest(node.as_bytes())[..4]
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Derive a DNS-safe job name unique to this node and transition run.
///
/// The readable node part may be cut short or lose characters, so the digest
/// of the full node name keeps names distinct across nodes.
pub fn servant_job_name(action: ServantAction, node: &str, run_suffix: &str) -> String {
    let suffix = format!("-{}-{run_suffix}", node_digest(node));
    let mut base = format!("edgectl-servant-{}-{}", action, node.to_lowercase());
    base.retain(|c| c.is_ascii_alphanumeric() || c == '-');
    base.truncate(MAX_NAME_LEN.saturating_sub(suffix.len()));
    let base = base.trim_end_matches('-');
    format!("{base}{suffix}")
}

/// Build the Job that runs `job.action` on `job.node`.
///
/// The pod is pinned with `nodeName`, shares the host PID namespace and mounts
/// the host root so the servant can rewrite kubelet configuration in place.
/// `ttlSecondsAfterFinished` hands cleanup to the platform.
pub fn build_servant_job(job: &ServantJob, ttl_seconds: i32) -> Job {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "edgectl".to_string(),
    );
    labels.insert("edgectl.io/servant-action".to_string(), job.action.to_string());
    // Label values are capped at 63 characters; node names are not.
    labels.insert("edgectl.io/servant-node-hash".to_string(), node_digest(&job.node));
    let annotations = BTreeMap::from([(
        "edgectl.io/servant-node".to_string(),
        job.node.clone(),
    )]);

    let container = Container {
        name: "servant".to_string(),
        image: Some(job.image.clone()),
        command: Some(vec!["/usr/local/bin/edge-servant".to_string()]),
        args: Some(vec![
            job.action.to_string(),
            format!("--node-name={}", job.node),
            format!("--host-root={HOST_ROOT}"),
        ]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: "host-root".to_string(),
            mount_path: HOST_ROOT.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(job.name.clone()),
            namespace: Some(job.namespace.clone()),
            labels: Some(labels.clone()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(1),
            ttl_seconds_after_finished: Some(ttl_seconds),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    node_name: Some(job.node.clone()),
                    host_pid: Some(true),
                    host_network: Some(true),
                    restart_policy: Some("OnFailure".to_string()),
                    tolerations: Some(vec![Toleration {
                        operator: Some("Exists".to_string()),
                        ..Default::default()
                    }]),
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: "host-root".to_string(),
                        host_path: Some(HostPathVolumeSource {
                            path: "/".to_string(),
                            type_: Some("Directory".to_string()),
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Read the terminal state of a Job from its status.
pub fn job_phase_of(job: &Job) -> JobPhase {
    let Some(status) = job.status.as_ref() else {
        return JobPhase::Active;
    };
    let condition = |type_: &str| {
        status
            .conditions
            .as_ref()
            .and_then(|conditions| {
                conditions
                    .iter()
                    .find(|c| c.type_ == type_ && c.status == "True")
            })
            .cloned()
    };

    if condition("Complete").is_some() || status.succeeded.unwrap_or(0) > 0 {
        JobPhase::Succeeded
    } else if let Some(failed) = condition("Failed") {
        JobPhase::Failed(
            failed
                .message
                .or(failed.reason)
                .unwrap_or_else(|| "job failed".to_string()),
        )
    } else {
        JobPhase::Active
    }
}

/// Terminal outcome of one servant job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed(String),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobResult {
    pub node: String,
    pub job: String,
    #[serde(flatten)]
    pub outcome: JobOutcome,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        self.outcome == JobOutcome::Succeeded
    }
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub namespace: String,
    pub image: String,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

/// Creates one servant job per edge node and waits for all of them.
pub struct ServantDispatcher {
    client: Arc<dyn ControlPlane>,
    settings: DispatchSettings,
}

impl ServantDispatcher {
    pub fn new(client: Arc<dyn ControlPlane>, settings: DispatchSettings) -> Self {
        Self { client, settings }
    }

    /// The jobs a dispatch would create, without creating them.
    pub fn plan(&self, nodes: &[String], action: ServantAction, run_suffix: &str) -> Vec<ServantJob> {
        nodes
            .iter()
            .map(|node| {
                ServantJob::new(
                    node,
                    action,
                    &self.settings.image,
                    &self.settings.namespace,
                    run_suffix,
                )
            })
            .collect()
    }

    /// Run one job per node and return every node's result, ordered by node.
    ///
    /// Waits for all jobs; a failure on one node does not cancel the others.
    pub async fn dispatch(
        &self,
        nodes: &[String],
        action: ServantAction,
        run_suffix: &str,
    ) -> Vec<JobResult> {
        let jobs = self.plan(nodes, action, run_suffix);
        if jobs.is_empty() {
            debug!(%action, "no edge nodes, skipping servant jobs");
            return Vec::new();
        }
        info!(%action, count = jobs.len(), image = %self.settings.image, "dispatching servant jobs");

        let handles: Vec<(ServantJob, JoinHandle<JobResult>)> = jobs
            .into_iter()
            .map(|job| {
                let client = Arc::clone(&self.client);
                let timeout = self.settings.timeout;
                let poll = self.settings.poll_interval;
                let task_job = job.clone();
                (job, tokio::spawn(run_servant(client, task_job, timeout, poll)))
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for (job, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => JobResult {
                    node: job.node,
                    job: job.name,
                    outcome: JobOutcome::Failed(format!("servant task aborted: {e}")),
                },
            };
            results.push(result);
        }
        results.sort_by(|a, b| a.node.cmp(&b.node));
        results
    }

    /// Collapse per-node results into the fan-out verdict.
    pub fn aggregate(results: &[JobResult]) -> Result<(), EdgeError> {
        let failed_nodes: Vec<String> = results
            .iter()
            .filter(|r| !r.is_success())
            .map(|r| r.node.clone())
            .collect();
        if failed_nodes.is_empty() {
            Ok(())
        } else {
            Err(EdgeError::JobDispatchFailed { failed_nodes })
        }
    }
}

async fn run_servant(
    client: Arc<dyn ControlPlane>,
    job: ServantJob,
    timeout: Duration,
    poll_interval: Duration,
) -> JobResult {
    let outcome = match client.create_job(&job).await {
        Ok(()) => {
            debug!(node = %job.node, job = %job.name, "servant job created");
            wait_for_job(client.as_ref(), &job, timeout, poll_interval).await
        }
        Err(e) => JobOutcome::Failed(format!("create job: {e}")),
    };

    match &outcome {
        JobOutcome::Succeeded => info!(node = %job.node, job = %job.name, "servant job succeeded"),
        JobOutcome::Failed(reason) => {
            warn!(node = %job.node, job = %job.name, %reason, "servant job failed")
        }
        JobOutcome::TimedOut => {
            warn!(node = %job.node, job = %job.name, timeout_secs = timeout.as_secs(), "servant job timed out")
        }
    }

    JobResult {
        node: job.node,
        job: job.name,
        outcome,
    }
}

async fn wait_for_job(
    client: &dyn ControlPlane,
    job: &ServantJob,
    timeout: Duration,
    poll_interval: Duration,
) -> JobOutcome {
    // A huge timeout must not overflow; treat it as waiting forever.
    let deadline = Instant::now().checked_add(timeout);
    loop {
        match client.job_phase(&job.namespace, &job.name).await {
            Ok(JobPhase::Succeeded) => return JobOutcome::Succeeded,
            Ok(JobPhase::Failed(reason)) => return JobOutcome::Failed(reason),
            Ok(JobPhase::Active) => {}
            Err(e) => return JobOutcome::Failed(format!("read job status: {e}")),
        }
        if let Some(deadline) = deadline
            && Instant::now().checked_add(poll_interval).is_none_or(|next| next > deadline)
        {
            return JobOutcome::TimedOut;
        }
        sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::{JobScript, MemoryCluster, Op};
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};

    fn settings() -> DispatchSettings {
        DispatchSettings {
            namespace: "kube-system".into(),
            image: "example/servant:v1".into(),
            timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn nodes(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn job_name_is_bounded_and_dns_safe() {
        let long_node = "Edge_Node.".to_string() + &"x".repeat(80);
        let name = servant_job_name(ServantAction::Revert, &long_node, "ab12c");
        assert!(name.len() <= MAX_NAME_LEN);
        assert!(name.starts_with("edgectl-servant-revert-edgenode"));
        assert!(name.ends_with(&format!("-{}-ab12c", node_digest(&long_node))));
        assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }

    #[test]
    fn job_names_differ_for_nodes_sharing_a_long_prefix() {
        let a = servant_job_name(ServantAction::Convert, "gke-prod-cluster-default-pool-4f2a9c1e-ab12", "r1");
        let b = servant_job_name(ServantAction::Convert, "gke-prod-cluster-default-pool-4f2a9c1e-cd34", "r1");
        assert_ne!(a, b);
        assert!(a.len() <= MAX_NAME_LEN && b.len() <= MAX_NAME_LEN);

        let dotted = servant_job_name(ServantAction::Revert, "edge.1", "r1");
        let plain = servant_job_name(ServantAction::Revert, "edge1", "r1");
        assert_ne!(dotted, plain);
    }

    #[test]
    fn label_values_fit_for_long_node_names() {
        let node = "n".repeat(100);
        let job = ServantJob::new(&node, ServantAction::Revert, "img:1", "kube-system", "r1");
        let built = build_servant_job(&job, 300);
        let labels = built.metadata.labels.unwrap();
        assert!(labels.values().all(|v| v.len() <= 63), "{labels:?}");
        let annotations = built.metadata.annotations.unwrap();
        assert_eq!(annotations["edgectl.io/servant-node"], node);
        let pod_labels = built.spec.unwrap().template.metadata.unwrap().labels.unwrap();
        assert!(pod_labels.values().all(|v| v.len() <= 63));
    }

    #[test]
    fn servant_job_pins_node_and_passes_action() {
        let job = ServantJob::new("edge-1", ServantAction::Convert, "img:1", "kube-system", "r1");
        let built = build_servant_job(&job, 300);
        let spec = built.spec.unwrap();
        assert_eq!(spec.ttl_seconds_after_finished, Some(300));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.node_name.as_deref(), Some("edge-1"));
        assert_eq!(pod.host_pid, Some(true));
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("img:1"));
        assert_eq!(container.args.as_ref().unwrap()[0], "convert");
    }

    #[test]
    fn job_phase_reads_conditions() {
        let mut job = Job::default();
        assert_eq!(job_phase_of(&job), JobPhase::Active);

        job.status = Some(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: "Failed".into(),
                status: "True".into(),
                message: Some("BackoffLimitExceeded".into()),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert_eq!(job_phase_of(&job), JobPhase::Failed("BackoffLimitExceeded".into()));

        job.status = Some(JobStatus {
            succeeded: Some(1),
            ..Default::default()
        });
        assert_eq!(job_phase_of(&job), JobPhase::Succeeded);
    }

    #[tokio::test]
    async fn dispatch_creates_exactly_one_job_per_node() {
        let cluster = Arc::new(MemoryCluster::new());
        let dispatcher = ServantDispatcher::new(cluster.clone(), settings());

        let results = dispatcher
            .dispatch(&nodes(&["b", "a", "c"]), ServantAction::Convert, "r1")
            .await;

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(JobResult::is_success));
        assert_eq!(
            results.iter().map(|r| r.node.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        let created = cluster.created_jobs();
        assert_eq!(created.len(), 3);
        assert!(created.iter().all(|j| j.action == ServantAction::Convert));
        assert!(created.iter().all(|j| j.image == "example/servant:v1"));
        assert!(ServantDispatcher::aggregate(&results).is_ok());
    }

    #[tokio::test]
    async fn dispatch_with_no_nodes_creates_nothing() {
        let cluster = Arc::new(MemoryCluster::new());
        let dispatcher = ServantDispatcher::new(cluster.clone(), settings());
        let results = dispatcher.dispatch(&[], ServantAction::Revert, "r1").await;
        assert!(results.is_empty());
        assert!(cluster.created_jobs().is_empty());
    }

    #[tokio::test]
    async fn failure_waits_for_all_jobs_then_aggregates() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.script_job("a", JobScript::Fail("kubelet restart failed".into()));
        // "b" finishes only after "a" has already failed.
        cluster.script_job("b", JobScript::SucceedAfterPolls(5));
        cluster.script_job("c", JobScript::Hang);
        let dispatcher = ServantDispatcher::new(cluster.clone(), settings());

        let results = dispatcher
            .dispatch(&nodes(&["a", "b", "c"]), ServantAction::Revert, "r1")
            .await;

        assert_eq!(results[0].outcome, JobOutcome::Failed("kubelet restart failed".into()));
        assert_eq!(results[1].outcome, JobOutcome::Succeeded);
        assert_eq!(results[2].outcome, JobOutcome::TimedOut);

        match ServantDispatcher::aggregate(&results) {
            Err(EdgeError::JobDispatchFailed { failed_nodes }) => {
                assert_eq!(failed_nodes, vec!["a".to_string(), "c".to_string()]);
            }
            other => panic!("expected JobDispatchFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn nodes_sharing_a_long_prefix_each_get_a_job() {
        let cluster = Arc::new(MemoryCluster::new());
        let dispatcher = ServantDispatcher::new(cluster.clone(), settings());
        let results = dispatcher
            .dispatch(
                &nodes(&[
                    "gke-prod-cluster-default-pool-4f2a9c1e-ab12",
                    "gke-prod-cluster-default-pool-4f2a9c1e-cd34",
                ]),
                ServantAction::Convert,
                "ab12c",
            )
            .await;
        assert!(results.iter().all(JobResult::is_success), "{results:?}");
        assert_eq!(cluster.created_jobs().len(), 2);
    }

    #[tokio::test]
    async fn huge_timeout_does_not_overflow() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.script_job("a", JobScript::SucceedAfterPolls(2));
        let dispatcher = ServantDispatcher::new(
            cluster.clone(),
            DispatchSettings {
                timeout: Duration::MAX,
                ..settings()
            },
        );
        let results = dispatcher.dispatch(&nodes(&["a"]), ServantAction::Revert, "r1").await;
        assert_eq!(results[0].outcome, JobOutcome::Succeeded);
    }

    #[tokio::test]
    async fn create_failure_counts_as_failed_node() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.fail_on(Op::CreateJob, "b");
        let dispatcher = ServantDispatcher::new(cluster.clone(), settings());

        let results = dispatcher
            .dispatch(&nodes(&["a", "b"]), ServantAction::Convert, "r1")
            .await;

        assert!(results[0].is_success());
        assert!(matches!(&results[1].outcome, JobOutcome::Failed(r) if r.starts_with("create job")));
        assert_eq!(cluster.created_jobs().len(), 1);
    }
}
