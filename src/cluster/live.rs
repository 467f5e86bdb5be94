//! [`ControlPlane`] backed by a Kubernetes API server via `kube`.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
    PropagationPolicy,
};
use kube::config::KubeConfigOptions;
use kube::{Client, Config};
use tracing::debug;

use super::{
    ControlPlane, JobPhase, LockRecord, Manifest, NodePatch, NodeRecord, ObjectRef, ResourceKind,
    ServerVersion,
};
use crate::error::{ApiError, ApiErrorKind};
use crate::jobs::{ServantJob, build_servant_job, job_phase_of};

const LOCK_HOLDER_ANNOTATION: &str = "edgectl.io/lock-holder";
const LOCK_ACQUIRED_ANNOTATION: &str = "edgectl.io/lock-acquired-at";

pub struct KubeControlPlane {
    client: Client,
    job_ttl_seconds: i32,
}

impl KubeControlPlane {
    pub fn new(client: Client, job_ttl_seconds: i32) -> Self {
        Self {
            client,
            job_ttl_seconds,
        }
    }

    /// Connect using the kubeconfig, optionally pinned to a named context.
    /// Without a context the usual inference (in-cluster, then kubeconfig) applies.
    pub async fn connect(context: Option<&str>, job_ttl_seconds: i32) -> Result<Self> {
        let config = match context {
            Some(ctx) => {
                let options = KubeConfigOptions {
                    context: Some(ctx.to_string()),
                    ..Default::default()
                };
                Config::from_kubeconfig(&options)
                    .await
                    .with_context(|| format!("failed to load kubeconfig context {ctx}"))?
            }
            None => Config::infer()
                .await
                .context("failed to infer kubernetes config")?,
        };
        let client = Client::try_from(config).context("failed to build kubernetes client")?;
        Ok(Self::new(client, job_ttl_seconds))
    }

    fn dynamic_api(&self, target: &ObjectRef) -> Api<DynamicObject> {
        let resource = api_resource(target.kind);
        match &target.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

fn api_resource(kind: ResourceKind) -> ApiResource {
    match kind {
        ResourceKind::ClusterRole => ApiResource::erase::<ClusterRole>(&()),
        ResourceKind::ClusterRoleBinding => ApiResource::erase::<ClusterRoleBinding>(&()),
        ResourceKind::ServiceAccount => ApiResource::erase::<ServiceAccount>(&()),
        ResourceKind::Service => ApiResource::erase::<Service>(&()),
        ResourceKind::DaemonSet => ApiResource::erase::<DaemonSet>(&()),
        ResourceKind::Deployment => ApiResource::erase::<Deployment>(&()),
    }
}

/// Map a `kube` error onto the closed [`ApiErrorKind`] set.
fn classify(err: kube::Error) -> ApiError {
    match err {
        kube::Error::Api(resp) => {
            let kind = match (resp.code, resp.reason.as_str()) {
                (404, _) => ApiErrorKind::NotFound,
                (409, "AlreadyExists") => ApiErrorKind::AlreadyExists,
                (409, _) => ApiErrorKind::Conflict,
                _ => ApiErrorKind::Other,
            };
            ApiError::new(kind, resp.message)
        }
        other => ApiError::other(other.to_string()),
    }
}

fn lock_from_config_map(cm: ConfigMap) -> Option<LockRecord> {
    let name = cm.metadata.name?;
    let annotations = cm.metadata.annotations.unwrap_or_default();
    let holder = annotations.get(LOCK_HOLDER_ANNOTATION)?.clone();
    let acquired_at = annotations
        .get(LOCK_ACQUIRED_ANNOTATION)
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc))
        .or_else(|| cm.metadata.creation_timestamp.map(|t| t.0))
        .unwrap_or_else(Utc::now);
    Some(LockRecord {
        name,
        holder,
        acquired_at,
    })
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    async fn server_version(&self) -> Result<ServerVersion, ApiError> {
        let info = self.client.apiserver_version().await.map_err(classify)?;
        Ok(ServerVersion {
            major: info.major,
            minor: info.minor,
            git_version: info.git_version,
        })
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>, ApiError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await.map_err(classify)?;
        Ok(nodes
            .items
            .into_iter()
            .filter_map(|node| {
                Some(NodeRecord {
                    name: node.metadata.name?,
                    labels: node.metadata.labels.unwrap_or_default(),
                    annotations: node.metadata.annotations.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn patch_node(&self, name: &str, patch: &NodePatch) -> Result<(), ApiError> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.patch(
            name,
            &PatchParams::default(),
            &Patch::Merge(&patch.to_merge_patch()),
        )
        .await
        .map_err(classify)?;
        debug!(node = %name, %patch, "node patched");
        Ok(())
    }

    async fn get_lock(&self, namespace: &str, name: &str) -> Result<Option<LockRecord>, ApiError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let cm = api.get_opt(name).await.map_err(classify)?;
        // A record without the holder annotation still blocks acquisition.
        Ok(cm.map(|cm| {
            let fallback_name = cm.metadata.name.clone().unwrap_or_else(|| name.to_string());
            lock_from_config_map(cm).unwrap_or_else(|| LockRecord {
                name: fallback_name,
                holder: "unknown".to_string(),
                acquired_at: Utc::now(),
            })
        }))
    }

    async fn create_lock(&self, namespace: &str, record: &LockRecord) -> Result<(), ApiError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let mut annotations = BTreeMap::new();
        annotations.insert(LOCK_HOLDER_ANNOTATION.to_string(), record.holder.clone());
        annotations.insert(
            LOCK_ACQUIRED_ANNOTATION.to_string(),
            record.acquired_at.to_rfc3339(),
        );
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(record.name.clone()),
                namespace: Some(namespace.to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        };
        api.create(&PostParams::default(), &cm)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete_lock(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn create_object(&self, manifest: &Manifest) -> Result<(), ApiError> {
        let obj: DynamicObject = serde_json::from_value(manifest.body.clone())
            .map_err(|e| ApiError::other(format!("invalid manifest for {}: {e}", manifest.target)))?;
        self.dynamic_api(&manifest.target)
            .create(&PostParams::default(), &obj)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn update_object(&self, manifest: &Manifest) -> Result<(), ApiError> {
        // A merge patch on a missing object reports 404, which is the
        // update-if-present contract.
        self.dynamic_api(&manifest.target)
            .patch(
                &manifest.target.name,
                &PatchParams::default(),
                &Patch::Merge(&manifest.body),
            )
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn delete_object(&self, target: &ObjectRef) -> Result<(), ApiError> {
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        self.dynamic_api(target)
            .delete(&target.name, &params)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn create_job(&self, job: &ServantJob) -> Result<(), ApiError> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), &job.namespace);
        api.create(&PostParams::default(), &build_servant_job(job, self.job_ttl_seconds))
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn job_phase(&self, namespace: &str, name: &str) -> Result<JobPhase, ApiError> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let job = api.get(name).await.map_err(classify)?;
        Ok(job_phase_of(&job))
    }
}
