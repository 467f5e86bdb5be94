//! Object bodies for the managed catalog.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, ObjectFieldSelector, PodSpec, PodTemplateSpec,
    SecurityContext, Service, ServiceAccount, ServicePort, ServiceSpec, Toleration,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::Serialize;

use crate::cluster::{Manifest, ObjectRef, ResourceKind};

pub const TUNNEL_SERVER: &str = "yurt-tunnel-server";
pub const TUNNEL_SERVER_SERVICE: &str = "x-tunnel-server-svc";
pub const TUNNEL_AGENT: &str = "yurt-tunnel-agent";
pub const CONTROLLER_MANAGER: &str = "yurt-controller-manager";
/// Built-in service account used by the node lifecycle controller.
pub const NODE_CONTROLLER: &str = "node-controller";

const TUNNEL_AGENT_PORT: i32 = 10262;
const TUNNEL_MASTER_PORT: i32 = 10263;
const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

/// Inputs for rendering the catalog.
#[derive(Debug, Clone)]
pub struct ComponentSettings {
    pub namespace: String,
    pub edge_label_key: String,
    pub controller_manager_image: String,
    pub tunnel_server_image: String,
    pub tunnel_agent_image: String,
}

fn manifest<K: Serialize>(target: ObjectRef, object: &K) -> Result<Manifest, serde_json::Error> {
    Ok(Manifest {
        target,
        body: serde_json::to_value(object)?,
    })
}

fn meta(name: &str, namespace: Option<&str>) -> ObjectMeta {
    let mut labels = BTreeMap::new();
    labels.insert("k8s-app".to_string(), name.to_string());
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "edgectl".to_string(),
    );
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(labels),
        ..Default::default()
    }
}

fn app_labels(name: &str) -> BTreeMap<String, String> {
    [("k8s-app".to_string(), name.to_string())].into()
}

fn rule(group: &str, resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![group.to_string()]),
        resources: Some(resources.iter().map(|r| r.to_string()).collect()),
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
        ..Default::default()
    }
}

fn field_env(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                api_version: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn control_plane_tolerations() -> Vec<Toleration> {
    ["node-role.kubernetes.io/master", "node-role.kubernetes.io/control-plane"]
        .iter()
        .map(|key| Toleration {
            key: Some(key.to_string()),
            operator: Some("Exists".to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Default::default()
        })
        .collect()
}

fn pod_template(name: &str, spec: PodSpec) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(app_labels(name)),
            ..Default::default()
        }),
        spec: Some(spec),
    }
}

pub fn cluster_role(name: &str, rules: Vec<PolicyRule>) -> Result<Manifest, serde_json::Error> {
    let role = ClusterRole {
        metadata: meta(name, None),
        rules: Some(rules),
        ..Default::default()
    };
    manifest(ObjectRef::cluster(ResourceKind::ClusterRole, name), &role)
}

pub fn service_account(namespace: &str, name: &str) -> Result<Manifest, serde_json::Error> {
    let account = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    manifest(
        ObjectRef::namespaced(ResourceKind::ServiceAccount, namespace, name),
        &account,
    )
}

pub fn cluster_role_binding(name: &str, subject: Subject) -> Result<Manifest, serde_json::Error> {
    let binding = ClusterRoleBinding {
        metadata: meta(name, None),
        role_ref: RoleRef {
            api_group: RBAC_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: name.to_string(),
        },
        subjects: Some(vec![subject]),
    };
    manifest(ObjectRef::cluster(ResourceKind::ClusterRoleBinding, name), &binding)
}

pub fn tunnel_server_role() -> Result<Manifest, serde_json::Error> {
    cluster_role(
        TUNNEL_SERVER,
        vec![
            rule(
                "certificates.k8s.io",
                &["certificatesigningrequests"],
                &["create", "get", "list", "watch"],
            ),
            rule(
                "certificates.k8s.io",
                &["certificatesigningrequests/approval"],
                &["update"],
            ),
            rule("certificates.k8s.io", &["signers"], &["approve"]),
            rule("", &["nodes", "services", "endpoints", "configmaps"], &["get", "list", "watch"]),
        ],
    )
}

pub fn tunnel_agent_role() -> Result<Manifest, serde_json::Error> {
    cluster_role(
        TUNNEL_AGENT,
        vec![rule(
            "certificates.k8s.io",
            &["certificatesigningrequests"],
            &["create", "get", "list", "watch"],
        )],
    )
}

pub fn tunnel_server_binding(namespace: &str) -> Result<Manifest, serde_json::Error> {
    cluster_role_binding(
        TUNNEL_SERVER,
        Subject {
            kind: "ServiceAccount".to_string(),
            name: TUNNEL_SERVER.to_string(),
            namespace: Some(namespace.to_string()),
            api_group: None,
        },
    )
}

pub fn tunnel_agent_binding() -> Result<Manifest, serde_json::Error> {
    // Agents authenticate with their client certificate, not a service account.
    cluster_role_binding(
        TUNNEL_AGENT,
        Subject {
            kind: "User".to_string(),
            name: "tunnel-agent".to_string(),
            namespace: None,
            api_group: Some(RBAC_GROUP.to_string()),
        },
    )
}

pub fn tunnel_server_service(namespace: &str) -> Result<Manifest, serde_json::Error> {
    let port = |name: &str, number: i32| ServicePort {
        name: Some(name.to_string()),
        port: number,
        target_port: Some(IntOrString::Int(number)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    };
    let service = Service {
        metadata: meta(TUNNEL_SERVER_SERVICE, Some(namespace)),
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            selector: Some(app_labels(TUNNEL_SERVER)),
            ports: Some(vec![
                port("https", TUNNEL_MASTER_PORT),
                port("tcp", TUNNEL_AGENT_PORT),
            ]),
            ..Default::default()
        }),
        ..Default::default()
    };
    manifest(
        ObjectRef::namespaced(ResourceKind::Service, namespace, TUNNEL_SERVER_SERVICE),
        &service,
    )
}

fn daemon_set(
    name: &str,
    settings: &ComponentSettings,
    pod: PodSpec,
) -> Result<Manifest, serde_json::Error> {
    let ds = DaemonSet {
        metadata: meta(name, Some(&settings.namespace)),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(app_labels(name)),
                ..Default::default()
            },
            template: pod_template(name, pod),
            ..Default::default()
        }),
        ..Default::default()
    };
    manifest(
        ObjectRef::namespaced(ResourceKind::DaemonSet, &settings.namespace, name),
        &ds,
    )
}

/// Tunnel server, one per cloud node.
pub fn tunnel_server_daemon_set(settings: &ComponentSettings) -> Result<Manifest, serde_json::Error> {
    let container = Container {
        name: TUNNEL_SERVER.to_string(),
        image: Some(settings.tunnel_server_image.clone()),
        command: Some(vec![TUNNEL_SERVER.to_string()]),
        args: Some(vec![
            "--bind-address=$(NODE_IP)".to_string(),
            "--enable-iptables=true".to_string(),
        ]),
        env: Some(vec![field_env("NODE_IP", "status.hostIP")]),
        security_context: Some(SecurityContext {
            capabilities: Some(k8s_openapi::api::core::v1::Capabilities {
                add: Some(vec!["NET_ADMIN".to_string(), "NET_RAW".to_string()]),
                drop: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    daemon_set(
        TUNNEL_SERVER,
        settings,
        PodSpec {
            host_network: Some(true),
            service_account_name: Some(TUNNEL_SERVER.to_string()),
            node_selector: Some([(settings.edge_label_key.clone(), "false".to_string())].into()),
            tolerations: Some(control_plane_tolerations()),
            containers: vec![container],
            ..Default::default()
        },
    )
}

/// Tunnel agent, one per edge node.
pub fn tunnel_agent_daemon_set(settings: &ComponentSettings) -> Result<Manifest, serde_json::Error> {
    let container = Container {
        name: TUNNEL_AGENT.to_string(),
        image: Some(settings.tunnel_agent_image.clone()),
        command: Some(vec![TUNNEL_AGENT.to_string()]),
        args: Some(vec!["--node-name=$(NODE_NAME)".to_string()]),
        env: Some(vec![field_env("NODE_NAME", "spec.nodeName")]),
        ..Default::default()
    };
    daemon_set(
        TUNNEL_AGENT,
        settings,
        PodSpec {
            host_network: Some(true),
            node_selector: Some([(settings.edge_label_key.clone(), "true".to_string())].into()),
            containers: vec![container],
            ..Default::default()
        },
    )
}

/// Replaces the built-in node lifecycle controller; runs on cloud nodes only.
pub fn controller_manager_deployment(
    settings: &ComponentSettings,
) -> Result<Manifest, serde_json::Error> {
    let container = Container {
        name: CONTROLLER_MANAGER.to_string(),
        image: Some(settings.controller_manager_image.clone()),
        command: Some(vec![CONTROLLER_MANAGER.to_string()]),
        ..Default::default()
    };
    let deployment = Deployment {
        metadata: meta(CONTROLLER_MANAGER, Some(&settings.namespace)),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(app_labels(CONTROLLER_MANAGER)),
                ..Default::default()
            },
            template: pod_template(
                CONTROLLER_MANAGER,
                PodSpec {
                    host_network: Some(true),
                    node_selector: Some(
                        [(settings.edge_label_key.clone(), "false".to_string())].into(),
                    ),
                    tolerations: Some(control_plane_tolerations()),
                    containers: vec![container],
                    ..Default::default()
                },
            ),
            ..Default::default()
        }),
        ..Default::default()
    };
    manifest(
        ObjectRef::namespaced(ResourceKind::Deployment, &settings.namespace, CONTROLLER_MANAGER),
        &deployment,
    )
}
