//! Edge membership classification of cluster nodes.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::cluster::{ControlPlane, NodePatch, NodeRecord};
use crate::error::EdgeError;

const TRUE: &str = "true";
const FALSE: &str = "false";

/// Which nodes take the edge role during convert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EdgeSelection {
    /// The named nodes stay in the cloud; every other node becomes an edge node.
    CloudNodes(BTreeSet<String>),
    /// Only the named nodes become edge nodes.
    EdgeNodes(BTreeSet<String>),
}

impl EdgeSelection {
    fn named(&self) -> &BTreeSet<String> {
        match self {
            EdgeSelection::CloudNodes(names) | EdgeSelection::EdgeNodes(names) => names,
        }
    }

    fn is_edge(&self, node: &str) -> bool {
        match self {
            EdgeSelection::CloudNodes(cloud) => !cloud.contains(node),
            EdgeSelection::EdgeNodes(edge) => edge.contains(node),
        }
    }
}

/// Outcome of classifying the node set, before any write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    /// Edge nodes, sorted by name. These receive servant jobs.
    pub edge: Vec<String>,
    /// Patches for nodes whose metadata must change, sorted by name.
    pub patches: Vec<(String, NodePatch)>,
}

pub struct NodeClassifier {
    client: Arc<dyn ControlPlane>,
    label_key: String,
    annotation_key: String,
}

impl NodeClassifier {
    pub fn new(client: Arc<dyn ControlPlane>, label_key: &str, annotation_key: &str) -> Self {
        Self {
            client,
            label_key: label_key.to_string(),
            annotation_key: annotation_key.to_string(),
        }
    }

    pub fn is_edge(&self, node: &NodeRecord) -> bool {
        node.labels.get(&self.label_key).map(String::as_str) == Some(TRUE)
    }

    /// Label nodes for convert and return the edge node names.
    pub async fn convert(
        &self,
        selection: &EdgeSelection,
        autonomous: bool,
    ) -> Result<Vec<String>, EdgeError> {
        let plan = self.plan_convert(selection, autonomous).await?;
        self.apply(&plan).await?;
        info!(edge = plan.edge.len(), label = %self.label_key, "nodes labelled for edge role");
        Ok(plan.edge)
    }

    /// Strip membership markers and return the nodes that were edge nodes.
    pub async fn revert(&self) -> Result<Vec<String>, EdgeError> {
        let plan = self.plan_revert().await?;
        self.apply(&plan).await?;
        info!(edge = plan.edge.len(), label = %self.label_key, "edge membership removed");
        Ok(plan.edge)
    }

    pub async fn plan_convert(
        &self,
        selection: &EdgeSelection,
        autonomous: bool,
    ) -> Result<Classification, EdgeError> {
        let nodes = self.client.list_nodes().await?;
        self.classify_convert(&nodes, selection, autonomous)
    }

    pub async fn plan_revert(&self) -> Result<Classification, EdgeError> {
        let nodes = self.client.list_nodes().await?;
        Ok(self.classify_revert(&nodes))
    }

    /// Current edge and non-edge node names.
    pub async fn partition(&self) -> Result<(Vec<String>, Vec<String>), EdgeError> {
        let nodes = self.client.list_nodes().await?;
        let (edge, rest): (Vec<_>, Vec<_>) =
            sorted(&nodes).into_iter().partition(|n| self.is_edge(n));
        Ok((
            edge.into_iter().map(|n| n.name.clone()).collect(),
            rest.into_iter().map(|n| n.name.clone()).collect(),
        ))
    }

    fn classify_convert(
        &self,
        nodes: &[NodeRecord],
        selection: &EdgeSelection,
        autonomous: bool,
    ) -> Result<Classification, EdgeError> {
        let known: BTreeSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
        if let Some(missing) = selection.named().iter().find(|n| !known.contains(n.as_str())) {
            return Err(EdgeError::NodeNotFound(missing.clone()));
        }

        let mut plan = Classification::default();
        for node in sorted(nodes) {
            let edge = selection.is_edge(&node.name);
            let wanted = if edge { TRUE } else { FALSE };
            let mut patch = NodePatch::default();
            if node.labels.get(&self.label_key).map(String::as_str) != Some(wanted) {
                patch
                    .labels
                    .insert(self.label_key.clone(), Some(wanted.to_string()));
            }
            if edge && autonomous
                && node.annotations.get(&self.annotation_key).map(String::as_str) != Some(TRUE)
            {
                patch
                    .annotations
                    .insert(self.annotation_key.clone(), Some(TRUE.to_string()));
            }
            if edge {
                plan.edge.push(node.name.clone());
            }
            if !patch.is_empty() {
                plan.patches.push((node.name.clone(), patch));
            }
        }
        Ok(plan)
    }

    fn classify_revert(&self, nodes: &[NodeRecord]) -> Classification {
        let mut plan = Classification::default();
        for node in sorted(nodes) {
            if !node.labels.contains_key(&self.label_key) {
                continue;
            }
            let mut patch = NodePatch::default();
            patch.labels.insert(self.label_key.clone(), None);
            if self.is_edge(node) {
                plan.edge.push(node.name.clone());
                if node.annotations.contains_key(&self.annotation_key) {
                    patch.annotations.insert(self.annotation_key.clone(), None);
                }
            }
            plan.patches.push((node.name.clone(), patch));
        }
        plan
    }

    /// Patch nodes one at a time. The first failure aborts the whole set:
    /// a partially labelled cluster is not safe to run autonomously.
    async fn apply(&self, plan: &Classification) -> Result<(), EdgeError> {
        for (name, patch) in &plan.patches {
            self.client
                .patch_node(name, patch)
                .await
                .map_err(|source| EdgeError::NodeUpdateFailed {
                    node: name.clone(),
                    source,
                })?;
            debug!(node = %name, %patch, "node updated");
        }
        Ok(())
    }
}

fn sorted(nodes: &[NodeRecord]) -> Vec<&NodeRecord> {
    let mut nodes: Vec<&NodeRecord> = nodes.iter().collect();
    nodes.sort_by(|a, b| a.name.cmp(&b.name));
    nodes
}
