//! Kubernetes-backed node store.

use crate::error::ClusterError;
use crate::index::{FieldIndexer, POD_NODE_NAME_FIELD};
use crate::store_trait::NodeStore;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::PostParams;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tracing::debug;

/// Node store backed by the API server for nodes and a local pod index.
///
/// Node reads always hit the API server so every reconciliation sees a fresh
/// snapshot. Pod lookups are served from the `spec.nodeName` index.
#[derive(Clone)]
pub struct KubeNodeStore {
    nodes: Api<Node>,
    pods: FieldIndexer<Pod>,
}

impl std::fmt::Debug for KubeNodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeNodeStore")
            .field("pods", &self.pods)
            .finish_non_exhaustive()
    }
}

impl KubeNodeStore {
    /// Creates a store over all nodes in the cluster.
    ///
    /// `pods` must already have the `spec.nodeName` index registered.
    pub fn new(client: Client, pods: FieldIndexer<Pod>) -> Self {
        Self {
            nodes: Api::all(client),
            pods,
        }
    }
}

#[async_trait::async_trait]
impl NodeStore for KubeNodeStore {
    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        match self.nodes.get(name).await {
            Ok(node) => Ok(node),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                Err(ClusterError::NotFound(format!("node/{}", name)))
            }
            Err(e) => Err(ClusterError::Kube(e)),
        }
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Arc<Pod>>, ClusterError> {
        let pods = self.pods.by_index(POD_NODE_NAME_FIELD, node_name)?;
        debug!("Found {} pods on node {}", pods.len(), node_name);
        Ok(pods)
    }

    async fn update_node(&self, node: &Node) -> Result<Node, ClusterError> {
        let name = node.name_any();
        match self.nodes.replace(&name, &PostParams::default(), node).await {
            Ok(updated) => Ok(updated),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(ClusterError::Conflict(format!(
                "node/{}: {}",
                name, ae.message
            ))),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                Err(ClusterError::NotFound(format!("node/{}", name)))
            }
            Err(e) => Err(ClusterError::Kube(e)),
        }
    }
}
