//! NodeStore trait for mocking
//!
//! This trait abstracts cluster access so the reconciler can be exercised
//! against in-memory fixtures. `KubeNodeStore` implements it against a real
//! API server, `MockNodeStore` (behind `test-util`) in memory.

use crate::error::ClusterError;
use k8s_openapi::api::core::v1::{Node, Pod};
use std::sync::Arc;

/// Cluster state operations needed by the node reconciler
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait NodeStore: Send + Sync {
    /// Fetch the current node. Returns `ClusterError::NotFound` (or a 404
    /// `Kube` error) when the node does not exist.
    async fn get_node(&self, name: &str) -> Result<Node, ClusterError>;

    /// All pods whose `spec.nodeName` equals `node_name`.
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Arc<Pod>>, ClusterError>;

    /// Whole-object write of the node. Conflicts are returned, never retried.
    async fn update_node(&self, node: &Node) -> Result<Node, ClusterError>;
}
