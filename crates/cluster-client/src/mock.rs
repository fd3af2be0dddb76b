//! Mock NodeStore for unit testing
//!
//! Stores nodes and pods in memory and records every node update, so
//! reconciler tests can assert on both the returned outcome and the writes
//! that were (or were not) made.

use crate::error::ClusterError;
use crate::index::pod_node_name;
use crate::store_trait::NodeStore;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Mock NodeStore for testing
#[derive(Clone, Default)]
pub struct MockNodeStore {
    pub(crate) nodes: Arc<Mutex<HashMap<String, Node>>>,
    // BTreeMap keeps list order deterministic for tests
    pub(crate) pods: Arc<Mutex<BTreeMap<(String, String), Pod>>>,
    pub(crate) updates: Arc<Mutex<Vec<Node>>>,
    pub(crate) list_calls: Arc<Mutex<usize>>,
    pub(crate) next_list_error: Arc<Mutex<Option<ClusterError>>>,
    pub(crate) next_update_error: Arc<Mutex<Option<ClusterError>>>,
}

impl std::fmt::Debug for MockNodeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockNodeStore")
            .field("nodes", &self.nodes.lock().unwrap().len())
            .field("pods", &self.pods.lock().unwrap().len())
            .field("updates", &self.updates.lock().unwrap().len())
            .finish()
    }
}

impl MockNodeStore {
    /// Create an empty mock store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a node (for test setup)
    pub fn add_node(&self, node: Node) {
        self.nodes.lock().unwrap().insert(node.name_any(), node);
    }

    /// Remove a node (simulates deletion between trigger and fetch)
    pub fn remove_node(&self, name: &str) {
        self.nodes.lock().unwrap().remove(name);
    }

    /// Add or replace a pod (for test setup)
    pub fn add_pod(&self, pod: Pod) {
        let key = (pod.namespace().unwrap_or_default(), pod.name_any());
        self.pods.lock().unwrap().insert(key, pod);
    }

    /// Current stored copy of a node
    pub fn node(&self, name: &str) -> Option<Node> {
        self.nodes.lock().unwrap().get(name).cloned()
    }

    /// Every node passed to `update_node` so far, in call order
    pub fn updates(&self) -> Vec<Node> {
        self.updates.lock().unwrap().clone()
    }

    /// Number of `list_pods_on_node` calls so far
    pub fn list_calls(&self) -> usize {
        *self.list_calls.lock().unwrap()
    }

    /// Make the next `list_pods_on_node` call fail with `error`
    pub fn fail_next_list(&self, error: ClusterError) {
        *self.next_list_error.lock().unwrap() = Some(error);
    }

    /// Make the next `update_node` call fail with `error`
    pub fn fail_next_update(&self, error: ClusterError) {
        *self.next_update_error.lock().unwrap() = Some(error);
    }
}

#[async_trait::async_trait]
impl NodeStore for MockNodeStore {
    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        self.nodes
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(format!("node/{}", name)))
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Arc<Pod>>, ClusterError> {
        *self.list_calls.lock().unwrap() += 1;
        if let Some(error) = self.next_list_error.lock().unwrap().take() {
            return Err(error);
        }

        Ok(self
            .pods
            .lock()
            .unwrap()
            .values()
            .filter(|pod| pod_node_name(pod).iter().any(|n| n == node_name))
            .cloned()
            .map(Arc::new)
            .collect())
    }

    async fn update_node(&self, node: &Node) -> Result<Node, ClusterError> {
        self.updates.lock().unwrap().push(node.clone());
        if let Some(error) = self.next_update_error.lock().unwrap().take() {
            return Err(error);
        }

        let name = node.name_any();
        let mut nodes = self.nodes.lock().unwrap();
        if !nodes.contains_key(&name) {
            return Err(ClusterError::NotFound(format!("node/{}", name)));
        }
        nodes.insert(name, node.clone());
        Ok(node.clone())
    }
}
