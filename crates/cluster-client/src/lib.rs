//! Cluster Client
//!
//! Node and pod access for the node-untaint controller.
//!
//! The controller never talks to `kube::Api` directly. It goes through the
//! [`NodeStore`] trait so the reconciliation logic can run against an
//! in-memory store in unit tests.
//!
//! # Example
//!
//! ```no_run
//! use cluster_client::{FieldIndexer, KubeNodeStore, NodeStore, register_pod_node_index};
//! use k8s_openapi::api::core::v1::Pod;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//!
//! // Register the node-name index before anything is fed into it
//! let pods: FieldIndexer<Pod> = FieldIndexer::new();
//! register_pod_node_index(&pods)?;
//!
//! let store = KubeNodeStore::new(client, pods);
//! let on_node = store.list_pods_on_node("worker-1").await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Field index**: secondary indices over a watched collection, fed by
//!   `kube_runtime::watcher` events
//! - **Node store**: fresh node reads, whole-object node writes, pod lookups
//!   by scheduled node
//! - **Mock store** (`test-util`): in-memory nodes and pods with failure
//!   injection and update recording

pub mod client;
pub mod error;
pub mod index;
#[path = "trait.rs"]
pub mod store_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::KubeNodeStore;
pub use error::ClusterError;
pub use index::{
    FieldIndexer, POD_NODE_NAME_FIELD, pod_node_name, register_pod_node_index, run_informer,
};
pub use store_trait::NodeStore;
#[cfg(feature = "test-util")]
pub use mock::MockNodeStore;
