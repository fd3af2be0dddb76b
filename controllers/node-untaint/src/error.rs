//! Controller-specific error types.
//!
//! This module defines error types specific to the Node Untaint Controller
//! that are not covered by upstream library errors.

use cluster_client::ClusterError;
use kube::Error as KubeError;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the Node Untaint Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Node or pod access failed
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Kubernetes API error outside the node store (client setup, leases)
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reconciliation exceeded its deadline
    #[error("Reconciliation timed out after {0:?}")]
    Timeout(Duration),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Leader lease could not be held
    #[error("Leader election failed: {0}")]
    LeaderElection(String),

    /// Probe or metrics server failed
    #[error("Server error: {0}")]
    Server(#[from] std::io::Error),

    /// Metrics registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}
