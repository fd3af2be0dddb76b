//! Reconciliation logic for tainted nodes.
//!
//! For a node carrying the target taint, this module gathers the pods
//! scheduled on it, keeps the ones owned by a configured workload, and removes
//! the taint once every one of them is ready. Until then the node is
//! rechecked on a fixed interval.
//!
//! The decision itself ([`Reconciler::evaluate_pods`],
//! [`Reconciler::carries_target_taint`], [`Reconciler::strip_target_taint`])
//! works on snapshots only; I/O goes through the injected [`NodeStore`].

use crate::config::UntaintConfig;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use cluster_client::NodeStore;
use k8s_openapi::api::core::v1::{Node, Pod, Taint};
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Fixed delay between readiness rechecks of a still-tainted node.
pub const RECHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Result of one reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing further to do for this node
    Done,
    /// Check the node again after the delay
    Requeue(Duration),
}

/// Readiness of the target pods found on a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodGate {
    /// No pod on the node is owned by a configured workload
    NoTargetPods,
    /// At least one target pod is not ready; carries the first one found
    NotReady {
        /// Pod namespace
        namespace: String,
        /// Pod name
        name: String,
    },
    /// Target pods exist and all of them are ready
    AllReady,
}

/// True if the pod reports `Ready=True`. No conditions means not ready.
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

fn node_taints(node: &Node) -> &[Taint] {
    node.spec
        .as_ref()
        .and_then(|spec| spec.taints.as_deref())
        .unwrap_or_default()
}

/// Reconciles tainted nodes.
pub struct Reconciler {
    store: Box<dyn NodeStore>,
    config: UntaintConfig,
    metrics: Option<Metrics>,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(store: Box<dyn NodeStore>, config: UntaintConfig) -> Self {
        Self {
            store,
            config,
            metrics: None,
        }
    }

    /// Counts removed taints in `metrics`.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Reconciles the node with the given name.
    ///
    /// This method:
    /// 1. Re-reads the node (a vanished node is not an error)
    /// 2. Stops if the node does not carry the target taint
    /// 3. Lists the pods scheduled on the node
    /// 4. Removes the taint if target pods exist and all are ready,
    ///    otherwise asks for a recheck in [`RECHECK_INTERVAL`]
    ///
    /// List and update failures are returned to the caller; there is no
    /// retry loop in here.
    pub async fn reconcile_node(&self, name: &str) -> Result<Outcome, ControllerError> {
        let node = match self.store.get_node(name).await {
            Ok(node) => node,
            Err(e) if e.is_not_found() => {
                debug!("Node {} no longer exists, nothing to do", name);
                return Ok(Outcome::Done);
            }
            Err(e) => return Err(e.into()),
        };

        if !self.carries_target_taint(&node) {
            debug!("Node {} does not carry taint {}", name, self.config.target_taint());
            return Ok(Outcome::Done);
        }

        let pods = self.store.list_pods_on_node(name).await?;

        match self.evaluate_pods(&pods) {
            PodGate::AllReady => {
                self.remove_target_taint(node).await?;
                Ok(Outcome::Done)
            }
            PodGate::NotReady { namespace, name: pod_name } => {
                info!(
                    "Pod {}/{} on node {} is not ready, requeueing",
                    namespace, pod_name, name
                );
                Ok(Outcome::Requeue(RECHECK_INTERVAL))
            }
            PodGate::NoTargetPods => {
                info!(
                    "No pods owned by {:?} on node {} yet, requeueing",
                    self.config.owned_by_names(),
                    name
                );
                Ok(Outcome::Requeue(RECHECK_INTERVAL))
            }
        }
    }

    /// True if any taint on the node has the target key.
    pub fn carries_target_taint(&self, node: &Node) -> bool {
        node_taints(node)
            .iter()
            .any(|taint| taint.key == self.config.target_taint())
    }

    /// True if any owner reference of the pod names a configured workload.
    pub fn is_target_pod(&self, pod: &Pod) -> bool {
        pod.owner_references()
            .iter()
            .any(|owner| self.config.is_target_owner(&owner.name))
    }

    /// Decides whether the pods on a node release the taint.
    ///
    /// Stops at the first target pod that is not ready, so which one gets
    /// reported depends on iteration order but the verdict does not.
    pub fn evaluate_pods(&self, pods: &[Arc<Pod>]) -> PodGate {
        let mut has_target_pods = false;

        for pod in pods.iter().filter(|pod| self.is_target_pod(pod)) {
            has_target_pods = true;
            if !is_pod_ready(pod) {
                debug!(
                    "Pod {} phase {:?} conditions {:?}",
                    pod.name_any(),
                    pod.status.as_ref().and_then(|s| s.phase.as_deref()),
                    pod.status.as_ref().and_then(|s| s.conditions.as_ref()),
                );
                return PodGate::NotReady {
                    namespace: pod.namespace().unwrap_or_default(),
                    name: pod.name_any(),
                };
            }
        }

        if has_target_pods {
            PodGate::AllReady
        } else {
            PodGate::NoTargetPods
        }
    }

    /// Every taint except those with the target key, order preserved.
    pub fn strip_target_taint(&self, taints: &[Taint]) -> Vec<Taint> {
        taints
            .iter()
            .filter(|taint| taint.key != self.config.target_taint())
            .cloned()
            .collect()
    }

    async fn remove_target_taint(&self, mut node: Node) -> Result<(), ControllerError> {
        let remaining = self.strip_target_taint(node_taints(&node));
        let removed = node_taints(&node).len() - remaining.len();

        let spec = node.spec.get_or_insert_with(Default::default);
        spec.taints = if remaining.is_empty() { None } else { Some(remaining) };

        self.store.update_node(&node).await?;
        if let Some(metrics) = &self.metrics {
            metrics.taint_removed();
        }

        info!(
            "Removed taint {} from node {} ({} entries)",
            self.config.target_taint(),
            node.name_any(),
            removed
        );
        Ok(())
    }
}
