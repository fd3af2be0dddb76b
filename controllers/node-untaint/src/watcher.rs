//! Node watch and reconciliation loop.
//!
//! Nodes are watched through a reflector (so requeued nodes can still be
//! looked up) and only creation events are forwarded to the controller.
//! The controller runs [`reconcile`] per node, serialized per name and
//! bounded in total by the configured concurrency.

use crate::backoff::ErrorBackoffs;
use crate::error::ControllerError;
use crate::filter::CreationFilter;
use crate::metrics::{Metrics, OUTCOME_DONE, OUTCOME_ERROR, OUTCOME_REQUEUE};
use crate::reconciler::{Outcome, Reconciler};
use futures::{Stream, StreamExt, stream};
use k8s_openapi::api::core::v1::Node;
use kube::{Api, ResourceExt};
use kube_runtime::controller::{self, Action};
use kube_runtime::reflector::store::Writer;
use kube_runtime::{Controller, WatchStreamExt, reflector, watcher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Shared state handed to every reconciliation.
pub struct Context {
    reconciler: Reconciler,
    metrics: Metrics,
    backoffs: ErrorBackoffs,
    timeout: Duration,
}

impl Context {
    pub fn new(reconciler: Reconciler, metrics: Metrics, timeout: Duration) -> Self {
        Self {
            reconciler,
            metrics,
            backoffs: ErrorBackoffs::default(),
            timeout,
        }
    }
}

/// Runs one reconciliation under the deadline and maps the outcome to an
/// [`Action`].
pub async fn reconcile(node: Arc<Node>, ctx: Arc<Context>) -> Result<Action, ControllerError> {
    let name = node.name_any();
    let started = Instant::now();

    let result = tokio::time::timeout(ctx.timeout, ctx.reconciler.reconcile_node(&name))
        .await
        .unwrap_or(Err(ControllerError::Timeout(ctx.timeout)));

    let elapsed = started.elapsed();
    match result {
        Ok(Outcome::Done) => {
            ctx.metrics.observe(OUTCOME_DONE, elapsed);
            ctx.backoffs.reset(&name);
            Ok(Action::await_change())
        }
        Ok(Outcome::Requeue(after)) => {
            ctx.metrics.observe(OUTCOME_REQUEUE, elapsed);
            ctx.backoffs.reset(&name);
            Ok(Action::requeue(after))
        }
        Err(e) => {
            ctx.metrics.observe(OUTCOME_ERROR, elapsed);
            Err(e)
        }
    }
}

/// Requeues a failed node with its own Fibonacci backoff.
pub fn error_policy(node: Arc<Node>, error: &ControllerError, ctx: Arc<Context>) -> Action {
    let name = node.name_any();
    let delay = ctx.backoffs.next_delay(&name);
    warn!(node = %name, "Reconciliation failed: {}, retrying in {:?}", error, delay);
    Action::requeue(delay)
}

/// Watches nodes and reconciles each newly seen one until `shutdown` fires.
///
/// In-flight reconciliations finish before this returns.
pub async fn run_node_controller(
    api: Api<Node>,
    ctx: Arc<Context>,
    concurrency: u16,
    shutdown: watch::Receiver<bool>,
) {
    info!("Starting node controller (concurrency {})", concurrency);

    let events = watcher(api, watcher::Config::default()).default_backoff();
    drive_node_controller(events, ctx, concurrency, shutdown).await;

    info!("Node controller stopped");
}

/// Turns node watch events into the controller's trigger stream.
///
/// Every event passes through `writer` before the filter sees it, so an
/// admitted node is already in the store the controller looks it up in.
/// A deleted node also drops its error backoff.
fn created_nodes<S>(
    events: S,
    writer: Writer<Node>,
    ctx: Arc<Context>,
) -> impl Stream<Item = watcher::Result<Node>> + Send + 'static
where
    S: Stream<Item = watcher::Result<watcher::Event<Node>>> + Send + 'static,
{
    let mut filter = CreationFilter::<Node>::new();
    events.reflect(writer).flat_map(move |event| {
        let admitted: Vec<watcher::Result<Node>> = match event {
            Ok(event) => {
                if let watcher::Event::Delete(node) = &event {
                    ctx.backoffs.reset(&node.name_any());
                }
                filter.admit(event).into_iter().map(Ok).collect()
            }
            Err(e) => vec![Err(e)],
        };
        stream::iter(admitted)
    })
}

async fn drive_node_controller<S>(
    events: S,
    ctx: Arc<Context>,
    concurrency: u16,
    mut shutdown: watch::Receiver<bool>,
) where
    S: Stream<Item = watcher::Result<watcher::Event<Node>>> + Send + 'static,
{
    let (reader, writer) = reflector::store();
    let created = created_nodes(events, writer, Arc::clone(&ctx));

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
        let _ = stop_tx.send(());
    });

    Controller::for_stream(created, reader)
        .with_config(controller::Config::default().concurrency(concurrency))
        .graceful_shutdown_on(async move {
            let _ = stop_rx.await;
        })
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((node, action)) => {
                    debug!(node = %node.name, "Reconciled, next action {:?}", action);
                }
                Err(controller::Error::ReconcilerFailed(e, node)) => {
                    debug!(node = %node.name, "Reconciler error reported: {}", e);
                }
                Err(e) => warn!("Node controller error: {}", e),
            }
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UntaintConfig;
    use crate::test_utils::*;
    use cluster_client::{ClusterError, NodeStore};
    use futures::channel::mpsc;
    use k8s_openapi::api::core::v1::Pod;
    use kube_runtime::reflector::ObjectRef;

    type NodeEvent = watcher::Result<watcher::Event<Node>>;

    fn context(reconciler: Reconciler, timeout: Duration) -> Arc<Context> {
        Arc::new(Context::new(reconciler, Metrics::new().unwrap(), timeout))
    }

    #[tokio::test]
    async fn test_done_waits_for_change() {
        let (reconciler, store) = create_test_reconciler(&["cilium"]);
        let node = create_test_node("worker-1", vec![]);
        store.add_node(node.clone());
        let ctx = context(reconciler, Duration::from_secs(5));

        let action = reconcile(Arc::new(node), ctx.clone()).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert!(ctx.metrics.encode().unwrap().contains("outcome=\"done\"} 1"));
    }

    #[tokio::test]
    async fn test_requeue_maps_to_recheck() {
        let (reconciler, store) = create_test_reconciler(&["cilium"]);
        let node = create_test_node("worker-1", vec![taint(TEST_TAINT)]);
        store.add_node(node.clone());
        let ctx = context(reconciler, Duration::from_secs(5));

        let action = reconcile(Arc::new(node), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_error_is_counted_and_backs_off() {
        let (reconciler, store) = create_test_reconciler(&["cilium"]);
        let node = Arc::new(create_test_node("worker-1", vec![taint(TEST_TAINT)]));
        store.add_node((*node).clone());
        store.fail_next_list(ClusterError::CacheNotSynced("pods".to_string()));
        let ctx = context(reconciler, Duration::from_secs(5));

        let err = reconcile(node.clone(), ctx.clone()).await.unwrap_err();
        assert!(ctx.metrics.encode().unwrap().contains("outcome=\"error\"} 1"));

        for expected in [1, 1, 2] {
            assert_eq!(
                error_policy(node.clone(), &err, ctx.clone()),
                Action::requeue(Duration::from_secs(expected))
            );
        }

        // A successful pass resets the sequence
        reconcile(node.clone(), ctx.clone()).await.unwrap();
        assert_eq!(
            error_policy(node, &err, ctx),
            Action::requeue(Duration::from_secs(1))
        );
    }

    struct StalledStore;

    #[async_trait::async_trait]
    impl NodeStore for StalledStore {
        async fn get_node(&self, _name: &str) -> Result<Node, ClusterError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(ClusterError::NotFound("stalled".to_string()))
        }

        async fn list_pods_on_node(&self, _node_name: &str) -> Result<Vec<Arc<Pod>>, ClusterError> {
            Ok(Vec::new())
        }

        async fn update_node(&self, node: &Node) -> Result<Node, ClusterError> {
            Ok(node.clone())
        }
    }

    #[tokio::test]
    async fn test_deadline_cancels_reconciliation() {
        let config = UntaintConfig::new(TEST_TAINT, ["cilium"]).unwrap();
        let reconciler = Reconciler::new(Box::new(StalledStore), config);
        let ctx = context(reconciler, Duration::from_millis(50));

        let err = reconcile(Arc::new(create_test_node("worker-1", vec![])), ctx)
            .await
            .unwrap_err();

        assert!(matches!(err, ControllerError::Timeout(d) if d == Duration::from_millis(50)));
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..250 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_relisted_node_is_stored_before_it_is_admitted() {
        let (reconciler, _store) = create_test_reconciler(&["cilium"]);
        let ctx = context(reconciler, Duration::from_secs(5));
        let (reader, writer) = reflector::store::<Node>();
        let events: Vec<NodeEvent> = vec![
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(create_test_node("worker-a", vec![]))),
            Ok(watcher::Event::InitDone),
            Ok(watcher::Event::Init),
            Ok(watcher::Event::InitApply(create_test_node("worker-a", vec![]))),
            Ok(watcher::Event::InitApply(create_test_node("worker-b", vec![]))),
            Ok(watcher::Event::InitDone),
        ];

        let admitted: Vec<(String, bool)> = created_nodes(stream::iter(events), writer, ctx)
            .map(|node| {
                let node = node.unwrap();
                let stored = reader.get(&ObjectRef::from_obj(&node)).is_some();
                (node.name_any(), stored)
            })
            .collect()
            .await;

        assert_eq!(
            admitted,
            vec![("worker-a".to_string(), true), ("worker-b".to_string(), true)]
        );
    }

    #[tokio::test]
    async fn test_deleted_node_drops_its_backoff() {
        let (reconciler, _store) = create_test_reconciler(&["cilium"]);
        let ctx = context(reconciler, Duration::from_secs(5));
        for _ in 0..3 {
            ctx.backoffs.next_delay("worker-a");
        }
        let (_reader, writer) = reflector::store::<Node>();
        let events: Vec<NodeEvent> = vec![
            Ok(watcher::Event::Apply(create_test_node("worker-a", vec![]))),
            Ok(watcher::Event::Delete(create_test_node("worker-a", vec![]))),
        ];

        let admitted: Vec<_> = created_nodes(stream::iter(events), writer, Arc::clone(&ctx))
            .collect()
            .await;

        assert_eq!(admitted.len(), 1);
        assert_eq!(ctx.backoffs.next_delay("worker-a"), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_node_created_during_relist_is_reconciled() {
        let (reconciler, store) = create_test_reconciler(&["cilium"]);
        let ctx = context(reconciler, Duration::from_secs(5));
        let (events_tx, events_rx) = mpsc::unbounded::<NodeEvent>();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let controller = tokio::spawn(drive_node_controller(
            events_rx,
            Arc::clone(&ctx),
            1,
            shutdown_rx,
        ));
        let send = |event: watcher::Event<Node>| events_tx.unbounded_send(Ok(event)).unwrap();

        let node_a = create_test_node("worker-a", vec![]);
        store.add_node(node_a.clone());
        send(watcher::Event::Init);
        send(watcher::Event::InitApply(node_a.clone()));
        send(watcher::Event::InitDone);
        assert!(
            eventually(|| ctx.metrics.encode().unwrap().contains("outcome=\"done\"} 1")).await,
            "worker-a from the first list was never reconciled"
        );

        // worker-b joins while the watch is relisting
        let node_b = create_test_node("worker-b", vec![taint(TEST_TAINT)]);
        store.add_node(node_b.clone());
        store.add_pod(create_test_pod(
            "kube-system",
            "cilium-b",
            "worker-b",
            Some("cilium"),
            Some(true),
        ));
        send(watcher::Event::Init);
        send(watcher::Event::InitApply(node_a));
        send(watcher::Event::InitApply(node_b));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(store.updates().is_empty());
        send(watcher::Event::InitDone);

        assert!(
            eventually(|| store.updates().len() == 1).await,
            "worker-b was never reconciled"
        );
        assert!(taint_keys(&store.node("worker-b").unwrap()).is_empty());

        shutdown_tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(5), controller)
            .await
            .unwrap()
            .unwrap();
    }
}
