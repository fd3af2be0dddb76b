//! Main controller implementation.
//!
//! This module contains the `Controller` struct that wires the probe and
//! metrics servers, leader election, the pod index and the node controller
//! together, and drives the process until shutdown.

use crate::config::{Settings, UntaintConfig};
use crate::error::ControllerError;
use crate::http::{self, ReadyFlag};
use crate::leader_election::{LeaderElector, detect_namespace};
use crate::metrics::Metrics;
use crate::reconciler::Reconciler;
use crate::watcher::{Context, run_node_controller};
use cluster_client::{FieldIndexer, KubeNodeStore, register_pod_node_index, run_informer};
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::{Api, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How long the pod index may take to complete its first list.
const CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(120);

/// Main controller for node untainting.
pub struct Controller {
    client: Client,
    config: UntaintConfig,
    metrics: Metrics,
    pods: FieldIndexer<Pod>,
    ready: ReadyFlag,
    elector: Option<Arc<LeaderElector>>,
    concurrency: u16,
    reconcile_timeout: Duration,
    servers: Vec<JoinHandle<Result<(), ControllerError>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Controller {
    /// Creates a new controller instance.
    ///
    /// Everything that can fail at startup happens here: client creation,
    /// index registration and binding the server ports.
    pub async fn new(settings: &Settings, config: UntaintConfig) -> Result<Self, ControllerError> {
        info!("Initializing Node Untaint Controller");

        let reconcile_timeout = settings.reconcile_timeout()?;
        let metrics_addr = settings.metrics_addr()?;
        let health_addr = settings.health_probe_addr()?;

        let client = Client::try_default().await?;

        let pods = FieldIndexer::<Pod>::new();
        register_pod_node_index(&pods)?;

        let metrics = Metrics::new()?;
        let ready = ReadyFlag::default();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut servers = Vec::new();
        if let Some(addr) = health_addr {
            let listener = http::bind(addr, "Health probes").await?;
            servers.push(tokio::spawn(http::serve(
                listener,
                http::health_router(ready.clone()),
                shutdown_rx.clone(),
            )));
        } else {
            info!("Health probe server disabled");
        }
        if let Some(addr) = metrics_addr {
            let listener = http::bind(addr, "Metrics").await?;
            servers.push(tokio::spawn(http::serve(
                listener,
                http::metrics_router(metrics.clone()),
                shutdown_rx.clone(),
            )));
        } else {
            info!("Metrics server disabled");
        }

        let elector = settings.leader_elect.then(|| {
            let namespace = detect_namespace(&settings.leader_election_namespace);
            Arc::new(LeaderElector::new(client.clone(), &namespace))
        });

        let signal_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            signal_tx.send_replace(true);
        });

        Ok(Self {
            client,
            config,
            metrics,
            pods,
            ready,
            elector,
            concurrency: settings.max_concurrent_reconciles,
            reconcile_timeout,
            servers,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Runs the controller until shutdown.
    pub async fn run(self) -> Result<(), ControllerError> {
        let Controller {
            client,
            config,
            metrics,
            pods,
            ready,
            elector,
            concurrency,
            reconcile_timeout,
            servers,
            shutdown_tx,
            mut shutdown_rx,
        } = self;

        if let Some(elector) = &elector {
            if !elector.acquire(&mut shutdown_rx).await? {
                info!("Shutdown before leadership was acquired");
                join_servers(servers).await;
                return Ok(());
            }
        }
        let mut renewal = elector.clone().map(|elector| {
            let rx = shutdown_rx.clone();
            tokio::spawn(async move { elector.keep_renewing(rx).await })
        });

        let mut informer = tokio::spawn(run_informer(
            Api::<Pod>::all(client.clone()),
            pods.clone(),
        ));

        match sync_pod_index(&pods, CACHE_SYNC_TIMEOUT, &mut shutdown_rx).await {
            Ok(true) => info!("Pod index synced with {} pods", pods.len()),
            synced => {
                informer.abort();
                abandon_startup(elector.as_deref(), &shutdown_tx, servers).await;
                return synced.map(|_| ());
            }
        }

        let store = KubeNodeStore::new(client.clone(), pods);
        let reconciler = Reconciler::new(Box::new(store), config).with_metrics(metrics.clone());
        let ctx = Arc::new(Context::new(reconciler, metrics, reconcile_timeout));
        let mut node_controller = tokio::spawn(run_node_controller(
            Api::<Node>::all(client),
            ctx,
            concurrency,
            shutdown_rx.clone(),
        ));

        ready.set_ready();
        info!("Node Untaint Controller running");

        let result = tokio::select! {
            _ = shutdown_rx.wait_for(|stop| *stop) => Ok(()),
            result = &mut node_controller => Err(ControllerError::Watch(match result {
                Ok(()) => "node controller exited unexpectedly".to_string(),
                Err(e) => format!("node controller panicked: {}", e),
            })),
            result = &mut informer => Err(ControllerError::Watch(match result {
                Ok(()) => "pod informer exited unexpectedly".to_string(),
                Err(e) => format!("pod informer panicked: {}", e),
            })),
            result = wait_renewal(&mut renewal) => result,
        };

        ready.set_not_ready();
        shutdown_tx.send_replace(true);

        if !node_controller.is_finished() {
            info!("Waiting for in-flight reconciliations to finish");
            if let Err(e) = node_controller.await {
                warn!("Node controller task failed during shutdown: {}", e);
            }
        }
        informer.abort();

        // A lost lease belongs to someone else by now
        if result.is_ok() {
            release(elector.as_deref()).await;
        }
        join_servers(servers).await;

        if let Err(e) = &result {
            error!("Node Untaint Controller stopped: {}", e);
        } else {
            info!("Node Untaint Controller stopped");
        }
        result
    }
}

async fn wait_renewal(
    renewal: &mut Option<JoinHandle<Result<(), ControllerError>>>,
) -> Result<(), ControllerError> {
    match renewal {
        Some(handle) => match handle.await {
            // Renewal only returns cleanly on shutdown
            Ok(Ok(())) => std::future::pending().await,
            Ok(Err(e)) => Err(e),
            Err(e) => Err(ControllerError::LeaderElection(format!(
                "lease renewal task panicked: {}",
                e
            ))),
        },
        None => std::future::pending().await,
    }
}

/// Waits for the pod index to finish its first list.
///
/// `Ok(false)` means shutdown came first.
async fn sync_pod_index(
    pods: &FieldIndexer<Pod>,
    limit: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<bool, ControllerError> {
    info!("Waiting for pod index to sync");
    tokio::select! {
        synced = tokio::time::timeout(limit, pods.wait_until_synced()) => match synced {
            Ok(()) => Ok(true),
            Err(_) => Err(ControllerError::Watch(format!(
                "pod index did not sync within {:?}",
                limit
            ))),
        },
        _ = shutdown.wait_for(|stop| *stop) => Ok(false),
    }
}

/// Unwinds a startup that never reached the node controller.
async fn abandon_startup(
    elector: Option<&LeaderElector>,
    shutdown_tx: &watch::Sender<bool>,
    servers: Vec<JoinHandle<Result<(), ControllerError>>>,
) {
    shutdown_tx.send_replace(true);
    release(elector).await;
    join_servers(servers).await;
}

async fn release(elector: Option<&LeaderElector>) {
    if let Some(elector) = elector {
        elector.release().await;
    }
}

async fn join_servers(servers: Vec<JoinHandle<Result<(), ControllerError>>>) {
    for server in servers {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Server stopped with error: {}", e),
            Err(e) => warn!("Server task failed: {}", e),
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
