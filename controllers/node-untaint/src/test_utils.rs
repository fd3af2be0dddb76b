//! Test utilities for unit testing the reconciler
//!
//! Builders for nodes, taints and pods, plus a reconciler wired to a
//! [`MockNodeStore`] and an in-process stand-in for the Lease API.

use crate::config::UntaintConfig;
use crate::reconciler::Reconciler;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cluster_client::MockNodeStore;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Node, NodeSpec, Pod, PodCondition, PodSpec, PodStatus, Taint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use std::sync::{Arc, Mutex};

/// Taint key used throughout the tests
pub const TEST_TAINT: &str = "node.example.com/agent-not-ready";

/// Helper to create a taint with the given key
pub fn taint(key: &str) -> Taint {
    Taint {
        key: key.to_string(),
        effect: "NoSchedule".to_string(),
        ..Default::default()
    }
}

/// Helper to create a taint with a value, for telling duplicates apart
pub fn taint_with_value(key: &str, value: &str) -> Taint {
    Taint {
        value: Some(value.to_string()),
        ..taint(key)
    }
}

/// Helper to create a node carrying the given taints
pub fn create_test_node(name: &str, taints: Vec<Taint>) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            taints: if taints.is_empty() { None } else { Some(taints) },
            ..Default::default()
        }),
        status: None,
    }
}

/// Helper to create a pod scheduled on `node`
///
/// `owner` becomes the single owner reference when given. `ready` sets the
/// `Ready` condition; `None` leaves the pod without any conditions.
pub fn create_test_pod(
    namespace: &str,
    name: &str,
    node: &str,
    owner: Option<&str>,
    ready: Option<bool>,
) -> Pod {
    let owner_references = owner.map(|owner| {
        vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "DaemonSet".to_string(),
            name: owner.to_string(),
            uid: format!("uid-{}", owner),
            controller: Some(true),
            ..Default::default()
        }]
    });

    let conditions = ready.map(|ready| {
        vec![PodCondition {
            type_: "Ready".to_string(),
            status: if ready { "True" } else { "False" }.to_string(),
            ..Default::default()
        }]
    });

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references,
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            conditions,
            ..Default::default()
        }),
    }
}

/// Helper to create a reconciler over a fresh mock store
///
/// Returns the store too so tests can seed it and inspect writes.
pub fn create_test_reconciler(owned_by_names: &[&str]) -> (Reconciler, MockNodeStore) {
    let store = MockNodeStore::new();
    let config = UntaintConfig::new(TEST_TAINT, owned_by_names.iter().copied()).unwrap();
    (Reconciler::new(Box::new(store.clone()), config), store)
}

/// Taint keys of the stored node, in order
pub fn taint_keys(node: &Node) -> Vec<String> {
    node.spec
        .as_ref()
        .and_then(|spec| spec.taints.as_ref())
        .map(|taints| taints.iter().map(|t| t.key.clone()).collect())
        .unwrap_or_default()
}

/// The single Lease held by [`spawn_lease_api`]
pub type LeaseSlot = Arc<Mutex<Option<Lease>>>;

fn status(code: StatusCode, reason: &str) -> Response {
    let body = format!(
        r#"{{"kind":"Status","apiVersion":"v1","status":"Failure","reason":"{}","code":{}}}"#,
        reason,
        code.as_u16()
    );
    (code, [(header::CONTENT_TYPE, "application/json")], body).into_response()
}

async fn read_lease(State(slot): State<LeaseSlot>) -> Response {
    match slot.lock().unwrap().clone() {
        Some(lease) => Json(lease).into_response(),
        None => status(StatusCode::NOT_FOUND, "NotFound"),
    }
}

async fn create_lease(State(slot): State<LeaseSlot>, Json(lease): Json<Lease>) -> Response {
    let mut slot = slot.lock().unwrap();
    if slot.is_some() {
        return status(StatusCode::CONFLICT, "AlreadyExists");
    }
    *slot = Some(lease.clone());
    (StatusCode::CREATED, Json(lease)).into_response()
}

async fn replace_lease(State(slot): State<LeaseSlot>, Json(lease): Json<Lease>) -> Json<Lease> {
    *slot.lock().unwrap() = Some(lease.clone());
    Json(lease)
}

/// Serves the coordination Lease endpoints over plain HTTP on a random port
///
/// Returns a client pointed at it and the stored lease for inspection.
pub async fn spawn_lease_api() -> (kube::Client, LeaseSlot) {
    let slot = LeaseSlot::default();
    let router = Router::new()
        .route(
            "/apis/coordination.k8s.io/v1/namespaces/{namespace}/leases",
            post(create_lease),
        )
        .route(
            "/apis/coordination.k8s.io/v1/namespaces/{namespace}/leases/{name}",
            get(read_lease).put(replace_lease),
        )
        .with_state(Arc::clone(&slot));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await });

    let _ = rustls::crypto::ring::default_provider().install_default();
    let config = kube::Config::new(format!("http://{}", addr).parse().unwrap());
    (kube::Client::try_from(config).unwrap(), slot)
}

/// Holder identity of the stored lease
pub fn lease_holder(slot: &LeaseSlot) -> Option<String> {
    slot.lock()
        .unwrap()
        .as_ref()
        .and_then(|lease| lease.spec.as_ref())
        .and_then(|spec| spec.holder_identity.clone())
}
