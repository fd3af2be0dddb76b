//! Lease-based leader election.
//!
//! With `--leader-elect`, only the replica holding the Lease runs the node
//! controller. Others wait in [`LeaderElector::acquire`] until the holder's
//! lease expires or is released.

use crate::error::ControllerError;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::Client;
use kube::api::{Api, PostParams};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const LEASE_NAME: &str = "generic-untaint-operator-leader-election";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);
const SERVICE_ACCOUNT_NAMESPACE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Namespace for the Lease: explicit value, then the service account
/// namespace, then `default`.
pub fn detect_namespace(explicit: &str) -> String {
    if !explicit.trim().is_empty() {
        return explicit.trim().to_string();
    }
    std::fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE)
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| "default".to_string())
}

fn detect_identity() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .ok()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("node-untaint-{}", uuid::Uuid::new_v4()))
}

/// True if the lease was never renewed or its duration has passed at `now`.
pub fn is_expired(spec: Option<&LeaseSpec>, now: DateTime<Utc>) -> bool {
    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec
        .and_then(|s| s.lease_duration_seconds)
        .unwrap_or(LEASE_DURATION_SECS) as i64;

    match renew_time {
        Some(MicroTime(t)) => now.signed_duration_since(*t).num_seconds() > duration_secs,
        None => true,
    }
}

fn holder(lease: &Lease) -> Option<&str> {
    lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref())
}

fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 409)
}

/// Holds or waits for the controller Lease.
pub struct LeaderElector {
    lease_api: Api<Lease>,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str) -> Self {
        let lease_api = Api::<Lease>::namespaced(client, namespace);
        let identity = detect_identity();
        info!(identity = %identity, namespace = %namespace, "Initialized leader elector");
        Self { lease_api, identity }
    }

    /// Blocks until the lease is acquired.
    ///
    /// Returns `Ok(false)` if `shutdown` fired first.
    pub async fn acquire(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool, ControllerError> {
        info!(identity = %self.identity, "Waiting to acquire leader lease {}", LEASE_NAME);
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Acquired leader lease");
                    return Ok(true);
                }
                Ok(false) => {
                    debug!("Lease held by another instance, retrying in {:?}", RETRY_INTERVAL);
                }
                Err(e) => warn!("Lease acquisition error: {}, retrying in {:?}", e, RETRY_INTERVAL),
            }

            tokio::select! {
                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                _ = shutdown.wait_for(|stop| *stop) => return Ok(false),
            }
        }
    }

    /// Renews the lease. `Ok(false)` means leadership was lost.
    pub async fn renew(&self) -> Result<bool, ControllerError> {
        let lease = self.lease_api.get(LEASE_NAME).await?;
        if holder(&lease) != Some(self.identity.as_str()) {
            return Ok(false);
        }

        let mut updated = lease;
        if let Some(spec) = updated.spec.as_mut() {
            spec.renew_time = Some(MicroTime(Utc::now()));
        }

        match self
            .lease_api
            .replace(LEASE_NAME, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => {
                debug!("Renewed leader lease");
                Ok(true)
            }
            Err(e) if is_conflict(&e) => {
                warn!("Lease conflict during renewal, lost leadership");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Renews until leadership is lost or `shutdown` fires.
    ///
    /// Returns an error only when the lease is lost; transient renewal
    /// failures are retried until the lease would have expired.
    pub async fn keep_renewing(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ControllerError> {
        let mut last_renewed = Utc::now();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(RENEW_INTERVAL) => {}
                _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
            }

            match self.renew().await {
                Ok(true) => last_renewed = Utc::now(),
                Ok(false) => {
                    return Err(ControllerError::LeaderElection(format!(
                        "lease {} is held by another instance",
                        LEASE_NAME
                    )));
                }
                Err(e) => {
                    warn!("Failed to renew leader lease: {}", e);
                    let held_for = Utc::now().signed_duration_since(last_renewed).num_seconds();
                    if held_for > LEASE_DURATION_SECS as i64 {
                        return Err(ControllerError::LeaderElection(format!(
                            "lease {} not renewed for {}s",
                            LEASE_NAME, held_for
                        )));
                    }
                }
            }
        }
    }

    /// Clears the holder identity if we still hold the lease.
    pub async fn release(&self) {
        info!(identity = %self.identity, "Releasing leader lease");
        let lease = match self.lease_api.get(LEASE_NAME).await {
            Ok(l) => l,
            Err(e) => {
                warn!("Failed to read lease for release: {}", e);
                return;
            }
        };

        if holder(&lease) != Some(self.identity.as_str()) {
            debug!("Lease not held by us, skipping release");
            return;
        }

        let mut updated = lease;
        if let Some(spec) = updated.spec.as_mut() {
            spec.holder_identity = None;
        }
        match self
            .lease_api
            .replace(LEASE_NAME, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => info!("Released leader lease"),
            Err(e) => warn!("Failed to release leader lease: {}", e),
        }
    }

    async fn try_acquire(&self) -> Result<bool, ControllerError> {
        let now = MicroTime(Utc::now());

        match self.lease_api.get(LEASE_NAME).await {
            Ok(existing) => {
                if holder(&existing) == Some(self.identity.as_str()) {
                    self.update_lease(&existing, &now, false).await
                } else if holder(&existing).is_none() || is_expired(existing.spec.as_ref(), now.0) {
                    self.update_lease(&existing, &now, true).await
                } else {
                    Ok(false)
                }
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => self.create_lease(&now).await,
            Err(e) => Err(e.into()),
        }
    }

    async fn create_lease(&self, now: &MicroTime) -> Result<bool, ControllerError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION_SECS),
                acquire_time: Some(now.clone()),
                renew_time: Some(now.clone()),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };
        match self.lease_api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_lease(
        &self,
        existing: &Lease,
        now: &MicroTime,
        takeover: bool,
    ) -> Result<bool, ControllerError> {
        let prev = existing.spec.as_ref();
        let transitions = prev.and_then(|s| s.lease_transitions).unwrap_or(0);

        let mut updated = existing.clone();
        updated.spec = Some(LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(LEASE_DURATION_SECS),
            acquire_time: if takeover {
                Some(now.clone())
            } else {
                prev.and_then(|s| s.acquire_time.clone())
            },
            renew_time: Some(now.clone()),
            lease_transitions: Some(if takeover { transitions + 1 } else { transitions }),
            ..Default::default()
        });

        match self
            .lease_api
            .replace(LEASE_NAME, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
