//! Process configuration.
//!
//! Every setting can be given as a flag or an environment variable; the flag
//! wins when both are present. The two settings that define what the
//! controller does (target taint, workload names) have no defaults and are
//! validated into an immutable [`UntaintConfig`] before anything starts.

use crate::error::ControllerError;
use clap::{Parser, ValueEnum};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

/// Command-line and environment settings.
#[derive(Parser, Debug, Clone)]
#[command(name = "node-untaint-controller")]
#[command(
    version,
    about = "Removes a startup taint from nodes once their node-local workloads are ready"
)]
pub struct Settings {
    /// The taint key to watch for and remove
    #[arg(long, env = "TARGET_TAINT")]
    pub target_taint: Option<String>,

    /// Comma-separated list of workload names to check for readiness
    #[arg(long, env = "OWNED_BY_NAMES")]
    pub owned_by_names: Option<String>,

    /// The address the metrics endpoint binds to ("0" disables it)
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = ":8080")]
    pub metrics_bind_address: String,

    /// The address the health probe endpoint binds to ("0" disables it)
    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS", default_value = ":8081")]
    pub health_probe_bind_address: String,

    /// Enable leader election so only one replica reconciles at a time
    #[arg(long, env = "LEADER_ELECT", default_value_t = false)]
    pub leader_elect: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE", default_value = "")]
    pub leader_election_namespace: String,

    /// Maximum number of nodes reconciled concurrently (0 = unbounded)
    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value_t = 1)]
    pub max_concurrent_reconciles: u16,

    /// Deadline for a single reconciliation, in seconds
    #[arg(long, env = "RECONCILE_TIMEOUT_SECS", default_value_t = 60)]
    pub reconcile_timeout_secs: u64,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Settings {
    /// Validates the target taint and workload names.
    pub fn untaint_config(&self) -> Result<UntaintConfig, ControllerError> {
        let target_taint = self
            .target_taint
            .as_deref()
            .map(str::trim)
            .filter(|taint| !taint.is_empty())
            .ok_or_else(|| {
                ControllerError::InvalidConfig(
                    "target-taint flag or TARGET_TAINT environment variable is required"
                        .to_string(),
                )
            })?;

        let names = parse_name_list(self.owned_by_names.as_deref().unwrap_or_default());
        if names.is_empty() {
            return Err(ControllerError::InvalidConfig(
                "owned-by-names flag or OWNED_BY_NAMES environment variable is required"
                    .to_string(),
            ));
        }

        UntaintConfig::new(target_taint, names)
    }

    /// Metrics listener address, `None` when disabled.
    pub fn metrics_addr(&self) -> Result<Option<SocketAddr>, ControllerError> {
        parse_bind_address(&self.metrics_bind_address)
    }

    /// Health probe listener address, `None` when disabled.
    pub fn health_probe_addr(&self) -> Result<Option<SocketAddr>, ControllerError> {
        parse_bind_address(&self.health_probe_bind_address)
    }

    /// Per-reconciliation deadline.
    pub fn reconcile_timeout(&self) -> Result<Duration, ControllerError> {
        if self.reconcile_timeout_secs == 0 {
            return Err(ControllerError::InvalidConfig(
                "reconcile-timeout-secs must be greater than zero".to_string(),
            ));
        }
        Ok(Duration::from_secs(self.reconcile_timeout_secs))
    }
}

/// What the reconciler acts on. Immutable after startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UntaintConfig {
    target_taint: String,
    owned_by_names: BTreeSet<String>,
}

impl UntaintConfig {
    /// Builds a config, rejecting an empty taint key or an empty name set.
    pub fn new<I, S>(
        target_taint: impl Into<String>,
        owned_by_names: I,
    ) -> Result<Self, ControllerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let target_taint = target_taint.into();
        if target_taint.is_empty() {
            return Err(ControllerError::InvalidConfig(
                "target taint key must not be empty".to_string(),
            ));
        }

        let owned_by_names: BTreeSet<String> = owned_by_names
            .into_iter()
            .map(Into::into)
            .filter(|name: &String| !name.is_empty())
            .collect();
        if owned_by_names.is_empty() {
            return Err(ControllerError::InvalidConfig(
                "at least one workload name is required".to_string(),
            ));
        }

        Ok(Self {
            target_taint,
            owned_by_names,
        })
    }

    /// The taint key removed from nodes.
    pub fn target_taint(&self) -> &str {
        &self.target_taint
    }

    /// Workload names whose pods gate the taint removal.
    pub fn owned_by_names(&self) -> &BTreeSet<String> {
        &self.owned_by_names
    }

    /// True if an owner reference with this name makes a pod a target pod.
    pub fn is_target_owner(&self, owner_name: &str) -> bool {
        self.owned_by_names.contains(owner_name)
    }
}

/// Splits a comma-separated list, trimming entries and dropping blanks.
pub fn parse_name_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses a listener address. `":8080"` binds all interfaces, `"0"` disables.
pub fn parse_bind_address(raw: &str) -> Result<Option<SocketAddr>, ControllerError> {
    let raw = raw.trim();
    if raw == "0" || raw.is_empty() {
        return Ok(None);
    }

    let normalized = if raw.starts_with(':') {
        format!("0.0.0.0{}", raw)
    } else {
        raw.to_string()
    };

    normalized
        .parse::<SocketAddr>()
        .map(Some)
        .map_err(|e| {
            ControllerError::InvalidConfig(format!("invalid bind address {:?}: {}", raw, e))
        })
}
