//! Bring-up and supervision of a tap session
//!
//! The watchers, the coordinator and the relay run as independent tasks that
//! share one `CancellationToken`; the first failure cancels everything and
//! the runner then cleans up.

pub mod coordinator;
pub mod events;
pub mod reachability;
pub mod readiness;
pub mod relay;
pub mod runner;
pub mod stages;

pub use coordinator::{Coordinator, ReadinessBook, Stage, StageError, StageHooks};
pub use events::{assess_event, watch_hub_events, EventReason, EventVerdict};
pub use reachability::{establish, ProbeSettings, ReachabilityError, ReachabilityTarget};
pub use readiness::{watch_pod_readiness, FailureReason, PodReadiness, ReadinessState, Transition};
pub use relay::run_relay;
pub use runner::{
    check_ns_restricted, resolve_target_namespaces, run_tap, TapDeps, CLEANUP_TIMEOUT, SHUTDOWN_TIMEOUT,
};
pub use stages::{open_browser, StageSettings, TapStages};

use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::client::ConnectorError;
use crate::cluster::{ClusterError, ProvisionError, SyncerError, FRONT_POD_NAME, HUB_POD_NAME};
use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum TapError {
    #[error("Namespace-restricted mode only allows targeting namespace {self_namespace}, got {requested:?}")]
    NsRestricted {
        self_namespace: String,
        requested: Vec<String>,
    },

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Provisioning error: {0}")]
    Provision(#[from] ProvisionError),

    #[error("Hub client error: {0}")]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Syncer(#[from] SyncerError),
}

/// State of one bring-up attempt
#[derive(Debug, Clone)]
pub struct Session {
    pub start_time: DateTime<Utc>,
    pub target_namespaces: Vec<String>,
    pub self_service_account_exists: bool,
}

impl Session {
    pub fn start(target_namespaces: Vec<String>) -> Self {
        Self {
            start_time: Utc::now(),
            target_namespaces,
            self_service_account_exists: false,
        }
    }

    /// Workers can resolve target IPs to names only with the tool's
    /// service account in place
    pub fn resolves_target_names(&self) -> bool {
        self.self_service_account_exists
    }
}

/// The two supervised pods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PodRole {
    Hub,
    Front,
}

impl PodRole {
    pub fn pod_name(&self) -> &'static str {
        match self {
            PodRole::Hub => HUB_POD_NAME,
            PodRole::Front => FRONT_POD_NAME,
        }
    }
}

impl fmt::Display for PodRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.pod_name())
    }
}
