//! Tap session runner
//!
//! Order of a session: namespace checks, targeted-pod preview, provisioning,
//! then the watchers and the coordinator until interrupt or failure, then
//! cleanup bounded by [`CLEANUP_TIMEOUT`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::resources::log_dump_path;
use crate::cluster::{
    ClusterWatch, PodSetController, ProvisionError, ResourceProvisioner, TunnelProvider,
    ALL_NAMESPACES, SERVICE_ACCOUNT_NAME,
};
use crate::config::{dot_folder_path, Config, TapConfig};

use super::coordinator::Coordinator;
use super::events::watch_hub_events;
use super::reachability::ProbeSettings;
use super::readiness::watch_pod_readiness;
use super::stages::{StageSettings, TapStages};
use super::{PodRole, Session, TapError};

pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Bound on closing tunnels and joining the relay before cleanup starts
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

/// Collaborators of a tap session
#[derive(Clone)]
pub struct TapDeps {
    pub cluster: Arc<dyn ClusterWatch>,
    pub tunnels: Arc<dyn TunnelProvider>,
    pub provisioner: Arc<dyn ResourceProvisioner>,
    pub controller: Arc<dyn PodSetController>,
}

// ============================================================================
// SBIO: Pure helpers (no I/O)
// ============================================================================

/// All namespaces, the configured ones (deduplicated), or the current one
pub fn resolve_target_namespaces(tap: &TapConfig, current_namespace: &str) -> Vec<String> {
    if tap.all_namespaces {
        return vec![ALL_NAMESPACES.to_string()];
    }
    if tap.namespaces.is_empty() {
        return vec![current_namespace.to_string()];
    }

    let mut unique: Vec<String> = Vec::new();
    for namespace in &tap.namespaces {
        if !unique.contains(namespace) {
            unique.push(namespace.clone());
        }
    }
    unique
}

/// In namespace-restricted mode only the self namespace may be targeted
pub fn check_ns_restricted(config: &Config, target_namespaces: &[String]) -> Result<(), TapError> {
    if !config.is_ns_restricted_mode() {
        return Ok(());
    }
    if target_namespaces.len() == 1 && target_namespaces[0] == config.self_namespace {
        return Ok(());
    }
    Err(TapError::NsRestricted {
        self_namespace: config.self_namespace.clone(),
        requested: target_namespaces.to_vec(),
    })
}

fn stage_settings(config: &Config) -> Result<StageSettings, TapError> {
    Ok(StageSettings {
        namespace: config.self_namespace.clone(),
        host: config.tap.proxy.host.clone(),
        hub: config.tap.proxy.hub,
        front: config.tap.proxy.front,
        storage_limit: config.tap.storage_limit_bytes()?,
        headless: config.headless,
        probe: ProbeSettings::default(),
    })
}

// ============================================================================
// Session
// ============================================================================

/// Run one tap session until `shutdown` resolves or a component fails.
pub async fn run_tap<S>(config: &Config, mut session: Session, deps: TapDeps, shutdown: S) -> Result<(), TapError>
where
    S: Future<Output = ()> + Send,
{
    check_ns_restricted(config, &session.target_namespaces)?;
    let pod_regex = config.tap.pod_regex()?;
    let settings = stage_settings(config)?;

    info!(namespaces = ?session.target_namespaces, "Targeting pods in");
    preview_targeted_pods(deps.cluster.as_ref(), &session.target_namespaces, &pod_regex, config).await;

    if config.tap.dry_run {
        return Ok(());
    }

    info!(
        limit = %config.tap.storage_limit,
        "Traffic is stored up to this limit per node; the oldest streams are removed once it is reached"
    );
    info!("Waiting for the creation of the Hub and Front resources");

    match deps.provisioner.create_hub_resources().await {
        Ok(outcome) => session.self_service_account_exists = outcome.service_account_exists,
        Err(ProvisionError::AlreadyExists(what)) => {
            warn!(
                resource = %what,
                namespace = %config.self_namespace,
                "Tapline is already running in this namespace; change `selfnamespace` or clean up the running instance"
            );
            return Ok(());
        }
        Err(e) => {
            error!(error = %e, "Error creating resources");
            if let Err(cleanup) = deps.provisioner.clean_up().await {
                warn!(error = %cleanup, "Cleanup after failed provisioning was incomplete");
            }
            return Err(e.into());
        }
    }
    if !session.resolves_target_names() {
        warn!(
            service_account = SERVICE_ACCOUNT_NAME,
            "Service account is missing; Tapline will not resolve target IPs to names"
        );
    }
    debug!("Resources created");

    let cancel = CancellationToken::new();
    let stages = Arc::new(TapStages::new(
        deps.tunnels.clone(),
        deps.controller.clone(),
        settings,
    ));
    let timeout = Duration::from_secs(config.tap.ready_timeout_secs);
    let (ready_tx, ready_rx) = mpsc::channel(4);

    let tasks = vec![
        tokio::spawn(watch_hub_events(
            deps.cluster.clone(),
            config.self_namespace.clone(),
            session.start_time,
            cancel.clone(),
        )),
        tokio::spawn({
            let (cluster, namespace, ready_tx, cancel) =
                (deps.cluster.clone(), config.self_namespace.clone(), ready_tx.clone(), cancel.clone());
            async move {
                watch_pod_readiness(cluster, PodRole::Hub, namespace, timeout, ready_tx, cancel).await;
            }
        }),
        tokio::spawn({
            let (cluster, namespace, cancel) =
                (deps.cluster.clone(), config.self_namespace.clone(), cancel.clone());
            async move {
                watch_pod_readiness(cluster, PodRole::Front, namespace, timeout, ready_tx, cancel).await;
            }
        }),
        tokio::spawn({
            let (stages, cancel) = (stages.clone(), cancel.clone());
            async move {
                Coordinator::new(stages).run(ready_rx, cancel).await;
            }
        }),
    ];

    wait_for_termination(shutdown, &cancel).await;

    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Session task ended abnormally");
        }
    }
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, stages.shutdown()).await.is_err() {
        warn!(timeout_secs = SHUTDOWN_TIMEOUT.as_secs(), "Tunnels and relay did not stop in time");
    }
    finish(deps.provisioner.as_ref(), config.dump_logs).await;
    Ok(())
}

async fn preview_targeted_pods(cluster: &dyn ClusterWatch, namespaces: &[String], pod_regex: &Regex, config: &Config) {
    let pods = match cluster.list_running_pods(namespaces, pod_regex).await {
        Ok(pods) => pods,
        Err(e) => {
            error!(error = %e, "Error listing pods");
            return;
        }
    };

    if pods.is_empty() {
        if config.tap.all_namespaces {
            warn!(regex = %pod_regex, "Did not find any currently running pods that match the regex argument");
        } else {
            warn!(
                regex = %pod_regex,
                namespaces = ?namespaces,
                "Did not find any currently running pods that match the regex argument; use -n <namespace> or -A to look elsewhere"
            );
        }
    }

    for pod in &pods {
        info!(
            pod = pod.metadata.name.as_deref().unwrap_or_default(),
            namespace = pod.metadata.namespace.as_deref().unwrap_or_default(),
            "Targeting pod"
        );
    }
}

/// Block until `shutdown` resolves or the session is cancelled
async fn wait_for_termination<S: Future<Output = ()>>(shutdown: S, cancel: &CancellationToken) {
    tokio::select! {
        _ = shutdown => {
            info!("Received interrupt, shutting down");
            cancel.cancel();
        }
        _ = cancel.cancelled() => {
            debug!("Session cancelled");
        }
    }
}

/// Best-effort log dump and teardown; failures are only logged
async fn finish(provisioner: &dyn ResourceProvisioner, dump_logs: bool) {
    let cleanup = async {
        if dump_logs {
            let path = log_dump_path(&dot_folder_path(), Utc::now());
            if let Err(e) = provisioner.dump_logs(&path).await {
                error!(error = %e, "Failed to dump logs");
            }
        }
        if let Err(e) = provisioner.clean_up().await {
            error!(error = %e, "Failed to remove resources");
        }
    };

    if tokio::time::timeout(CLEANUP_TIMEOUT, cleanup).await.is_err() {
        error!(timeout_secs = CLEANUP_TIMEOUT.as_secs(), "Cleanup timed out");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tap(namespaces: &[&str], all: bool) -> TapConfig {
        TapConfig {
            namespaces: namespaces.iter().map(|ns| ns.to_string()).collect(),
            all_namespaces: all,
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_target_namespaces() {
        assert_eq!(resolve_target_namespaces(&tap(&[], false), "dev"), vec!["dev"]);
        assert_eq!(resolve_target_namespaces(&tap(&["a", "b"], true), "dev"), vec![""]);
        assert_eq!(
            resolve_target_namespaces(&tap(&["a", "b", "a"], false), "dev"),
            vec!["a", "b"]
        );
    }

    #[test]
    fn test_ns_restricted_mode() {
        let open = Config::default();
        assert!(check_ns_restricted(&open, &["a".into(), "b".into()]).is_ok());

        let restricted = Config {
            self_namespace: "team".into(),
            ..Default::default()
        };
        assert!(check_ns_restricted(&restricted, &["team".into()]).is_ok());
        assert!(matches!(
            check_ns_restricted(&restricted, &["team".into(), "other".into()]),
            Err(TapError::NsRestricted { .. })
        ));
        assert!(check_ns_restricted(&restricted, &["".into()]).is_err());
    }
}
