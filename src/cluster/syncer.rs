//! Reconciling pod-set controller
//!
//! Keeps the set of targeted pods current and reports it through three
//! streams: "the targeted set changed", "a worker pod changed", and errors.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use regex::Regex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::diff::{diff_pods, PodDiff};
use super::watch::{WatchEventType, WatchStream};
use super::{prefix_regex, ClusterWatch, SELF_RESOURCES_PREFIX, WORKER_POD_PREFIX};

const STREAM_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncerErrorReason {
    PodList,
    PodWatch,
    WorkerUpdate,
}

impl SyncerErrorReason {
    pub fn describe(&self) -> &'static str {
        match self {
            SyncerErrorReason::PodList => "Failed to update currently targeted pods",
            SyncerErrorReason::PodWatch => "Error occurred in pod watch",
            SyncerErrorReason::WorkerUpdate => "Error updating worker",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}: {message}", .reason.describe())]
pub struct SyncerError {
    pub reason: SyncerErrorReason,
    pub message: String,
}

impl SyncerError {
    pub fn new(reason: SyncerErrorReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

/// The three output streams of a pod-set controller
#[derive(Debug)]
pub struct PodSetStreams {
    pub pod_changes: mpsc::Receiver<()>,
    pub worker_status: mpsc::Receiver<Pod>,
    pub errors: mpsc::Receiver<SyncerError>,
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait PodSetController: Send + Sync {
    /// Start reconciling; the streams close once `cancel` fires
    async fn start(&self, cancel: CancellationToken) -> Result<PodSetStreams, SyncerError>;

    /// Current full snapshot of targeted pods
    fn targeted_pods(&self) -> Vec<Pod>;
}

#[derive(Debug, Clone)]
pub struct SyncerConfig {
    pub target_namespaces: Vec<String>,
    pub pod_regex: Regex,
    pub self_namespace: String,
}

// ============================================================================
// SBIO: Pure helpers (no I/O)
// ============================================================================

/// Drop this tool's own pods from a target listing
pub fn exclude_self_pods(pods: Vec<Pod>) -> Vec<Pod> {
    pods.into_iter()
        .filter(|pod| {
            !pod.metadata
                .name
                .as_deref()
                .unwrap_or_default()
                .starts_with(SELF_RESOURCES_PREFIX)
        })
        .collect()
}

fn pod_label(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or_default(),
        pod.metadata.name.as_deref().unwrap_or_default()
    )
}

/// Watches target pods and worker pods through a [`ClusterWatch`]
pub struct PodSetSyncer {
    cluster: Arc<dyn ClusterWatch>,
    config: SyncerConfig,
    targeted: Arc<RwLock<Vec<Pod>>>,
}

impl PodSetSyncer {
    pub fn new(cluster: Arc<dyn ClusterWatch>, config: SyncerConfig) -> Self {
        Self {
            cluster,
            config,
            targeted: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

#[async_trait]
impl PodSetController for PodSetSyncer {
    async fn start(&self, cancel: CancellationToken) -> Result<PodSetStreams, SyncerError> {
        let worker_filter = prefix_regex(WORKER_POD_PREFIX)
            .map_err(|e| SyncerError::new(SyncerErrorReason::PodWatch, e.to_string()))?;

        let (changes_tx, pod_changes) = mpsc::channel(STREAM_BUFFER);
        let (worker_tx, worker_status) = mpsc::channel(STREAM_BUFFER);
        let (errors_tx, errors) = mpsc::channel(STREAM_BUFFER);

        let target_watches: Vec<WatchStream> = self
            .config
            .target_namespaces
            .iter()
            .map(|ns| {
                self.cluster
                    .watch_pods(ns, self.config.pod_regex.clone(), cancel.child_token())
            })
            .collect();

        let targets = TargetLoop {
            cluster: self.cluster.clone(),
            namespaces: self.config.target_namespaces.clone(),
            pod_regex: self.config.pod_regex.clone(),
            targeted: self.targeted.clone(),
            changes: changes_tx,
            errors: errors_tx.clone(),
        };
        tokio::spawn(targets.run(target_watches, cancel.clone()));

        let workers = self
            .cluster
            .watch_pods(&self.config.self_namespace, worker_filter, cancel.child_token());
        tokio::spawn(run_worker_loop(workers, worker_tx, errors_tx, cancel));

        Ok(PodSetStreams {
            pod_changes,
            worker_status,
            errors,
        })
    }

    fn targeted_pods(&self) -> Vec<Pod> {
        self.targeted
            .read()
            .map(|pods| pods.clone())
            .unwrap_or_default()
    }
}

struct TargetLoop {
    cluster: Arc<dyn ClusterWatch>,
    namespaces: Vec<String>,
    pod_regex: Regex,
    targeted: Arc<RwLock<Vec<Pod>>>,
    changes: mpsc::Sender<()>,
    errors: mpsc::Sender<SyncerError>,
}

impl TargetLoop {
    async fn run(self, watches: Vec<WatchStream>, cancel: CancellationToken) {
        // Fan the per-namespace watches into one trigger stream
        let (trigger_tx, mut triggers) = mpsc::channel(STREAM_BUFFER);
        for mut watch in watches {
            let trigger_tx = trigger_tx.clone();
            tokio::spawn(async move {
                while let Some(item) = watch.recv().await {
                    if trigger_tx.send(item).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(trigger_tx);

        self.refresh().await;

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return,
                item = triggers.recv() => item,
            };

            match item {
                Some(Ok(event)) => match event.event_type {
                    WatchEventType::Added | WatchEventType::Modified | WatchEventType::Deleted => {
                        self.refresh().await;
                    }
                    WatchEventType::Bookmark | WatchEventType::Error => {
                        debug!(event_type = ?event.event_type, "Ignoring target watch notification");
                    }
                },
                Some(Err(e)) => {
                    self.report(SyncerError::new(SyncerErrorReason::PodWatch, e.to_string()))
                        .await;
                }
                None => return,
            }
        }
    }

    async fn refresh(&self) {
        let listed = match self
            .cluster
            .list_running_pods(&self.namespaces, &self.pod_regex)
            .await
        {
            Ok(pods) => exclude_self_pods(pods),
            Err(e) => {
                self.report(SyncerError::new(SyncerErrorReason::PodList, e.to_string()))
                    .await;
                return;
            }
        };

        let diff = {
            let current = self.targeted.read().map(|pods| pods.clone()).unwrap_or_default();
            diff_pods(&current, &listed)
        };
        if diff.is_empty() {
            return;
        }

        log_diff(&diff);
        if let Ok(mut targeted) = self.targeted.write() {
            *targeted = listed;
        }
        let _ = self.changes.send(()).await;
    }

    async fn report(&self, error: SyncerError) {
        let _ = self.errors.send(error).await;
    }
}

fn log_diff(diff: &PodDiff) {
    for pod in &diff.added {
        info!(pod = %pod_label(pod), "Added target pod");
    }
    for pod in &diff.removed {
        info!(pod = %pod_label(pod), "Removed target pod");
    }
}

async fn run_worker_loop(
    mut workers: WatchStream,
    status: mpsc::Sender<Pod>,
    errors: mpsc::Sender<SyncerError>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return,
            item = workers.recv() => item,
        };

        match item {
            Some(Ok(event)) => match event.event_type {
                WatchEventType::Added | WatchEventType::Modified => match event.to_pod() {
                    Ok(pod) => {
                        if status.send(pod).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = errors
                            .send(SyncerError::new(SyncerErrorReason::WorkerUpdate, e.to_string()))
                            .await;
                    }
                },
                _ => {}
            },
            Some(Err(e)) => {
                let _ = errors
                    .send(SyncerError::new(SyncerErrorReason::PodWatch, e.to_string()))
                    .await;
                return;
            }
            None => return,
        }
    }
}
