//! Hub control-plane endpoints
//!
//! Every message kind is delivered with its own reliable-delivery loop.
//! A successful worker registration is followed by a storage-limit update.

use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::connector::{Connector, DeliveryOutcome, HttpTransport, ReqwestTransport};

pub const WORKER_POD_ENDPOINT: &str = "/pods/worker";
pub const TARGETED_PODS_ENDPOINT: &str = "/pods/targetted";
pub const STORAGE_LIMIT_ENDPOINT: &str = "/pcaps/set-storage-limit";

/// Body of the storage-limit endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLimitPayload {
    pub limit: i64,
}

/// One unit of state pushed to the Hub
#[derive(Debug, Clone)]
pub enum RelayMessage {
    WorkerPodUpdate(Pod),
    TargetedPodsUpdate(Vec<Pod>),
    StorageLimitUpdate(i64),
}

impl RelayMessage {
    pub fn endpoint(&self) -> &'static str {
        match self {
            RelayMessage::WorkerPodUpdate(_) => WORKER_POD_ENDPOINT,
            RelayMessage::TargetedPodsUpdate(_) => TARGETED_PODS_ENDPOINT,
            RelayMessage::StorageLimitUpdate(_) => STORAGE_LIMIT_ENDPOINT,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RelayMessage::WorkerPodUpdate(_) => "worker-pod",
            RelayMessage::TargetedPodsUpdate(_) => "targeted-pods",
            RelayMessage::StorageLimitUpdate(_) => "storage-limit",
        }
    }
}

/// Reliable-delivery client bound to the Hub's local address
pub struct HubClient<T: HttpTransport = ReqwestTransport> {
    connector: Connector<T>,
    storage_limit: i64,
}

impl<T: HttpTransport> HubClient<T> {
    pub fn new(connector: Connector<T>, storage_limit: i64) -> Self {
        Self {
            connector,
            storage_limit,
        }
    }

    pub fn url(&self) -> &str {
        self.connector.url()
    }

    pub fn connector(&self) -> &Connector<T> {
        &self.connector
    }

    pub fn storage_limit(&self) -> i64 {
        self.storage_limit
    }

    /// Deliver one message; worker updates cascade into a storage-limit update.
    pub async fn deliver(&self, message: &RelayMessage, cancel: &CancellationToken) -> DeliveryOutcome {
        match message {
            RelayMessage::WorkerPodUpdate(pod) => self.post_worker_pod(pod, cancel).await,
            RelayMessage::TargetedPodsUpdate(pods) => self.post_targeted_pods(pods, cancel).await,
            RelayMessage::StorageLimitUpdate(limit) => self.post_storage_limit(*limit, cancel).await,
        }
    }

    pub async fn post_worker_pod(&self, pod: &Pod, cancel: &CancellationToken) -> DeliveryOutcome {
        let outcome = self
            .connector
            .deliver_reliably(WORKER_POD_ENDPOINT, pod, cancel)
            .await;

        if outcome == DeliveryOutcome::Delivered {
            debug!(
                worker_pod = pod.metadata.name.as_deref().unwrap_or_default(),
                "Reported worker pod to Hub"
            );
            self.post_storage_limit(self.storage_limit, cancel).await;
        } else {
            log_undelivered("worker-pod", &outcome);
        }

        outcome
    }

    pub async fn post_targeted_pods(&self, pods: &[Pod], cancel: &CancellationToken) -> DeliveryOutcome {
        let outcome = self
            .connector
            .deliver_reliably(TARGETED_PODS_ENDPOINT, pods, cancel)
            .await;

        if outcome == DeliveryOutcome::Delivered {
            debug!(pod_count = pods.len(), "Reported targeted pods to Hub");
        } else {
            log_undelivered("targeted-pods", &outcome);
        }

        outcome
    }

    pub async fn post_storage_limit(&self, limit: i64, cancel: &CancellationToken) -> DeliveryOutcome {
        let outcome = self
            .connector
            .deliver_reliably(STORAGE_LIMIT_ENDPOINT, &StorageLimitPayload { limit }, cancel)
            .await;

        if outcome == DeliveryOutcome::Delivered {
            debug!(limit, "Reported storage limit to Hub");
        } else {
            log_undelivered("storage-limit", &outcome);
        }

        outcome
    }
}

fn log_undelivered(kind: &str, outcome: &DeliveryOutcome) {
    match outcome {
        DeliveryOutcome::Abandoned(reason) => {
            warn!(kind, reason = %reason, "Gave up reporting to Hub")
        }
        DeliveryOutcome::Cancelled => debug!(kind, "Report to Hub cancelled"),
        DeliveryOutcome::Delivered => {}
    }
}
