//! Event relay from the pod-set controller to the Hub
//!
//! Each message kind has one delivery worker, so deliveries of one kind keep
//! their emission order while different kinds proceed independently. The
//! relay loop never waits on a delivery: targeted-pod changes collapse into
//! one pending notification, and worker updates keep only the latest status
//! per pod.

use std::sync::{Arc, Mutex};

use k8s_openapi::api::core::v1::Pod;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::client::{HttpTransport, HubClient, RelayMessage};
use crate::cluster::{PodSetController, PodSetStreams};

// ============================================================================
// SBIO: Pure state (no I/O)
// ============================================================================

/// Worker pods waiting for delivery, latest status per pod name
#[derive(Debug, Default)]
struct PendingWorkers {
    pods: Vec<Pod>,
}

impl PendingWorkers {
    fn push(&mut self, pod: Pod) {
        match self
            .pods
            .iter_mut()
            .find(|queued| queued.metadata.name == pod.metadata.name)
        {
            Some(queued) => *queued = pod,
            None => self.pods.push(pod),
        }
    }

    fn take(&mut self) -> Vec<Pod> {
        std::mem::take(&mut self.pods)
    }
}

// ============================================================================
// Delivery workers
// ============================================================================

/// Wait for the next wake-up; `false` once the relay is gone or cancelled
async fn woken(signal: &mut watch::Receiver<()>, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        changed = signal.changed() => changed.is_ok(),
    }
}

fn spawn_targeted_worker<T: HttpTransport + 'static>(
    hub: Arc<HubClient<T>>,
    controller: Arc<dyn PodSetController>,
    mut signal: watch::Receiver<()>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while woken(&mut signal, &cancel).await {
            let snapshot = controller.targeted_pods();
            debug!(pod_count = snapshot.len(), "Delivering targeted pods");
            hub.deliver(&RelayMessage::TargetedPodsUpdate(snapshot), &cancel)
                .await;
        }
        debug!(kind = "targeted-pods", "Delivery worker stopped");
    })
}

fn spawn_worker_status_worker<T: HttpTransport + 'static>(
    hub: Arc<HubClient<T>>,
    pending: Arc<Mutex<PendingWorkers>>,
    mut signal: watch::Receiver<()>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while woken(&mut signal, &cancel).await {
            let batch = match pending.lock() {
                Ok(mut pending) => pending.take(),
                Err(_) => break,
            };
            for pod in batch {
                if cancel.is_cancelled() {
                    break;
                }
                hub.deliver(&RelayMessage::WorkerPodUpdate(pod), &cancel).await;
            }
        }
        debug!(kind = "worker-pod", "Delivery worker stopped");
    })
}

/// Forward the controller's streams to the Hub until cancellation or until
/// all three streams have closed. An error item cancels the session.
pub async fn run_relay<T: HttpTransport + 'static>(
    hub: Arc<HubClient<T>>,
    controller: Arc<dyn PodSetController>,
    streams: PodSetStreams,
    cancel: CancellationToken,
) {
    let PodSetStreams {
        mut pod_changes,
        mut worker_status,
        mut errors,
    } = streams;

    let (targeted_signal, targeted_rx) = watch::channel(());
    let targeted_worker = spawn_targeted_worker(hub.clone(), controller, targeted_rx, cancel.clone());

    let pending_workers = Arc::new(Mutex::new(PendingWorkers::default()));
    let (workers_signal, workers_rx) = watch::channel(());
    let worker_worker = spawn_worker_status_worker(hub, pending_workers.clone(), workers_rx, cancel.clone());

    let mut changes_open = true;
    let mut workers_open = true;
    let mut errors_open = true;

    while changes_open || workers_open || errors_open {
        tokio::select! {
            _ = cancel.cancelled() => break,

            change = pod_changes.recv(), if changes_open => match change {
                Some(()) => {
                    debug!("Targeted pods changed");
                    targeted_signal.send_replace(());
                }
                None => changes_open = false,
            },

            status = worker_status.recv(), if workers_open => match status {
                Some(pod) => {
                    if let Ok(mut pending) = pending_workers.lock() {
                        pending.push(pod);
                    }
                    workers_signal.send_replace(());
                }
                None => workers_open = false,
            },

            failure = errors.recv(), if errors_open => match failure {
                Some(failure) => {
                    error!(
                        reason = failure.reason.describe(),
                        error = %failure.message,
                        "Pod set controller failed"
                    );
                    cancel.cancel();
                    break;
                }
                None => errors_open = false,
            },
        }
    }

    drop(targeted_signal);
    drop(workers_signal);
    let _ = targeted_worker.await;
    let _ = worker_worker.await;
    debug!("Relay stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::connector::mock::ScriptedTransport;
    use crate::client::{ConnectionTarget, Connector, TransportError};
    use crate::cluster::mock::pod;
    use crate::cluster::{SyncerError, SyncerErrorReason};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct StaticController(Vec<Pod>);

    #[async_trait]
    impl PodSetController for StaticController {
        async fn start(&self, _cancel: CancellationToken) -> Result<PodSetStreams, SyncerError> {
            unreachable!("streams are built by the test")
        }

        fn targeted_pods(&self) -> Vec<Pod> {
            self.0.clone()
        }
    }

    struct Feeds {
        changes: mpsc::Sender<()>,
        workers: mpsc::Sender<Pod>,
        errors: mpsc::Sender<SyncerError>,
    }

    fn streams() -> (Feeds, PodSetStreams) {
        let (changes, pod_changes) = mpsc::channel(8);
        let (workers, worker_status) = mpsc::channel(8);
        let (errors, errors_rx) = mpsc::channel(8);
        (
            Feeds {
                changes,
                workers,
                errors,
            },
            PodSetStreams {
                pod_changes,
                worker_status,
                errors: errors_rx,
            },
        )
    }

    fn hub() -> Arc<HubClient<ScriptedTransport>> {
        hub_with(ScriptedTransport::new(vec![]))
    }

    fn hub_with(transport: ScriptedTransport) -> Arc<HubClient<ScriptedTransport>> {
        let connector = Connector::with_transport(ConnectionTarget::new("http://hub.test"), transport)
        .with_retry_delay(Duration::from_millis(1));
        Arc::new(HubClient::new(connector, 1000))
    }

    fn urls(hub: &HubClient<ScriptedTransport>) -> Vec<String> {
        hub.connector().transport().calls().into_iter().map(|(url, _)| url).collect()
    }

    #[tokio::test]
    async fn test_relays_until_all_streams_close() {
        let hub = hub();
        let controller = Arc::new(StaticController(vec![pod("nginx", "1", "Running")]));
        let (feeds, streams) = streams();
        let cancel = CancellationToken::new();

        feeds.changes.send(()).await.unwrap();
        feeds.workers.send(pod("tapline-worker-a", "2", "Running")).await.unwrap();
        drop(feeds);

        run_relay(hub.clone(), controller, streams, cancel.clone()).await;

        let mut calls = urls(&hub);
        calls.sort();
        assert_eq!(
            calls,
            vec![
                "http://hub.test/pcaps/set-storage-limit",
                "http://hub.test/pods/targetted",
                "http://hub.test/pods/worker",
            ]
        );
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_closed_stream_does_not_stop_others() {
        let hub = hub();
        let controller = Arc::new(StaticController(vec![]));
        let (feeds, streams) = streams();
        let cancel = CancellationToken::new();
        drop(feeds.changes);
        drop(feeds.errors);

        let relay = tokio::spawn(run_relay(hub.clone(), controller, streams, cancel.clone()));
        feeds.workers.send(pod("tapline-worker-a", "2", "Running")).await.unwrap();
        drop(feeds.workers);
        relay.await.unwrap();

        assert_eq!(urls(&hub)[0], "http://hub.test/pods/worker");
    }

    #[tokio::test]
    async fn test_error_cancels() {
        let hub = hub();
        let controller = Arc::new(StaticController(vec![]));
        let (feeds, streams) = streams();
        let cancel = CancellationToken::new();

        feeds
            .errors
            .send(SyncerError::new(SyncerErrorReason::PodList, "forbidden"))
            .await
            .unwrap();

        tokio::time::timeout(
            Duration::from_secs(2),
            run_relay(hub.clone(), controller, streams, cancel.clone()),
        )
        .await
        .unwrap();

        assert!(cancel.is_cancelled());
        assert!(urls(&hub).is_empty());
        drop(feeds);
    }

    #[tokio::test]
    async fn test_cancel_stops_relay_with_open_streams() {
        let (_feeds, streams) = streams();
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(
            Duration::from_secs(2),
            run_relay(hub(), Arc::new(StaticController(vec![])), streams, cancel),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_error_cancels_while_hub_unreachable() {
        let hub = hub_with(ScriptedTransport::always(TransportError::Transient(
            "connection refused".into(),
        )));
        let controller = Arc::new(StaticController(vec![pod("nginx", "1", "Running")]));
        let (changes, pod_changes) = mpsc::channel(128);
        let (_workers, worker_status) = mpsc::channel(8);
        let (errors, errors_rx) = mpsc::channel(8);
        let streams = PodSetStreams {
            pod_changes,
            worker_status,
            errors: errors_rx,
        };
        let cancel = CancellationToken::new();

        let relay = tokio::spawn(run_relay(hub.clone(), controller, streams, cancel.clone()));
        for _ in 0..60 {
            changes.send(()).await.unwrap();
        }
        errors
            .send(SyncerError::new(SyncerErrorReason::PodList, "forbidden"))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), relay)
            .await
            .expect("relay should stop after the error")
            .unwrap();
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_pending_workers_keep_latest_status() {
        let mut pending = PendingWorkers::default();
        pending.push(pod("tapline-worker-a", "1", "Pending"));
        pending.push(pod("tapline-worker-b", "2", "Running"));
        pending.push(pod("tapline-worker-a", "1", "Running"));

        let pods = pending.take();
        let summary: Vec<(String, String)> = pods
            .iter()
            .map(|pod| {
                (
                    pod.metadata.name.clone().unwrap_or_default(),
                    pod.status
                        .as_ref()
                        .and_then(|status| status.phase.clone())
                        .unwrap_or_default(),
                )
            })
            .collect();
        assert_eq!(
            summary,
            vec![
                ("tapline-worker-a".to_string(), "Running".to_string()),
                ("tapline-worker-b".to_string(), "Running".to_string()),
            ]
        );
        assert!(pending.take().is_empty());
    }
}
