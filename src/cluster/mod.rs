//! # Cluster access
//!
//! Everything this crate needs from the orchestrator sits behind two traits:
//!
//! - [`ClusterWatch`]: filtered, long-lived watches over pods and events, plus
//!   listing of running pods
//! - [`TunnelProvider`]: making an in-cluster service reachable from the
//!   operator's machine (direct service proxy, or a pod port-forward)
//!
//! [`KubernetesProvider`] implements both against a real cluster; tests
//! substitute channel-backed fakes.
//!
//! ```text
//!   ┌──────────────┐  watch_pods / watch_events   ┌────────────────────┐
//!   │  runtime::*  │ ───────────────────────────▶ │ KubernetesProvider │
//!   │  watchers    │ ◀─── mpsc<WatchEvent> ────── │   (kube::Client)   │
//!   └──────────────┘                              └────────────────────┘
//! ```

pub mod diff;
pub mod provider;
pub mod resources;
pub mod syncer;
pub mod tunnel;
pub mod watch;

pub use diff::{diff_pods, PodDiff};
pub use provider::KubernetesProvider;
pub use resources::{KubernetesProvisioner, ManifestBundle, ProvisionError, ProvisionOutcome, ResourceProvisioner};
pub use syncer::{PodSetController, PodSetStreams, PodSetSyncer, SyncerConfig, SyncerError, SyncerErrorReason};
pub use tunnel::TunnelHandle;
pub use watch::{ClusterEvent, WatchError, WatchEvent, WatchEventType, WatchFilter, WatchStream};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use regex::Regex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Prefix shared by every resource this tool creates
pub const SELF_RESOURCES_PREFIX: &str = "tapline-";

pub const HUB_POD_NAME: &str = "tapline-hub";
pub const HUB_SERVICE_NAME: &str = "tapline-hub";
pub const FRONT_POD_NAME: &str = "tapline-front";
pub const FRONT_SERVICE_NAME: &str = "tapline-front";
pub const WORKER_POD_PREFIX: &str = "tapline-worker";
pub const SERVICE_ACCOUNT_NAME: &str = "tapline-service-account";

/// Port the Hub and Front services expose inside the cluster
pub const SERVICE_PORT: u16 = 80;

/// Namespace value meaning "every namespace"
pub const ALL_NAMESPACES: &str = "";

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Kubernetes config error: {0}")]
    Config(String),

    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("No pod matching '{pattern}' in namespace {namespace}")]
    NoMatchingPod { pattern: String, namespace: String },

    #[error("Port-forward error: {0}")]
    PortForward(String),

    #[error("Invalid manifest: {0}")]
    Manifest(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClusterError {
    /// The API server refused a create because the object already exists
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::Api(kube::Error::Api(response)) if response.reason == "AlreadyExists")
    }
}

/// `http://<host>:<port>`
pub fn localhost_on_port(host: &str, port: u16) -> String {
    format!("http://{}:{}", host, port)
}

/// Regex matching exactly `name`
pub fn exact_name_regex(name: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^{}$", regex::escape(name)))
}

/// Regex matching names starting with `prefix`
pub fn prefix_regex(prefix: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^{}", regex::escape(prefix)))
}

// ============================================================================
// SBIO: Traits for abstraction (allow fakes in tests)
// ============================================================================

#[async_trait]
pub trait ClusterWatch: Send + Sync {
    /// Watch pods in `namespace` whose name matches `name_filter`
    fn watch_pods(&self, namespace: &str, name_filter: Regex, cancel: CancellationToken) -> WatchStream;

    /// Watch events in `namespace` whose subject is a pod matching `subject_filter`
    fn watch_events(&self, namespace: &str, subject_filter: Regex, cancel: CancellationToken) -> WatchStream;

    /// Running pods matching `name_filter` across `namespaces`
    async fn list_running_pods(
        &self,
        namespaces: &[String],
        name_filter: &Regex,
    ) -> Result<Vec<Pod>, ClusterError>;
}

#[async_trait]
pub trait TunnelProvider: Send + Sync {
    /// Serve `host:local_port` by proxying through the API server to `service`
    async fn open_service_proxy(
        &self,
        namespace: &str,
        service: &str,
        host: &str,
        local_port: u16,
        cancel: &CancellationToken,
    ) -> Result<TunnelHandle, ClusterError>;

    /// Forward `host:local_port` to `remote_port` of the first pod matching `pod_filter`
    async fn open_port_forward(
        &self,
        namespace: &str,
        pod_filter: &Regex,
        host: &str,
        local_port: u16,
        remote_port: u16,
        cancel: &CancellationToken,
    ) -> Result<TunnelHandle, ClusterError>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    use crate::cluster::watch::{WatchError, WatchEvent, WATCH_BUFFER};

    type WatchSender = mpsc::Sender<Result<WatchEvent, WatchError>>;

    /// Pod snapshot with a name, uid and phase
    pub fn pod(name: &str, uid: &str, phase: &str) -> Pod {
        serde_json::from_value(serde_json::json!({
            "metadata": {"name": name, "namespace": "default", "uid": uid},
            "status": {"phase": phase}
        }))
        .unwrap()
    }

    /// Channel-backed cluster; tests push watch items by object name
    #[derive(Default)]
    pub struct FakeCluster {
        pods: Mutex<Vec<Pod>>,
        list_error: Mutex<Option<String>>,
        list_calls: AtomicUsize,
        pod_watches: Mutex<Vec<(Regex, WatchSender)>>,
        event_watches: Mutex<Vec<(Regex, WatchSender)>>,
    }

    impl FakeCluster {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_pods(&self, pods: Vec<Pod>) {
            *self.pods.lock().unwrap() = pods;
        }

        pub fn fail_list(&self, reason: &str) {
            *self.list_error.lock().unwrap() = Some(reason.to_string());
        }

        pub fn list_calls(&self) -> usize {
            self.list_calls.load(Ordering::SeqCst)
        }

        pub async fn wait_for_list_calls(&self, count: usize) {
            while self.list_calls() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        pub fn pod_watch_count(&self) -> usize {
            self.pod_watches.lock().unwrap().len()
        }

        pub fn event_watch_count(&self) -> usize {
            self.event_watches.lock().unwrap().len()
        }

        /// Deliver to every pod watch whose filter matches `name`
        pub async fn send_pod_event(&self, name: &str, item: Result<WatchEvent, WatchError>) {
            let senders = matching(&self.pod_watches, name);
            for sender in senders {
                let _ = sender.send(item.clone()).await;
            }
        }

        /// Deliver to every event watch whose subject filter matches `subject`
        pub async fn send_event(&self, subject: &str, item: Result<WatchEvent, WatchError>) {
            let senders = matching(&self.event_watches, subject);
            for sender in senders {
                let _ = sender.send(item.clone()).await;
            }
        }

        /// Close every pod watch whose filter matches `name`
        pub fn close_pod_watches(&self, name: &str) {
            self.pod_watches
                .lock()
                .unwrap()
                .retain(|(regex, _)| !regex.is_match(name));
        }
    }

    fn matching(watches: &Mutex<Vec<(Regex, WatchSender)>>, name: &str) -> Vec<WatchSender> {
        watches
            .lock()
            .unwrap()
            .iter()
            .filter(|(regex, _)| regex.is_match(name))
            .map(|(_, sender)| sender.clone())
            .collect()
    }

    #[async_trait]
    impl ClusterWatch for FakeCluster {
        fn watch_pods(&self, _namespace: &str, name_filter: Regex, _cancel: CancellationToken) -> WatchStream {
            let (tx, rx) = mpsc::channel(WATCH_BUFFER);
            self.pod_watches.lock().unwrap().push((name_filter, tx));
            rx
        }

        fn watch_events(&self, _namespace: &str, subject_filter: Regex, _cancel: CancellationToken) -> WatchStream {
            let (tx, rx) = mpsc::channel(WATCH_BUFFER);
            self.event_watches.lock().unwrap().push((subject_filter, tx));
            rx
        }

        async fn list_running_pods(
            &self,
            _namespaces: &[String],
            name_filter: &Regex,
        ) -> Result<Vec<Pod>, ClusterError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(reason) = self.list_error.lock().unwrap().clone() {
                return Err(ClusterError::Config(reason));
            }
            Ok(self
                .pods
                .lock()
                .unwrap()
                .iter()
                .filter(|pod| name_filter.is_match(pod.metadata.name.as_deref().unwrap_or_default()))
                .cloned()
                .collect())
        }
    }

    /// Records tunnel requests; the proxy and port-forward can be made to fail
    #[derive(Default)]
    pub struct FakeTunnels {
        pub fail_proxy: bool,
        pub fail_forward: bool,
        pub(crate) opened: Mutex<Vec<String>>,
    }

    impl FakeTunnels {
        pub fn opened(&self) -> Vec<String> {
            self.opened.lock().unwrap().clone()
        }

        fn handle(cancel: &CancellationToken) -> TunnelHandle {
            let token = cancel.child_token();
            let waiter = token.clone();
            TunnelHandle::new(token, tokio::spawn(async move { waiter.cancelled().await }))
        }
    }

    #[async_trait]
    impl TunnelProvider for FakeTunnels {
        async fn open_service_proxy(
            &self,
            _namespace: &str,
            service: &str,
            _host: &str,
            local_port: u16,
            cancel: &CancellationToken,
        ) -> Result<TunnelHandle, ClusterError> {
            self.opened
                .lock()
                .unwrap()
                .push(format!("proxy:{}:{}", service, local_port));
            if self.fail_proxy {
                return Err(ClusterError::Bind {
                    addr: format!("127.0.0.1:{}", local_port),
                    reason: "address in use".into(),
                });
            }
            Ok(Self::handle(cancel))
        }

        async fn open_port_forward(
            &self,
            namespace: &str,
            pod_filter: &Regex,
            _host: &str,
            local_port: u16,
            remote_port: u16,
            cancel: &CancellationToken,
        ) -> Result<TunnelHandle, ClusterError> {
            self.opened
                .lock()
                .unwrap()
                .push(format!("forward:{}:{}:{}", pod_filter, local_port, remote_port));
            if self.fail_forward {
                return Err(ClusterError::NoMatchingPod {
                    pattern: pod_filter.to_string(),
                    namespace: namespace.to_string(),
                });
            }
            Ok(Self::handle(cancel))
        }
    }
}
