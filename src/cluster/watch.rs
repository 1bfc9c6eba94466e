//! Orchestrator watch events
//!
//! Watches deliver raw JSON objects; each consumer parses the snapshot it
//! expects (`to_pod`, `to_event`) so that a malformed payload surfaces where
//! it is handled.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ObjectReference, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DynamicObject, WatchParams};
use kube::Api;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Buffered events per watch before the producer waits
pub const WATCH_BUFFER: usize = 64;

/// Server-side timeout of one watch request (must stay below 295s)
const WATCH_TIMEOUT_SECS: u32 = 290;

/// First delay before re-subscribing after a broken watch stream
const RESUBSCRIBE_BASE_DELAY: Duration = Duration::from_millis(500);

/// Longest delay between re-subscriptions
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(30);

/// Stream of watch notifications; `Err` items report subscription failures
pub type WatchStream = mpsc::Receiver<Result<WatchEvent, WatchError>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    #[error("Failed to watch {resource}: {reason}")]
    Subscribe { resource: String, reason: String },

    #[error("Failed to parse {kind} snapshot: {reason}")]
    Parse { kind: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
    Bookmark,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub object: Value,
}

impl WatchEvent {
    pub fn new(event_type: WatchEventType, object: Value) -> Self {
        Self { event_type, object }
    }

    pub fn to_pod(&self) -> Result<Pod, WatchError> {
        serde_json::from_value(self.object.clone()).map_err(|e| WatchError::Parse {
            kind: "pod",
            reason: e.to_string(),
        })
    }

    pub fn to_event(&self) -> Result<ClusterEvent, WatchError> {
        serde_json::from_value(self.object.clone()).map_err(|e| WatchError::Parse {
            kind: "event",
            reason: e.to_string(),
        })
    }
}

/// The subset of an `events.k8s.io/v1` Event this crate reads
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterEvent {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub regarding: Option<ObjectReference>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}

impl ClusterEvent {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.metadata.creation_timestamp.as_ref().map(|time| time.0)
    }

    pub fn subject_name(&self) -> &str {
        self.regarding
            .as_ref()
            .and_then(|r| r.name.as_deref())
            .unwrap_or_default()
    }

    pub fn subject_kind(&self) -> &str {
        self.regarding
            .as_ref()
            .and_then(|r| r.kind.as_deref())
            .unwrap_or_default()
    }

    pub fn reason(&self) -> &str {
        self.reason.as_deref().unwrap_or_default()
    }

    pub fn note(&self) -> &str {
        self.note.as_deref().unwrap_or_default()
    }
}

/// Which objects of a watch are forwarded
#[derive(Debug, Clone)]
pub enum WatchFilter {
    /// Objects whose `metadata.name` matches
    Name(Regex),
    /// Events whose `regarding` object has this kind and a matching name
    Subject { name: Regex, kind: String },
}

impl WatchFilter {
    // SBIO: pure predicate over the raw object
    pub fn matches(&self, object: &Value) -> bool {
        match self {
            WatchFilter::Name(regex) => object
                .pointer("/metadata/name")
                .and_then(Value::as_str)
                .is_some_and(|name| regex.is_match(name)),
            WatchFilter::Subject { name, kind } => {
                let subject_kind = object.pointer("/regarding/kind").and_then(Value::as_str);
                let subject_name = object.pointer("/regarding/name").and_then(Value::as_str);
                subject_kind.is_some_and(|k| k.eq_ignore_ascii_case(kind))
                    && subject_name.is_some_and(|n| name.is_match(n))
            }
        }
    }
}

/// Exponential delay between consecutive failed watch subscriptions
#[derive(Debug, Clone, Default)]
pub struct ResubscribeBackoff {
    failures: u32,
}

impl ResubscribeBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Record one more failure and return how long to wait
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.failures.min(16));
        self.failures = self.failures.saturating_add(1);
        RESUBSCRIBE_BASE_DELAY
            .saturating_mul(factor)
            .min(RESUBSCRIBE_MAX_DELAY)
    }
}

/// Translate a kube watch event; `None` when the filter drops it.
fn translate(
    event: kube::core::WatchEvent<DynamicObject>,
    filter: &WatchFilter,
    resource_version: &mut String,
) -> Option<WatchEvent> {
    use kube::core::WatchEvent as KubeEvent;

    let (event_type, object) = match event {
        KubeEvent::Added(obj) => (WatchEventType::Added, obj),
        KubeEvent::Modified(obj) => (WatchEventType::Modified, obj),
        KubeEvent::Deleted(obj) => (WatchEventType::Deleted, obj),
        KubeEvent::Bookmark(bookmark) => {
            *resource_version = bookmark.metadata.resource_version;
            return Some(WatchEvent::new(WatchEventType::Bookmark, Value::Null));
        }
        KubeEvent::Error(response) => {
            if response.code == 410 {
                // Version too old; start over from the current state
                *resource_version = "0".to_string();
            }
            let object = serde_json::to_value(&response).unwrap_or(Value::Null);
            return Some(WatchEvent::new(WatchEventType::Error, object));
        }
    };

    if let Some(version) = object.metadata.resource_version.clone() {
        *resource_version = version;
    }

    let value = match serde_json::to_value(&object) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Dropping unserializable watch object");
            return None;
        }
    };

    filter
        .matches(&value)
        .then(|| WatchEvent::new(event_type, value))
}

/// Run a filtered watch on `api` in the background.
///
/// The watch re-subscribes from the last seen resource version whenever the
/// server ends the stream, and stops when `cancel` fires or the receiver is
/// dropped. A broken stream is re-subscribed after a [`ResubscribeBackoff`]
/// delay. A failure to subscribe is sent as an `Err` item and ends the watch.
pub fn spawn_filtered_watch(
    api: Api<DynamicObject>,
    resource: &'static str,
    filter: WatchFilter,
    cancel: CancellationToken,
) -> WatchStream {
    let (tx, rx) = mpsc::channel(WATCH_BUFFER);

    tokio::spawn(async move {
        let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let mut resource_version = "0".to_string();
        let mut backoff = ResubscribeBackoff::new();

        loop {
            let stream = tokio::select! {
                _ = cancel.cancelled() => return,
                result = api.watch(&params, &resource_version) => result,
            };

            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx
                        .send(Err(WatchError::Subscribe {
                            resource: resource.to_string(),
                            reason: e.to_string(),
                        }))
                        .await;
                    return;
                }
            };
            let mut stream = stream.boxed();
            let mut received = false;

            let broken = loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => return,
                    item = stream.next() => item,
                };

                match item {
                    Some(Ok(event)) => {
                        received = true;
                        backoff.reset();
                        if let Some(event) = translate(event, &filter, &mut resource_version) {
                            if tx.send(Ok(event)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        debug!(resource, error = %e, "Watch stream error");
                        break true;
                    }
                    // An empty stream that closes right away counts as a failure
                    None => break !received,
                }
            };

            if broken {
                let delay = backoff.next_delay();
                debug!(resource, delay_ms = delay.as_millis() as u64, "Re-subscribing after delay");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            } else {
                debug!(resource, "Watch stream ended, re-subscribing");
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resubscribe_backoff_grows_and_caps() {
        let mut backoff = ResubscribeBackoff::new();
        let delays: Vec<Duration> = (0..8).map(|_| backoff.next_delay()).collect();

        assert_eq!(delays[0], Duration::from_millis(500));
        assert_eq!(delays[1], Duration::from_secs(1));
        assert_eq!(delays[2], Duration::from_secs(2));
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(delays[7], Duration::from_secs(30));

        for _ in 0..100 {
            assert!(backoff.next_delay() <= Duration::from_secs(30));
        }
    }

    #[test]
    fn test_resubscribe_backoff_resets() {
        let mut backoff = ResubscribeBackoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_to_pod() {
        let event = WatchEvent::new(
            WatchEventType::Modified,
            json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": "tapline-hub", "uid": "1"},
                "status": {"phase": "Running"}
            }),
        );
        let pod = event.to_pod().unwrap();
        assert_eq!(pod.metadata.name.as_deref(), Some("tapline-hub"));
        assert_eq!(pod.status.unwrap().phase.as_deref(), Some("Running"));
    }

    #[test]
    fn test_to_pod_rejects_malformed_snapshot() {
        let event = WatchEvent::new(WatchEventType::Modified, json!({"metadata": 7}));
        assert!(matches!(
            event.to_pod(),
            Err(WatchError::Parse { kind: "pod", .. })
        ));
    }

    #[test]
    fn test_to_event() {
        let event = WatchEvent::new(
            WatchEventType::Added,
            json!({
                "apiVersion": "events.k8s.io/v1",
                "kind": "Event",
                "metadata": {"name": "tapline-hub.1", "creationTimestamp": "2026-01-02T03:04:05Z"},
                "regarding": {"kind": "Pod", "name": "tapline-hub"},
                "reason": "FailedScheduling",
                "note": "0/3 nodes are available"
            }),
        );
        let cluster_event = event.to_event().unwrap();
        assert_eq!(cluster_event.name(), "tapline-hub.1");
        assert_eq!(cluster_event.subject_name(), "tapline-hub");
        assert_eq!(cluster_event.subject_kind(), "Pod");
        assert_eq!(cluster_event.reason(), "FailedScheduling");
        assert_eq!(
            cluster_event.created_at().unwrap().to_rfc3339(),
            "2026-01-02T03:04:05+00:00"
        );
    }

    #[test]
    fn test_name_filter() {
        let filter = WatchFilter::Name(Regex::new("^tapline-hub$").unwrap());
        assert!(filter.matches(&json!({"metadata": {"name": "tapline-hub"}})));
        assert!(!filter.matches(&json!({"metadata": {"name": "tapline-front"}})));
        assert!(!filter.matches(&json!({"metadata": {}})));
    }

    #[test]
    fn test_subject_filter() {
        let filter = WatchFilter::Subject {
            name: Regex::new("^tapline-hub").unwrap(),
            kind: "pod".to_string(),
        };
        assert!(filter.matches(&json!({"regarding": {"kind": "Pod", "name": "tapline-hub"}})));
        assert!(!filter.matches(&json!({"regarding": {"kind": "Service", "name": "tapline-hub"}})));
        assert!(!filter.matches(&json!({"regarding": {"kind": "Pod", "name": "other"}})));
    }
}
