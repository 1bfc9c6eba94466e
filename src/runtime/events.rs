//! Cluster event watcher for the Hub pod
//!
//! Events created before the session started belong to an earlier run in
//! the same namespace and are ignored.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::cluster::watch::{ClusterEvent, WatchEventType};
use crate::cluster::{prefix_regex, ClusterWatch, HUB_POD_NAME};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventReason {
    FailedScheduling,
    Failed,
    Other(String),
}

impl EventReason {
    pub fn parse(reason: &str) -> Self {
        match reason {
            "FailedScheduling" => EventReason::FailedScheduling,
            "Failed" => EventReason::Failed,
            other => EventReason::Other(other.to_string()),
        }
    }

    pub fn is_fatal(&self) -> bool {
        match self {
            EventReason::FailedScheduling | EventReason::Failed => true,
            EventReason::Other(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventVerdict {
    Stale,
    Benign(EventReason),
    Fatal(EventReason),
}

// ============================================================================
// SBIO: Pure classification (no I/O)
// ============================================================================

/// Classify one event against the session start time.
///
/// Events without a creation timestamp cannot be placed after the session
/// start and count as stale.
pub fn assess_event(event: &ClusterEvent, session_start: DateTime<Utc>) -> EventVerdict {
    match event.created_at() {
        Some(created) if created > session_start => {}
        _ => return EventVerdict::Stale,
    }

    let reason = EventReason::parse(event.reason());
    if reason.is_fatal() {
        EventVerdict::Fatal(reason)
    } else {
        EventVerdict::Benign(reason)
    }
}

/// Watch events about the Hub pod and cancel on a fatal one.
pub async fn watch_hub_events(
    cluster: Arc<dyn ClusterWatch>,
    namespace: String,
    session_start: DateTime<Utc>,
    cancel: CancellationToken,
) {
    let filter = match prefix_regex(HUB_POD_NAME) {
        Ok(filter) => filter,
        Err(e) => {
            error!(pod = HUB_POD_NAME, error = %e, "Invalid event filter");
            return;
        }
    };
    let mut events = cluster.watch_events(&namespace, filter, cancel.child_token());

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(pod = HUB_POD_NAME, "Watching pod events, cancelled");
                return;
            }
            item = events.recv() => item,
        };

        let watch_event = match item {
            Some(Ok(watch_event)) => watch_event,
            Some(Err(e)) => {
                error!(pod = HUB_POD_NAME, error = %e, "While watching events");
                continue;
            }
            None => {
                debug!(pod = HUB_POD_NAME, "Event watch closed");
                return;
            }
        };

        if matches!(
            watch_event.event_type,
            WatchEventType::Bookmark | WatchEventType::Error
        ) {
            continue;
        }

        let event = match watch_event.to_event() {
            Ok(event) => event,
            Err(e) => {
                error!(pod = HUB_POD_NAME, error = %e, "Parsing resource event");
                continue;
            }
        };

        match assess_event(&event, session_start) {
            EventVerdict::Stale => {}
            EventVerdict::Benign(reason) => debug!(
                pod = HUB_POD_NAME,
                event = event.name(),
                name = event.subject_name(),
                kind = event.subject_kind(),
                reason = ?reason,
                note = event.note(),
                "Watching events"
            ),
            EventVerdict::Fatal(reason) => {
                error!(
                    pod = HUB_POD_NAME,
                    event = event.name(),
                    time = ?event.created_at(),
                    name = event.subject_name(),
                    kind = event.subject_kind(),
                    reason = ?reason,
                    note = event.note(),
                    "Fatal event for pod"
                );
                cancel.cancel();
                return;
            }
        }
    }
}
