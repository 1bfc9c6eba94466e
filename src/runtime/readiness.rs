//! Pod readiness watcher
//!
//! A per-pod state machine fed by watch events:
//!
//! ```text
//!   Unknown ──Added──▶ Observed ──Added/Modified(Running)──▶ Ready
//!      │                  │                              │
//!      └──────────────────┴── Deleted / parse error ─────┴──▶ Failed
//!                             deadline (before Ready)
//! ```
//!
//! `Failed` is sticky. `Ready` is only left through `Deleted`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::watch::{WatchEvent, WatchEventType};
use crate::cluster::{exact_name_regex, ClusterWatch};

use super::PodRole;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Deleted,
    WatchError(String),
    Timeout,
    ParseError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessState {
    Unknown,
    Observed,
    Ready,
    Failed(FailureReason),
}

/// What processing one input changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    None,
    BecameReady,
    Failed(FailureReason),
}

// ============================================================================
// SBIO: Pure state machine (no I/O)
// ============================================================================

#[derive(Debug, Clone)]
pub struct PodReadiness {
    state: ReadinessState,
}

impl Default for PodReadiness {
    fn default() -> Self {
        Self::new()
    }
}

impl PodReadiness {
    pub fn new() -> Self {
        Self {
            state: ReadinessState::Unknown,
        }
    }

    pub fn state(&self) -> &ReadinessState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ReadinessState::Ready
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, ReadinessState::Failed(_))
    }

    fn fail(&mut self, reason: FailureReason) -> Transition {
        self.state = ReadinessState::Failed(reason.clone());
        Transition::Failed(reason)
    }

    pub fn on_event(&mut self, event: &WatchEvent) -> Transition {
        if self.is_failed() {
            return Transition::None;
        }

        match event.event_type {
            WatchEventType::Added | WatchEventType::Modified => {
                let pod = match event.to_pod() {
                    Ok(pod) => pod,
                    Err(e) => return self.fail(FailureReason::ParseError(e.to_string())),
                };
                if self.state == ReadinessState::Unknown {
                    self.state = ReadinessState::Observed;
                }

                // A pod that already runs when the watch starts only shows up as Added
                let running = pod
                    .status
                    .as_ref()
                    .and_then(|status| status.phase.as_deref())
                    == Some("Running");

                if running && !self.is_ready() {
                    self.state = ReadinessState::Ready;
                    Transition::BecameReady
                } else {
                    Transition::None
                }
            }
            WatchEventType::Deleted => self.fail(FailureReason::Deleted),
            WatchEventType::Bookmark | WatchEventType::Error => Transition::None,
        }
    }

    pub fn on_deadline(&mut self) -> Transition {
        if self.is_ready() || self.is_failed() {
            return Transition::None;
        }
        self.fail(FailureReason::Timeout)
    }

    pub fn on_watch_error(&mut self, reason: String) -> Transition {
        if self.is_failed() {
            return Transition::None;
        }
        self.fail(FailureReason::WatchError(reason))
    }
}

// ============================================================================
// Watch loop
// ============================================================================

/// Drive a [`PodReadiness`] from the watch of `role`'s pod.
///
/// Sends `role` on `ready_tx` the first time the pod runs; cancels `cancel`
/// on any failure. Returns the final state.
pub async fn watch_pod_readiness(
    cluster: Arc<dyn ClusterWatch>,
    role: PodRole,
    namespace: String,
    timeout: Duration,
    ready_tx: mpsc::Sender<PodRole>,
    cancel: CancellationToken,
) -> ReadinessState {
    let pod = role.pod_name();
    let mut readiness = PodReadiness::new();

    let filter = match exact_name_regex(pod) {
        Ok(filter) => filter,
        Err(e) => {
            error!(pod, error = %e, "Invalid pod filter");
            cancel.cancel();
            readiness.on_watch_error(e.to_string());
            return readiness.state().clone();
        }
    };
    let mut events = cluster.watch_pods(&namespace, filter, cancel.child_token());

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut deadline_elapsed = false;
    let mut watch_open = true;

    loop {
        let transition = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(pod, "Watching pod, cancelled");
                break;
            }
            _ = &mut deadline, if !deadline_elapsed => {
                deadline_elapsed = true;
                readiness.on_deadline()
            }
            item = events.recv(), if watch_open => match item {
                Some(Ok(event)) => {
                    log_event(pod, &event);
                    readiness.on_event(&event)
                }
                Some(Err(e)) => readiness.on_watch_error(e.to_string()),
                None => {
                    if readiness.is_ready() {
                        debug!(pod, "Pod watch closed");
                        break;
                    }
                    warn!(pod, "Pod watch closed before the pod was ready");
                    watch_open = false;
                    Transition::None
                }
            },
        };

        match transition {
            Transition::BecameReady => {
                info!(pod, "Pod is ready");
                let _ = ready_tx.send(role).await;
            }
            Transition::Failed(reason) => {
                report_failure(pod, &namespace, timeout, &reason);
                cancel.cancel();
                break;
            }
            Transition::None => {}
        }
    }

    readiness.state().clone()
}

fn log_event(pod: &str, event: &WatchEvent) {
    match event.event_type {
        WatchEventType::Added => info!(pod, "Added pod"),
        WatchEventType::Deleted => info!(pod, "Removed pod"),
        WatchEventType::Modified => {
            let phase = event
                .object
                .pointer("/status/phase")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            debug!(pod, phase, "Watching pod")
        }
        WatchEventType::Bookmark | WatchEventType::Error => {
            debug!(pod, event_type = ?event.event_type, "Ignoring watch notification")
        }
    }
}

fn report_failure(pod: &str, namespace: &str, timeout: Duration, reason: &FailureReason) {
    match reason {
        FailureReason::Deleted => error!(pod, namespace, "Pod was removed"),
        FailureReason::Timeout => {
            error!(pod, timeout_secs = timeout.as_secs(), "Pod was not ready in time")
        }
        FailureReason::WatchError(e) => error!(pod, namespace, error = %e, "Failed watching pod"),
        FailureReason::ParseError(e) => error!(pod, error = %e, "Failed parsing pod snapshot"),
    }
}
