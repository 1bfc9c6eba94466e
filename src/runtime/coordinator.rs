//! Bring-up coordinator
//!
//! Readiness watchers report over a channel; a single task owns the
//! readiness flags, so the dual-ready stage can fire only once no matter how
//! the Hub and Front signals interleave.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::client::ConnectorError;
use crate::cluster::SyncerError;

use super::reachability::ReachabilityError;
use super::PodRole;

#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Reachability(#[from] ReachabilityError),

    #[error("Failed to start relay: {0}")]
    Relay(#[from] SyncerError),

    #[error(transparent)]
    Client(#[from] ConnectorError),

    #[error("Invalid pod filter: {0}")]
    InvalidFilter(#[from] regex::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// The Hub pod runs for the first time
    HubStarted,
    /// Both pods have run; fires once
    DualReady,
}

// ============================================================================
// SBIO: Pure readiness bookkeeping (no I/O)
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadinessBook {
    hub: bool,
    front: bool,
    dual_fired: bool,
}

impl ReadinessBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self, role: PodRole) -> bool {
        match role {
            PodRole::Hub => self.hub,
            PodRole::Front => self.front,
        }
    }

    pub fn dual_fired(&self) -> bool {
        self.dual_fired
    }

    /// Record a readiness signal and return the stages it unlocks, in order
    pub fn record(&mut self, role: PodRole) -> Vec<Stage> {
        if self.is_ready(role) {
            return Vec::new();
        }

        let mut stages = Vec::new();
        match role {
            PodRole::Hub => {
                self.hub = true;
                stages.push(Stage::HubStarted);
            }
            PodRole::Front => self.front = true,
        }

        if self.hub && self.front && !self.dual_fired {
            self.dual_fired = true;
            stages.push(Stage::DualReady);
        }
        stages
    }
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait StageHooks: Send + Sync {
    async fn on_hub_started(&self, cancel: &CancellationToken) -> Result<(), StageError>;

    async fn on_dual_ready(&self, cancel: &CancellationToken) -> Result<(), StageError>;
}

#[async_trait]
impl<H: StageHooks + ?Sized> StageHooks for std::sync::Arc<H> {
    async fn on_hub_started(&self, cancel: &CancellationToken) -> Result<(), StageError> {
        (**self).on_hub_started(cancel).await
    }

    async fn on_dual_ready(&self, cancel: &CancellationToken) -> Result<(), StageError> {
        (**self).on_dual_ready(cancel).await
    }
}

pub struct Coordinator<H: StageHooks> {
    hooks: H,
    book: ReadinessBook,
}

impl<H: StageHooks> Coordinator<H> {
    pub fn new(hooks: H) -> Self {
        Self {
            hooks,
            book: ReadinessBook::new(),
        }
    }

    /// Consume readiness signals until cancellation or until every sender
    /// is gone. A failing stage cancels the session.
    pub async fn run(mut self, mut signals: mpsc::Receiver<PodRole>, cancel: CancellationToken) -> ReadinessBook {
        loop {
            let role = tokio::select! {
                _ = cancel.cancelled() => break,
                role = signals.recv() => match role {
                    Some(role) => role,
                    None => break,
                },
            };

            for stage in self.book.record(role) {
                debug!(stage = ?stage, "Entering bring-up stage");
                let result = tokio::select! {
                    _ = cancel.cancelled() => return self.book,
                    result = self.run_stage(stage, &cancel) => result,
                };

                if let Err(e) = result {
                    error!(stage = ?stage, error = %e, "Bring-up stage failed");
                    cancel.cancel();
                    return self.book;
                }
            }
        }
        self.book
    }

    async fn run_stage(&self, stage: Stage, cancel: &CancellationToken) -> Result<(), StageError> {
        match stage {
            Stage::HubStarted => self.hooks.on_hub_started(cancel).await,
            Stage::DualReady => self.hooks.on_dual_ready(cancel).await,
        }
    }
}
