//! What happens when the Hub starts and when both pods are ready

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ConnectionTarget, Connector, HubClient};
use crate::cluster::{
    exact_name_regex, PodSetController, TunnelHandle, TunnelProvider, FRONT_POD_NAME,
    FRONT_SERVICE_NAME, HUB_POD_NAME, HUB_SERVICE_NAME,
};
use crate::config::PortPair;

use super::coordinator::{StageError, StageHooks};
use super::reachability::{establish, ProbeSettings, ReachabilityTarget};
use super::relay::run_relay;

pub const HUB_HEALTH_PATH: &str = "/echo";
pub const FRONT_HEALTH_PATH: &str = "";

#[derive(Debug, Clone)]
pub struct StageSettings {
    pub namespace: String,
    pub host: String,
    pub hub: PortPair,
    pub front: PortPair,
    pub storage_limit: i64,
    pub headless: bool,
    pub probe: ProbeSettings,
}

impl StageSettings {
    fn target(&self, service: &str, pod: &str, ports: PortPair, health_path: &str) -> Result<ReachabilityTarget, StageError> {
        let pod_filter = exact_name_regex(pod)?;
        Ok(ReachabilityTarget {
            namespace: self.namespace.clone(),
            service: service.to_string(),
            pod_filter,
            host: self.host.clone(),
            local_port: ports.src_port,
            remote_port: ports.dst_port,
            health_path: health_path.to_string(),
        })
    }

    pub fn hub_target(&self) -> Result<ReachabilityTarget, StageError> {
        self.target(HUB_SERVICE_NAME, HUB_POD_NAME, self.hub, HUB_HEALTH_PATH)
    }

    pub fn front_target(&self) -> Result<ReachabilityTarget, StageError> {
        self.target(FRONT_SERVICE_NAME, FRONT_POD_NAME, self.front, FRONT_HEALTH_PATH)
    }
}

/// Stage hooks of a tap session: Hub reachability plus relay, then Front
/// reachability plus browser.
pub struct TapStages {
    tunnels: Arc<dyn TunnelProvider>,
    controller: Arc<dyn PodSetController>,
    settings: StageSettings,
    open_tunnels: Mutex<Vec<TunnelHandle>>,
    relay: Mutex<Option<JoinHandle<()>>>,
}

impl TapStages {
    pub fn new(
        tunnels: Arc<dyn TunnelProvider>,
        controller: Arc<dyn PodSetController>,
        settings: StageSettings,
    ) -> Self {
        Self {
            tunnels,
            controller,
            settings,
            open_tunnels: Mutex::new(Vec::new()),
            relay: Mutex::new(None),
        }
    }

    fn keep(&self, handle: TunnelHandle) {
        if let Ok(mut tunnels) = self.open_tunnels.lock() {
            tunnels.push(handle);
        }
    }

    async fn reach(&self, target: &ReachabilityTarget, cancel: &CancellationToken) -> Result<String, StageError> {
        let url = target.local_url();
        let prober = self.settings.probe.connector(url.clone())?;
        let handle = establish(self.tunnels.as_ref(), target, &prober, cancel).await?;
        self.keep(handle);
        Ok(url)
    }

    /// Close every tunnel and wait for the relay to finish
    pub async fn shutdown(&self) {
        let tunnels: Vec<TunnelHandle> = self
            .open_tunnels
            .lock()
            .map(|mut tunnels| std::mem::take(&mut *tunnels))
            .unwrap_or_default();
        for tunnel in tunnels {
            tunnel.close().await;
        }

        let relay = self.relay.lock().ok().and_then(|mut relay| relay.take());
        if let Some(relay) = relay {
            let _ = relay.await;
        }
    }
}

#[async_trait]
impl StageHooks for TapStages {
    async fn on_hub_started(&self, cancel: &CancellationToken) -> Result<(), StageError> {
        let url = self.reach(&self.settings.hub_target()?, cancel).await?;

        let streams = self.controller.start(cancel.clone()).await?;
        let hub = HubClient::new(
            Connector::http(ConnectionTarget::new(url.clone()))?,
            self.settings.storage_limit,
        );
        let relay = tokio::spawn(run_relay(
            Arc::new(hub),
            self.controller.clone(),
            streams,
            cancel.clone(),
        ));
        if let Ok(mut slot) = self.relay.lock() {
            *slot = Some(relay);
        }

        info!(url = %url, "Hub is available at");
        Ok(())
    }

    async fn on_dual_ready(&self, cancel: &CancellationToken) -> Result<(), StageError> {
        let url = self.reach(&self.settings.front_target()?, cancel).await?;
        info!(url = %url, "Tapline is available at");

        if !self.settings.headless {
            open_browser(&url);
        }
        Ok(())
    }
}

/// Open `url` with the platform's default handler
pub fn open_browser(url: &str) {
    let spawned = if cfg!(target_os = "macos") {
        Command::new("open").arg(url).spawn()
    } else if cfg!(target_os = "windows") {
        Command::new("cmd").args(["/C", "start", url]).spawn()
    } else {
        Command::new("xdg-open").arg(url).spawn()
    };

    match spawned {
        Ok(_) => debug!(url, "Opened browser"),
        Err(e) => warn!(url, error = %e, "Failed to open browser"),
    }
}
