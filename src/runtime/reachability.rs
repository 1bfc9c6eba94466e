//! Reachability establisher
//!
//! Make a service answer on `host:local_port`: first through the API server's
//! service proxy, then, if the health probe fails, through a port-forward to
//! the stage's pod on the same local port.

use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::client::connector::{DEFAULT_RETRIES, DEFAULT_RETRY_DELAY, DEFAULT_TIMEOUT};
use crate::client::{ConnectionTarget, Connector, ConnectorError, HttpTransport, ReqwestTransport};
use crate::cluster::{localhost_on_port, ClusterError, TunnelHandle, TunnelProvider};

#[derive(Error, Debug)]
pub enum ReachabilityError {
    #[error("Failed to start proxy to {service}: {source}")]
    Proxy { service: String, source: ClusterError },

    #[error("Failed to port-forward to {pattern}: {source}")]
    Forward { pattern: String, source: ClusterError },

    #[error("Couldn't connect to service {service} at {url}")]
    Unreachable { service: String, url: String },
}

/// What to make reachable and how to tell it is up
#[derive(Debug, Clone)]
pub struct ReachabilityTarget {
    pub namespace: String,
    pub service: String,
    /// Pod to port-forward to when the service proxy does not answer
    pub pod_filter: Regex,
    pub host: String,
    pub local_port: u16,
    pub remote_port: u16,
    pub health_path: String,
}

impl ReachabilityTarget {
    pub fn local_url(&self) -> String {
        localhost_on_port(&self.host, self.local_port)
    }
}

/// Health-probe budget used after opening a tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSettings {
    pub retries: u32,
    pub timeout: Duration,
    pub retry_delay: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRIES,
            timeout: DEFAULT_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl ProbeSettings {
    /// HTTP prober for `url`
    pub fn connector(&self, url: String) -> Result<Connector<ReqwestTransport>, ConnectorError> {
        let target = ConnectionTarget::new(url)
            .with_retries(self.retries)
            .with_timeout(self.timeout);
        Ok(Connector::http(target)?.with_retry_delay(self.retry_delay))
    }
}

/// Establish reachability of `target`, probing with `prober`.
///
/// `prober` must point at [`ReachabilityTarget::local_url`]. The returned
/// handle keeps whichever tunnel answered alive.
pub async fn establish<T: HttpTransport>(
    tunnels: &dyn TunnelProvider,
    target: &ReachabilityTarget,
    prober: &Connector<T>,
    cancel: &CancellationToken,
) -> Result<TunnelHandle, ReachabilityError> {
    let proxy = tunnels
        .open_service_proxy(
            &target.namespace,
            &target.service,
            &target.host,
            target.local_port,
            cancel,
        )
        .await
        .map_err(|source| {
            error!(
                service = %target.service,
                local_port = target.local_port,
                error = %source,
                "Error occurred while running k8s proxy, try a different local port"
            );
            ReachabilityError::Proxy {
                service: target.service.clone(),
                source,
            }
        })?;

    if prober.probe(&target.health_path).await.is_ok() {
        info!(service = %target.service, url = %target.local_url(), "Proxy available");
        return Ok(proxy);
    }

    warn!(
        service = %target.service,
        "Couldn't connect using proxy, stopping proxy and trying to create port-forward"
    );
    proxy.close().await;

    let forward = tunnels
        .open_port_forward(
            &target.namespace,
            &target.pod_filter,
            &target.host,
            target.local_port,
            target.remote_port,
            cancel,
        )
        .await
        .map_err(|source| {
            error!(
                pod_regex = %target.pod_filter,
                local_port = target.local_port,
                error = %source,
                "Error occurred while running port-forward, try a different local port"
            );
            ReachabilityError::Forward {
                pattern: target.pod_filter.to_string(),
                source,
            }
        })?;

    if prober.probe(&target.health_path).await.is_ok() {
        info!(service = %target.service, url = %target.local_url(), "Port-forward available");
        return Ok(forward);
    }

    error!(service = %target.service, url = %target.local_url(), "Couldn't connect to service");
    forward.close().await;
    Err(ReachabilityError::Unreachable {
        service: target.service.clone(),
        url: target.local_url(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::connector::mock::ScriptedTransport;
    use crate::client::{ConnectionTarget, TransportError};
    use crate::cluster::mock::FakeTunnels;
    use crate::cluster::exact_name_regex;
    use std::time::Duration;

    fn target() -> ReachabilityTarget {
        ReachabilityTarget {
            namespace: "tapline".into(),
            service: "tapline-hub".into(),
            pod_filter: exact_name_regex("tapline-hub").unwrap(),
            host: "127.0.0.1".into(),
            local_port: 8898,
            remote_port: 8898,
            health_path: "/echo".into(),
        }
    }

    fn prober(transport: ScriptedTransport) -> Connector<ScriptedTransport> {
        Connector::with_transport(ConnectionTarget::new(target().local_url()), transport)
            .with_retry_delay(Duration::from_millis(1))
    }

    fn refused() -> TransportError {
        TransportError::Transient("connection refused".into())
    }

    #[tokio::test]
    async fn test_direct_proxy_answers() {
        let tunnels = FakeTunnels::default();
        let prober = prober(ScriptedTransport::new(vec![]));

        let handle = establish(&tunnels, &target(), &prober, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(tunnels.opened(), vec!["proxy:tapline-hub:8898"]);
        assert_eq!(prober.transport().call_count(), 1);
        handle.close().await;
    }

    #[tokio::test]
    async fn test_falls_back_to_port_forward() {
        let tunnels = FakeTunnels::default();
        let prober = prober(ScriptedTransport::failing(3, refused()));

        let handle = establish(&tunnels, &target(), &prober, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            tunnels.opened(),
            vec!["proxy:tapline-hub:8898", "forward:^tapline\\-hub$:8898:8898"]
        );
        assert_eq!(prober.transport().call_count(), 4);
        handle.close().await;
    }

    #[tokio::test]
    async fn test_proxy_open_failure_does_not_fall_back() {
        let tunnels = FakeTunnels {
            fail_proxy: true,
            ..Default::default()
        };
        let prober = prober(ScriptedTransport::new(vec![]));

        let result = establish(&tunnels, &target(), &prober, &CancellationToken::new()).await;

        assert!(matches!(result, Err(ReachabilityError::Proxy { .. })));
        assert_eq!(tunnels.opened().len(), 1);
        assert_eq!(prober.transport().call_count(), 0);
    }

    #[tokio::test]
    async fn test_port_forward_failure() {
        let tunnels = FakeTunnels {
            fail_forward: true,
            ..Default::default()
        };
        let prober = prober(ScriptedTransport::always(refused()));

        let result = establish(&tunnels, &target(), &prober, &CancellationToken::new()).await;

        assert!(matches!(result, Err(ReachabilityError::Forward { .. })));
        assert_eq!(prober.transport().call_count(), 3);
    }

    #[tokio::test]
    async fn test_unreachable_after_fallback() {
        let tunnels = FakeTunnels::default();
        let prober = prober(ScriptedTransport::always(refused()));

        let result = establish(&tunnels, &target(), &prober, &CancellationToken::new()).await;

        assert!(matches!(result, Err(ReachabilityError::Unreachable { .. })));
        assert_eq!(prober.transport().call_count(), 6);
    }
}
