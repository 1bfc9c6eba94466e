use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::events::v1::Event;
use kube::api::{ApiResource, DynamicObject, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::tunnel::{bind_listener, serve_port_forward, serve_service_proxy, TunnelHandle};
use super::watch::{spawn_filtered_watch, WatchFilter, WatchStream};
use super::{ClusterError, ClusterWatch, TunnelProvider, ALL_NAMESPACES};

/// Orchestrator access backed by a `kube::Client`
#[derive(Clone)]
pub struct KubernetesProvider {
    client: Client,
}

impl KubernetesProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from an explicit kubeconfig and/or context, falling
    /// back to in-cluster or default kubeconfig inference.
    pub async fn from_config(path: Option<&Path>, context: Option<&str>) -> Result<Self, ClusterError> {
        let options = KubeConfigOptions {
            context: context.map(str::to_string),
            ..Default::default()
        };

        let config = match path {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .map_err(|e| ClusterError::Config(format!("{}: {}", path.display(), e)))?;
                Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| ClusterError::Config(e.to_string()))?
            }
            None if context.is_some() => Config::from_kubeconfig(&options)
                .await
                .map_err(|e| ClusterError::Config(e.to_string()))?,
            None => Config::infer()
                .await
                .map_err(|e| ClusterError::Config(e.to_string()))?,
        };

        debug!(cluster_url = %config.cluster_url, "Using Kubernetes API server");
        let client = Client::try_from(config)?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Namespace of the active kubeconfig context
    pub fn current_namespace(&self) -> &str {
        self.client.default_namespace()
    }

    fn dynamic_api(&self, namespace: &str, resource: &ApiResource) -> Api<DynamicObject> {
        if namespace == ALL_NAMESPACES {
            Api::all_with(self.client.clone(), resource)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, resource)
        }
    }

    fn pod_api(&self, namespace: &str) -> Api<Pod> {
        if namespace == ALL_NAMESPACES {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        }
    }

    async fn find_pod(&self, namespace: &str, pod_filter: &Regex) -> Result<String, ClusterError> {
        let pods = self.pod_api(namespace).list(&ListParams::default()).await?;
        pods.items
            .into_iter()
            .filter_map(|pod| pod.metadata.name)
            .find(|name| pod_filter.is_match(name))
            .ok_or_else(|| ClusterError::NoMatchingPod {
                pattern: pod_filter.to_string(),
                namespace: namespace.to_string(),
            })
    }
}

#[async_trait]
impl ClusterWatch for KubernetesProvider {
    fn watch_pods(&self, namespace: &str, name_filter: Regex, cancel: CancellationToken) -> WatchStream {
        let api = self.dynamic_api(namespace, &ApiResource::erase::<Pod>(&()));
        spawn_filtered_watch(api, "pods", WatchFilter::Name(name_filter), cancel)
    }

    fn watch_events(&self, namespace: &str, subject_filter: Regex, cancel: CancellationToken) -> WatchStream {
        let api = self.dynamic_api(namespace, &ApiResource::erase::<Event>(&()));
        let filter = WatchFilter::Subject {
            name: subject_filter,
            kind: "Pod".to_string(),
        };
        spawn_filtered_watch(api, "events", filter, cancel)
    }

    async fn list_running_pods(
        &self,
        namespaces: &[String],
        name_filter: &Regex,
    ) -> Result<Vec<Pod>, ClusterError> {
        let params = ListParams::default().fields("status.phase=Running");
        let mut matching = Vec::new();

        for namespace in namespaces {
            let pods = self.pod_api(namespace).list(&params).await?;
            matching.extend(pods.items.into_iter().filter(|pod| {
                pod.metadata
                    .name
                    .as_deref()
                    .is_some_and(|name| name_filter.is_match(name))
            }));
        }

        Ok(matching)
    }
}

#[async_trait]
impl TunnelProvider for KubernetesProvider {
    async fn open_service_proxy(
        &self,
        namespace: &str,
        service: &str,
        host: &str,
        local_port: u16,
        cancel: &CancellationToken,
    ) -> Result<TunnelHandle, ClusterError> {
        let listener = bind_listener(host, local_port).await?;
        debug!(namespace, service, host, local_port, "Service proxy listening");
        Ok(serve_service_proxy(
            self.client.clone(),
            namespace,
            service,
            listener,
            cancel.child_token(),
        ))
    }

    async fn open_port_forward(
        &self,
        namespace: &str,
        pod_filter: &Regex,
        host: &str,
        local_port: u16,
        remote_port: u16,
        cancel: &CancellationToken,
    ) -> Result<TunnelHandle, ClusterError> {
        let pod_name = self.find_pod(namespace, pod_filter).await?;
        let listener = bind_listener(host, local_port).await?;
        info!(pod = %pod_name, namespace, local_port, remote_port, "Port-forwarding");
        Ok(serve_port_forward(
            self.pod_api(namespace),
            pod_name,
            remote_port,
            listener,
            cancel.child_token(),
        ))
    }
}
