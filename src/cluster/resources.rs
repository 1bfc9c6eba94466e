//! Hub/Front resource provisioning and teardown
//!
//! Resources come from a multi-document YAML bundle. Without a bundle the
//! provisioner attaches to resources that are already deployed.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Namespace, Pod, Service, ServiceAccount};
use kube::api::{DeleteParams, LogParams, PostParams};
use kube::{Api, Client};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{ClusterError, FRONT_POD_NAME, HUB_POD_NAME, SERVICE_ACCOUNT_NAME};

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error(transparent)]
    Failed(#[from] ClusterError),
}

/// What the provisioner reports back to the bring-up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProvisionOutcome {
    pub service_account_exists: bool,
}

// ============================================================================
// SBIO: Trait for abstraction (allows mocking in tests)
// ============================================================================

#[async_trait]
pub trait ResourceProvisioner: Send + Sync {
    async fn create_hub_resources(&self) -> Result<ProvisionOutcome, ProvisionError>;

    /// Write the Hub and Front logs to `path`
    async fn dump_logs(&self, path: &Path) -> Result<(), ClusterError>;

    /// Delete what `create_hub_resources` created
    async fn clean_up(&self) -> Result<(), ClusterError>;
}

// ============================================================================
// SBIO: Pure manifest parsing (no I/O)
// ============================================================================

#[derive(Debug, Clone)]
pub enum ManifestObject {
    ServiceAccount(ServiceAccount),
    Pod(Pod),
    Service(Service),
}

impl ManifestObject {
    pub fn kind(&self) -> &'static str {
        match self {
            ManifestObject::ServiceAccount(_) => "ServiceAccount",
            ManifestObject::Pod(_) => "Pod",
            ManifestObject::Service(_) => "Service",
        }
    }

    pub fn name(&self) -> &str {
        let name = match self {
            ManifestObject::ServiceAccount(sa) => &sa.metadata.name,
            ManifestObject::Pod(pod) => &pod.metadata.name,
            ManifestObject::Service(svc) => &svc.metadata.name,
        };
        name.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ManifestBundle {
    pub objects: Vec<ManifestObject>,
}

impl ManifestBundle {
    pub fn parse(content: &str) -> Result<Self, ClusterError> {
        let mut objects = Vec::new();

        for (index, document) in serde_yaml::Deserializer::from_str(content).enumerate() {
            let value = serde_yaml::Value::deserialize(document)
                .map_err(|e| ClusterError::Manifest(format!("document {}: {}", index, e)))?;
            if value.is_null() {
                continue;
            }

            let kind = value
                .get("kind")
                .and_then(serde_yaml::Value::as_str)
                .unwrap_or_default()
                .to_string();
            let object = match kind.as_str() {
                "ServiceAccount" => ManifestObject::ServiceAccount(typed(value, index)?),
                "Pod" => ManifestObject::Pod(typed(value, index)?),
                "Service" => ManifestObject::Service(typed(value, index)?),
                other => {
                    return Err(ClusterError::Manifest(format!(
                        "document {}: unsupported kind '{}'",
                        index, other
                    )))
                }
            };

            if object.name().is_empty() {
                return Err(ClusterError::Manifest(format!(
                    "document {}: {} has no name",
                    index,
                    object.kind()
                )));
            }
            objects.push(object);
        }

        Ok(Self { objects })
    }

    pub fn load(path: &Path) -> Result<Self, ClusterError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn has_service_account(&self) -> bool {
        self.objects.iter().any(|object| {
            matches!(object, ManifestObject::ServiceAccount(_)) && object.name() == SERVICE_ACCOUNT_NAME
        })
    }
}

fn typed<T: serde::de::DeserializeOwned>(value: serde_yaml::Value, index: usize) -> Result<T, ClusterError> {
    serde_yaml::from_value(value).map_err(|e| ClusterError::Manifest(format!("document {}: {}", index, e)))
}

/// `<folder>/tapline_logs_<timestamp>.log`
pub fn log_dump_path(folder: &Path, now: DateTime<Utc>) -> PathBuf {
    folder.join(format!("tapline_logs_{}.log", now.format("%Y_%m_%d__%H_%M_%S")))
}

// ============================================================================
// Kubernetes implementation
// ============================================================================

#[derive(Debug, Clone)]
enum Created {
    Namespace,
    Object { kind: &'static str, name: String },
}

pub struct KubernetesProvisioner {
    client: Client,
    namespace: String,
    ns_restricted: bool,
    bundle: Option<ManifestBundle>,
    created: Mutex<Vec<Created>>,
}

impl KubernetesProvisioner {
    pub fn new(client: Client, namespace: &str, ns_restricted: bool, bundle: Option<ManifestBundle>) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            ns_restricted,
            bundle,
            created: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, created: Created) {
        if let Ok(mut list) = self.created.lock() {
            list.push(created);
        }
    }

    async fn create_namespace(&self) -> Result<(), ProvisionError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace: Namespace = serde_json::from_value(serde_json::json!({
            "metadata": {"name": self.namespace}
        }))
        .map_err(|e| ClusterError::Manifest(e.to_string()))?;

        create_or_conflict(&api, &namespace, &format!("namespace {}", self.namespace)).await?;
        self.record(Created::Namespace);
        Ok(())
    }

    async fn create_object(&self, object: &ManifestObject) -> Result<(), ProvisionError> {
        let label = format!("{} {}", object.kind(), object.name());
        match object {
            ManifestObject::ServiceAccount(sa) => {
                let mut sa = sa.clone();
                sa.metadata.namespace = Some(self.namespace.clone());
                let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &self.namespace);
                create_or_conflict(&api, &sa, &label).await?;
            }
            ManifestObject::Pod(pod) => {
                let mut pod = pod.clone();
                pod.metadata.namespace = Some(self.namespace.clone());
                let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
                create_or_conflict(&api, &pod, &label).await?;
            }
            ManifestObject::Service(svc) => {
                let mut svc = svc.clone();
                svc.metadata.namespace = Some(self.namespace.clone());
                let api: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
                create_or_conflict(&api, &svc, &label).await?;
            }
        }

        info!(kind = object.kind(), name = object.name(), "Successfully created a resource");
        self.record(Created::Object {
            kind: object.kind(),
            name: object.name().to_string(),
        });
        Ok(())
    }

    async fn service_account_exists(&self) -> Result<bool, ClusterError> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &self.namespace);
        Ok(api.get_opt(SERVICE_ACCOUNT_NAME).await?.is_some())
    }

    async fn delete(&self, created: &Created) -> Result<(), ClusterError> {
        let params = DeleteParams::default();
        let result = match created {
            Created::Namespace => {
                let api: Api<Namespace> = Api::all(self.client.clone());
                api.delete(&self.namespace, &params).await.map(|_| ())
            }
            Created::Object { kind, name } => match *kind {
                "ServiceAccount" => Api::<ServiceAccount>::namespaced(self.client.clone(), &self.namespace)
                    .delete(name, &params)
                    .await
                    .map(|_| ()),
                "Pod" => Api::<Pod>::namespaced(self.client.clone(), &self.namespace)
                    .delete(name, &params)
                    .await
                    .map(|_| ()),
                _ => Api::<Service>::namespaced(self.client.clone(), &self.namespace)
                    .delete(name, &params)
                    .await
                    .map(|_| ()),
            },
        };

        match result {
            Ok(()) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn create_or_conflict<K>(api: &Api<K>, object: &K, label: &str) -> Result<(), ProvisionError>
where
    K: kube::Resource + Clone + serde::Serialize + serde::de::DeserializeOwned + std::fmt::Debug,
{
    match api.create(&PostParams::default(), object).await {
        Ok(_) => Ok(()),
        Err(e) => {
            let error = ClusterError::from(e);
            if error.is_already_exists() {
                Err(ProvisionError::AlreadyExists(label.to_string()))
            } else {
                Err(ProvisionError::Failed(error))
            }
        }
    }
}

#[async_trait]
impl ResourceProvisioner for KubernetesProvisioner {
    async fn create_hub_resources(&self) -> Result<ProvisionOutcome, ProvisionError> {
        let Some(bundle) = self.bundle.as_ref() else {
            info!(namespace = %self.namespace, "No manifest bundle given, attaching to deployed resources");
            let exists = self.service_account_exists().await?;
            return Ok(ProvisionOutcome {
                service_account_exists: exists,
            });
        };

        if !self.ns_restricted {
            self.create_namespace().await?;
        }

        for object in &bundle.objects {
            self.create_object(object).await?;
        }

        let service_account_exists = bundle.has_service_account() || self.service_account_exists().await?;
        if !service_account_exists {
            warn!(
                service_account = SERVICE_ACCOUNT_NAME,
                "Service account missing; target IPs will not be resolved to names"
            );
        }

        Ok(ProvisionOutcome {
            service_account_exists,
        })
    }

    async fn dump_logs(&self, path: &Path) -> Result<(), ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut dump = String::new();

        for pod in [HUB_POD_NAME, FRONT_POD_NAME] {
            match api.logs(pod, &LogParams::default()).await {
                Ok(logs) => {
                    dump.push_str(&format!("===== {} =====\n", pod));
                    dump.push_str(&logs);
                    dump.push('\n');
                }
                Err(e) => warn!(pod, error = %e, "Failed to fetch pod logs"),
            }
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, dump).await?;
        info!(path = %path.display(), "Dumped logs");
        Ok(())
    }

    async fn clean_up(&self) -> Result<(), ClusterError> {
        let created: Vec<Created> = self
            .created
            .lock()
            .map(|mut list| std::mem::take(&mut *list))
            .unwrap_or_default();

        let targets: Vec<Created> = if created.iter().any(|c| matches!(c, Created::Namespace)) {
            vec![Created::Namespace]
        } else {
            created.into_iter().rev().collect()
        };

        let mut last_error = None;
        for target in &targets {
            debug!(resource = ?target, "Removing resource");
            if let Err(e) = self.delete(target).await {
                warn!(resource = ?target, error = %e, "Failed to remove resource");
                last_error = Some(e);
            }
        }

        if targets.is_empty() {
            debug!("Nothing to clean up");
        } else {
            info!(namespace = %self.namespace, "Removed created resources");
        }

        last_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const BUNDLE: &str = r#"
apiVersion: v1
kind: ServiceAccount
metadata:
  name: tapline-service-account
---
apiVersion: v1
kind: Pod
metadata:
  name: tapline-hub
spec:
  containers:
    - name: hub
      image: example/hub:latest
---
apiVersion: v1
kind: Service
metadata:
  name: tapline-hub
spec:
  ports:
    - port: 80
      targetPort: 8898
---
"#;

    #[test]
    fn test_parse_bundle() {
        let bundle = ManifestBundle::parse(BUNDLE).unwrap();
        let kinds: Vec<_> = bundle.objects.iter().map(|o| (o.kind(), o.name())).collect();
        assert_eq!(
            kinds,
            vec![
                ("ServiceAccount", "tapline-service-account"),
                ("Pod", "tapline-hub"),
                ("Service", "tapline-hub"),
            ]
        );
        assert!(bundle.has_service_account());
    }

    #[test]
    fn test_parse_rejects_unsupported_kind() {
        let result = ManifestBundle::parse("kind: ClusterRole\nmetadata:\n  name: x\n");
        assert!(matches!(result, Err(ClusterError::Manifest(msg)) if msg.contains("ClusterRole")));
    }

    #[test]
    fn test_parse_rejects_nameless_object() {
        let result = ManifestBundle::parse("kind: Pod\nmetadata: {}\n");
        assert!(matches!(result, Err(ClusterError::Manifest(msg)) if msg.contains("no name")));
    }

    #[test]
    fn test_parse_empty_bundle() {
        let bundle = ManifestBundle::parse("").unwrap();
        assert!(bundle.objects.is_empty());
        assert!(!bundle.has_service_account());
    }

    #[test]
    fn test_log_dump_path() {
        let now = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        let path = log_dump_path(Path::new("/home/u/.tapline"), now);
        assert_eq!(
            path,
            PathBuf::from("/home/u/.tapline/tapline_logs_2026_03_04__05_06_07.log")
        );
    }
}
