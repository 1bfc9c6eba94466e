use std::path::PathBuf;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::size::parse_human_size;
use super::ConfigError;

/// Default namespace for the tool's own resources. Any other value puts the
/// tool into namespace-restricted mode.
pub const DEFAULT_SELF_NAMESPACE: &str = "tapline";

/// Default local/remote ports for the Hub proxy
pub const DEFAULT_HUB_SRC_PORT: u16 = 8898;
pub const DEFAULT_HUB_DST_PORT: u16 = 8898;

/// Default local/remote ports for the Front proxy
pub const DEFAULT_FRONT_SRC_PORT: u16 = 8899;
pub const DEFAULT_FRONT_DST_PORT: u16 = 80;

/// Default deadline for the Hub and Front pods to reach the running phase
pub const DEFAULT_READY_TIMEOUT_SECS: u64 = 120;

/// The complete configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tap: TapConfig,

    #[serde(default)]
    pub kube: KubeConfig,

    /// Namespace the Hub, Front and Worker resources live in
    #[serde(rename = "selfnamespace", default = "default_self_namespace")]
    pub self_namespace: String,

    /// Dump Hub/Front logs to disk before teardown
    #[serde(rename = "dumplogs", default)]
    pub dump_logs: bool,

    /// Never open a browser
    #[serde(default)]
    pub headless: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tap: TapConfig::default(),
            kube: KubeConfig::default(),
            self_namespace: default_self_namespace(),
            dump_logs: false,
            headless: false,
        }
    }
}

impl Config {
    /// Namespace-restricted mode: the tool may only touch its own namespace
    pub fn is_ns_restricted_mode(&self) -> bool {
        self.self_namespace != DEFAULT_SELF_NAMESPACE
    }

    /// Validate every field that is parsed lazily elsewhere
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tap.validate()
    }
}

/// Kubeconfig selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KubeConfig {
    #[serde(rename = "configpath", default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl KubeConfig {
    /// Resolve the kubeconfig path: explicit value, then `$KUBECONFIG`, then
    /// `~/.kube/config`. `None` means "let the client infer".
    pub fn resolved_path(&self) -> Option<PathBuf> {
        if let Some(ref path) = self.config_path {
            return Some(PathBuf::from(shellexpand::tilde(path).into_owned()));
        }
        if let Ok(path) = std::env::var("KUBECONFIG") {
            if !path.is_empty() {
                return Some(PathBuf::from(path));
            }
        }
        dirs::home_dir()
            .map(|home| home.join(".kube").join("config"))
            .filter(|path| path.exists())
    }
}

/// A local/remote port pair for one reachability target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPair {
    #[serde(rename = "src-port")]
    pub src_port: u16,
    #[serde(rename = "dst-port")]
    pub dst_port: u16,
}

/// Proxy settings for the Hub and Front
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_hub_ports")]
    pub hub: PortPair,

    #[serde(default = "default_front_ports")]
    pub front: PortPair,

    #[serde(default = "default_proxy_host")]
    pub host: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            hub: default_hub_ports(),
            front: default_front_ports(),
            host: default_proxy_host(),
        }
    }
}

/// Settings of the `tap` command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapConfig {
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Regex selecting the pods to capture
    #[serde(rename = "regex", default = "default_pod_regex")]
    pub pod_regex: String,

    #[serde(default)]
    pub namespaces: Vec<String>,

    #[serde(rename = "allnamespaces", default)]
    pub all_namespaces: bool,

    /// Human-readable per-node storage ceiling, e.g. "200MB"
    #[serde(rename = "storagelimit", default = "default_storage_limit")]
    pub storage_limit: String,

    #[serde(rename = "dryrun", default)]
    pub dry_run: bool,

    /// Multi-document YAML with the Hub/Front resources to create
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifests: Option<String>,

    #[serde(rename = "ready-timeout", default = "default_ready_timeout")]
    pub ready_timeout_secs: u64,
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            pod_regex: default_pod_regex(),
            namespaces: Vec::new(),
            all_namespaces: false,
            storage_limit: default_storage_limit(),
            dry_run: false,
            manifests: None,
            ready_timeout_secs: DEFAULT_READY_TIMEOUT_SECS,
        }
    }
}

impl TapConfig {
    pub fn pod_regex(&self) -> Result<Regex, ConfigError> {
        Regex::new(&self.pod_regex).map_err(|e| ConfigError::InvalidRegex {
            pattern: self.pod_regex.clone(),
            reason: e.to_string(),
        })
    }

    pub fn storage_limit_bytes(&self) -> Result<i64, ConfigError> {
        parse_human_size(&self.storage_limit)
    }

    pub fn manifests_path(&self) -> Option<PathBuf> {
        self.manifests
            .as_ref()
            .map(|path| PathBuf::from(shellexpand::tilde(path).into_owned()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pod_regex()?;
        self.storage_limit_bytes()?;
        Ok(())
    }
}

fn default_self_namespace() -> String {
    DEFAULT_SELF_NAMESPACE.to_string()
}

fn default_hub_ports() -> PortPair {
    PortPair {
        src_port: DEFAULT_HUB_SRC_PORT,
        dst_port: DEFAULT_HUB_DST_PORT,
    }
}

fn default_front_ports() -> PortPair {
    PortPair {
        src_port: DEFAULT_FRONT_SRC_PORT,
        dst_port: DEFAULT_FRONT_DST_PORT,
    }
}

fn default_proxy_host() -> String {
    "127.0.0.1".to_string()
}

fn default_pod_regex() -> String {
    ".*".to_string()
}

fn default_storage_limit() -> String {
    "200MB".to_string()
}

fn default_ready_timeout() -> u64 {
    DEFAULT_READY_TIMEOUT_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.self_namespace, "tapline");
        assert!(!config.is_ns_restricted_mode());
        assert_eq!(config.tap.proxy.hub.src_port, 8898);
        assert_eq!(config.tap.proxy.front.dst_port, 80);
        assert_eq!(config.tap.ready_timeout_secs, 120);
        assert_eq!(config.tap.storage_limit_bytes().unwrap(), 200_000_000);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
selfnamespace: team-a
tap:
  regex: "^web-"
  proxy:
    front:
      src-port: 9000
      dst-port: 8080
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.is_ns_restricted_mode());
        assert_eq!(config.tap.proxy.front.src_port, 9000);
        assert_eq!(config.tap.proxy.hub.src_port, DEFAULT_HUB_SRC_PORT);
        assert_eq!(config.tap.proxy.host, "127.0.0.1");
        assert!(config.tap.pod_regex().unwrap().is_match("web-1"));
    }

    #[test]
    fn test_validate_rejects_bad_regex() {
        let mut config = Config::default();
        config.tap.pod_regex = "(".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRegex { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_storage_limit() {
        let mut config = Config::default();
        config.tap.storage_limit = "lots".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSize(_))
        ));
    }

    #[test]
    fn test_explicit_kubeconfig_path_wins() {
        let kube = KubeConfig {
            config_path: Some("/tmp/kubeconfig".to_string()),
            context: None,
        };
        assert_eq!(kube.resolved_path(), Some(PathBuf::from("/tmp/kubeconfig")));
    }
}
