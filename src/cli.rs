use clap::{ArgAction, Parser};
use std::path::PathBuf;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "tapline")]
#[command(about = "Bring up a Hub/Front/Worker traffic tap in a Kubernetes cluster")]
#[command(version)]
pub struct Args {
    /// Regex selecting the pods to tap
    #[arg(value_name = "POD_REGEX")]
    pub pod_regex: Option<String>,

    /// Enable verbose logging output (-v, -vv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Path to the config file (default: ~/.tapline/config.yaml)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Namespaces to target (repeatable)
    #[arg(short, long = "namespace", value_name = "NAMESPACE")]
    pub namespaces: Vec<String>,

    /// Target every namespace
    #[arg(short = 'A', long)]
    pub all_namespaces: bool,

    /// Namespace for the Hub, Front and Worker resources
    #[arg(short = 's', long, value_name = "NAMESPACE")]
    pub self_namespace: Option<String>,

    /// Per-node storage limit, e.g. 500MB or 1GiB
    #[arg(long, value_name = "SIZE")]
    pub storage_limit: Option<String>,

    /// Preview the targeted pods without deploying anything
    #[arg(long)]
    pub dry_run: bool,

    /// Never open a browser
    #[arg(long)]
    pub headless: bool,

    /// Dump the Hub and Front logs before teardown
    #[arg(long)]
    pub dump_logs: bool,

    /// Multi-document YAML with the Hub/Front resources to create
    #[arg(long, value_name = "FILE")]
    pub manifests: Option<String>,

    /// Local address the proxies bind to
    #[arg(long, value_name = "HOST")]
    pub proxy_host: Option<String>,

    /// Local port for the Hub
    #[arg(long, value_name = "PORT")]
    pub hub_port: Option<u16>,

    /// Local port for the Front
    #[arg(short = 'p', long, value_name = "PORT")]
    pub front_port: Option<u16>,

    /// Seconds the Hub and Front pods get to start running
    #[arg(long, value_name = "SECONDS")]
    pub ready_timeout: Option<u64>,

    /// Path to the kubeconfig file
    #[arg(short, long, value_name = "FILE")]
    pub kubeconfig: Option<String>,

    /// Kubeconfig context to use
    #[arg(long, value_name = "NAME")]
    pub context: Option<String>,
}

impl Args {
    /// Logging filter implied by `-v` when `RUST_LOG` is unset
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }

    /// Overlay every flag that was given onto `config`
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(ref regex) = self.pod_regex {
            config.tap.pod_regex = regex.clone();
        }
        if !self.namespaces.is_empty() {
            config.tap.namespaces = self.namespaces.clone();
        }
        if self.all_namespaces {
            config.tap.all_namespaces = true;
        }
        if let Some(ref namespace) = self.self_namespace {
            config.self_namespace = namespace.clone();
        }
        if let Some(ref limit) = self.storage_limit {
            config.tap.storage_limit = limit.clone();
        }
        if self.dry_run {
            config.tap.dry_run = true;
        }
        if self.headless {
            config.headless = true;
        }
        if self.dump_logs {
            config.dump_logs = true;
        }
        if let Some(ref manifests) = self.manifests {
            config.tap.manifests = Some(manifests.clone());
        }
        if let Some(ref host) = self.proxy_host {
            config.tap.proxy.host = host.clone();
        }
        if let Some(port) = self.hub_port {
            config.tap.proxy.hub.src_port = port;
        }
        if let Some(port) = self.front_port {
            config.tap.proxy.front.src_port = port;
        }
        if let Some(secs) = self.ready_timeout {
            config.tap.ready_timeout_secs = secs;
        }
        if let Some(ref path) = self.kubeconfig {
            config.kube.config_path = Some(path.clone());
        }
        if let Some(ref context) = self.context {
            config.kube.context = Some(context.clone());
        }
    }
}
