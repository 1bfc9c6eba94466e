use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tapline::cli::Args;
use tapline::cluster::{
    KubernetesProvider, KubernetesProvisioner, ManifestBundle, PodSetSyncer, SyncerConfig,
};
use tapline::config::{default_config_path, load_config_file, Config};
use tapline::runtime::{resolve_target_namespaces, run_tap, Session, TapDeps};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_filter())),
        )
        .init();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = load_config_file(&path)
        .with_context(|| format!("Failed to load config file {}", path.display()))?;
    args.apply_overrides(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn run(args: Args) -> Result<()> {
    let config = load_config(&args)?;

    let kube_path = config.kube.resolved_path();
    let provider = Arc::new(
        KubernetesProvider::from_config(kube_path.as_deref(), config.kube.context.as_deref())
            .await
            .context("Failed to connect to the cluster")?,
    );

    let target_namespaces = resolve_target_namespaces(&config.tap, provider.current_namespace());
    let session = Session::start(target_namespaces.clone());

    let bundle = config
        .tap
        .manifests_path()
        .map(|path| ManifestBundle::load(&path))
        .transpose()
        .context("Failed to load manifests")?;
    let provisioner = Arc::new(KubernetesProvisioner::new(
        provider.client().clone(),
        &config.self_namespace,
        config.is_ns_restricted_mode(),
        bundle,
    ));

    let controller = Arc::new(PodSetSyncer::new(
        provider.clone(),
        SyncerConfig {
            target_namespaces,
            pod_regex: config.tap.pod_regex()?,
            self_namespace: config.self_namespace.clone(),
        },
    ));

    let deps = TapDeps {
        cluster: provider.clone(),
        tunnels: provider,
        provisioner,
        controller,
    };

    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for interrupt");
            std::future::pending::<()>().await;
        }
    };

    run_tap(&config, session, deps, interrupt).await?;
    info!("Done");
    Ok(())
}
