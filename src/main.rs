use clap::Parser;
use prism_gateway::balancer::health::HealthSupervisor;
use prism_gateway::config::etcd::EtcdSource;
use prism_gateway::config::GatewayConfig;
use prism_gateway::router::RouterManager;
use prism_gateway::server::Gateway;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "prism-gateway", version, about)]
struct Cli {
    /// Path to the gateway configuration file
    #[arg(long = "conf", default_value = "config/gateway.yaml")]
    conf: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Prism Gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = GatewayConfig::from_file(&cli.conf)?;
    tracing::info!(config = %cli.conf, "configuration loaded");

    let supervisor = Arc::new(HealthSupervisor::new(Gateway::health_interval(&config)));

    let router = if config.config_source.source_type == "etcd"
        && !config.config_source.etcd.endpoints.is_empty()
    {
        let etcd = &config.config_source.etcd;
        let mut source = EtcdSource::connect(&etcd.endpoints).await?;
        let upstreams = source.fetch_upstreams(&etcd.key).await?;
        tracing::info!(key = %etcd.key, upstreams = upstreams.len(), "upstreams fetched from etcd");
        let router = Arc::new(RouterManager::new(&upstreams, supervisor));

        if etcd.watch {
            let watch_router = Arc::clone(&router);
            let key = etcd.key.clone();
            let cancel = CancellationToken::new();
            tokio::spawn(async move {
                tracing::info!(key = %key, "watching etcd for upstream updates");
                let result = source
                    .watch_upstreams(key.clone(), cancel, move |upstreams| {
                        tracing::info!(upstreams = upstreams.len(), "upstreams updated from etcd");
                        watch_router.update_upstreams(&upstreams);
                    })
                    .await;
                if let Err(e) = result {
                    tracing::error!(key = %key, error = %e, "etcd watch stopped");
                }
            });
        }
        router
    } else {
        Arc::new(RouterManager::new(&config.upstreams, supervisor))
    };

    let gateway = Arc::new(Gateway::new(&config, Arc::clone(&router))?);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(
        shutdown.clone(),
        Arc::clone(&router),
        cli.conf.clone(),
        config.config_source.source_type.clone(),
    )?;

    gateway.run(shutdown).await?;
    Ok(())
}

/// SIGINT/SIGTERM trigger graceful shutdown; SIGHUP reloads the file config.
fn spawn_signal_handler(
    shutdown: CancellationToken,
    router: Arc<RouterManager>,
    conf_path: String,
    source_type: String,
) -> anyhow::Result<()> {
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("SIGINT received, shutting down");
                    shutdown.cancel();
                    return;
                }
                _ = sigterm.recv() => {
                    tracing::info!("SIGTERM received, shutting down");
                    shutdown.cancel();
                    return;
                }
                _ = sighup.recv() => {
                    tracing::info!("SIGHUP received, reloading configuration");
                    if source_type != "file" {
                        tracing::info!("SIGHUP reload only applies to the file config source, ignoring");
                        continue;
                    }
                    match GatewayConfig::from_file(&conf_path) {
                        Ok(new_config) => {
                            router.update_upstreams(&new_config.upstreams);
                            tracing::info!("configuration reloaded, upstreams updated");
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "config reload failed, keeping previous table");
                        }
                    }
                }
            }
        }
    });

    Ok(())
}
