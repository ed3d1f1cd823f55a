// Broker service main entry point.
use anyhow::{Context, Result};
use broker::config::BrokerConfig;
use broker::{RunningBroker, observability};
use clap::Parser;
use simhub_authz::JwtVerifier;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Message broker for simulation clients.
#[derive(Debug, Parser)]
#[command(name = "simhub-broker", version)]
struct Cli {
    /// Listen address; overrides SIMHUB_BIND together with PORT.
    addr: Option<IpAddr>,
    /// Listen port.
    port: Option<u16>,
}

impl Cli {
    fn apply(&self, config: &mut BrokerConfig) {
        if let Some(addr) = self.addr {
            config.bind = SocketAddr::new(addr, self.port.unwrap_or(config.bind.port()));
        } else if let Some(port) = self.port {
            config.bind.set_port(port);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let metrics_handle = observability::init_observability("simhub-broker")?;
    let mut config = BrokerConfig::from_env_or_yaml()?;
    cli.apply(&mut config);

    if let Some(metrics_bind) = config.metrics_bind {
        tokio::spawn(async move {
            if let Err(err) = observability::serve_metrics(metrics_handle, metrics_bind).await {
                tracing::warn!(error = %err, "metrics listener exited");
            }
        });
    }

    run_with_shutdown(config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

async fn run_with_shutdown<F>(config: BrokerConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let secret = config
        .token_secret
        .as_deref()
        .context("SIMHUB_TOKEN_SECRET must be set")?;
    let verifier = JwtVerifier::new(secret).context("build token verifier")?;
    let broker = RunningBroker::start(&config, Arc::new(verifier)).await?;
    tracing::info!(addr = %broker.local_addr(), "broker started");

    // Block until SIGINT so the process stays alive.
    shutdown.await;
    broker.shutdown().await?;
    tracing::info!("broker stopped");
    Ok(())
}
