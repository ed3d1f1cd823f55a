// TCP accept loop feeding new sessions into the hub.
use anyhow::{Context, Result};
use simhub_authz::TokenVerifier;
use simhub_broker::{Hub, HubWorkers};
use simhub_transport::TcpServer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::BrokerConfig;
use crate::session::{self, SessionConfig};

// Pause after a failed accept so persistent errors (fd exhaustion) do not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

pub async fn serve(server: Arc<TcpServer>, hub: Arc<Hub>, config: SessionConfig) -> Result<()> {
    let shutdown = hub.shutdown_token();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = server.accept() => accepted,
        };
        let connection = match accepted {
            Ok(connection) => connection,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };
        let peer = connection.info().peer_addr;
        let (session, outbound) = hub.open_session(peer);
        if let Err(err) = hub.register(session.clone()) {
            tracing::warn!(%peer, error = %err, "session rejected");
            connection.close().await;
            continue;
        }
        metrics::counter!("simhub_connections_accepted_total").increment(1);
        tracing::info!(session = %session.id(), %peer, "session opened");
        tokio::spawn(session::run(
            Arc::clone(&hub),
            connection,
            session,
            outbound,
            config.clone(),
        ));
    }
    tracing::info!("accept loop stopped");
    Ok(())
}

/// A broker bound and running in the background.
pub struct RunningBroker {
    pub hub: Arc<Hub>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<Result<()>>,
    workers: HubWorkers,
}

impl RunningBroker {
    pub async fn start(config: &BrokerConfig, verifier: Arc<dyn TokenVerifier>) -> Result<Self> {
        let hub = Hub::new(config.hub(), verifier);
        let workers = hub.start().context("start hub workers")?;
        let server = TcpServer::bind(config.bind, config.transport())
            .await
            .with_context(|| format!("bind TCP listener on {}", config.bind))?;
        let local_addr = server.local_addr().context("read TCP local address")?;
        tracing::info!(addr = %local_addr, "tcp listener started");
        let accept_task = tokio::spawn(serve(Arc::new(server), Arc::clone(&hub), config.session()));
        Ok(Self {
            hub,
            local_addr,
            accept_task,
            workers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, closes every session and waits for the hub tasks.
    pub async fn shutdown(self) -> Result<()> {
        self.hub.shutdown();
        let accepted = self.accept_task.await.context("join accept loop")?;
        self.workers.join().await;
        accepted
    }
}
