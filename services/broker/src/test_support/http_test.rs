// HTTP helpers for the metrics endpoint tests:
// - strict client timeouts and no_proxy to prevent localhost hijacking
// - readiness polling instead of sleep
use anyhow::{Context, Result};
use reqwest::{Client, redirect::Policy};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

pub fn build_test_client() -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(1))
        .no_proxy()
        .redirect(Policy::none())
        .build()
        .context("build test http client")
}

pub async fn wait_for_listen(addr: SocketAddr) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(1);
    loop {
        match tokio::net::TcpStream::connect(addr).await {
            Ok(_) => return Ok(()),
            Err(err) => {
                if Instant::now() >= deadline {
                    return Err(anyhow::anyhow!("server not ready at {addr}: {err}"));
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

pub async fn get_text(client: &Client, url: &str) -> Result<(u16, String)> {
    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("GET {url}"))?;
    let status = response.status().as_u16();
    let body = response.text().await.with_context(|| format!("read body {url}"))?;
    Ok((status, body))
}
