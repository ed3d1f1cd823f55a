use serde_json::Value;
use simhub_transport::{Connection, TransportError};
use simhub_wire::{Envelope, EnvelopeOption, Kind};
use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{ClientConfig, ClientError, Result};

/// Connected simhub client.
///
/// ```no_run
/// use simhub_client::{Client, ClientConfig};
/// use serde_json::json;
///
/// async fn chat() -> simhub_client::Result<()> {
///     let addr = "127.0.0.1:9000".parse().expect("addr");
///     let client = Client::connect(addr, ClientConfig::default()).await?;
///     client.login("token").await?;
///     client.subscribe("room1").await?;
///     client.publish("room1", json!({ "msg": "hi" })).await?;
///     while let Some(envelope) = client.next_envelope().await {
///         println!("{envelope:?}");
///     }
///     Ok(())
/// }
/// ```
pub struct Client {
    connection: Connection,
    inbox: Mutex<Inbox>,
    reader: JoinHandle<()>,
    config: ClientConfig,
}

struct Inbox {
    rx: mpsc::Receiver<Envelope>,
    // Envelopes read past while waiting for a login verdict.
    backlog: VecDeque<Envelope>,
}

impl Client {
    pub async fn connect(addr: SocketAddr, config: ClientConfig) -> Result<Self> {
        let connection = Connection::connect(addr, config.transport.clone()).await?;
        debug!(%addr, "client connected");
        let (tx, rx) = mpsc::channel(config.inbox_depth.max(1));
        let reader = tokio::spawn(read_envelopes(connection.clone(), tx));
        Ok(Self {
            connection,
            inbox: Mutex::new(Inbox {
                rx,
                backlog: VecDeque::new(),
            }),
            reader,
            config,
        })
    }

    /// Logs in and returns the name the broker authenticated.
    pub async fn login(&self, access_token: &str) -> Result<String> {
        self.send(&Envelope::login(access_token)).await?;
        let verdict = tokio::time::timeout(self.config.request_timeout, self.next_verdict())
            .await
            .map_err(|_| ClientError::Timeout)??;
        let data = verdict.data_object();
        if verdict.is(EnvelopeOption::Error) {
            let message = data
                .and_then(|data| data.get("error"))
                .and_then(Value::as_str)
                .unwrap_or("login rejected");
            return Err(ClientError::Rejected(message.to_string()));
        }
        Ok(data
            .and_then(|data| data.get("user"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    pub async fn subscribe(&self, topic: &str) -> Result<()> {
        self.send(&Envelope::subscribe(topic)).await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.send(&Envelope::unsubscribe(topic)).await
    }

    pub async fn publish(&self, topic: &str, data: Value) -> Result<()> {
        self.send(&Envelope::publish(topic, data)).await
    }

    /// Sends an arbitrary envelope, acknowledged at the transport level.
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        self.connection.send(envelope.encode()?, true).await?;
        Ok(())
    }

    /// Next envelope from the broker other than heartbeats, or `None` once
    /// the connection has ended.
    pub async fn next_envelope(&self) -> Option<Envelope> {
        let mut inbox = self.inbox.lock().await;
        if let Some(envelope) = inbox.backlog.pop_front() {
            return Some(envelope);
        }
        inbox.rx.recv().await
    }

    pub async fn close(&self) {
        self.connection.close().await;
        self.reader.abort();
    }

    async fn next_verdict(&self) -> Result<Envelope> {
        let mut inbox = self.inbox.lock().await;
        loop {
            let envelope = inbox.rx.recv().await.ok_or(ClientError::Closed)?;
            if envelope.is(EnvelopeOption::Info) || envelope.is(EnvelopeOption::Error) {
                return Ok(envelope);
            }
            inbox.backlog.push_back(envelope);
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_envelopes(connection: Connection, inbox: mpsc::Sender<Envelope>) {
    let pong = match Envelope::pong().encode() {
        Ok(pong) => pong,
        Err(err) => {
            tracing::warn!(error = %err, "failed to encode pong");
            return;
        }
    };
    loop {
        let received = match connection.receive().await {
            Ok(received) => received,
            Err(err @ (TransportError::Closed | TransportError::EndOfStream)) => {
                debug!(reason = %err, "broker connection ended");
                break;
            }
            Err(err) => {
                tracing::warn!(error = %err, "broker connection failed");
                break;
            }
        };
        if received.kind != Kind::Data {
            continue;
        }
        let envelope = match Envelope::decode(&received.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(error = %err, "dropping undecodable envelope");
                continue;
            }
        };
        if envelope.is(EnvelopeOption::Ping) {
            if let Err(err) = connection.send(pong.clone(), false).await {
                debug!(error = %err, "failed to answer ping");
                break;
            }
            continue;
        }
        if inbox.send(envelope).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use serde_json::json;
    use simhub_transport::{TcpServer, TransportConfig};
    use std::time::Duration;

    async fn broker_side() -> Result<(TcpServer, SocketAddr)> {
        let server = TcpServer::bind("127.0.0.1:0".parse()?, TransportConfig::default()).await?;
        let addr = server.local_addr()?;
        Ok((server, addr))
    }

    async fn next_data(connection: &Connection) -> Result<Envelope> {
        loop {
            let received = connection.receive().await?;
            if received.kind == Kind::Data {
                return Ok(Envelope::decode(&received.payload)?);
            }
        }
    }

    async fn send(connection: &Connection, envelope: Envelope) -> Result<()> {
        connection.send(envelope.encode()?, true).await?;
        Ok(())
    }

    #[tokio::test]
    async fn ping_envelopes_are_answered_and_not_surfaced() -> Result<()> {
        let (server, addr) = broker_side().await?;
        let (client, broker) = tokio::join!(Client::connect(addr, ClientConfig::default()), server.accept());
        let (client, broker) = (client?, broker?);

        send(&broker, Envelope::ping()).await?;
        send(&broker, Envelope::info("after ping")).await?;
        let reply = tokio::time::timeout(Duration::from_secs(1), next_data(&broker)).await??;
        assert!(reply.is(EnvelopeOption::Pong));
        let surfaced = tokio::time::timeout(Duration::from_secs(1), client.next_envelope())
            .await?
            .expect("envelope");
        assert_eq!(surfaced, Envelope::info("after ping"));
        Ok(())
    }

    #[tokio::test]
    async fn login_maps_error_to_rejected_and_keeps_backlog() -> Result<()> {
        let (server, addr) = broker_side().await?;
        let (client, broker) = tokio::join!(Client::connect(addr, ClientConfig::default()), server.accept());
        let (client, broker) = (client?, broker?);

        let broker_task = tokio::spawn(async move {
            let login = next_data(&broker).await?;
            assert!(login.is(EnvelopeOption::Login));
            send(&broker, Envelope::publish("room1", json!(1))).await?;
            send(&broker, Envelope::error("login failed: unknown access token")).await?;
            anyhow::Ok(broker)
        });
        let err = client.login("bad").await.expect_err("rejected");
        assert!(matches!(err, ClientError::Rejected(ref msg) if msg.contains("unknown")));
        let _broker = broker_task.await??;

        let held = client.next_envelope().await.expect("backlog");
        assert!(held.is(EnvelopeOption::Publish));
        Ok(())
    }

    #[tokio::test]
    async fn login_returns_user_name() -> Result<()> {
        let (server, addr) = broker_side().await?;
        let (client, broker) = tokio::join!(Client::connect(addr, ClientConfig::default()), server.accept());
        let (client, broker) = (client?, broker?);

        let broker_task = tokio::spawn(async move {
            next_data(&broker).await?;
            let verdict = Envelope::new(
                EnvelopeOption::Info,
                Some(json!({ "msg": "login success", "user": "alice" })),
            );
            send(&broker, verdict).await?;
            anyhow::Ok(broker)
        });
        assert_eq!(client.login("T1").await?, "alice");
        let _broker = broker_task.await??;
        Ok(())
    }

    #[tokio::test]
    async fn login_times_out_without_verdict() -> Result<()> {
        let (server, addr) = broker_side().await?;
        let config = ClientConfig {
            request_timeout: Duration::from_millis(50),
            ..ClientConfig::default()
        };
        let (client, broker) = tokio::join!(Client::connect(addr, config), server.accept());
        let (client, _broker) = (client?, broker?);
        assert!(matches!(client.login("T1").await, Err(ClientError::Timeout)));
        Ok(())
    }

    #[tokio::test]
    async fn next_envelope_ends_when_broker_closes() -> Result<()> {
        let (server, addr) = broker_side().await?;
        let (client, broker) = tokio::join!(Client::connect(addr, ClientConfig::default()), server.accept());
        let (client, broker) = (client?, broker?);
        broker.close().await;
        let next = tokio::time::timeout(Duration::from_secs(1), client.next_envelope()).await?;
        assert!(next.is_none());
        client.close().await;
        Ok(())
    }
}
