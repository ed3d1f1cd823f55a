// Per-connection session: read, write and heartbeat loops under one supervisor.
use anyhow::{Context, Result};
use bytes::Bytes;
use simhub_broker::{Enqueue, Hub, Inbound, SessionHandle};
use simhub_transport::Connection;
use simhub_wire::{Envelope, Kind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;

// Bound on writing the login-timeout notice to a peer that may not be reading.
const NOTICE_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub heartbeat_interval: Duration,
    pub pong_timeout: Duration,
    pub login_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(40),
            login_timeout: Duration::from_secs(50),
        }
    }
}

/// Why a session loop returned without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    PeerClosed,
    Cancelled,
    QueueClosed,
    HeartbeatTimeout,
    LoginTimeout,
}

/// Runs a registered session to completion.
///
/// The first loop to finish decides the outcome. The session and the
/// connection are then closed, which unblocks the remaining loops even when
/// the peer has stopped reading; they are drained and the hub notified.
pub async fn run(
    hub: Arc<Hub>,
    connection: Connection,
    session: SessionHandle,
    outbound: mpsc::Receiver<Bytes>,
    config: SessionConfig,
) {
    let id = session.id();
    let peer = session.peer();
    let mut loops = JoinSet::new();
    loops.spawn({
        let (hub, connection, session) = (Arc::clone(&hub), connection.clone(), session.clone());
        async move { ("read", read_loop(hub, connection, session).await) }
    });
    loops.spawn({
        let (connection, session) = (connection.clone(), session.clone());
        async move { ("write", write_loop(connection, session, outbound).await) }
    });
    loops.spawn({
        let (connection, session) = (connection.clone(), session.clone());
        async move { ("heartbeat", heartbeat_loop(connection, session, config).await) }
    });

    match loops.join_next().await {
        Some(Ok((name, Ok(exit)))) => {
            tracing::info!(session = %id, %peer, task = name, reason = ?exit, "session ending");
        }
        Some(Ok((name, Err(err)))) => {
            tracing::warn!(session = %id, %peer, task = name, error = %format!("{err:#}"), "session loop failed");
        }
        Some(Err(err)) => {
            tracing::warn!(session = %id, %peer, error = %err, "session loop panicked");
        }
        None => {}
    }

    session.close();
    connection.close().await;
    while let Some(joined) = loops.join_next().await {
        if let Ok((name, Err(err))) = joined {
            tracing::debug!(session = %id, task = name, error = %format!("{err:#}"), "loop error during close");
        }
    }
    hub.notify_closed(id);
    tracing::info!(session = %id, %peer, "session closed");
}

async fn read_loop(hub: Arc<Hub>, connection: Connection, session: SessionHandle) -> Result<LoopExit> {
    loop {
        let received = tokio::select! {
            _ = session.closed() => return Ok(LoopExit::Cancelled),
            received = connection.receive() => received,
        };
        let received = match received {
            Ok(received) => received,
            Err(err) if err.is_disconnect() => return Ok(LoopExit::PeerClosed),
            Err(err) => return Err(err).context("receive from peer"),
        };
        if received.kind != Kind::Data {
            continue;
        }
        let inbound = Inbound {
            payload: received.payload,
            session: session.clone(),
        };
        tokio::select! {
            _ = session.closed() => return Ok(LoopExit::Cancelled),
            submitted = hub.submit(inbound) => submitted.context("submit inbound message")?,
        }
    }
}

async fn write_loop(
    connection: Connection,
    session: SessionHandle,
    mut outbound: mpsc::Receiver<Bytes>,
) -> Result<LoopExit> {
    loop {
        let payload = tokio::select! {
            _ = session.closed() => return Ok(LoopExit::Cancelled),
            next = outbound.recv() => match next {
                Some(payload) => payload,
                None => return Ok(LoopExit::QueueClosed),
            },
        };
        // Not raced against `closed()`: a half-written frame would corrupt the
        // stream. `Connection::close` aborts a stalled send after `close_timeout`.
        match connection.send(payload, true).await {
            Ok(_) => {}
            Err(err) if err.is_disconnect() => return Ok(LoopExit::PeerClosed),
            Err(err) => return Err(err).context("send to peer"),
        }
    }
}

async fn heartbeat_loop(
    connection: Connection,
    session: SessionHandle,
    config: SessionConfig,
) -> Result<LoopExit> {
    let ping = Envelope::ping().encode().context("encode ping")?;
    let mut ticker = tokio::time::interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );
    let pong_deadline = tokio::time::sleep(config.pong_timeout);
    let login_deadline = tokio::time::sleep(config.login_timeout);
    tokio::pin!(pong_deadline, login_deadline);
    let mut awaiting_login = true;

    loop {
        tokio::select! {
            _ = session.closed() => return Ok(LoopExit::Cancelled),
            _ = ticker.tick() => {
                match session.enqueue(ping.clone()) {
                    Enqueue::Queued => {}
                    Enqueue::Full => tracing::debug!(session = %session.id(), "outbound queue full, skipping ping"),
                    Enqueue::Closed => return Ok(LoopExit::QueueClosed),
                }
            }
            _ = session.pong_received() => {
                pong_deadline.as_mut().reset(Instant::now() + config.pong_timeout);
            }
            _ = &mut pong_deadline => return Ok(LoopExit::HeartbeatTimeout),
            _ = session.authenticated(), if awaiting_login => {
                awaiting_login = false;
            }
            _ = &mut login_deadline, if awaiting_login => {
                let notice = Envelope::error("login timeout").encode().context("encode login timeout")?;
                match tokio::time::timeout(NOTICE_WRITE_TIMEOUT, connection.send(notice, false)).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => {
                        tracing::debug!(session = %session.id(), error = %err, "login timeout notice not sent");
                    }
                    Err(_) => tracing::debug!(session = %session.id(), "login timeout notice timed out"),
                }
                return Ok(LoopExit::LoginTimeout);
            }
        }
    }
}
