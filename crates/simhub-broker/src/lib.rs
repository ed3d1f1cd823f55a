// Session registry, topic routing and command dispatch.
//
// Sessions push decoded-later payloads onto one inbound queue; a single
// dispatcher task drains it and is the only writer of the topic registry.
// Replies and fan-out go through each session's bounded outbound queue.
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use serde_json::{Value, json};
use simhub_authz::TokenVerifier;
use simhub_wire::{Envelope, EnvelopeOption, LoginData, TopicData};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

mod registry;
pub mod session;

pub use registry::FanOut;
pub use session::{Enqueue, SessionHandle, SessionId};

use registry::TopicRegistry;

pub type Result<T> = std::result::Result<T, BrokerError>;

pub const FORMAT_ERROR: &str = "message format error, need json";

#[derive(thiserror::Error, Debug)]
pub enum BrokerError {
    #[error("session {0} is already registered")]
    DuplicateSession(SessionId),
    #[error("{0} task is already running")]
    AlreadyRunning(&'static str),
    #[error("hub is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub inbound_queue_depth: usize,
    pub outbound_queue_depth: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            inbound_queue_depth: 1024,
            outbound_queue_depth: 1024,
        }
    }
}

/// One application payload read from a session.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub payload: Bytes,
    pub session: SessionHandle,
}

/// Handles of the dispatcher and reaper tasks.
#[derive(Debug)]
pub struct HubWorkers {
    pub dispatcher: JoinHandle<()>,
    pub reaper: JoinHandle<()>,
}

impl HubWorkers {
    pub async fn join(self) {
        if let Err(err) = self.dispatcher.await {
            tracing::warn!(error = %err, "dispatcher task failed");
        }
        if let Err(err) = self.reaper.await {
            tracing::warn!(error = %err, "reaper task failed");
        }
    }
}

pub struct Hub {
    config: HubConfig,
    verifier: Arc<dyn TokenVerifier>,
    topics: TopicRegistry,
    sessions: DashMap<SessionId, SessionHandle>,
    next_session_id: AtomicU64,
    inbound_tx: mpsc::Sender<Inbound>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Inbound>>>,
    closed_tx: mpsc::UnboundedSender<SessionId>,
    closed_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionId>>>,
    shutdown: CancellationToken,
}

impl Hub {
    pub fn new(config: HubConfig, verifier: Arc<dyn TokenVerifier>) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_depth.max(1));
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            verifier,
            topics: TopicRegistry::default(),
            sessions: DashMap::new(),
            next_session_id: AtomicU64::new(1),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            closed_tx,
            closed_rx: Mutex::new(Some(closed_rx)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawns the dispatcher and reaper. Can only be done once per hub.
    pub fn start(self: &Arc<Self>) -> Result<HubWorkers> {
        let inbound = self
            .inbound_rx
            .lock()
            .take()
            .ok_or(BrokerError::AlreadyRunning("dispatcher"))?;
        let closed = self
            .closed_rx
            .lock()
            .take()
            .ok_or(BrokerError::AlreadyRunning("reaper"))?;
        let dispatcher = tokio::spawn(Arc::clone(self).run_dispatcher(inbound));
        let reaper = tokio::spawn(Arc::clone(self).run_reaper(closed));
        Ok(HubWorkers { dispatcher, reaper })
    }

    /// Assigns an id and builds the handle plus the receiving end of its
    /// outbound queue. The session is not live until [`Hub::register`].
    pub fn open_session(&self, peer: SocketAddr) -> (SessionHandle, mpsc::Receiver<Bytes>) {
        let id = SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.config.outbound_queue_depth.max(1));
        (SessionHandle::new(id, peer, tx), rx)
    }

    pub fn register(&self, session: SessionHandle) -> Result<()> {
        if self.is_shut_down() {
            return Err(BrokerError::ShuttingDown);
        }
        match self.sessions.entry(session.id()) {
            Entry::Occupied(_) => return Err(BrokerError::DuplicateSession(session.id())),
            Entry::Vacant(slot) => {
                slot.insert(session);
            }
        }
        metrics::gauge!("simhub_sessions_active").set(self.sessions.len() as f64);
        Ok(())
    }

    /// Queues a payload for the dispatcher, waiting for room.
    pub async fn submit(&self, inbound: Inbound) -> Result<()> {
        self.inbound_tx
            .send(inbound)
            .await
            .map_err(|_| BrokerError::ShuttingDown)
    }

    /// Tells the reaper a session has finished its close sequence.
    pub fn notify_closed(&self, id: SessionId) {
        if self.closed_tx.send(id).is_err() {
            // Reaper gone; remove inline so the live set stays accurate.
            self.reap(id);
        }
    }

    pub fn session(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.subscriber_count(topic)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.topic_count()
    }

    /// Closes every live session and stops the dispatcher and reaper.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for entry in self.sessions.iter() {
            entry.value().close();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    async fn run_dispatcher(self: Arc<Self>, mut inbound: mpsc::Receiver<Inbound>) {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = inbound.recv() => next,
            };
            match next {
                Some(message) => self.dispatch(message).await,
                None => break,
            }
        }
        tracing::debug!("dispatcher stopped");
    }

    async fn run_reaper(self: Arc<Self>, mut closed: mpsc::UnboundedReceiver<SessionId>) {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = closed.recv() => next,
            };
            match next {
                Some(id) => self.reap(id),
                None => break,
            }
        }
        // Sessions closed during shutdown still leave the live set.
        while let Ok(id) = closed.try_recv() {
            self.reap(id);
        }
        tracing::debug!("reaper stopped");
    }

    fn reap(&self, id: SessionId) {
        if self.sessions.remove(&id).is_some() {
            tracing::debug!(session = %id, "session reaped");
        }
        metrics::gauge!("simhub_sessions_active").set(self.sessions.len() as f64);
    }

    async fn dispatch(&self, inbound: Inbound) {
        let Inbound { payload, session } = inbound;
        if session.is_closed() {
            return;
        }
        let envelope = match Envelope::decode(&payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::debug!(session = %session.id(), error = %err, "undecodable payload");
                self.reply(&session, &Envelope::error(FORMAT_ERROR));
                return;
            }
        };
        match envelope.kind() {
            Some(EnvelopeOption::Login) => self.handle_login(&session, &envelope).await,
            Some(EnvelopeOption::Subscribe) => self.handle_subscribe(&session, &envelope),
            Some(EnvelopeOption::Unsubscribe) => self.handle_unsubscribe(&session, &envelope),
            Some(EnvelopeOption::Publish) => self.handle_publish(&session, envelope),
            Some(EnvelopeOption::Pong) => session.notify_pong(),
            Some(EnvelopeOption::Ping) => self.reply(&session, &Envelope::pong()),
            Some(EnvelopeOption::Info) | Some(EnvelopeOption::Error) => {}
            None => {
                let message = format!("unknown option: {}", envelope.option);
                self.reply(&session, &Envelope::error(message));
            }
        }
    }

    async fn handle_login(&self, session: &SessionHandle, envelope: &Envelope) {
        let login: LoginData = envelope.data_or_default();
        if login.access_token.is_empty() {
            self.reply(session, &Envelope::error("access token required"));
            return;
        }
        let principal = match self.verifier.verify(&login.access_token).await {
            Ok(principal) => principal,
            Err(err) => {
                tracing::info!(session = %session.id(), error = %err, "login rejected");
                self.reply(session, &Envelope::error(format!("login failed: {err}")));
                return;
            }
        };
        let name = principal.name.clone();
        if !session.authenticate(principal) {
            self.reply(session, &Envelope::error("already logged in"));
            return;
        }
        tracing::info!(session = %session.id(), peer = %session.peer(), user = %name, "login success");
        let reply = Envelope::new(
            EnvelopeOption::Info,
            Some(json!({ "msg": "login success", "user": name })),
        );
        self.reply(session, &reply);
    }

    fn handle_subscribe(&self, session: &SessionHandle, envelope: &Envelope) {
        if !session.is_authenticated() {
            return;
        }
        let TopicData { topic } = envelope.data_or_default();
        if topic.is_empty() {
            return;
        }
        self.topics.subscribe(&topic, session);
        tracing::debug!(session = %session.id(), topic = %topic, "subscribed");
    }

    fn handle_unsubscribe(&self, session: &SessionHandle, envelope: &Envelope) {
        if !session.is_authenticated() {
            return;
        }
        let TopicData { topic } = envelope.data_or_default();
        if topic.is_empty() {
            return;
        }
        self.topics.unsubscribe(&topic, session.id());
        tracing::debug!(session = %session.id(), topic = %topic, "unsubscribed");
    }

    fn handle_publish(&self, session: &SessionHandle, envelope: Envelope) {
        let Some(principal) = session.principal() else {
            return;
        };
        let TopicData { topic } = envelope.data_or_default();
        if topic.is_empty() {
            return;
        }
        let Some(Value::Object(mut data)) = envelope.data else {
            return;
        };
        data.insert("from_user".to_string(), Value::String(principal.name));
        let stamped = Envelope::new(EnvelopeOption::Publish, Some(Value::Object(data)));
        let payload = match stamped.encode() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(session = %session.id(), error = %err, "failed to encode publish");
                return;
            }
        };
        metrics::counter!("simhub_publish_total").increment(1);
        let outcome = self.topics.fan_out(&topic, &payload);
        metrics::counter!("simhub_deliveries_total").increment(outcome.delivered as u64);
        metrics::counter!("simhub_outbound_dropped_total").increment(outcome.dropped as u64);
        tracing::trace!(topic = %topic, ?outcome, "published");
    }

    fn reply(&self, session: &SessionHandle, envelope: &Envelope) {
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(session = %session.id(), error = %err, "failed to encode reply");
                return;
            }
        };
        match session.enqueue(payload) {
            Enqueue::Queued | Enqueue::Closed => {}
            Enqueue::Full => {
                metrics::counter!("simhub_outbound_dropped_total").increment(1);
                tracing::warn!(session = %session.id(), option = %envelope.option, "outbound queue full, dropping reply");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simhub_authz::StaticTokens;
    use std::time::Duration;

    fn hub_with(config: HubConfig) -> Arc<Hub> {
        let tokens = StaticTokens::new()
            .with_token("T-alice", "alice")
            .with_token("T-bob", "bob");
        Hub::new(config, Arc::new(tokens))
    }

    fn hub() -> Arc<Hub> {
        hub_with(HubConfig::default())
    }

    fn connect(hub: &Hub) -> (SessionHandle, mpsc::Receiver<Bytes>) {
        let (session, rx) = hub.open_session("127.0.0.1:4000".parse().expect("addr"));
        hub.register(session.clone()).expect("register");
        (session, rx)
    }

    async fn send(hub: &Hub, session: &SessionHandle, envelope: Envelope) {
        hub.dispatch(Inbound {
            payload: envelope.encode().expect("encode"),
            session: session.clone(),
        })
        .await;
    }

    fn next(rx: &mut mpsc::Receiver<Bytes>) -> Envelope {
        let payload = rx.try_recv().expect("queued envelope");
        Envelope::decode(&payload).expect("decode")
    }

    async fn logged_in(hub: &Hub, token: &str) -> (SessionHandle, mpsc::Receiver<Bytes>) {
        let (session, mut rx) = connect(hub);
        send(hub, &session, Envelope::login(token)).await;
        assert!(next(&mut rx).is(EnvelopeOption::Info));
        (session, rx)
    }

    #[tokio::test]
    async fn login_success_then_repeat_is_rejected() {
        let hub = hub();
        let (session, mut rx) = connect(&hub);
        send(&hub, &session, Envelope::login("T-alice")).await;
        let reply = next(&mut rx);
        assert!(reply.is(EnvelopeOption::Info));
        assert_eq!(reply.data, Some(json!({ "msg": "login success", "user": "alice" })));

        send(&hub, &session, Envelope::login("T-bob")).await;
        assert!(next(&mut rx).is(EnvelopeOption::Error));
        assert_eq!(session.principal().map(|p| p.name).as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn empty_and_invalid_tokens_are_rejected() {
        let hub = hub();
        let (session, mut rx) = connect(&hub);
        send(&hub, &session, Envelope::login("")).await;
        assert!(next(&mut rx).is(EnvelopeOption::Error));
        send(&hub, &session, Envelope::new(EnvelopeOption::Login, None)).await;
        assert!(next(&mut rx).is(EnvelopeOption::Error));
        send(&hub, &session, Envelope::login("T-nobody")).await;
        assert!(next(&mut rx).is(EnvelopeOption::Error));
        assert!(!session.is_authenticated());
    }

    #[tokio::test]
    async fn subscribe_requires_login() {
        let hub = hub();
        let (session, mut rx) = connect(&hub);
        send(&hub, &session, Envelope::subscribe("room1")).await;
        assert_eq!(hub.subscriber_count("room1"), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_reaches_subscribers_with_sender_stamp() {
        let hub = hub();
        let (alice, mut alice_rx) = logged_in(&hub, "T-alice").await;
        let (bob, mut bob_rx) = logged_in(&hub, "T-bob").await;
        send(&hub, &bob, Envelope::subscribe("room1")).await;
        assert_eq!(hub.subscriber_count("room1"), 1);

        send(&hub, &alice, Envelope::publish("room1", json!({ "msg": "hi" }))).await;
        let delivered = next(&mut bob_rx);
        assert!(delivered.is(EnvelopeOption::Publish));
        assert_eq!(
            delivered.data,
            Some(json!({ "topic": "room1", "data": { "msg": "hi" }, "from_user": "alice" }))
        );
        assert!(alice_rx.try_recv().is_err(), "publisher is not subscribed");
    }

    #[tokio::test]
    async fn publish_keeps_extra_fields_and_event_alias() {
        let hub = hub();
        let (alice, _alice_rx) = logged_in(&hub, "T-alice").await;
        let (bob, mut bob_rx) = logged_in(&hub, "T-bob").await;
        let subscribe = Envelope::new(EnvelopeOption::Subscribe, Some(json!({ "event": "sim" })));
        send(&hub, &bob, subscribe).await;

        let publish = Envelope::new(
            EnvelopeOption::Publish,
            Some(json!({ "event": "sim", "data": [1, 2], "tick": 9 })),
        );
        send(&hub, &alice, publish).await;
        let delivered = next(&mut bob_rx);
        let data = delivered.data_object().expect("object");
        assert_eq!(data.get("tick"), Some(&json!(9)));
        assert_eq!(data.get("from_user"), Some(&json!("alice")));
    }

    #[tokio::test]
    async fn unauthenticated_publish_and_empty_topic_are_ignored() {
        let hub = hub();
        let (bob, mut bob_rx) = logged_in(&hub, "T-bob").await;
        send(&hub, &bob, Envelope::subscribe("room1")).await;
        let (anonymous, mut anonymous_rx) = connect(&hub);
        send(&hub, &anonymous, Envelope::publish("room1", json!("x"))).await;
        send(&hub, &bob, Envelope::publish("", json!("x"))).await;
        send(&hub, &bob, Envelope::subscribe("")).await;
        assert!(bob_rx.try_recv().is_err());
        assert!(anonymous_rx.try_recv().is_err());
        assert_eq!(hub.topic_count(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery_and_drops_topic() {
        let hub = hub();
        let (alice, _alice_rx) = logged_in(&hub, "T-alice").await;
        let (bob, mut bob_rx) = logged_in(&hub, "T-bob").await;
        send(&hub, &bob, Envelope::subscribe("room1")).await;
        send(&hub, &bob, Envelope::unsubscribe("room1")).await;
        assert_eq!(hub.topic_count(), 0);
        send(&hub, &alice, Envelope::publish("room1", json!({}))).await;
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_subscriber_is_evicted_on_publish() {
        let hub = hub();
        let (alice, _alice_rx) = logged_in(&hub, "T-alice").await;
        let (bob, _bob_rx) = logged_in(&hub, "T-bob").await;
        send(&hub, &bob, Envelope::subscribe("room1")).await;
        bob.close();
        send(&hub, &alice, Envelope::publish("room1", json!({}))).await;
        assert_eq!(hub.subscriber_count("room1"), 0);
        assert_eq!(hub.topic_count(), 0);
    }

    #[tokio::test]
    async fn full_outbound_queue_drops_new_messages() {
        let hub = hub_with(HubConfig {
            outbound_queue_depth: 2,
            ..HubConfig::default()
        });
        let (alice, _alice_rx) = logged_in(&hub, "T-alice").await;
        let (bob, mut bob_rx) = logged_in(&hub, "T-bob").await;
        send(&hub, &bob, Envelope::subscribe("room1")).await;
        for n in 0..3 {
            send(&hub, &alice, Envelope::publish("room1", json!({ "n": n }))).await;
        }
        let first = next(&mut bob_rx);
        assert_eq!(first.data_object().and_then(|d| d.get("data")), Some(&json!({ "n": 0 })));
        next(&mut bob_rx);
        assert!(bob_rx.try_recv().is_err());
        assert_eq!(hub.subscriber_count("room1"), 1);
    }

    #[tokio::test]
    async fn malformed_and_unknown_messages_get_errors() {
        let hub = hub();
        let (session, mut rx) = connect(&hub);
        hub.dispatch(Inbound {
            payload: Bytes::from_static(b"{not json"),
            session: session.clone(),
        })
        .await;
        assert_eq!(next(&mut rx), Envelope::error(FORMAT_ERROR));

        send(&hub, &session, Envelope::decode(br#"{"option":"teleport"}"#).expect("decode")).await;
        let reply = next(&mut rx);
        assert!(reply.is(EnvelopeOption::Error));
        let text = reply.data_object().and_then(|d| d.get("error")).and_then(Value::as_str);
        assert!(text.expect("error text").contains("teleport"));
    }

    #[tokio::test]
    async fn client_ping_gets_pong_and_info_is_ignored() {
        let hub = hub();
        let (session, mut rx) = connect(&hub);
        send(&hub, &session, Envelope::ping()).await;
        assert!(next(&mut rx).is(EnvelopeOption::Pong));
        send(&hub, &session, Envelope::info("hello")).await;
        send(&hub, &session, Envelope::error("oops")).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn pong_envelope_reaches_the_session() {
        let hub = hub();
        let (session, _rx) = connect(&hub);
        send(&hub, &session, Envelope::pong()).await;
        tokio::time::timeout(Duration::from_millis(100), session.pong_received())
            .await
            .expect("pong forwarded");
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let hub = hub();
        let (session, _rx) = connect(&hub);
        assert!(matches!(
            hub.register(session.clone()),
            Err(BrokerError::DuplicateSession(id)) if id == session.id()
        ));
        assert_eq!(hub.session_count(), 1);
    }

    #[tokio::test]
    async fn workers_dispatch_and_reap_until_shutdown() {
        let hub = hub();
        let workers = hub.start().expect("start");
        assert!(matches!(hub.start(), Err(BrokerError::AlreadyRunning(_))));

        let (session, mut rx) = connect(&hub);
        hub.submit(Inbound {
            payload: Envelope::login("T-alice").encode().expect("encode"),
            session: session.clone(),
        })
        .await
        .expect("submit");
        let reply = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("reply in time")
            .expect("reply");
        assert!(Envelope::decode(&reply).expect("decode").is(EnvelopeOption::Info));

        let (other, _other_rx) = connect(&hub);
        assert_eq!(hub.session_count(), 2);
        other.close();
        hub.notify_closed(other.id());
        tokio::time::timeout(Duration::from_secs(1), async {
            while hub.session_count() != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reaped");

        hub.shutdown();
        assert!(session.is_closed());
        tokio::time::timeout(Duration::from_secs(1), workers.join())
            .await
            .expect("workers stop");
        assert!(matches!(
            hub.register(hub.open_session("127.0.0.1:1".parse().expect("addr")).0),
            Err(BrokerError::ShuttingDown)
        ));
    }
}
