// Topic name -> subscribed sessions.
use crate::session::{Enqueue, SessionHandle, SessionId};
use ahash::RandomState;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

type Subscribers = HashMap<SessionId, SessionHandle, RandomState>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub dropped: usize,
    pub evicted: usize,
    pub skipped: usize,
}

/// Each topic set has its own mutex; the map itself sits behind a
/// read/write lock that is only written when topics appear or disappear.
#[derive(Debug, Default)]
pub(crate) struct TopicRegistry {
    topics: RwLock<HashMap<String, Arc<Mutex<Subscribers>>, RandomState>>,
}

impl TopicRegistry {
    pub(crate) fn subscribe(&self, topic: &str, session: &SessionHandle) {
        let set = {
            let mut topics = self.topics.write();
            Arc::clone(
                topics
                    .entry(topic.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(Subscribers::default()))),
            )
        };
        set.lock().insert(session.id(), session.clone());
    }

    pub(crate) fn unsubscribe(&self, topic: &str, id: SessionId) {
        let Some(set) = self.topic(topic) else {
            return;
        };
        let now_empty = {
            let mut set = set.lock();
            set.remove(&id);
            set.is_empty()
        };
        if now_empty {
            self.drop_if_empty(topic);
        }
    }

    /// Enqueues `payload` on every authenticated, open subscriber of `topic`.
    /// Closed subscribers are evicted on the way.
    pub(crate) fn fan_out(&self, topic: &str, payload: &Bytes) -> FanOut {
        let mut outcome = FanOut::default();
        let Some(set) = self.topic(topic) else {
            return outcome;
        };
        let now_empty = {
            let mut set = set.lock();
            let mut closed = Vec::new();
            for (id, subscriber) in set.iter() {
                if subscriber.is_closed() {
                    closed.push(*id);
                    continue;
                }
                if !subscriber.is_authenticated() {
                    outcome.skipped += 1;
                    continue;
                }
                match subscriber.enqueue(payload.clone()) {
                    Enqueue::Queued => outcome.delivered += 1,
                    Enqueue::Full => {
                        outcome.dropped += 1;
                        tracing::warn!(session = %id, topic, "outbound queue full, dropping message");
                    }
                    Enqueue::Closed => closed.push(*id),
                }
            }
            outcome.evicted = closed.len();
            for id in closed {
                set.remove(&id);
            }
            set.is_empty()
        };
        if now_empty {
            self.drop_if_empty(topic);
        }
        outcome
    }

    pub(crate) fn subscriber_count(&self, topic: &str) -> usize {
        self.topic(topic).map(|set| set.lock().len()).unwrap_or(0)
    }

    pub(crate) fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    fn topic(&self, topic: &str) -> Option<Arc<Mutex<Subscribers>>> {
        self.topics.read().get(topic).cloned()
    }

    fn drop_if_empty(&self, topic: &str) {
        let mut topics = self.topics.write();
        // Re-check under the write lock; a subscribe may have raced in.
        if topics.get(topic).is_some_and(|set| set.lock().is_empty()) {
            topics.remove(topic);
        }
    }
}
