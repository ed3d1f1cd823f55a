// Hub-side view of one client session.
use bytes::Bytes;
use simhub_authz::Principal;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc, watch};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    Queued,
    /// Outbound queue at capacity; the payload was dropped.
    Full,
    Closed,
}

/// Shared handle to a session.
///
/// The hub's registries hold clones keyed by [`SessionId`]; the session's own
/// tasks hold one too. Closing is idempotent and observed by every clone.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    inner: Arc<SessionShared>,
}

#[derive(Debug)]
struct SessionShared {
    id: SessionId,
    peer: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
    principal: watch::Sender<Option<Principal>>,
    pong: Notify,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub(crate) fn new(id: SessionId, peer: SocketAddr, outbound: mpsc::Sender<Bytes>) -> Self {
        let (principal, _) = watch::channel(None);
        Self {
            inner: Arc::new(SessionShared {
                id,
                peer,
                outbound,
                principal,
                pong: Notify::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn principal(&self) -> Option<Principal> {
        self.inner.principal.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.principal.borrow().is_some()
    }

    /// Promotes the session. Returns false if it was already authenticated.
    pub fn authenticate(&self, principal: Principal) -> bool {
        self.inner.principal.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(principal);
            true
        })
    }

    /// Resolves once the session has logged in.
    pub async fn authenticated(&self) {
        let mut changes = self.inner.principal.subscribe();
        // The sender lives in `self`, so this only returns once a principal is set.
        let _ = changes.wait_for(Option::is_some).await;
    }

    /// Non-blocking enqueue onto the outbound queue.
    pub fn enqueue(&self, payload: Bytes) -> Enqueue {
        if self.is_closed() {
            return Enqueue::Closed;
        }
        match self.inner.outbound.try_send(payload) {
            Ok(()) => Enqueue::Queued,
            Err(TrySendError::Full(_)) => Enqueue::Full,
            Err(TrySendError::Closed(_)) => Enqueue::Closed,
        }
    }

    pub fn notify_pong(&self) {
        self.inner.pong.notify_one();
    }

    /// Resolves on the next pong, or immediately if one arrived since the last wait.
    pub async fn pong_received(&self) {
        self.inner.pong.notified().await;
    }

    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.inner.cancel.cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn handle(depth: usize) -> (SessionHandle, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(depth);
        let peer = "127.0.0.1:9".parse().expect("addr");
        (SessionHandle::new(SessionId(1), peer, tx), rx)
    }

    #[test]
    fn authenticate_only_once() {
        let (session, _rx) = handle(1);
        assert!(!session.is_authenticated());
        assert!(session.authenticate(Principal::new("alice")));
        assert!(!session.authenticate(Principal::new("mallory")));
        assert_eq!(session.principal(), Some(Principal::new("alice")));
    }

    #[test]
    fn enqueue_reports_full_and_closed() {
        let (session, rx) = handle(1);
        assert_eq!(session.enqueue(Bytes::from_static(b"a")), Enqueue::Queued);
        assert_eq!(session.enqueue(Bytes::from_static(b"b")), Enqueue::Full);
        drop(rx);
        assert_eq!(session.enqueue(Bytes::from_static(b"c")), Enqueue::Closed);

        let (session, _rx) = handle(1);
        session.close();
        assert_eq!(session.enqueue(Bytes::from_static(b"d")), Enqueue::Closed);
    }

    #[tokio::test]
    async fn pong_before_wait_is_not_lost() {
        let (session, _rx) = handle(1);
        session.notify_pong();
        tokio::time::timeout(Duration::from_millis(100), session.pong_received())
            .await
            .expect("stored pong");
    }

    #[tokio::test]
    async fn authenticated_resolves_after_login() {
        let (session, _rx) = handle(1);
        let waiter = session.clone();
        let task = tokio::spawn(async move { waiter.authenticated().await });
        session.authenticate(Principal::new("bob"));
        tokio::time::timeout(Duration::from_millis(200), task)
            .await
            .expect("resolved")
            .expect("join");
    }

    #[test]
    fn close_is_shared_between_clones() {
        let (session, _rx) = handle(1);
        let clone = session.clone();
        clone.close();
        clone.close();
        assert!(session.is_closed());
    }
}
