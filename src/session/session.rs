use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::session::pending::PendingExchanges;

/// Application data attached to a session on the server side, handed to handlers with every
///  request of that session
pub type SessionData = Arc<dyn Any + Send + Sync>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionStatus {
    /// The token is assigned, but the handshake is not complete yet
    Created,
    /// The handshake is complete, application traffic is accepted
    Established,
}

/// Snapshot of a session's state for introspection
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionInfo {
    pub token: String,
    pub peer_addr: SocketAddr,
    pub status: SessionStatus,
    pub idle_time: Duration,
    pub last_rtt: Option<Duration>,
}

/// All state for one conversation with a peer: token, peer address, sequence counter, pending
///  exchanges and bookkeeping. Lives behind an `Arc` in the session table (server) or the client.
pub struct Session {
    token: String,
    peer_addr: SocketAddr,
    next_sequence: AtomicI64,
    pending: PendingExchanges,
    state: RwLock<SessionState>,
}

struct SessionState {
    status: SessionStatus,
    last_activity: Instant,
    last_rtt: Option<Duration>,
    data: Option<SessionData>,
}

impl Debug for Session {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session{{token:{:?}, peer:{:?}}}", self.token, self.peer_addr)
    }
}

impl Session {
    pub fn new(token: impl Into<String>, peer_addr: SocketAddr) -> Session {
        Session {
            token: token.into(),
            peer_addr,
            next_sequence: AtomicI64::new(0),
            pending: PendingExchanges::new(),
            state: RwLock::new(SessionState {
                status: SessionStatus::Created,
                last_activity: Instant::now(),
                last_rtt: None,
                data: None,
            }),
        }
    }

    /// Creates the established successor of a session that was used for the handshake, with the
    ///  token assigned by the server. The sequence counter continues where the handshake left it.
    pub async fn upgrade(&self, token: impl Into<String>) -> Session {
        let last_rtt = self.state.read().await.last_rtt;
        Session {
            token: token.into(),
            peer_addr: self.peer_addr,
            next_sequence: AtomicI64::new(self.next_sequence.load(Ordering::Acquire)),
            pending: PendingExchanges::new(),
            state: RwLock::new(SessionState {
                status: SessionStatus::Established,
                last_activity: Instant::now(),
                last_rtt,
                data: None,
            }),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Allocates the sequence number for the next acknowledgment-expecting send
    pub fn next_sequence(&self) -> i64 {
        self.next_sequence.fetch_add(1, Ordering::AcqRel)
    }

    pub fn pending(&self) -> &PendingExchanges {
        &self.pending
    }

    pub async fn status(&self) -> SessionStatus {
        self.state.read().await.status
    }

    pub async fn is_established(&self) -> bool {
        self.status().await == SessionStatus::Established
    }

    /// Returns `true` if this call moved the session from `Created` to `Established`
    pub async fn establish(&self) -> bool {
        let mut state = self.state.write().await;
        if state.status == SessionStatus::Established {
            return false;
        }
        debug!("session {:?} from {:?} is established", self.token, self.peer_addr);
        state.status = SessionStatus::Established;
        true
    }

    pub async fn touch(&self) {
        self.state.write().await.last_activity = Instant::now();
    }

    pub async fn idle_time(&self) -> Duration {
        self.state.read().await.last_activity.elapsed()
    }

    pub async fn record_rtt(&self, rtt: Duration) {
        self.state.write().await.last_rtt = Some(rtt);
    }

    pub async fn last_rtt(&self) -> Option<Duration> {
        self.state.read().await.last_rtt
    }

    pub async fn set_data(&self, data: SessionData) {
        self.state.write().await.data = Some(data);
    }

    pub async fn data(&self) -> Option<SessionData> {
        self.state.read().await.data.clone()
    }

    pub async fn info(&self) -> SessionInfo {
        let state = self.state.read().await;
        SessionInfo {
            token: self.token.clone(),
            peer_addr: self.peer_addr,
            status: state.status,
            idle_time: state.last_activity.elapsed(),
            last_rtt: state.last_rtt,
        }
    }

    /// Ends the session: every pending exchange is settled as timed out, and no new exchanges
    ///  can be started. Returns the number of cancelled exchanges.
    pub async fn close(&self) -> usize {
        self.pending.cancel_all()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use tokio::time;
    use super::*;

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 7000))
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let session = Session::new("abcdefgh", peer());
        assert_eq!(session.status().await, SessionStatus::Created);

        assert!(session.establish().await);
        assert_eq!(session.status().await, SessionStatus::Established);

        assert!(!session.establish().await);
        assert!(session.is_established().await);
    }

    #[test]
    fn test_sequence_numbers_are_post_incremented() {
        let session = Session::new("abcdefgh", peer());
        assert_eq!(session.next_sequence(), 0);
        assert_eq!(session.next_sequence(), 1);
        assert_eq!(session.next_sequence(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sequence_numbers_are_distinct() {
        let session = Arc::new(Session::new("abcdefgh", peer()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let session = session.clone();
            handles.push(tokio::spawn(async move {
                (0..1000).map(|_| session.next_sequence()).collect::<Vec<_>>()
            }));
        }

        let mut all = BTreeSet::new();
        for handle in handles {
            let sequences = handle.await.unwrap();
            assert!(sequences.windows(2).all(|w| w[0] < w[1]));
            all.extend(sequences);
        }
        assert_eq!(all.len(), 8000);
        assert_eq!(all.iter().next(), Some(&0));
        assert_eq!(all.iter().last(), Some(&7999));
    }

    #[tokio::test]
    async fn test_upgrade_continues_sequence() {
        let bootstrap = Session::new("", peer());
        assert_eq!(bootstrap.next_sequence(), 0);
        bootstrap.record_rtt(Duration::from_millis(3)).await;

        let upgraded = bootstrap.upgrade("tok").await;
        assert_eq!(upgraded.token(), "tok");
        assert_eq!(upgraded.peer_addr(), peer());
        assert_eq!(upgraded.status().await, SessionStatus::Established);
        assert_eq!(upgraded.last_rtt().await, Some(Duration::from_millis(3)));
        assert_eq!(upgraded.next_sequence(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_time() {
        let session = Session::new("abcdefgh", peer());
        time::sleep(Duration::from_secs(5)).await;
        let idle = session.idle_time().await;
        assert!(idle >= Duration::from_secs(5) && idle < Duration::from_millis(5010));

        session.touch().await;
        assert_eq!(session.idle_time().await, Duration::ZERO);
        assert_eq!(session.info().await.idle_time, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_session_data() {
        let session = Session::new("abcdefgh", peer());
        assert!(session.data().await.is_none());

        session.set_data(Arc::new(42u32)).await;
        let data = session.data().await.unwrap();
        assert_eq!(data.downcast_ref::<u32>(), Some(&42));
    }

    #[tokio::test]
    async fn test_close_cancels_pending() {
        let session = Session::new("abcdefgh", peer());
        let exchange = session.pending().register(session.next_sequence()).unwrap();

        assert_eq!(session.close().await, 1);
        let result = session.pending().wait(exchange, Duration::from_secs(10)).await;
        assert!(result.unwrap_err().is_timeout());
    }
}
