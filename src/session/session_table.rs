use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::protocol::error::PrtError;
use crate::session::session::Session;
use crate::session::token::TokenGenerator;

/// The server's sessions by token. The key set doubles as the set of occupied tokens.
pub struct SessionTable {
    sessions: RwLock<FxHashMap<String, Arc<Session>>>,
    token_generator: Arc<dyn TokenGenerator>,
    token_length: usize,
}

impl SessionTable {
    /// Number of fresh tokens tried before giving up on a colliding generator
    const MAX_TOKEN_ATTEMPTS: usize = 16;

    pub fn new(token_generator: Arc<dyn TokenGenerator>, token_length: usize) -> SessionTable {
        SessionTable {
            sessions: Default::default(),
            token_generator,
            token_length,
        }
    }

    /// Creates a session with a fresh token that is not currently in use
    pub async fn create(&self, peer_addr: SocketAddr) -> Result<Arc<Session>, PrtError> {
        let mut sessions = self.sessions.write().await;

        for _ in 0..Self::MAX_TOKEN_ATTEMPTS {
            let token = self.token_generator.generate(self.token_length);
            if token.is_empty() || sessions.contains_key(&token) {
                debug!("generated session token {:?} is unusable - retrying", token);
                continue;
            }

            let session = Arc::new(Session::new(token.clone(), peer_addr));
            sessions.insert(token, session.clone());
            return Ok(session);
        }

        warn!("no unique session token after {} attempts", Self::MAX_TOKEN_ATTEMPTS);
        Err(PrtError::IllegalOperation("unable to generate a unique session token".to_string()))
    }

    pub async fn get(&self, token: &str) -> Option<Arc<Session>> {
        self.sessions.read().await
            .get(token)
            .cloned()
    }

    /// Removes a session, settling all its pending exchanges as timed out
    pub async fn remove(&self, token: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await
            .remove(token);

        if let Some(session) = &removed {
            let num_cancelled = session.close().await;
            debug!("removed session {:?}, cancelled {} pending exchanges", token, num_cancelled);
        }
        removed
    }

    /// Removes every session that was idle for at least `max_life_time`, returning their tokens.
    ///  Pending exchanges of evicted sessions are settled as timed out.
    pub async fn evict_idle(&self, max_life_time: Duration) -> Vec<String> {
        let mut evicted = Vec::new();
        {
            let mut sessions = self.sessions.write().await;
            let mut expired_tokens = Vec::new();
            for (token, session) in sessions.iter() {
                if session.idle_time().await >= max_life_time {
                    expired_tokens.push(token.clone());
                }
            }
            for token in expired_tokens {
                if let Some(session) = sessions.remove(&token) {
                    evicted.push(session);
                }
            }
        }

        let mut tokens = Vec::with_capacity(evicted.len());
        for session in evicted {
            let num_cancelled = session.close().await;
            info!("evicted idle session {:?} of {:?}, cancelled {} pending exchanges", session.token(), session.peer_addr(), num_cancelled);
            tokens.push(session.token().to_string());
        }
        tokens
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Closes and removes all sessions
    pub async fn clear(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.write().await
            .drain()
            .map(|(_, session)| session)
            .collect();
        for session in sessions {
            session.close().await;
        }
    }
}
