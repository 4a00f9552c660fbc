//! The server side of the protocol: It hands out sessions to clients performing the handshake,
//!  dispatches their messages to registered handlers, and evicts sessions that stay idle for
//!  longer than the configured maximum life time.

pub mod reaper;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::protocol;
use crate::protocol::error::PrtError;
use crate::protocol::message::Message;
use crate::router::{Handler, Request, Router};
use crate::server::reaper::run_reaper;
use crate::session::session::{Session, SessionData, SessionInfo};
use crate::session::session_table::SessionTable;
use crate::session::token::{RandomTokenGenerator, TokenGenerator};
use crate::transport::dispatch_pool::DispatchPool;
use crate::transport::end_point::{EndPoint, FrameHandler};
use crate::transport::DatagramSocket;

pub struct Server {
    inner: Arc<ServerInner>,
    dispatch_pool: Arc<DispatchPool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    reaper_shutdown: watch::Sender<bool>,
}

struct ServerInner {
    config: ServerConfig,
    end_point: Arc<EndPoint>,
    router: Router,
    sessions: Arc<SessionTable>,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> anyhow::Result<Server> {
        config.validate()?;

        let socket = UdpSocket::bind(config.self_addr).await
            .with_context(|| format!("binding server socket to {:?}", config.self_addr))?;
        info!("bound server socket to {:?}", socket.local_addr());

        Self::with_socket(config, Arc::new(socket), Arc::new(RandomTokenGenerator))
    }

    pub fn with_socket(config: ServerConfig, socket: Arc<dyn DatagramSocket>, token_generator: Arc<dyn TokenGenerator>) -> anyhow::Result<Server> {
        config.validate()?;

        let end_point = Arc::new(EndPoint::new(socket, &config.protocol));
        let sessions = Arc::new(SessionTable::new(token_generator, config.session_token_length));
        let num_workers = config.protocol.dispatch_workers;
        let queue_size = config.protocol.dispatch_queue_size;
        let max_life_time = config.max_life_time;
        let reaper_interval = config.reaper_interval;

        let inner = Arc::new(ServerInner {
            config,
            end_point: end_point.clone(),
            router: Router::new(),
            sessions: sessions.clone(),
        });

        let dispatch_pool = Arc::new(DispatchPool::new(inner.clone(), num_workers, queue_size));

        let mut tasks = Vec::new();

        let handler: Arc<dyn FrameHandler> = inner.clone();
        let pool = dispatch_pool.clone();
        tasks.push(tokio::spawn(async move {
            end_point.recv_loop(handler, pool).await
        }));

        let (reaper_shutdown, reaper_shutdown_receiver) = watch::channel(false);
        match reaper_interval {
            Some(interval) => tasks.push(tokio::spawn(run_reaper(sessions, max_life_time, interval, reaper_shutdown_receiver))),
            None => debug!("no periodic session eviction - sessions are evicted only by explicit calls to gc()"),
        }

        Ok(Server {
            inner,
            dispatch_pool,
            tasks: Mutex::new(tasks),
            reaper_shutdown,
        })
    }

    pub async fn add_route(&self, identifier: &str, handler: Arc<dyn Handler>) -> Result<(), PrtError> {
        self.inner.router.register(identifier, handler).await
    }

    pub async fn add_route_fn<F, Fut>(&self, identifier: &str, f: F) -> Result<(), PrtError>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Message>> + Send + 'static,
    {
        self.inner.router.register_fn(identifier, f).await
    }

    pub async fn remove_route(&self, identifier: &str) -> bool {
        self.inner.router.deregister(identifier).await
    }

    /// Sends a message to the client owning a session, without expecting an acknowledgment
    pub async fn tell(&self, session_token: &str, identifier: &str, body: impl Into<String>) -> Result<(), PrtError> {
        protocol::check_application_identifier(identifier)?;
        let session = self.inner.established_session(session_token).await?;

        let message = Message::new(session.token(), identifier, Message::NO_ACK, body);
        self.inner.end_point.send(session.peer_addr(), &message).await
    }

    /// Sends a message to the client owning a session and waits for its acknowledgment. Evicting
    ///  or removing the session while waiting fails the promise with [PrtError::Timeout].
    pub async fn promise(&self, session_token: &str, identifier: &str, body: impl Into<String>) -> Result<String, PrtError> {
        self.promise_with_timeout(session_token, identifier, body, self.inner.config.protocol.timeout).await
    }

    pub async fn promise_with_timeout(&self, session_token: &str, identifier: &str, body: impl Into<String>, timeout: Duration) -> Result<String, PrtError> {
        protocol::check_application_identifier(identifier)?;
        let session = self.inner.established_session(session_token).await?;

        let message = Message::new(session.token(), identifier, session.next_sequence(), body);
        let reply = self.inner.end_point
            .exchange(&session, session.peer_addr(), message, timeout)
            .await?;
        Ok(reply.body)
    }

    /// Attaches application data to a session. It is passed to handlers with every subsequent
    ///  request of that session.
    pub async fn set_session_data(&self, session_token: &str, data: SessionData) -> Result<(), PrtError> {
        let session = self.inner.sessions.get(session_token).await
            .ok_or_else(|| PrtError::UnknownSession(session_token.to_string()))?;
        session.set_data(data).await;
        Ok(())
    }

    /// Ends a session, failing its pending promises. Returns `false` if there was no such session.
    pub async fn remove_session(&self, session_token: &str) -> bool {
        self.inner.sessions.remove(session_token).await
            .is_some()
    }

    pub async fn session_info(&self, session_token: &str) -> Option<SessionInfo> {
        match self.inner.sessions.get(session_token).await {
            Some(session) => Some(session.info().await),
            None => None,
        }
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.len().await
    }

    /// Evicts idle sessions right away instead of waiting for the periodic sweep, returning the
    ///  evicted sessions' tokens
    pub async fn gc(&self) -> Vec<String> {
        self.inner.sessions
            .evict_idle(self.inner.config.max_life_time)
            .await
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.end_point.local_addr()
    }

    /// Stops receiving and the periodic eviction, waits for in-flight handlers to finish, and
    ///  closes all sessions
    pub async fn shutdown(&self) {
        self.inner.end_point.cancel_recv_loop();
        self.reaper_shutdown.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("server task terminated abnormally: {}", e);
            }
        }
        self.dispatch_pool.shutdown().await;

        self.inner.sessions.clear().await;
        info!("server shut down");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.inner.end_point.cancel_recv_loop();
        self.reaper_shutdown.send_replace(true);
    }
}

impl ServerInner {
    async fn established_session(&self, session_token: &str) -> Result<Arc<Session>, PrtError> {
        let session = self.sessions.get(session_token).await
            .ok_or_else(|| PrtError::UnknownSession(session_token.to_string()))?;
        if !session.is_established().await {
            return Err(PrtError::IllegalOperation(format!("session {:?} is not established", session_token)));
        }
        Ok(session)
    }

    /// First step of the handshake: a fresh session, offered to the client together with the
    ///  session life time in microseconds
    async fn offer_session(&self, hello: Message, from: SocketAddr) {
        let session = match self.sessions.create(from).await {
            Ok(session) => session,
            Err(e) => {
                warn!("unable to create a session for {:?}: {}", from, e);
                return;
            }
        };

        let offer = Message::new(session.token(), protocol::HELLO, hello.sequence, self.config.max_life_time.as_micros().to_string());
        match self.end_point.send(from, &offer).await {
            Ok(()) => debug!("offered session {:?} to {:?}", session.token(), from),
            Err(e) => {
                warn!("failed to send session offer to {:?}: {}", from, e);
                self.sessions.remove(session.token()).await;
            }
        }
    }
}

#[async_trait]
impl FrameHandler for ServerInner {
    async fn try_settle(&self, message: Message, _from: SocketAddr) -> Option<Message> {
        match message.identifier.as_str() {
            protocol::ACK => {
                let Some(session) = self.sessions.get(&message.session).await else {
                    debug!("acknowledgment for unknown session {:?} - dropping", message.session);
                    return None;
                };
                session.touch().await;

                let sequence = message.sequence;
                session.pending().resolve(sequence, message);
                None
            }
            protocol::ESTABLISHED => {
                match self.sessions.get(&message.session).await {
                    Some(session) => {
                        session.touch().await;
                        session.establish().await;
                    }
                    None => debug!("handshake completion for unknown session {:?} - dropping", message.session),
                }
                None
            }
            _ => Some(message),
        }
    }

    async fn on_frame(&self, message: Message, from: SocketAddr) {
        let Some(session) = self.sessions.get(&message.session).await else {
            if message.identifier == protocol::HELLO {
                self.offer_session(message, from).await;
            }
            else {
                debug!("{:?} from {:?} for an unknown session - dropping", message, from);
            }
            return;
        };

        session.touch().await;

        if message.identifier == protocol::HELLO {
            debug!("repeated handshake for session {:?} - dropping", session.token());
            return;
        }
        if !session.is_established().await {
            debug!("protocol violation: {:?} before the handshake was completed - dropping", message);
            return;
        }

        let request = Request {
            message,
            remote: from,
            session_data: session.data().await,
        };
        if let Some(ack) = self.router.dispatch(session.token(), request).await {
            if let Err(e) = self.end_point.send(from, &ack).await {
                warn!("failed to send acknowledgment {} to {:?}: {}", ack.sequence, from, e);
            }
        }
    }
}
