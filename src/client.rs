use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::protocol;
use crate::protocol::error::PrtError;
use crate::protocol::message::Message;
use crate::router::{Handler, Request, Router};
use crate::session::session::Session;
use crate::transport::dispatch_pool::DispatchPool;
use crate::transport::end_point::{EndPoint, FrameHandler};
use crate::transport::DatagramSocket;

/// The client side of the protocol: It talks to a single server, performing the handshake to
///  obtain a session and then sending fire-and-forget messages ([Client::tell]) and
///  request / acknowledgment exchanges ([Client::promise]) within that session.
///
/// The server can send messages to the client as well, they are dispatched to the handlers
///  registered with [Client::add_route].
pub struct Client {
    inner: Arc<ClientInner>,
    dispatch_pool: Arc<DispatchPool>,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

struct ClientInner {
    config: ClientConfig,
    end_point: Arc<EndPoint>,
    router: Router,
    /// a token-less bootstrap session until the handshake completes, replaced by the
    ///  established session afterwards
    session: RwLock<Arc<Session>>,
    max_life_time: RwLock<Option<Duration>>,
    handshake_lock: Mutex<()>,
}

impl Client {
    /// Binds a UDP socket to the configured address. The client is not connected to the server
    ///  until [Client::handshake] completes.
    pub async fn new(config: ClientConfig) -> anyhow::Result<Client> {
        config.validate()?;

        let socket = UdpSocket::bind(config.self_addr).await
            .with_context(|| format!("binding client socket to {:?}", config.self_addr))?;
        info!("bound client socket to {:?}", socket.local_addr());

        Self::with_socket(config, Arc::new(socket))
    }

    /// Binds a socket and performs the handshake
    pub async fn connect(config: ClientConfig) -> anyhow::Result<Client> {
        let client = Self::new(config).await?;
        client.connected().await
    }

    pub fn with_socket(config: ClientConfig, socket: Arc<dyn DatagramSocket>) -> anyhow::Result<Client> {
        config.validate()?;

        let end_point = Arc::new(EndPoint::new(socket, &config.protocol));
        let bootstrap_session = Arc::new(Session::new("", config.server_addr));
        let num_workers = config.protocol.dispatch_workers;
        let queue_size = config.protocol.dispatch_queue_size;

        let inner = Arc::new(ClientInner {
            config,
            end_point: end_point.clone(),
            router: Router::new(),
            session: RwLock::new(bootstrap_session),
            max_life_time: Default::default(),
            handshake_lock: Default::default(),
        });

        let dispatch_pool = Arc::new(DispatchPool::new(inner.clone(), num_workers, queue_size));

        let handler: Arc<dyn FrameHandler> = inner.clone();
        let pool = dispatch_pool.clone();
        let recv_task = tokio::spawn(async move {
            end_point.recv_loop(handler, pool).await
        });

        Ok(Client {
            inner,
            dispatch_pool,
            recv_task: Mutex::new(Some(recv_task)),
        })
    }

    /// Like [Client::connect], but on a given socket
    pub async fn connect_with_socket(config: ClientConfig, socket: Arc<dyn DatagramSocket>) -> anyhow::Result<Client> {
        let client = Self::with_socket(config, socket)?;
        client.connected().await
    }

    async fn connected(self) -> anyhow::Result<Client> {
        if let Err(e) = self.handshake().await {
            self.shutdown().await;
            return Err(anyhow::Error::new(e).context("handshake failed"));
        }
        Ok(self)
    }

    /// Obtains a session from the server. This fails with [PrtError::Timeout] if the server does
    ///  not reply in time, in which case the handshake can be retried.
    pub async fn handshake(&self) -> Result<(), PrtError> {
        self.inner.handshake().await
    }

    /// Discards the current session, e.g. after the server evicted it, so that [Client::handshake]
    ///  can obtain a new one. Promises pending in the discarded session fail with
    ///  [PrtError::Timeout].
    pub async fn reset_session(&self) {
        self.inner.reset_session().await
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

    /// Sends a message without expecting an acknowledgment. Delivery is not guaranteed.
    pub async fn tell(&self, identifier: &str, body: impl Into<String>) -> Result<(), PrtError> {
        protocol::check_application_identifier(identifier)?;
        let session = self.inner.established_session().await?;

        let message = Message::new(session.token(), identifier, Message::NO_ACK, body);
        self.inner.end_point.send(self.inner.config.server_addr, &message).await
    }

    /// Sends a message and waits for the server's acknowledgment, returning its body. Waits for
    ///  the configured default timeout.
    pub async fn promise(&self, identifier: &str, body: impl Into<String>) -> Result<String, PrtError> {
        self.promise_with_timeout(identifier, body, self.inner.config.protocol.timeout).await
    }

    pub async fn promise_with_timeout(&self, identifier: &str, body: impl Into<String>, timeout: Duration) -> Result<String, PrtError> {
        protocol::check_application_identifier(identifier)?;
        let session = self.inner.established_session().await?;

        let message = Message::new(session.token(), identifier, session.next_sequence(), body);
        let reply = self.inner.end_point
            .exchange(&session, self.inner.config.server_addr, message, timeout)
            .await?;
        Ok(reply.body)
    }

    pub async fn is_established(&self) -> bool {
        self.inner.session.read().await
            .is_established().await
    }

    /// The token assigned by the server, `None` before the handshake
    pub async fn session_token(&self) -> Option<String> {
        let session = self.inner.session.read().await.clone();
        if session.is_established().await {
            Some(session.token().to_string())
        }
        else {
            None
        }
    }

    /// The idle time after which the server evicts the session, as advertised in the handshake
    pub async fn max_life_time(&self) -> Option<Duration> {
        *self.inner.max_life_time.read().await
    }

    /// Round trip time of the most recent completed exchange, including the handshake
    pub async fn last_rtt(&self) -> Option<Duration> {
        self.inner.session.read().await
            .last_rtt().await
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.end_point.local_addr()
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.inner.config.server_addr
    }

    /// Stops receiving, waits for in-flight handlers to finish, and fails pending exchanges
    pub async fn shutdown(&self) {
        self.inner.end_point.cancel_recv_loop();
        if let Some(recv_task) = self.recv_task.lock().await.take() {
            if let Err(e) = recv_task.await {
                error!("receive loop terminated abnormally: {}", e);
            }
        }
        self.dispatch_pool.shutdown().await;

        let num_cancelled = self.inner.session.read().await
            .close().await;
        info!("client shut down, cancelled {} pending exchanges", num_cancelled);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.end_point.cancel_recv_loop();
    }
}

impl ClientInner {
    async fn handshake(&self) -> Result<(), PrtError> {
        let _handshake_guard = self.handshake_lock.lock().await;

        let bootstrap = self.session.read().await.clone();
        if bootstrap.is_established().await {
            return Err(PrtError::IllegalOperation("the handshake was performed already".to_string()));
        }

        let server_addr = self.config.server_addr;
        debug!("initiating handshake with {:?}", server_addr);

        let hello = Message::new("", protocol::HELLO, bootstrap.next_sequence(), "");
        let offer = self.end_point
            .exchange(&bootstrap, server_addr, hello, self.config.protocol.timeout)
            .await?;

        if offer.identifier != protocol::HELLO {
            return Err(PrtError::ProtocolViolation(format!("expected {} in reply to the handshake, got {:?}", protocol::HELLO, offer.identifier)));
        }
        if offer.session.is_empty() {
            return Err(PrtError::ProtocolViolation("server offered an empty session token".to_string()));
        }
        let max_life_time = offer.body.parse::<u64>()
            .map(Duration::from_micros)
            .map_err(|_| PrtError::ProtocolViolation(format!("invalid session life time {:?}", offer.body)))?;

        // the notice goes out before the session is published, so no application frame can overtake it
        let established = Message::new(offer.session.as_str(), protocol::ESTABLISHED, Message::NO_ACK, "");
        self.end_point.send(server_addr, &established).await?;

        let session = Arc::new(bootstrap.upgrade(offer.session).await);
        *self.session.write().await = session.clone();
        *self.max_life_time.write().await = Some(max_life_time);

        info!("established session {:?} with {:?}, max life time {:?}", session.token(), server_addr, max_life_time);
        Ok(())
    }

    async fn reset_session(&self) {
        let _handshake_guard = self.handshake_lock.lock().await;

        let bootstrap = Arc::new(Session::new("", self.config.server_addr));
        let previous = std::mem::replace(&mut *self.session.write().await, bootstrap);
        *self.max_life_time.write().await = None;

        let num_cancelled = previous.close().await;
        info!("discarded session {:?}, cancelled {} pending exchanges", previous.token(), num_cancelled);
    }

    async fn established_session(&self) -> Result<Arc<Session>, PrtError> {
        let session = self.session.read().await.clone();
        if !session.is_established().await {
            return Err(PrtError::IllegalOperation("no session - the handshake must be performed first".to_string()));
        }
        Ok(session)
    }
}

#[async_trait]
impl FrameHandler for ClientInner {
    async fn try_settle(&self, message: Message, _from: SocketAddr) -> Option<Message> {
        let is_ack = message.identifier == protocol::ACK;
        if !is_ack && message.identifier != protocol::HELLO {
            return Some(message);
        }

        let session = self.session.read().await.clone();
        // the handshake reply carries the new token, acknowledgments the current one
        if is_ack {
            if message.session != session.token() {
                debug!("acknowledgment for session {:?} does not match the current session - dropping", message.session);
                return None;
            }
        }
        else if session.is_established().await {
            debug!("handshake reply {:?} while a session is established - dropping", message.session);
            return None;
        }

        let sequence = message.sequence;
        session.pending().resolve(sequence, message);
        None
    }

    async fn on_frame(&self, message: Message, from: SocketAddr) {
        let session = self.session.read().await.clone();
        if !session.is_established().await || message.session != session.token() {
            debug!("{:?} does not belong to the current session - dropping", message);
            return;
        }

        let request = Request {
            message,
            remote: from,
            session_data: None,
        };
        if let Some(ack) = self.router.dispatch(session.token(), request).await {
            if let Err(e) = self.end_point.send(self.config.server_addr, &ack).await {
                warn!("failed to send acknowledgment {}: {}", ack.sequence, e);
            }
        }
    }
}
