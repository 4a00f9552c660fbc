use std::collections::hash_map::Entry;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::protocol;
use crate::protocol::error::PrtError;
use crate::protocol::message::Message;
use crate::session::session::SessionData;

/// Everything a handler gets to see about an inbound message
#[derive(Clone)]
pub struct Request {
    pub message: Message,
    /// The address the datagram came from
    pub remote: SocketAddr,
    /// Application data attached to the session on the server side, see
    ///  [set_session_data](crate::server::Server::set_session_data). Always `None` on the client.
    pub session_data: Option<SessionData>,
}

/// Application code handling messages for a given identifier.
///
/// Returning a message causes an acknowledgment carrying that message's body to be sent back,
///  correlated with the request's sequence number. Returning `None` sends nothing, so a peer
///  waiting for a reply will time out.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Option<Message>;
}

/// Adapter for using an async function or closure as a [Handler]
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Message>> + Send + 'static,
{
    async fn handle(&self, request: Request) -> Option<Message> {
        (self.0)(request).await
    }
}

/// Handlers by identifier. Identifiers with the reserved protocol prefix are rejected.
#[derive(Default)]
pub struct Router {
    handlers: RwLock<FxHashMap<String, Arc<dyn Handler>>>,
}

impl Router {
    pub fn new() -> Router {
        Default::default()
    }

    pub async fn register(&self, identifier: &str, handler: Arc<dyn Handler>) -> Result<(), PrtError> {
        protocol::check_application_identifier(identifier)?;

        match self.handlers.write().await
            .entry(identifier.to_string())
        {
            Entry::Occupied(_) => Err(PrtError::DuplicateRoute(identifier.to_string())),
            Entry::Vacant(e) => {
                debug!("registering handler for {:?}", identifier);
                e.insert(handler);
                Ok(())
            }
        }
    }

    pub async fn register_fn<F, Fut>(&self, identifier: &str, f: F) -> Result<(), PrtError>
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Message>> + Send + 'static,
    {
        self.register(identifier, Arc::new(FnHandler(f))).await
    }

    /// Returns `true` if there was a handler for the identifier
    pub async fn deregister(&self, identifier: &str) -> bool {
        self.handlers.write().await
            .remove(identifier)
            .is_some()
    }

    pub async fn get(&self, identifier: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.read().await
            .get(identifier)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.handlers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Looks up and invokes the handler for the request, returning the acknowledgment to send
    ///  back if there is one.
    pub async fn dispatch(&self, session_token: &str, request: Request) -> Option<Message> {
        let Some(handler) = self.get(&request.message.identifier).await else {
            debug!("no handler registered for {:?} - dropping", request.message.identifier);
            return None;
        };

        let sequence = request.message.sequence;
        let reply = handler.handle(request).await?;

        if sequence == Message::NO_ACK {
            trace!("discarding handler reply to a message that expects no acknowledgment");
            return None;
        }
        Some(Message::new(session_token, protocol::ACK, sequence, reply.body))
    }
}
