use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, span, trace, Instrument, Level};
use uuid::Uuid;

use crate::config::ProtocolConfig;
use crate::protocol::error::PrtError;
use crate::protocol::message::Message;
use crate::session::session::Session;
use crate::transport::dispatch_pool::DispatchPool;
use crate::transport::DatagramSocket;

/// This trait decouples the engine specific handling of received frames (client vs. server) from
///  the receive loop and the dispatch machinery, which are the same for both.
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    /// Called on the receive loop for every decoded frame, before it is queued for dispatch.
    ///  Acknowledgments and other protocol frames whose relative order matters are handled here
    ///  and consumed by returning `None`, everything else is returned for dispatch.
    ///
    /// NB: This holds up the receive loop, so it must not do anything but cheap bookkeeping
    async fn try_settle(&self, message: Message, from: SocketAddr) -> Option<Message>;

    /// Called from a dispatch worker for every frame not consumed by `try_settle`
    async fn on_frame(&self, message: Message, from: SocketAddr);
}

/// EndPoint owns the socket of an engine: It enforces the maximum transmit size on the send path,
///  and it runs the receive loop decoding datagrams and handing them on.
pub struct EndPoint {
    socket: Arc<dyn DatagramSocket>,
    max_transmit_size: usize,
    cancel_sender: watch::Sender<bool>,
}

impl EndPoint {
    pub fn new(socket: Arc<dyn DatagramSocket>, config: &ProtocolConfig) -> EndPoint {
        let (cancel_sender, _) = watch::channel(false);
        EndPoint {
            socket,
            max_transmit_size: config.max_transmit_size,
            cancel_sender,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn max_transmit_size(&self) -> usize {
        self.max_transmit_size
    }

    /// Encodes and sends a message. Nothing is sent if the encoded message exceeds the maximum
    ///  transmit size.
    pub async fn send(&self, to: SocketAddr, message: &Message) -> Result<(), PrtError> {
        let buf = message.encode_checked(self.max_transmit_size)?;
        trace!("sending {:?} to {:?}", message, to);
        self.socket.send_to(&buf, to).await?;
        Ok(())
    }

    /// Sends an acknowledgment-expecting message on behalf of a session and waits for the
    ///  correlated reply. The message's sequence number must have been allocated from the session.
    pub async fn exchange(&self, session: &Session, to: SocketAddr, message: Message, timeout: Duration) -> Result<Message, PrtError> {
        let exchange = session.pending().register(message.sequence)?;

        let start = Instant::now();
        if let Err(e) = self.send(to, &message).await {
            session.pending().discard(exchange);
            return Err(e);
        }

        let reply = session.pending().wait(exchange, timeout).await?;
        let rtt = start.elapsed();
        trace!("exchange {} completed after {:?}", message.sequence, rtt);
        session.record_rtt(rtt).await;
        Ok(reply)
    }

    /// Receives datagrams until [EndPoint::cancel_recv_loop] is called. Acknowledgments are
    ///  settled inline, other frames are submitted to the dispatch pool.
    pub async fn recv_loop(&self, handler: Arc<dyn FrameHandler>, dispatch_pool: Arc<DispatchPool>) {
        info!("starting receive loop on {:?}", self.socket.local_addr());

        let mut cancel_receiver = self.cancel_sender.subscribe();
        if *cancel_receiver.borrow() {
            info!("receive loop was cancelled before it started");
            return;
        }
        // one extra byte to detect datagrams exceeding the maximum size
        let mut buf = vec![0u8; self.max_transmit_size + 1];

        loop {
            let (len, from) = tokio::select! {
                r = self.socket.recv_from(&mut buf) => {
                    match r {
                        Ok(x) => x,
                        Err(e) => {
                            error!("socket error: {}", e);
                            continue;
                        }
                    }
                }
                _ = cancel_receiver.changed() => break,
            };

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "datagram_received", ?correlation_id, ?from);

            async {
                trace!("received {} bytes", len);

                if len > self.max_transmit_size {
                    debug!("datagram exceeds the maximum transmit size of {} bytes - dropping", self.max_transmit_size);
                    return;
                }

                let message = match Message::decode(&buf[..len]) {
                    Ok(message) => message,
                    Err(e) => {
                        debug!("dropping malformed datagram: {}", e);
                        return;
                    }
                };

                if let Some(message) = handler.try_settle(message, from).await {
                    dispatch_pool.submit(message, from, tracing::Span::current()).await;
                }
            }.instrument(span).await;
        }

        info!("receive loop finished");
    }

    /// Stops the receive loop. This is final: a receive loop started afterwards returns
    ///  immediately.
    pub fn cancel_recv_loop(&self) {
        if self.cancel_sender.send_replace(true) {
            debug!("receive loop was cancelled before");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tokio::sync::Mutex;
    use tokio::time;
    use crate::test_util::network::SimulatedNetwork;
    use super::*;

    #[derive(Default)]
    struct RecordingHandler {
        settled: Mutex<Vec<Message>>,
        dispatched: Mutex<Vec<(Message, SocketAddr)>>,
    }

    #[async_trait]
    impl FrameHandler for RecordingHandler {
        async fn try_settle(&self, message: Message, _from: SocketAddr) -> Option<Message> {
            if message.identifier == "prt-ack" {
                self.settled.lock().await.push(message);
                return None;
            }
            Some(message)
        }

        async fn on_frame(&self, message: Message, from: SocketAddr) {
            self.dispatched.lock().await.push((message, from));
        }
    }

    fn config() -> ProtocolConfig {
        ProtocolConfig {
            max_transmit_size: 100,
            ..ProtocolConfig::default()
        }
    }

    #[tokio::test]
    async fn test_send_rejects_oversized_message() {
        let network = SimulatedNetwork::new();
        let socket = network.bind(SocketAddr::from(([127, 0, 0, 1], 1))).await;
        let end_point = EndPoint::new(socket, &config());

        let result = end_point.send(SocketAddr::from(([127, 0, 0, 1], 2)), &Message::new("S", "x", 1, "a".repeat(100))).await;
        assert!(matches!(result, Err(PrtError::ContentOverflowed { .. })));
        assert!(network.sent_frames().await.is_empty());

        end_point.send(SocketAddr::from(([127, 0, 0, 1], 2)), &Message::new("S", "x", 1, "a")).await.unwrap();
        assert_eq!(network.sent_frames().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_loop_settles_dispatches_and_drops() {
        let network = SimulatedNetwork::new();
        let self_addr = SocketAddr::from(([127, 0, 0, 1], 1));
        let peer_addr = SocketAddr::from(([127, 0, 0, 1], 2));
        let end_point = Arc::new(EndPoint::new(network.bind(self_addr).await, &config()));
        let peer = network.bind(peer_addr).await;

        let handler = Arc::new(RecordingHandler::default());
        let pool = Arc::new(DispatchPool::new(handler.clone(), 2, 16));

        let end_point2 = end_point.clone();
        let handler2 = handler.clone();
        let pool2 = pool.clone();
        let recv_task = tokio::spawn(async move {
            end_point2.recv_loop(handler2, pool2).await
        });

        peer.send_to(b"S\nprt-ack\n3\n\nreply", self_addr).await.unwrap();
        peer.send_to(b"S\necho\n4\n\nrequest", self_addr).await.unwrap();
        peer.send_to(b"garbage", self_addr).await.unwrap();
        peer.send_to(format!("S\necho\n5\n\n{}", "x".repeat(100)).as_bytes(), self_addr).await.unwrap();

        time::sleep(Duration::from_millis(10)).await;
        end_point.cancel_recv_loop();
        recv_task.await.unwrap();
        pool.shutdown().await;

        assert_eq!(*handler.settled.lock().await, vec![Message::new("S", "prt-ack", 3, "reply")]);
        assert_eq!(*handler.dispatched.lock().await, vec![(Message::new("S", "echo", 4, "request"), peer_addr)]);
    }

    #[tokio::test]
    async fn test_cancel_before_recv_loop_starts() {
        let network = SimulatedNetwork::new();
        let end_point = EndPoint::new(network.bind(SocketAddr::from(([127, 0, 0, 1], 1))).await, &config());
        let handler = Arc::new(RecordingHandler::default());
        let pool = Arc::new(DispatchPool::new(handler, 1, 16));

        end_point.cancel_recv_loop();
        time::timeout(Duration::from_secs(1), end_point.recv_loop(Arc::new(RecordingHandler::default()), pool.clone()))
            .await
            .unwrap();
        pool.shutdown().await;
    }
}
