use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::trace;

use crate::protocol::message::Message;
use crate::transport::DatagramSocket;

/// A datagram that was handed to the simulated network
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SentFrame {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub payload: Vec<u8>,
    /// `true` if the frame was lost, either by the drop filter or for lack of a receiving socket
    pub dropped: bool,
}
impl SentFrame {
    pub fn message(&self) -> Option<Message> {
        Message::decode(&self.payload).ok()
    }
}

type DropFilter = Box<dyn Fn(&SentFrame) -> bool + Send + Sync>;
type Datagram = (Vec<u8>, SocketAddr);

/// An in-memory datagram network connecting [SimulatedSocket]s. It delivers immediately and in
///  order, except for frames matched by a configurable drop filter, and it records everything
///  that is sent for later inspection.
#[derive(Default)]
pub struct SimulatedNetwork {
    inboxes: RwLock<FxHashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>>,
    drop_filter: RwLock<Option<DropFilter>>,
    sent: Mutex<Vec<SentFrame>>,
}

impl SimulatedNetwork {
    pub fn new() -> Arc<SimulatedNetwork> {
        Arc::new(Default::default())
    }

    pub async fn bind(self: &Arc<Self>, addr: SocketAddr) -> Arc<SimulatedSocket> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.inboxes.write().await
            .insert(addr, sender);

        Arc::new(SimulatedSocket {
            addr,
            network: self.clone(),
            inbox: Mutex::new(receiver),
        })
    }

    /// Frames for which the filter returns `true` are lost
    pub async fn set_drop_filter(&self, filter: impl Fn(&SentFrame) -> bool + Send + Sync + 'static) {
        *self.drop_filter.write().await = Some(Box::new(filter));
    }

    pub async fn clear_drop_filter(&self) {
        *self.drop_filter.write().await = None;
    }

    pub async fn sent_frames(&self) -> Vec<SentFrame> {
        self.sent.lock().await.clone()
    }

    /// Decoded messages of all frames sent so far, in order, including dropped ones
    pub async fn sent_messages(&self) -> Vec<Message> {
        self.sent.lock().await
            .iter()
            .filter_map(|f| f.message())
            .collect()
    }

    pub async fn clear_sent_frames(&self) {
        self.sent.lock().await.clear();
    }

    /// Sends a raw datagram on behalf of an arbitrary sender address
    pub async fn inject(&self, from: SocketAddr, to: SocketAddr, payload: &[u8]) {
        self.transmit(from, to, payload).await
    }

    async fn transmit(&self, from: SocketAddr, to: SocketAddr, payload: &[u8]) {
        let mut frame = SentFrame {
            from,
            to,
            payload: payload.to_vec(),
            dropped: false,
        };

        let filtered = self.drop_filter.read().await
            .as_ref()
            .map(|filter| filter(&frame))
            .unwrap_or(false);

        let delivered = !filtered && match self.inboxes.read().await.get(&to) {
            Some(inbox) => inbox.send((frame.payload.clone(), from)).is_ok(),
            None => false,
        };

        trace!("simulated network: {:?} -> {:?}, {} bytes, delivered: {}", from, to, payload.len(), delivered);
        frame.dropped = !delivered;
        self.sent.lock().await.push(frame);
    }
}

pub struct SimulatedSocket {
    addr: SocketAddr,
    network: Arc<SimulatedNetwork>,
    inbox: Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

#[async_trait]
impl DatagramSocket for SimulatedSocket {
    async fn send_to(&self, buf: &[u8], to: SocketAddr) -> io::Result<()> {
        self.network.transmit(self.addr, to, buf).await;
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        match self.inbox.lock().await.recv().await {
            Some((payload, from)) => {
                // like UDP, excess bytes are discarded
                let len = payload.len().min(buf.len());
                buf[..len].copy_from_slice(&payload[..len]);
                Ok((len, from))
            }
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "simulated network is gone")),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}
